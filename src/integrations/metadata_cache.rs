//! Versioned TTL cache for world and instance metadata.
//!
//! - Entries older than [`REFRESH_AFTER_HOURS`] are flagged `needs_refresh`
//!   by the sweep but keep being served.
//! - Entries older than [`PURGE_AFTER_DAYS`] are dropped by the sweep.
//! - Entries written under another [`METADATA_SCHEMA_VERSION`] are
//!   `is_obsolete` and read as misses until refetched.
//!
//! The cache can be snapshotted to JSON for warm starts; durability of that
//! file is best effort.

use crate::data::{InstanceMetadata, WorldMetadata};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Bump to invalidate every cached entry without a data migration
pub const METADATA_SCHEMA_VERSION: u32 = 3;

pub const REFRESH_AFTER_HOURS: i64 = 6;
pub const PURGE_AFTER_DAYS: i64 = 45;

// =============================================================================
// Entries
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub value: T,
    pub cached_at: DateTime<Utc>,
    #[serde(default)]
    pub is_obsolete: bool,
    #[serde(default)]
    pub needs_refresh: bool,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, cached_at: DateTime<Utc>) -> Self {
        Self {
            value,
            cached_at,
            is_obsolete: false,
            needs_refresh: false,
        }
    }

    /// Whether a background fetch should be scheduled for this entry
    pub fn wants_fetch(&self) -> bool {
        self.is_obsolete || self.needs_refresh
    }
}

/// Serializable shape of the whole cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub version: u32,
    #[serde(default)]
    pub worlds: HashMap<String, CacheEntry<WorldMetadata>>,
    #[serde(default)]
    pub instances: HashMap<String, CacheEntry<InstanceMetadata>>,
}

impl Default for MetadataSnapshot {
    fn default() -> Self {
        Self {
            version: METADATA_SCHEMA_VERSION,
            worlds: HashMap::new(),
            instances: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub marked_stale: usize,
    pub purged: usize,
}

// =============================================================================
// Cache
// =============================================================================

#[derive(Debug, Default)]
pub struct MetadataCache {
    worlds: RwLock<HashMap<String, CacheEntry<WorldMetadata>>>,
    instances: RwLock<HashMap<String, CacheEntry<InstanceMetadata>>>,
    /// Downloaded thumbnails by world id; not persisted
    thumbnails: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_world(&self, world_id: &str) -> Option<CacheEntry<WorldMetadata>> {
        read_live(&self.worlds, world_id)
    }

    pub fn get_instance(&self, session_id: &str) -> Option<CacheEntry<InstanceMetadata>> {
        read_live(&self.instances, session_id)
    }

    pub fn put_world(&self, world: WorldMetadata) {
        self.put_world_at(world, Utc::now());
    }

    pub fn put_world_at(&self, world: WorldMetadata, cached_at: DateTime<Utc>) {
        let key = world.world_id.clone();
        write_entry(&self.worlds, key, CacheEntry::new(world, cached_at));
    }

    pub fn put_instance(&self, instance: InstanceMetadata) {
        self.put_instance_at(instance, Utc::now());
    }

    pub fn put_instance_at(&self, instance: InstanceMetadata, cached_at: DateTime<Utc>) {
        let key = instance.session_id.clone();
        write_entry(&self.instances, key, CacheEntry::new(instance, cached_at));
    }

    /// True if the world is absent, obsolete or stale
    pub fn world_needs_fetch(&self, world_id: &str) -> bool {
        needs_fetch(&self.worlds, world_id)
    }

    pub fn instance_needs_fetch(&self, session_id: &str) -> bool {
        needs_fetch(&self.instances, session_id)
    }

    pub fn put_thumbnail(&self, world_id: &str, bytes: Vec<u8>) {
        match self.thumbnails.write() {
            Ok(mut guard) => {
                guard.insert(world_id.to_string(), Arc::new(bytes));
            }
            Err(e) => tracing::warn!("Thumbnail cache lock poisoned: {e}"),
        }
    }

    pub fn thumbnail(&self, world_id: &str) -> Option<Arc<Vec<u8>>> {
        self.thumbnails.read().ok()?.get(world_id).cloned()
    }

    pub fn len(&self) -> usize {
        let worlds = self.worlds.read().map(|g| g.len()).unwrap_or(0);
        let instances = self.instances.read().map(|g| g.len()).unwrap_or(0);
        worlds + instances
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // Sweep
    // =========================================================================

    pub fn sweep(&self) -> SweepStats {
        self.sweep_at(Utc::now())
    }

    /// Flag stale entries and purge expired ones relative to `now`
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepStats {
        let mut stats = SweepStats::default();
        sweep_map(&self.worlds, now, &mut stats);
        sweep_map(&self.instances, now, &mut stats);

        if stats.purged > 0 {
            if let Ok(worlds) = self.worlds.read() {
                if let Ok(mut thumbs) = self.thumbnails.write() {
                    thumbs.retain(|id, _| worlds.contains_key(id));
                }
            }
        }

        if stats != SweepStats::default() {
            tracing::debug!(
                "Metadata sweep: {} marked stale, {} purged",
                stats.marked_stale,
                stats.purged
            );
        }
        stats
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub fn snapshot(&self) -> MetadataSnapshot {
        MetadataSnapshot {
            version: METADATA_SCHEMA_VERSION,
            worlds: self.worlds.read().map(|g| g.clone()).unwrap_or_default(),
            instances: self.instances.read().map(|g| g.clone()).unwrap_or_default(),
        }
    }

    /// Replace contents with a snapshot.
    ///
    /// A snapshot from another schema version keeps its data but every entry
    /// becomes obsolete and stale.
    pub fn restore(&self, mut snapshot: MetadataSnapshot) {
        if snapshot.version != METADATA_SCHEMA_VERSION {
            tracing::warn!(
                "Metadata cache version mismatch (expected {}, got {}), marking entries obsolete",
                METADATA_SCHEMA_VERSION,
                snapshot.version
            );
            for entry in snapshot.worlds.values_mut() {
                entry.is_obsolete = true;
                entry.needs_refresh = true;
            }
            for entry in snapshot.instances.values_mut() {
                entry.is_obsolete = true;
                entry.needs_refresh = true;
            }
        }

        match self.worlds.write() {
            Ok(mut guard) => *guard = snapshot.worlds,
            Err(e) => tracing::warn!("World cache lock poisoned on restore: {e}"),
        }
        match self.instances.write() {
            Ok(mut guard) => *guard = snapshot.instances,
            Err(e) => tracing::warn!("Instance cache lock poisoned on restore: {e}"),
        }
    }

    /// Load a cache from disk; a missing file yields an empty cache
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let cache = Self::new();
        if !path.exists() {
            return Ok(cache);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read metadata cache from {}", path.display()))?;
        let snapshot: MetadataSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse metadata cache from {}", path.display()))?;

        cache.restore(snapshot);
        cache.sweep();
        Ok(cache)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(&self.snapshot())
            .context("Failed to serialize metadata cache")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write metadata cache to {}", path.display()))?;
        Ok(())
    }
}

fn read_live<T: Clone>(
    map: &RwLock<HashMap<String, CacheEntry<T>>>,
    key: &str,
) -> Option<CacheEntry<T>> {
    let guard = map.read().ok()?;
    guard.get(key).filter(|e| !e.is_obsolete).cloned()
}

fn write_entry<T>(map: &RwLock<HashMap<String, CacheEntry<T>>>, key: String, entry: CacheEntry<T>) {
    match map.write() {
        Ok(mut guard) => {
            guard.insert(key, entry);
        }
        Err(e) => tracing::warn!("Metadata cache lock poisoned on write: {e}"),
    }
}

fn needs_fetch<T>(map: &RwLock<HashMap<String, CacheEntry<T>>>, key: &str) -> bool {
    match map.read() {
        Ok(guard) => guard.get(key).map_or(true, CacheEntry::wants_fetch),
        Err(_) => true,
    }
}

fn sweep_map<T>(
    map: &RwLock<HashMap<String, CacheEntry<T>>>,
    now: DateTime<Utc>,
    stats: &mut SweepStats,
) {
    let refresh_after = ChronoDuration::hours(REFRESH_AFTER_HOURS);
    let purge_after = ChronoDuration::days(PURGE_AFTER_DAYS);

    let Ok(mut guard) = map.write() else {
        tracing::warn!("Metadata cache lock poisoned on sweep");
        return;
    };

    let before = guard.len();
    guard.retain(|_, entry| now.signed_duration_since(entry.cached_at) <= purge_after);
    stats.purged += before - guard.len();

    for entry in guard.values_mut() {
        if !entry.needs_refresh && now.signed_duration_since(entry.cached_at) > refresh_after {
            entry.needs_refresh = true;
            stats.marked_stale += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SessionDetails;
    use tempfile::TempDir;

    fn world(id: &str) -> WorldMetadata {
        WorldMetadata {
            world_id: id.to_string(),
            name: format!("World {id}"),
            author: None,
            description: None,
            capacity: Some(16),
            thumbnail_url: None,
        }
    }

    fn instance(id: &str) -> InstanceMetadata {
        InstanceMetadata {
            session_id: id.to_string(),
            world_id: None,
            name: Some("Instance".to_string()),
            space_name: None,
            details: SessionDetails::default(),
        }
    }

    #[test]
    fn fresh_entry_is_served_and_not_refetched() {
        let cache = MetadataCache::new();
        cache.put_world(world("wrld_1"));

        let entry = cache.get_world("wrld_1").unwrap();
        assert!(!entry.needs_refresh);
        assert!(!cache.world_needs_fetch("wrld_1"));
        assert!(cache.world_needs_fetch("wrld_2"));
    }

    #[test]
    fn seven_hour_old_entry_is_stale_but_served() {
        let cache = MetadataCache::new();
        let now = Utc::now();
        cache.put_world_at(world("wrld_old"), now - ChronoDuration::hours(7));
        cache.put_world_at(world("wrld_new"), now - ChronoDuration::hours(1));

        let stats = cache.sweep_at(now);

        assert_eq!(stats.marked_stale, 1);
        assert!(cache.get_world("wrld_old").unwrap().needs_refresh);
        assert!(!cache.get_world("wrld_new").unwrap().needs_refresh);
        assert!(cache.world_needs_fetch("wrld_old"));
    }

    #[test]
    fn forty_six_day_old_entry_is_purged() {
        let cache = MetadataCache::new();
        let now = Utc::now();
        cache.put_instance_at(instance("inst_old"), now - ChronoDuration::days(46));
        cache.put_instance_at(instance("inst_ok"), now - ChronoDuration::days(44));

        let stats = cache.sweep_at(now);

        assert_eq!(stats.purged, 1);
        assert!(cache.get_instance("inst_old").is_none());
        assert!(cache.get_instance("inst_ok").is_some());
    }

    #[test]
    fn obsolete_entries_read_as_misses() {
        let cache = MetadataCache::new();
        let mut snapshot = MetadataSnapshot {
            version: METADATA_SCHEMA_VERSION - 1,
            ..Default::default()
        };
        snapshot
            .worlds
            .insert("wrld_1".to_string(), CacheEntry::new(world("wrld_1"), Utc::now()));

        cache.restore(snapshot);

        assert!(cache.get_world("wrld_1").is_none());
        assert!(cache.world_needs_fetch("wrld_1"));

        let raw = cache.snapshot();
        let entry = raw.worlds.get("wrld_1").unwrap();
        assert!(entry.is_obsolete);
        assert!(entry.needs_refresh);
    }

    #[test]
    fn refetch_clears_obsolete_flag() {
        let cache = MetadataCache::new();
        let mut snapshot = MetadataSnapshot {
            version: 0,
            ..Default::default()
        };
        snapshot
            .worlds
            .insert("wrld_1".to_string(), CacheEntry::new(world("wrld_1"), Utc::now()));
        cache.restore(snapshot);

        cache.put_world(world("wrld_1"));
        assert!(cache.get_world("wrld_1").is_some());
    }

    #[test]
    fn save_and_load_through_disk() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("metadata-cache.json");

        let cache = MetadataCache::new();
        cache.put_world(world("wrld_1"));
        cache.put_instance(instance("inst_1"));
        cache.save_to_path(&path).unwrap();

        let loaded = MetadataCache::load_from_path(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get_world("wrld_1").unwrap().value.name, "World wrld_1");
    }

    #[test]
    fn missing_file_loads_empty() {
        let temp_dir = TempDir::new().unwrap();
        let cache = MetadataCache::load_from_path(&temp_dir.path().join("none.json")).unwrap();
        assert!(cache.is_empty());
    }
}
