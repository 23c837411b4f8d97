//! Canonical live presence and session registry
//!
//! Every platform communicator feeds this registry; it owns exactly one
//! record per (platform, account id) and one per (platform, session id).
//!
//! # Merge semantics
//!
//! ```text
//!   incoming LiveUserUpdate ──┐
//!                             ├─ Known session? ── upsert LiveSession ── session-updated
//!                             └─ field-wise merge (Some overwrites, None keeps) ── user-updated
//! ```
//!
//! Records are never removed for the lifetime of the process.

pub mod listeners;

use crate::data::{
    LiveSession, LiveSessionId, LiveUserUpdate, MainSessionState, NonIndexedSession, Platform,
    SessionDetails, SessionKey, SessionKnowledge, UserKey,
};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub use listeners::{ListenerId, Listeners};

/// Lookup of the registry's assigned id for an in-platform session id.
///
/// Communicators consult this optionally while deriving session knowledge.
pub trait SessionIdLookup: Send + Sync {
    fn assigned_session_id(&self, platform: Platform, session_id: &str) -> Option<LiveSessionId>;
}

#[derive(Default)]
pub struct LiveRegistry {
    users: DashMap<UserKey, LiveUserUpdate>,
    sessions: DashMap<SessionKey, LiveSession>,
    next_session_id: AtomicU64,
    user_listeners: Listeners<LiveUserUpdate>,
    session_listeners: Listeners<LiveSession>,
}

impl LiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Merging
    // =========================================================================

    /// Merge a partial user update into the canonical record.
    ///
    /// Returns the merged record. If the update carries a known session, a
    /// lightweight session record is upserted first and its assigned id is
    /// written into the update; session listeners fire before user listeners.
    pub fn merge_user(&self, mut update: LiveUserUpdate) -> LiveUserUpdate {
        let mut touched_session = None;

        if let Some(MainSessionState {
            knowledge: SessionKnowledge::Known(known),
            ..
        }) = update.main_session.as_mut()
        {
            let reference = NonIndexedSession {
                platform: update.platform,
                session_id: known.session_id.clone(),
                name: known.name.clone(),
                space_name: known.space_name.clone(),
                details: SessionDetails::default(),
            };
            let session = self.upsert_session(reference, false);
            known.assigned_id = Some(session.id);
            touched_session = Some(session);
        }

        let merged = match self.users.entry(update.key()) {
            Entry::Occupied(mut entry) => {
                merge_user_fields(entry.get_mut(), update);
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                tracing::debug!(
                    "New live user {} on {}",
                    update.account_id,
                    update.platform
                );
                entry.insert(update).value().clone()
            }
        };

        if let Some(session) = touched_session {
            self.session_listeners.notify(&session);
        }
        self.user_listeners.notify(&merged);

        merged
    }

    /// Upsert a session by (platform, session id).
    ///
    /// The id is assigned on first sight only; later calls update the
    /// display fields (name, space name) and nothing else.
    pub fn merge_session(&self, session: NonIndexedSession) -> LiveSessionId {
        let merged = self.upsert_session(session, false);
        let id = merged.id;
        self.session_listeners.notify(&merged);
        id
    }

    /// Upsert a session and merge the details it carries, with a single
    /// session-updated notification.
    pub fn merge_session_with_details(&self, session: NonIndexedSession) -> LiveSessionId {
        let merged = self.upsert_session(session, true);
        let id = merged.id;
        self.session_listeners.notify(&merged);
        id
    }

    /// Merge non-display details (host, capacity, attendance, participants,
    /// markers, world) into an existing session.
    ///
    /// Returns `None` when the session has never been observed.
    pub fn merge_session_details(
        &self,
        platform: Platform,
        session_id: &str,
        details: SessionDetails,
    ) -> Option<LiveSessionId> {
        let key = SessionKey {
            platform,
            session_id: session_id.to_string(),
        };

        let merged = {
            let mut entry = self.sessions.get_mut(&key)?;
            let session = entry.value_mut();
            apply_details(session, details);
            session.updated_at = Utc::now();
            session.clone()
        };

        let id = merged.id;
        self.session_listeners.notify(&merged);
        Some(id)
    }

    /// Fill in the space name of every session hosted in `world_id`.
    ///
    /// Returns the number of sessions that changed.
    pub fn apply_world_name(&self, platform: Platform, world_id: &str, name: &str) -> usize {
        let mut changed = Vec::new();

        for mut entry in self.sessions.iter_mut() {
            let session = entry.value_mut();
            if session.platform != platform
                || session.world_id.as_deref() != Some(world_id)
                || session.space_name.as_deref() == Some(name)
            {
                continue;
            }
            session.space_name = Some(name.to_string());
            session.updated_at = Utc::now();
            changed.push(session.clone());
        }

        for session in &changed {
            self.session_listeners.notify(session);
        }
        changed.len()
    }

    fn upsert_session(&self, session: NonIndexedSession, with_details: bool) -> LiveSession {
        match self.sessions.entry(session.key()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                if session.name.is_some() {
                    existing.name = session.name;
                }
                if session.space_name.is_some() {
                    existing.space_name = session.space_name;
                }
                if with_details {
                    apply_details(existing, session.details);
                }
                existing.updated_at = Utc::now();
                existing.clone()
            }
            Entry::Vacant(entry) => {
                let id = LiveSessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1);
                let now = Utc::now();
                let mut created = LiveSession {
                    id,
                    platform: session.platform,
                    session_id: session.session_id,
                    name: session.name,
                    space_name: session.space_name,
                    world_id: None,
                    host: None,
                    capacity: None,
                    attendance: None,
                    participants: Vec::new(),
                    markers: Default::default(),
                    first_seen: now,
                    updated_at: now,
                };
                apply_details(&mut created, session.details);
                tracing::debug!(
                    "New live session {} ({}) on {}",
                    created.session_id,
                    id,
                    created.platform
                );
                entry.insert(created).value().clone()
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_user(&self, platform: Platform, account_id: &str) -> Option<LiveUserUpdate> {
        let key = UserKey {
            platform,
            account_id: account_id.to_string(),
        };
        self.users.get(&key).map(|r| r.value().clone())
    }

    pub fn get_session(&self, platform: Platform, session_id: &str) -> Option<LiveSession> {
        let key = SessionKey {
            platform,
            session_id: session_id.to_string(),
        };
        self.sessions.get(&key).map(|r| r.value().clone())
    }

    pub fn users(&self, platform: Platform) -> Vec<LiveUserUpdate> {
        self.users
            .iter()
            .filter(|r| r.key().platform == platform)
            .map(|r| r.value().clone())
            .collect()
    }

    pub fn sessions(&self, platform: Platform) -> Vec<LiveSession> {
        self.sessions
            .iter()
            .filter(|r| r.key().platform == platform)
            .map(|r| r.value().clone())
            .collect()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    pub fn on_user_updated<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&LiveUserUpdate) + Send + Sync + 'static,
    {
        self.user_listeners.add(callback)
    }

    pub fn on_session_updated<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&LiveSession) + Send + Sync + 'static,
    {
        self.session_listeners.add(callback)
    }

    pub fn remove_user_listener(&self, id: ListenerId) -> bool {
        self.user_listeners.remove(id)
    }

    pub fn remove_session_listener(&self, id: ListenerId) -> bool {
        self.session_listeners.remove(id)
    }
}

impl SessionIdLookup for LiveRegistry {
    fn assigned_session_id(&self, platform: Platform, session_id: &str) -> Option<LiveSessionId> {
        self.get_session(platform, session_id).map(|s| s.id)
    }
}

/// Field-wise merge: present incoming values overwrite, absent ones keep.
///
/// The trigger tag is the exception: an existing record keeps its original
/// trigger and only adopts the incoming one if it never had one.
fn merge_user_fields(existing: &mut LiveUserUpdate, incoming: LiveUserUpdate) {
    if incoming.display_name.is_some() {
        existing.display_name = incoming.display_name;
    }
    if incoming.online_status.is_some() {
        existing.online_status = incoming.online_status;
    }
    if incoming.custom_status.is_some() {
        existing.custom_status = incoming.custom_status;
    }
    if incoming.main_session.is_some() {
        existing.main_session = incoming.main_session;
    }
    if existing.trigger.is_none() {
        existing.trigger = incoming.trigger;
    }
    if incoming.connection_id.is_some() {
        existing.connection_id = incoming.connection_id;
    }
}

fn apply_details(session: &mut LiveSession, details: SessionDetails) {
    if details.world_id.is_some() {
        session.world_id = details.world_id;
    }
    if details.host.is_some() {
        session.host = details.host;
    }
    if details.capacity.is_some() {
        session.capacity = details.capacity;
    }
    if details.attendance.is_some() {
        session.attendance = details.attendance;
    }
    if let Some(participants) = details.participants {
        session.participants = participants;
    }
    if let Some(markers) = details.markers {
        session.markers = markers;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{KnownSession, OnlineStatus, SessionMarker, UpdateTrigger};
    use std::sync::{Arc, Mutex};

    fn user(id: &str) -> LiveUserUpdate {
        LiveUserUpdate::new(Platform::Resonite, id)
    }

    #[test]
    fn merge_user_creates_then_updates_single_record() {
        let registry = LiveRegistry::new();

        let mut first = user("U-alice");
        first.online_status = Some(OnlineStatus::Online);
        first.custom_status = Some("building".to_string());
        registry.merge_user(first);

        let mut second = user("U-alice");
        second.online_status = Some(OnlineStatus::Busy);
        let merged = registry.merge_user(second);

        assert_eq!(registry.user_count(), 1);
        assert_eq!(merged.online_status, Some(OnlineStatus::Busy));
        assert_eq!(merged.custom_status.as_deref(), Some("building"));
    }

    #[test]
    fn trigger_tag_keeps_previous_value() {
        let registry = LiveRegistry::new();

        let mut first = user("U-bob");
        first.trigger = Some(UpdateTrigger::InitialPoll);
        registry.merge_user(first);

        let mut second = user("U-bob");
        second.trigger = Some(UpdateTrigger::StatusPush);
        let merged = registry.merge_user(second);

        assert_eq!(merged.trigger, Some(UpdateTrigger::InitialPoll));
    }

    #[test]
    fn same_account_on_different_platforms_is_distinct() {
        let registry = LiveRegistry::new();
        registry.merge_user(LiveUserUpdate::new(Platform::Resonite, "same"));
        registry.merge_user(LiveUserUpdate::new(Platform::VRChat, "same"));

        assert_eq!(registry.user_count(), 2);
        assert_eq!(registry.users(Platform::VRChat).len(), 1);
    }

    #[test]
    fn merge_session_keeps_identity() {
        let registry = LiveRegistry::new();

        let mut first = NonIndexedSession::new(Platform::VRChat, "wrld_1:100");
        first.name = Some("Lobby".to_string());
        first.details.capacity = Some(32);
        let id1 = registry.merge_session(first);

        let mut second = NonIndexedSession::new(Platform::VRChat, "wrld_1:100");
        second.space_name = Some("The Great Pug".to_string());
        second.details.capacity = Some(2);
        let id2 = registry.merge_session(second);

        assert_eq!(id1, id2);
        let session = registry.get_session(Platform::VRChat, "wrld_1:100").unwrap();
        assert_eq!(session.name.as_deref(), Some("Lobby"));
        assert_eq!(session.space_name.as_deref(), Some("The Great Pug"));
        assert_eq!(session.capacity, Some(32), "later merges only touch display fields");
    }

    #[test]
    fn merge_session_details_updates_live_fields() {
        let registry = LiveRegistry::new();
        registry.merge_session(NonIndexedSession::new(Platform::Resonite, "S-1"));

        let details = SessionDetails {
            attendance: Some(5),
            markers: Some([SessionMarker::Headless].into_iter().collect()),
            ..Default::default()
        };
        assert!(registry
            .merge_session_details(Platform::Resonite, "S-1", details)
            .is_some());
        assert!(registry
            .merge_session_details(Platform::Resonite, "S-unknown", SessionDetails::default())
            .is_none());

        let session = registry.get_session(Platform::Resonite, "S-1").unwrap();
        assert_eq!(session.attendance, Some(5));
        assert!(session.markers.contains(&SessionMarker::Headless));
    }

    #[test]
    fn known_session_reference_upserts_session_before_user() {
        let registry = LiveRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        {
            let order = Arc::clone(&order);
            registry.on_session_updated(move |s| {
                order.lock().unwrap().push(format!("session:{}", s.session_id));
            });
        }
        {
            let order = Arc::clone(&order);
            registry.on_user_updated(move |u| {
                order.lock().unwrap().push(format!("user:{}", u.account_id));
            });
        }

        let mut update = user("U-carol");
        let mut known = KnownSession::new("S-42");
        known.name = Some("Carol's Lab".to_string());
        update.main_session = Some(MainSessionState::new(SessionKnowledge::Known(known)));
        let merged = registry.merge_user(update);

        let session = registry.get_session(Platform::Resonite, "S-42").unwrap();
        assert_eq!(session.name.as_deref(), Some("Carol's Lab"));

        let assigned = merged
            .main_session
            .as_ref()
            .and_then(|m| m.knowledge.known())
            .and_then(|k| k.assigned_id);
        assert_eq!(assigned, Some(session.id));

        assert_eq!(
            *order.lock().unwrap(),
            vec!["session:S-42".to_string(), "user:U-carol".to_string()]
        );
    }

    #[test]
    fn session_push_with_details_notifies_once() {
        let registry = LiveRegistry::new();
        let notified = Arc::new(Mutex::new(Vec::new()));
        {
            let notified = Arc::clone(&notified);
            registry.on_session_updated(move |s| {
                notified.lock().unwrap().push((s.session_id.clone(), s.attendance));
            });
        }

        let mut first = NonIndexedSession::new(Platform::Resonite, "S-7");
        first.details.attendance = Some(3);
        let id = registry.merge_session_with_details(first);

        let mut second = NonIndexedSession::new(Platform::Resonite, "S-7");
        second.name = Some("Renamed".to_string());
        second.details.attendance = Some(5);
        assert_eq!(registry.merge_session_with_details(second), id);

        assert_eq!(
            *notified.lock().unwrap(),
            vec![("S-7".to_string(), Some(3)), ("S-7".to_string(), Some(5))]
        );
        let stored = registry.get_session(Platform::Resonite, "S-7").unwrap();
        assert_eq!(stored.name.as_deref(), Some("Renamed"));
        assert_eq!(stored.attendance, Some(5));

        // plain merges still leave details alone
        let mut third = NonIndexedSession::new(Platform::Resonite, "S-7");
        third.details.attendance = Some(9);
        registry.merge_session(third);
        assert_eq!(
            registry.get_session(Platform::Resonite, "S-7").unwrap().attendance,
            Some(5)
        );
    }

    #[test]
    fn apply_world_name_fills_matching_sessions() {
        let registry = LiveRegistry::new();

        let mut session = NonIndexedSession::new(Platform::VRChat, "wrld_a:1");
        session.details.world_id = Some("wrld_a".to_string());
        registry.merge_session(session);
        registry.merge_session(NonIndexedSession::new(Platform::VRChat, "wrld_b:1"));

        assert_eq!(registry.apply_world_name(Platform::VRChat, "wrld_a", "Aurora"), 1);
        assert_eq!(
            registry.apply_world_name(Platform::VRChat, "wrld_a", "Aurora"),
            0,
            "unchanged sessions are not re-notified"
        );
        let updated = registry.get_session(Platform::VRChat, "wrld_a:1").unwrap();
        assert_eq!(updated.space_name.as_deref(), Some("Aurora"));
    }

    #[test]
    fn session_id_lookup() {
        let registry = LiveRegistry::new();
        let id = registry.merge_session(NonIndexedSession::new(Platform::Resonite, "S-9"));

        assert_eq!(registry.assigned_session_id(Platform::Resonite, "S-9"), Some(id));
        assert_eq!(registry.assigned_session_id(Platform::VRChat, "S-9"), None);
    }
}
