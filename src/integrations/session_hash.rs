//! Resolution of salted session hashes.
//!
//! Resonite status pushes never carry a plaintext session id. Each push
//! carries `hash(session_id, salt)` with a salt that changes per push, so the
//! only way to recover the session is to rehash every session we have
//! already observed with that salt and look for a match.
//!
//! Resolved hashes are memoized forever; the candidate pool holds every
//! session seen in this process and stays small enough for a linear scan.

use crate::data::{LiveSessionId, SessionBrief};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// One-way session hash; must match the platform byte for byte
pub trait SessionHasher: Send + Sync {
    fn hash(&self, session_id: &str, salt: &str) -> String;
}

/// SHA-256 over `session_id` immediately followed by `salt`, lowercase hex.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256SessionHasher;

impl SessionHasher for Sha256SessionHasher {
    fn hash(&self, session_id: &str, salt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(session_id.as_bytes());
        hasher.update(salt.as_bytes());
        hex::encode(hasher.finalize())
    }
}

pub struct SessionHashResolver {
    hasher: Arc<dyn SessionHasher>,
    /// session id -> brief
    candidates: RwLock<HashMap<String, SessionBrief>>,
    /// hash -> session id
    resolved: RwLock<HashMap<String, String>>,
}

impl Default for SessionHashResolver {
    fn default() -> Self {
        Self::new(Arc::new(Sha256SessionHasher))
    }
}

impl SessionHashResolver {
    pub fn new(hasher: Arc<dyn SessionHasher>) -> Self {
        Self {
            hasher,
            candidates: RwLock::new(HashMap::new()),
            resolved: RwLock::new(HashMap::new()),
        }
    }

    /// Register a known session as a resolution candidate.
    ///
    /// Submitting the same session again is a no-op.
    pub fn submit_session(&self, session_id: &str, assigned_id: LiveSessionId) {
        match self.candidates.write() {
            Ok(mut guard) => {
                guard
                    .entry(session_id.to_string())
                    .or_insert_with(|| SessionBrief {
                        session_id: session_id.to_string(),
                        assigned_id,
                    });
            }
            Err(e) => tracing::warn!("Session candidate lock poisoned on submit: {e}"),
        }
    }

    /// Find the candidate whose hash under `salt` equals `hash`
    pub fn resolve_session(&self, hash: &str, salt: &str) -> Option<SessionBrief> {
        if let Some(brief) = self.lookup_memo(hash) {
            return Some(brief);
        }

        // Scan a snapshot so submissions are never blocked behind hashing.
        let snapshot: Vec<SessionBrief> = match self.candidates.read() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(e) => {
                tracing::warn!("Session candidate lock poisoned on resolve: {e}");
                return None;
            }
        };

        let found = snapshot
            .into_iter()
            .find(|candidate| self.hasher.hash(&candidate.session_id, salt) == hash)?;

        match self.resolved.write() {
            Ok(mut guard) => {
                guard.insert(hash.to_string(), found.session_id.clone());
            }
            Err(e) => tracing::warn!("Session hash memo lock poisoned: {e}"),
        }
        tracing::debug!("Resolved session hash to {}", found.session_id);

        Some(found)
    }

    fn lookup_memo(&self, hash: &str) -> Option<SessionBrief> {
        let session_id = self.resolved.read().ok()?.get(hash).cloned()?;
        self.candidates.read().ok()?.get(&session_id).cloned()
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.read().map(|g| g.len()).unwrap_or(0)
    }
}
