//! Resonite hub adapter: decodes hub messages into canonical events.
//!
//! Status pushes never name the session a user is in. The current session is
//! identified by a salted hash, which is resolved against every session this
//! process has already seen:
//!
//! ```text
//!   offline / invisible          -> Offline
//!   no focused session           -> Indeterminate
//!   hidden or Private session    -> PrivateWorld
//!   hash resolves                -> Known (session id + registry id)
//!   hash does not resolve (yet)  -> KnownButNoData
//! ```

use super::client::ContactSource;
use super::wire::{self, HubMessage, SessionInfo, UserStatus};
use crate::data::{
    KnownSession, LiveUserUpdate, MainSessionState, Platform, SessionKnowledge, UpdateTrigger,
};
use crate::integrations::enrichment_queue::{JobPriority, QueueJob, SessionRef};
use crate::integrations::error::ApiError;
use crate::integrations::live::{FrameOutcome, LinkContext, LiveEvent, PlatformAdapter, PlatformServices};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const KEEPALIVE_PERIOD: Duration = Duration::from_secs(15);

pub struct ResoniteAdapter {
    contacts: Arc<dyn ContactSource>,
    services: PlatformServices,
}

impl ResoniteAdapter {
    pub fn new(contacts: Arc<dyn ContactSource>, services: PlatformServices) -> Self {
        Self { contacts, services }
    }

    /// Canonical update for one status push
    pub fn status_update(
        &self,
        status: &UserStatus,
        ctx: &LinkContext,
        trigger: UpdateTrigger,
    ) -> LiveUserUpdate {
        let mut update = LiveUserUpdate::new(Platform::Resonite, status.user_id.clone());
        update.online_status = status.online_status.as_deref().and_then(wire::online_status);
        update.main_session = Some(self.derive_session(status));
        update.trigger = Some(trigger);
        update.connection_id = Some(ctx.connection_id);
        update
    }

    pub fn derive_session(&self, status: &UserStatus) -> MainSessionState {
        let online = status.online_status.as_deref().and_then(wire::online_status);
        if online.is_some_and(|s| s.is_offline()) {
            return MainSessionState::new(SessionKnowledge::Offline);
        }

        let Some(current) = status.current_session() else {
            return MainSessionState::new(SessionKnowledge::Indeterminate);
        };
        let Some(hash) = current.session_hash.as_deref() else {
            return MainSessionState::new(SessionKnowledge::Indeterminate);
        };

        if current.is_private() {
            return MainSessionState::new(SessionKnowledge::PrivateWorld).with_reference(hash);
        }

        let Some(salt) = status.hash_salt.as_deref() else {
            return MainSessionState::new(SessionKnowledge::KnownButNoData).with_reference(hash);
        };

        let Some(brief) = self.services.resolver.resolve_session(hash, salt) else {
            tracing::debug!("Unresolved session hash for {}", status.user_id);
            return MainSessionState::new(SessionKnowledge::KnownButNoData).with_reference(hash);
        };

        let cached = self.services.cache.get_instance(&brief.session_id);
        if cached.as_ref().map_or(true, |entry| entry.needs_refresh) {
            let session = SessionRef {
                session_id: brief.session_id.clone(),
                world_id: cached.as_ref().and_then(|e| e.value.world_id.clone()),
            };
            self.services.queue.enqueue(
                QueueJob::Instance {
                    session,
                    fast_fetch: true,
                },
                JobPriority::Normal,
            );
        }

        let mut known = KnownSession::new(brief.session_id);
        known.assigned_id = Some(brief.assigned_id);
        if let Some(entry) = cached {
            known.name = entry.value.name;
            known.space_name = entry.value.space_name;
        }

        MainSessionState::new(SessionKnowledge::Known(known)).with_reference(hash)
    }

    /// Cache a pushed session and queue its world for enrichment
    fn session_event(&self, info: &SessionInfo) -> LiveEvent {
        let instance = info.to_instance();
        if let Some(world_id) = instance.world_id.as_deref() {
            if self.services.cache.world_needs_fetch(world_id) {
                self.services
                    .queue
                    .enqueue(QueueJob::World(world_id.to_string()), JobPriority::Normal);
            }
        }
        self.services.cache.put_instance(instance.clone());
        LiveEvent::Session(instance.to_session(Platform::Resonite))
    }

    fn handle_record(&self, record: &str, ctx: &LinkContext, out: &mut FrameOutcome) -> Result<(), ApiError> {
        let message: HubMessage = serde_json::from_str(record)?;

        match message.kind {
            None => {
                if let Some(error) = message.error {
                    return Err(ApiError::Transient(format!("hub rejected handshake: {error}")));
                }
                tracing::debug!("Resonite hub handshake acknowledged");
            }
            Some(wire::MSG_INVOCATION) => {
                let target = message.target.as_deref().unwrap_or_default();
                match target {
                    wire::TARGET_STATUS_UPDATE => {
                        let status: UserStatus = first_argument(&message.arguments)?;
                        out.events.push(LiveEvent::User(self.status_update(
                            &status,
                            ctx,
                            UpdateTrigger::StatusPush,
                        )));
                    }
                    wire::TARGET_SESSION_UPDATE => {
                        let info: SessionInfo = first_argument(&message.arguments)?;
                        out.events.push(self.session_event(&info));
                    }
                    wire::TARGET_REMOVE_SESSION => {
                        // sessions are never removed from the registry
                        tracing::debug!("Ignoring session removal");
                    }
                    other => tracing::debug!("Ignoring hub invocation {}", other),
                }
            }
            Some(wire::MSG_PING) | Some(wire::MSG_COMPLETION) => {}
            Some(wire::MSG_CLOSE) => {
                let reason = message.error.unwrap_or_else(|| "no reason".to_string());
                return Err(ApiError::Transient(format!("hub closed connection: {reason}")));
            }
            Some(other) => tracing::debug!("Ignoring hub message type {}", other),
        }

        Ok(())
    }
}

fn first_argument<T: DeserializeOwned>(arguments: &[Value]) -> Result<T, ApiError> {
    let value = arguments
        .first()
        .ok_or_else(|| ApiError::Protocol("invocation without arguments".to_string()))?;
    Ok(T::deserialize(value)?)
}

#[async_trait]
impl PlatformAdapter for ResoniteAdapter {
    fn platform(&self) -> Platform {
        Platform::Resonite
    }

    fn handshake(&self) -> Vec<String> {
        vec![wire::handshake_frame()]
    }

    fn keepalive(&self) -> Option<(Duration, String)> {
        Some((KEEPALIVE_PERIOD, wire::ping_frame()))
    }

    async fn full_poll(
        &self,
        ctx: &LinkContext,
        trigger: UpdateTrigger,
    ) -> Result<FrameOutcome, ApiError> {
        let contacts = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(ApiError::Cancelled),
            result = self.contacts.fetch_contacts() => result?,
        };
        tracing::info!("Resonite: {} contacts", contacts.len());

        let events = contacts
            .into_iter()
            .map(|contact| {
                let mut update = LiveUserUpdate::new(Platform::Resonite, contact.id);
                update.display_name = contact.contact_username;
                update.trigger = Some(trigger);
                update.connection_id = Some(ctx.connection_id);
                LiveEvent::User(update)
            })
            .collect();

        // statuses arrive as pushes
        Ok(FrameOutcome {
            events,
            replies: self.status_request_frame().into_iter().collect(),
        })
    }

    fn subscribe_frame(&self, account_id: &str) -> Option<String> {
        Some(wire::invocation_frame(
            wire::TARGET_LISTEN_ON_CONTACT,
            vec![Value::String(account_id.to_string())],
        ))
    }

    fn status_request_frame(&self) -> Option<String> {
        Some(wire::invocation_frame(
            wire::TARGET_REQUEST_STATUS,
            vec![Value::Null, Value::Bool(false)],
        ))
    }

    async fn handle_frame(&self, frame: &str, ctx: &LinkContext) -> Result<FrameOutcome, ApiError> {
        let mut out = FrameOutcome::default();
        for record in wire::split_records(frame) {
            match self.handle_record(record, ctx, &mut out) {
                Ok(()) => {}
                Err(ApiError::Protocol(msg)) => {
                    tracing::warn!("Skipping malformed hub message: {}", msg);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{InstanceMetadata, LiveSessionId, SessionDetails, WorldMetadata};
    use crate::integrations::enrichment_queue::{EnrichmentQueue, EnrichmentSink, MetadataSource};
    use crate::integrations::metadata_cache::MetadataCache;
    use crate::integrations::session_hash::{SessionHashResolver, SessionHasher, Sha256SessionHasher};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct NoContacts;

    #[async_trait]
    impl ContactSource for NoContacts {
        async fn fetch_contacts(&self) -> Result<Vec<super::wire::Contact>, ApiError> {
            Ok(Vec::new())
        }
    }

    struct NullSource;

    #[async_trait]
    impl MetadataSource for NullSource {
        async fn fetch_world(&self, _: &str) -> Result<Option<WorldMetadata>, ApiError> {
            Ok(None)
        }
        async fn fetch_instance(&self, _: &SessionRef, _: bool) -> Result<Option<InstanceMetadata>, ApiError> {
            Ok(None)
        }
        async fn fetch_thumbnail(&self, _: &str) -> Result<Option<Vec<u8>>, ApiError> {
            Ok(None)
        }
    }

    struct NullSink;

    impl EnrichmentSink for NullSink {
        fn world_cached(&self, _: &WorldMetadata) {}
        fn session_enriched(&self, _: &InstanceMetadata) {}
    }

    fn adapter() -> ResoniteAdapter {
        let cache = Arc::new(MetadataCache::new());
        let services = PlatformServices {
            resolver: Arc::new(SessionHashResolver::default()),
            cache: Arc::clone(&cache),
            queue: EnrichmentQueue::new(Arc::new(NullSource), cache, Arc::new(NullSink)),
            lookup: None,
        };
        ResoniteAdapter::new(Arc::new(NoContacts), services)
    }

    fn ctx() -> LinkContext {
        LinkContext {
            connection_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
        }
    }

    fn status(online: &str, hash: &str, salt: &str) -> UserStatus {
        serde_json::from_value(json!({
            "userId": "U-friend",
            "onlineStatus": online,
            "currentSessionIndex": 0,
            "sessions": [{"sessionHash": hash, "accessLevel": "Anyone"}],
            "hashSalt": salt
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn unresolved_then_resolved_hash() {
        let adapter = adapter();
        let hash = Sha256SessionHasher.hash("S-1", "salt");

        let state = adapter.derive_session(&status("Online", &hash, "salt"));
        assert_eq!(state.knowledge, SessionKnowledge::KnownButNoData);
        assert_eq!(state.reference.as_deref(), Some(hash.as_str()));

        adapter.services.resolver.submit_session("S-1", LiveSessionId(7));
        let state = adapter.derive_session(&status("Online", &hash, "salt"));
        let known = state.knowledge.known().unwrap();
        assert_eq!(known.session_id, "S-1");
        assert_eq!(known.assigned_id, Some(LiveSessionId(7)));
        assert_eq!(adapter.services.queue.pending_len(), 1, "instance queued for details");
        adapter.services.queue.shutdown().await;
    }

    #[tokio::test]
    async fn offline_and_private_states() {
        let adapter = adapter();
        assert_eq!(
            adapter.derive_session(&status("Invisible", "h", "s")).knowledge,
            SessionKnowledge::Offline
        );

        let hidden: UserStatus = serde_json::from_value(json!({
            "userId": "U-friend",
            "onlineStatus": "Online",
            "currentSessionIndex": 0,
            "sessions": [{"sessionHash": "h", "accessLevel": "Private"}],
            "hashSalt": "s"
        }))
        .unwrap();
        assert_eq!(
            adapter.derive_session(&hidden).knowledge,
            SessionKnowledge::PrivateWorld
        );

        let idle: UserStatus =
            serde_json::from_value(json!({"userId": "U-friend", "onlineStatus": "Online"})).unwrap();
        assert_eq!(
            adapter.derive_session(&idle).knowledge,
            SessionKnowledge::Indeterminate
        );
    }

    #[tokio::test]
    async fn cached_session_fills_names() {
        let adapter = adapter();
        adapter.services.cache.put_instance(InstanceMetadata {
            session_id: "S-2".to_string(),
            world_id: None,
            name: Some("Lounge".to_string()),
            space_name: Some("Cozy World".to_string()),
            details: SessionDetails::default(),
        });
        adapter.services.resolver.submit_session("S-2", LiveSessionId(2));

        let hash = Sha256SessionHasher.hash("S-2", "pep");
        let state = adapter.derive_session(&status("Online", &hash, "pep"));
        let known = state.knowledge.known().unwrap();
        assert_eq!(known.name.as_deref(), Some("Lounge"));
        assert_eq!(known.space_name.as_deref(), Some("Cozy World"));
        assert_eq!(adapter.services.queue.pending_len(), 0, "fresh cache entry");
    }

    #[tokio::test]
    async fn decodes_multi_record_frames() {
        let adapter = adapter();
        let ctx = ctx();
        let status_push = json!({
            "type": 1,
            "target": "ReceiveStatusUpdate",
            "arguments": [{"userId": "U-a", "onlineStatus": "Busy"}]
        });
        let session_push = json!({
            "type": 1,
            "target": "ReceiveSessionUpdate",
            "arguments": [{
                "sessionId": "S-9",
                "name": "<color=red>Party</color>",
                "correspondingWorldId": {"id": "R-1", "ownerId": "U-o"},
                "maximumUsers": 10
            }]
        });
        let frame = format!("{{}}\u{1e}{status_push}\u{1e}not json\u{1e}{{\"type\":6}}\u{1e}{session_push}\u{1e}");

        let out = adapter.handle_frame(&frame, &ctx).await.unwrap();
        assert_eq!(out.events.len(), 2);

        match &out.events[0] {
            LiveEvent::User(update) => {
                assert_eq!(update.account_id, "U-a");
                assert_eq!(update.online_status, Some(crate::data::OnlineStatus::Busy));
                assert_eq!(update.connection_id, Some(ctx.connection_id));
                assert_eq!(update.trigger, Some(UpdateTrigger::StatusPush));
            }
            other => panic!("unexpected event {other:?}"),
        }
        match &out.events[1] {
            LiveEvent::Session(session) => {
                assert_eq!(session.session_id, "S-9");
                assert_eq!(session.name.as_deref(), Some("Party"));
                assert_eq!(session.details.world_id.as_deref(), Some("U-o/R-1"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(adapter.services.cache.get_instance("S-9").is_some());
        adapter.services.queue.shutdown().await;
    }

    #[tokio::test]
    async fn close_message_drops_connection() {
        let adapter = adapter();
        let result = adapter
            .handle_frame("{\"type\":7,\"error\":\"bye\"}\u{1e}", &ctx())
            .await;
        assert!(matches!(result, Err(ApiError::Transient(_))));
    }

    #[test]
    fn subscribe_and_status_frames() {
        let adapter = adapter();
        let subscribe = adapter.subscribe_frame("U-x").unwrap();
        assert!(subscribe.contains("ListenOnContact"));
        assert!(subscribe.contains("U-x"));
        assert!(adapter.status_request_frame().unwrap().contains("RequestStatus"));
    }
}
