//! VRChat pipeline adapter.
//!
//! Pipeline messages name a user's location directly, so session identity
//! never needs hash resolution. What may be missing is the session's
//! descriptive data, which is fetched through the enrichment queue.

use super::client::FriendSource;
use super::wire::{self, FriendEvent, Location, PipelineEnvelope, VrcUser};
use crate::data::{
    KnownSession, LiveUserUpdate, MainSessionState, OnlineStatus, Platform, SessionKnowledge,
    UpdateTrigger,
};
use crate::integrations::enrichment_queue::{JobPriority, QueueJob, SessionRef};
use crate::integrations::error::ApiError;
use crate::integrations::live::{FrameOutcome, LinkContext, LiveEvent, PlatformAdapter, PlatformServices};
use async_trait::async_trait;
use std::sync::Arc;

pub struct VRChatAdapter {
    friends: Arc<dyn FriendSource>,
    services: PlatformServices,
}

impl VRChatAdapter {
    pub fn new(friends: Arc<dyn FriendSource>, services: PlatformServices) -> Self {
        Self { friends, services }
    }

    /// Session state for a location string
    pub fn derive_location(&self, location: &str, traveling_to: Option<&str>) -> MainSessionState {
        let loc = match wire::parse_location(location) {
            Location::Offline => return MainSessionState::new(SessionKnowledge::Offline),
            Location::Private => return MainSessionState::new(SessionKnowledge::PrivateWorld),
            Location::Traveling => {
                let state = MainSessionState::new(SessionKnowledge::Traveling);
                return match traveling_to {
                    Some(target) => state.with_reference(target),
                    None => state,
                };
            }
            Location::Unknown => {
                tracing::debug!("Unrecognized VRChat location {:?}", location);
                return MainSessionState::new(SessionKnowledge::Indeterminate);
            }
            Location::Instance(loc) => loc,
        };

        let services = &self.services;
        if services.cache.world_needs_fetch(&loc.world_id) {
            services
                .queue
                .enqueue(QueueJob::World(loc.world_id.clone()), JobPriority::Normal);
        }

        let session = SessionRef {
            session_id: loc.raw.clone(),
            world_id: Some(loc.world_id.clone()),
        };
        let assigned_id = services
            .lookup
            .as_ref()
            .and_then(|lookup| lookup.assigned_session_id(Platform::VRChat, &loc.raw));
        let world_name = services.cache.get_world(&loc.world_id).map(|e| e.value.name);

        let knowledge = match services.cache.get_instance(&loc.raw) {
            Some(entry) => {
                if entry.needs_refresh {
                    services.queue.enqueue(
                        QueueJob::Instance {
                            session,
                            fast_fetch: false,
                        },
                        JobPriority::Normal,
                    );
                }
                let mut known = KnownSession::new(loc.raw.clone());
                known.assigned_id = assigned_id;
                known.name = entry.value.name;
                known.space_name = entry.value.space_name.or(world_name);
                SessionKnowledge::Known(known)
            }
            None if assigned_id.is_some() => {
                services.queue.enqueue(
                    QueueJob::Instance {
                        session,
                        fast_fetch: true,
                    },
                    JobPriority::Normal,
                );
                let mut known = KnownSession::new(loc.raw.clone());
                known.assigned_id = assigned_id;
                known.space_name = world_name;
                SessionKnowledge::Known(known)
            }
            None => {
                services.queue.enqueue(
                    QueueJob::Instance {
                        session,
                        fast_fetch: true,
                    },
                    JobPriority::High,
                );
                SessionKnowledge::KnownButNoData
            }
        };

        MainSessionState::new(knowledge).with_reference(loc.raw)
    }

    fn base_update(&self, account_id: &str, ctx: &LinkContext, trigger: UpdateTrigger) -> LiveUserUpdate {
        let mut update = LiveUserUpdate::new(Platform::VRChat, account_id);
        update.trigger = Some(trigger);
        update.connection_id = Some(ctx.connection_id);
        update
    }

    fn apply_profile(update: &mut LiveUserUpdate, user: &VrcUser) {
        update.display_name = user.display_name.clone();
        update.online_status = user.online_status();
        update.custom_status = user.status_description.clone();
    }

    /// Update for a user seen in the friends list
    pub fn friend_update(&self, user: &VrcUser, ctx: &LinkContext, trigger: UpdateTrigger) -> LiveUserUpdate {
        let mut update = self.base_update(&user.id, ctx, trigger);
        Self::apply_profile(&mut update, user);
        update.main_session = user
            .location
            .as_deref()
            .map(|loc| self.derive_location(loc, user.traveling_to_location.as_deref()));
        update
    }

    fn location_update(&self, event: &FriendEvent, ctx: &LinkContext, trigger: UpdateTrigger) -> LiveUserUpdate {
        if let Some(world) = &event.world {
            if self.services.cache.world_needs_fetch(&world.id) {
                self.services.cache.put_world(world.to_metadata());
            }
        }

        let mut update = self.base_update(&event.user_id, ctx, trigger);
        if let Some(user) = &event.user {
            Self::apply_profile(&mut update, user);
        }

        let location = event
            .location
            .as_deref()
            .or_else(|| event.user.as_ref().and_then(|u| u.location.as_deref()));
        let traveling_to = event
            .traveling_to_location
            .as_deref()
            .or_else(|| event.user.as_ref().and_then(|u| u.traveling_to_location.as_deref()));
        update.main_session = location.map(|loc| self.derive_location(loc, traveling_to));
        update
    }

    fn dispatch(&self, envelope: &PipelineEnvelope, ctx: &LinkContext) -> Result<Vec<LiveEvent>, ApiError> {
        let update = match envelope.kind.as_str() {
            "friend-online" => {
                let event: FriendEvent = envelope.content()?;
                let mut update = self.location_update(&event, ctx, UpdateTrigger::StatusPush);
                update.online_status = update.online_status.or(Some(OnlineStatus::Online));
                update
            }
            "friend-location" | "user-location" => {
                let event: FriendEvent = envelope.content()?;
                self.location_update(&event, ctx, UpdateTrigger::LocationPush)
            }
            "friend-active" => {
                // online on the website, not in a world
                let event: FriendEvent = envelope.content()?;
                let mut update = self.base_update(&event.user_id, ctx, UpdateTrigger::StatusPush);
                if let Some(user) = &event.user {
                    Self::apply_profile(&mut update, user);
                }
                update.main_session = Some(MainSessionState::new(SessionKnowledge::Offline));
                update
            }
            "friend-update" | "friend-add" => {
                let event: FriendEvent = envelope.content()?;
                let mut update = self.base_update(&event.user_id, ctx, UpdateTrigger::ProfilePush);
                if let Some(user) = &event.user {
                    Self::apply_profile(&mut update, user);
                }
                update
            }
            "friend-offline" => {
                let event: FriendEvent = envelope.content()?;
                let mut update = self.base_update(&event.user_id, ctx, UpdateTrigger::OfflinePush);
                update.online_status = Some(OnlineStatus::Offline);
                update.main_session = Some(MainSessionState::new(SessionKnowledge::Offline));
                update
            }
            "friend-delete" => {
                // records are kept for the life of the process
                tracing::debug!("Ignoring VRChat friend removal");
                return Ok(Vec::new());
            }
            other => {
                tracing::debug!("Ignoring VRChat pipeline message {}", other);
                return Ok(Vec::new());
            }
        };

        Ok(vec![LiveEvent::User(update)])
    }
}

#[async_trait]
impl PlatformAdapter for VRChatAdapter {
    fn platform(&self) -> Platform {
        Platform::VRChat
    }

    async fn full_poll(
        &self,
        ctx: &LinkContext,
        trigger: UpdateTrigger,
    ) -> Result<FrameOutcome, ApiError> {
        let friends = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(ApiError::Cancelled),
            result = self.friends.fetch_online_friends() => result?,
        };
        tracing::info!("VRChat: {} online friends", friends.len());

        let events = friends
            .iter()
            .map(|user| LiveEvent::User(self.friend_update(user, ctx, trigger)))
            .collect();
        Ok(FrameOutcome::events(events))
    }

    fn subscribe_frame(&self, _account_id: &str) -> Option<String> {
        None
    }

    fn status_request_frame(&self) -> Option<String> {
        None
    }

    async fn handle_frame(&self, frame: &str, ctx: &LinkContext) -> Result<FrameOutcome, ApiError> {
        let envelope: PipelineEnvelope = serde_json::from_str(frame)?;
        Ok(FrameOutcome::events(self.dispatch(&envelope, ctx)?))
    }
}
