//! VRChat REST API: friends, worlds and instances.

use super::wire::{VrcInstance, VrcUser, VrcWorld};
use crate::config::VRChatConfig;
use crate::data::{InstanceMetadata, WorldMetadata};
use crate::integrations::enrichment_queue::{MetadataSource, SessionRef};
use crate::integrations::error::ApiError;
use crate::integrations::retry::with_retry;
use crate::integrations::{get_bytes, get_json, HTTP_CLIENT};
use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

/// Page size of the friends endpoint
pub const FRIENDS_PAGE_SIZE: usize = 100;

/// Online friend enumeration used by full polls
#[async_trait]
pub trait FriendSource: Send + Sync {
    async fn fetch_online_friends(&self) -> Result<Vec<VrcUser>, ApiError>;
}

pub struct VRChatClient {
    api_url: String,
    cookie: String,
    user_agent: String,
    max_attempts: u32,
    cancel: CancellationToken,
}

impl VRChatClient {
    pub fn new(config: &VRChatConfig, max_attempts: u32, cancel: CancellationToken) -> Result<Self> {
        let token = config.auth_token()?;
        Ok(Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            cookie: format!("auth={token}"),
            user_agent: config.user_agent.clone(),
            max_attempts: max_attempts.max(1),
            cancel,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, attempts: u32) -> Result<Option<T>, ApiError> {
        let url = format!("{}{}", self.api_url, path);
        with_retry(&url, attempts, &self.cancel, || {
            let request = HTTP_CLIENT
                .get(&url)
                .header("Cookie", &self.cookie)
                .header("User-Agent", &self.user_agent);
            get_json(request, &url)
        })
        .await
    }
}

#[async_trait]
impl FriendSource for VRChatClient {
    async fn fetch_online_friends(&self) -> Result<Vec<VrcUser>, ApiError> {
        let mut friends = Vec::new();
        loop {
            let path = format!(
                "/auth/user/friends?offline=false&n={}&offset={}",
                FRIENDS_PAGE_SIZE,
                friends.len()
            );
            let page: Vec<VrcUser> = self.get(&path, self.max_attempts).await?.unwrap_or_default();
            let last_page = page.len() < FRIENDS_PAGE_SIZE;
            friends.extend(page);
            if last_page {
                break;
            }
        }
        Ok(friends)
    }
}

#[async_trait]
impl MetadataSource for VRChatClient {
    async fn fetch_world(&self, world_id: &str) -> Result<Option<WorldMetadata>, ApiError> {
        let path = format!("/worlds/{}", urlencoding::encode(world_id));
        let world: Option<VrcWorld> = self.get(&path, self.max_attempts).await?;
        Ok(world.map(|w| w.to_metadata()))
    }

    async fn fetch_instance(
        &self,
        session: &SessionRef,
        fast_fetch: bool,
    ) -> Result<Option<InstanceMetadata>, ApiError> {
        let path = format!("/instances/{}", urlencoding::encode(&session.session_id));
        let attempts = if fast_fetch { 1 } else { self.max_attempts };
        let instance: Option<VrcInstance> = self.get(&path, attempts).await?;
        Ok(instance.map(|i| i.to_instance(&session.session_id)))
    }

    async fn fetch_thumbnail(&self, url: &str) -> Result<Option<Vec<u8>>, ApiError> {
        with_retry(url, 1, &self.cancel, || get_bytes(url)).await
    }
}
