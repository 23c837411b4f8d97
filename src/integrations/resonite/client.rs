//! Resonite REST API: contacts, sessions and world records.

use super::wire::{asset_url, Contact, SessionInfo, WorldRecord};
use crate::config::ResoniteConfig;
use crate::data::{InstanceMetadata, WorldMetadata};
use crate::integrations::enrichment_queue::{MetadataSource, SessionRef};
use crate::integrations::error::ApiError;
use crate::integrations::retry::with_retry;
use crate::integrations::{get_bytes, get_json, HTTP_CLIENT};
use crate::util::strip_markup;
use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

/// Contact list lookup used by the initial poll
#[async_trait]
pub trait ContactSource: Send + Sync {
    async fn fetch_contacts(&self) -> Result<Vec<Contact>, ApiError>;
}

pub struct ResoniteClient {
    api_url: String,
    assets_url: String,
    user_id: String,
    authorization: String,
    max_attempts: u32,
    cancel: CancellationToken,
}

impl ResoniteClient {
    pub fn new(config: &ResoniteConfig, max_attempts: u32, cancel: CancellationToken) -> Result<Self> {
        let (user_id, token) = config.credentials()?;
        Ok(Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            assets_url: config.assets_url.clone(),
            user_id: user_id.to_string(),
            authorization: format!("res {}:{}", user_id, token),
            max_attempts: max_attempts.max(1),
            cancel,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, attempts: u32) -> Result<Option<T>, ApiError> {
        let url = format!("{}{}", self.api_url, path);
        with_retry(&url, attempts, &self.cancel, || {
            let request = HTTP_CLIENT
                .get(&url)
                .header("Authorization", &self.authorization);
            get_json(request, &url)
        })
        .await
    }

    fn attempts(&self, fast_fetch: bool) -> u32 {
        if fast_fetch {
            1
        } else {
            self.max_attempts
        }
    }
}

#[async_trait]
impl ContactSource for ResoniteClient {
    async fn fetch_contacts(&self) -> Result<Vec<Contact>, ApiError> {
        let path = format!("/users/{}/contacts", urlencoding::encode(&self.user_id));
        let contacts: Vec<Contact> = self.get(&path, self.max_attempts).await?.unwrap_or_default();
        Ok(contacts.into_iter().filter(Contact::is_friend).collect())
    }
}

#[async_trait]
impl MetadataSource for ResoniteClient {
    async fn fetch_world(&self, world_id: &str) -> Result<Option<WorldMetadata>, ApiError> {
        let Some((owner_id, record_id)) = world_id.split_once('/') else {
            return Err(ApiError::Protocol(format!("malformed world id {world_id}")));
        };
        let path = format!(
            "/users/{}/records/{}",
            urlencoding::encode(owner_id),
            urlencoding::encode(record_id)
        );

        let record: Option<WorldRecord> = self.get(&path, self.max_attempts).await?;
        Ok(record.map(|record| WorldMetadata {
            world_id: format!("{}/{}", record.owner_id, record.id),
            name: strip_markup(&record.name),
            author: record.owner_name,
            description: record.description,
            capacity: None,
            thumbnail_url: record
                .thumbnail_uri
                .as_deref()
                .map(|uri| asset_url(uri, &self.assets_url)),
        }))
    }

    async fn fetch_instance(
        &self,
        session: &SessionRef,
        fast_fetch: bool,
    ) -> Result<Option<InstanceMetadata>, ApiError> {
        let path = format!("/sessions/{}", urlencoding::encode(&session.session_id));
        let info: Option<SessionInfo> = self.get(&path, self.attempts(fast_fetch)).await?;
        Ok(info.map(|info| info.to_instance()))
    }

    async fn fetch_thumbnail(&self, url: &str) -> Result<Option<Vec<u8>>, ApiError> {
        with_retry(url, 1, &self.cancel, || get_bytes(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_credentials() {
        let config = ResoniteConfig::default();
        assert!(ResoniteClient::new(&config, 3, CancellationToken::new()).is_err());

        let config = ResoniteConfig {
            user_id: Some("U-me".to_string()),
            token: Some("tok".to_string()),
            api_url: "https://api.example.com/".to_string(),
            ..ResoniteConfig::default()
        };
        let client = ResoniteClient::new(&config, 0, CancellationToken::new()).unwrap();
        assert_eq!(client.user_id(), "U-me");
        assert_eq!(client.authorization, "res U-me:tok");
        assert_eq!(client.api_url, "https://api.example.com");
        assert_eq!(client.attempts(false), 1, "at least one attempt");
        assert_eq!(client.attempts(true), 1);
    }

    #[tokio::test]
    async fn malformed_world_id_is_a_protocol_error() {
        let config = ResoniteConfig {
            user_id: Some("U-me".to_string()),
            token: Some("tok".to_string()),
            ..ResoniteConfig::default()
        };
        let client = ResoniteClient::new(&config, 1, CancellationToken::new()).unwrap();
        assert!(matches!(
            client.fetch_world("no-slash").await,
            Err(ApiError::Protocol(_))
        ));
    }
}
