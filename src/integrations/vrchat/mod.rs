//! VRChat live integration: pipeline websocket plus REST enrichment.

pub mod adapter;
pub mod client;
pub mod wire;

pub use adapter::VRChatAdapter;
pub use client::{FriendSource, VRChatClient};

use crate::config::VRChatConfig;
use crate::integrations::enrichment_queue::EnrichmentQueue;
use crate::integrations::live::{Communicator, PlatformServices};
use crate::integrations::transport::WsConnector;
use crate::monitor::{CommunicatorFactory, MonitorContext, MonitorParts};
use crate::registry::SessionIdLookup;
use anyhow::Result;
use std::sync::Arc;

/// Builds the VRChat communicator for each monitoring run
pub struct VRChatFactory {
    config: VRChatConfig,
    max_attempts: u32,
}

impl VRChatFactory {
    pub fn new(config: VRChatConfig, max_attempts: u32) -> Self {
        Self {
            config,
            max_attempts,
        }
    }

    fn pipeline_url(&self, token: &str) -> String {
        format!(
            "{}/?authToken={}",
            self.config.pipeline_url.trim_end_matches('/'),
            urlencoding::encode(token)
        )
    }
}

impl CommunicatorFactory for VRChatFactory {
    fn build(&self, ctx: &MonitorContext) -> Result<MonitorParts> {
        let token = self.config.auth_token()?;
        let client = Arc::new(VRChatClient::new(
            &self.config,
            self.max_attempts,
            ctx.cancel.clone(),
        )?);

        let queue = EnrichmentQueue::new(client.clone(), Arc::clone(&ctx.cache), Arc::clone(&ctx.sink));
        let lookup: Arc<dyn SessionIdLookup> = ctx.registry.clone();
        let services = PlatformServices {
            resolver: Arc::clone(&ctx.resolver),
            cache: Arc::clone(&ctx.cache),
            queue: Arc::clone(&queue),
            lookup: Some(lookup),
        };

        let adapter = Arc::new(VRChatAdapter::new(client, services));
        let connector = Arc::new(
            WsConnector::new(self.pipeline_url(token))
                .with_header("User-Agent", self.config.user_agent.clone()),
        );

        Ok(MonitorParts {
            communicator: Arc::new(Communicator::new(adapter, connector)),
            queue: Some(queue),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_url_carries_encoded_token() {
        let factory = VRChatFactory::new(VRChatConfig::default(), 3);
        assert_eq!(
            factory.pipeline_url("authcookie_a+b"),
            "wss://pipeline.vrchat.cloud/?authToken=authcookie_a%2Bb"
        );
    }
}
