//! Resonite live integration: SignalR hub stream plus REST enrichment.

pub mod adapter;
pub mod client;
pub mod wire;

pub use adapter::ResoniteAdapter;
pub use client::{ContactSource, ResoniteClient};

use crate::config::ResoniteConfig;
use crate::integrations::enrichment_queue::EnrichmentQueue;
use crate::integrations::live::{Communicator, PlatformServices};
use crate::integrations::transport::WsConnector;
use crate::monitor::{CommunicatorFactory, MonitorContext, MonitorParts};
use crate::registry::SessionIdLookup;
use anyhow::Result;
use std::sync::Arc;

/// Builds the Resonite communicator for each monitoring run
pub struct ResoniteFactory {
    config: ResoniteConfig,
    max_attempts: u32,
}

impl ResoniteFactory {
    pub fn new(config: ResoniteConfig, max_attempts: u32) -> Self {
        Self {
            config,
            max_attempts,
        }
    }
}

impl CommunicatorFactory for ResoniteFactory {
    fn build(&self, ctx: &MonitorContext) -> Result<MonitorParts> {
        let (user_id, token) = self.config.credentials()?;
        let client = Arc::new(ResoniteClient::new(
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

        let adapter = Arc::new(ResoniteAdapter::new(client, services));
        let connector = Arc::new(
            WsConnector::new(self.config.hub_url.clone())
                .with_header("Authorization", format!("res {}:{}", user_id, token)),
        );

        Ok(MonitorParts {
            communicator: Arc::new(Communicator::new(adapter, connector)),
            queue: Some(queue),
        })
    }
}
