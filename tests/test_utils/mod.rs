#![allow(dead_code)]
//! Test utilities and fakes for omniroster tests

use async_trait::async_trait;
use omniroster::data::{InstanceMetadata, WorldMetadata};
use omniroster::integrations::enrichment_queue::{MetadataSource, SessionRef};
use omniroster::integrations::error::ApiError;
use omniroster::integrations::transport::{StreamTransport, TransportConnector};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Transport whose inbound frames come from a test-held channel
pub struct ChannelTransport {
    inbound: mpsc::UnboundedReceiver<String>,
    sent: Arc<Mutex<Vec<String>>>,
}

/// Test side of a [`ChannelTransport`]
pub struct TransportHandle {
    pub inbound: mpsc::UnboundedSender<String>,
    pub sent: Arc<Mutex<Vec<String>>>,
}

impl TransportHandle {
    pub fn push(&self, frame: impl Into<String>) {
        self.inbound.send(frame.into()).expect("transport closed");
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

pub fn channel_transport() -> (Box<dyn StreamTransport>, TransportHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let transport = ChannelTransport {
        inbound: rx,
        sent: Arc::clone(&sent),
    };
    (Box::new(transport), TransportHandle { inbound: tx, sent })
}

#[async_trait]
impl StreamTransport for ChannelTransport {
    async fn send_text(&mut self, text: String) -> Result<(), ApiError> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn next_text(&mut self) -> Option<Result<String, ApiError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {}
}

/// Hands out prepared transports in order; refuses once empty
#[derive(Default)]
pub struct ScriptedConnector {
    transports: Mutex<VecDeque<Box<dyn StreamTransport>>>,
}

impl ScriptedConnector {
    pub fn with(transport: Box<dyn StreamTransport>) -> Arc<Self> {
        let connector = Self::default();
        connector.transports.lock().unwrap().push_back(transport);
        Arc::new(connector)
    }
}

#[async_trait]
impl TransportConnector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn StreamTransport>, ApiError> {
        self.transports
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ApiError::Transient("connection refused".to_string()))
    }
}

/// In-memory metadata source
#[derive(Default)]
pub struct StaticMetadata {
    pub worlds: Mutex<HashMap<String, WorldMetadata>>,
    pub instances: Mutex<HashMap<String, InstanceMetadata>>,
}

impl StaticMetadata {
    pub fn add_world(&self, world: WorldMetadata) {
        self.worlds
            .lock()
            .unwrap()
            .insert(world.world_id.clone(), world);
    }

    pub fn add_instance(&self, instance: InstanceMetadata) {
        self.instances
            .lock()
            .unwrap()
            .insert(instance.session_id.clone(), instance);
    }
}

#[async_trait]
impl MetadataSource for StaticMetadata {
    async fn fetch_world(&self, world_id: &str) -> Result<Option<WorldMetadata>, ApiError> {
        Ok(self.worlds.lock().unwrap().get(world_id).cloned())
    }

    async fn fetch_instance(
        &self,
        session: &SessionRef,
        _fast_fetch: bool,
    ) -> Result<Option<InstanceMetadata>, ApiError> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .get(&session.session_id)
            .cloned())
    }

    async fn fetch_thumbnail(&self, _url: &str) -> Result<Option<Vec<u8>>, ApiError> {
        Ok(None)
    }
}

pub fn world(world_id: &str, name: &str) -> WorldMetadata {
    WorldMetadata {
        world_id: world_id.to_string(),
        name: name.to_string(),
        author: None,
        description: None,
        capacity: None,
        thumbnail_url: None,
    }
}

/// Poll `check` until it returns `Some`, failing after two seconds
pub async fn eventually<T, F, Fut>(what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(value) = check().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    match waited {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}
