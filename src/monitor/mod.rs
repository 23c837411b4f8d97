//! Monitoring orchestrator: one per platform.
//!
//! Owns the lifecycle of a communicator and the tasks around it:
//!
//! ```text
//!                 ┌──────────────┐  LiveEvent   ┌────────────┐
//!   connect() ──► │ Communicator │ ───────────► │ event pump │ ──► LiveRegistry
//!                 └──────────────┘              └────────────┘        │
//!                        ▲   subscribe / re-subscribe  │              │ session-updated
//!                        └─────────────────────────────┘              ▼
//!                        ▲                                    SessionHashResolver
//!   periodic task ───────┘ request_full_status + cache sweep
//! ```
//!
//! Start and stop are serialized and idempotent; stop joins every task it
//! started before returning.

use crate::data::{InstanceMetadata, Platform, WorldMetadata};
use crate::integrations::enrichment_queue::{EnrichmentQueue, EnrichmentSink};
use crate::integrations::live::{ConnectionState, LiveCommunicator, LiveEvent};
use crate::integrations::metadata_cache::MetadataCache;
use crate::integrations::session_hash::SessionHashResolver;
use crate::registry::{ListenerId, LiveRegistry};
use anyhow::Result;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_BUFFER: usize = 256;

/// Shared services handed to a factory for one monitoring run
pub struct MonitorContext {
    pub platform: Platform,
    pub registry: Arc<LiveRegistry>,
    pub resolver: Arc<SessionHashResolver>,
    pub cache: Arc<MetadataCache>,
    pub sink: Arc<dyn EnrichmentSink>,
    /// Cancelled when monitoring stops
    pub cancel: CancellationToken,
}

pub struct MonitorParts {
    pub communicator: Arc<dyn LiveCommunicator>,
    pub queue: Option<Arc<EnrichmentQueue>>,
}

/// Builds a fresh communicator for each start
pub trait CommunicatorFactory: Send + Sync {
    fn build(&self, ctx: &MonitorContext) -> Result<MonitorParts>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorStatus {
    Stopped,
    Running,
    /// The communicator gave up; monitoring must be restarted
    Failed(String),
}

/// Routes enrichment results into the registry
pub struct RegistrySink {
    platform: Platform,
    registry: Arc<LiveRegistry>,
}

impl RegistrySink {
    pub fn new(platform: Platform, registry: Arc<LiveRegistry>) -> Self {
        Self { platform, registry }
    }
}

impl EnrichmentSink for RegistrySink {
    fn world_cached(&self, world: &WorldMetadata) {
        let changed = self
            .registry
            .apply_world_name(self.platform, &world.world_id, &world.name);
        tracing::debug!("World {} cached, {} sessions renamed", world.world_id, changed);
    }

    fn session_enriched(&self, instance: &InstanceMetadata) {
        self.registry.merge_session_with_details(instance.to_session(self.platform));
    }
}

struct RunningMonitor {
    communicator: Arc<dyn LiveCommunicator>,
    queue: Option<Arc<EnrichmentQueue>>,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
    periodic: JoinHandle<()>,
    session_listener: ListenerId,
    tracked: Arc<Mutex<HashSet<String>>>,
}

pub struct MonitoringOrchestrator {
    platform: Platform,
    factory: Arc<dyn CommunicatorFactory>,
    registry: Arc<LiveRegistry>,
    resolver: Arc<SessionHashResolver>,
    cache: Arc<MetadataCache>,
    refresh_interval: Duration,
    running: tokio::sync::Mutex<Option<RunningMonitor>>,
    status: Arc<RwLock<MonitorStatus>>,
}

impl MonitoringOrchestrator {
    pub fn new(
        platform: Platform,
        factory: Arc<dyn CommunicatorFactory>,
        registry: Arc<LiveRegistry>,
        cache: Arc<MetadataCache>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            platform,
            factory,
            registry,
            resolver: Arc::new(SessionHashResolver::default()),
            cache,
            refresh_interval,
            running: tokio::sync::Mutex::new(None),
            status: Arc::new(RwLock::new(MonitorStatus::Stopped)),
        }
    }

    /// Use a specific resolver (shared across runs by default)
    pub fn with_resolver(mut self, resolver: Arc<SessionHashResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn resolver(&self) -> &Arc<SessionHashResolver> {
        &self.resolver
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    pub fn status(&self) -> MonitorStatus {
        self.status
            .read()
            .map(|s| s.clone())
            .unwrap_or(MonitorStatus::Stopped)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn start_monitoring(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::debug!("{} monitoring already running", self.platform);
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let ctx = MonitorContext {
            platform: self.platform,
            registry: Arc::clone(&self.registry),
            resolver: Arc::clone(&self.resolver),
            cache: Arc::clone(&self.cache),
            sink: Arc::new(RegistrySink::new(self.platform, Arc::clone(&self.registry))),
            cancel: cancel.clone(),
        };
        let parts = self.factory.build(&ctx)?;

        // Every session the registry learns about becomes a hash candidate
        let platform = self.platform;
        let resolver = Arc::clone(&self.resolver);
        let session_listener = self.registry.on_session_updated(move |session| {
            if session.platform == platform {
                resolver.submit_session(&session.session_id, session.id);
            }
        });

        let tracked = Arc::new(Mutex::new(HashSet::new()));
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        let pump = tokio::spawn(pump_events(
            events_rx,
            Arc::clone(&self.registry),
            Arc::clone(&parts.communicator),
            Arc::clone(&tracked),
            Arc::clone(&self.status),
        ));

        set_status(&self.status, MonitorStatus::Running);
        parts.communicator.connect(events_tx).await;

        let periodic = tokio::spawn(periodic_refresh(
            Arc::clone(&parts.communicator),
            Arc::clone(&self.cache),
            self.refresh_interval,
            cancel.clone(),
        ));

        tracing::info!("{} monitoring started", self.platform);
        *running = Some(RunningMonitor {
            communicator: parts.communicator,
            queue: parts.queue,
            cancel,
            pump,
            periodic,
            session_listener,
            tracked,
        });
        Ok(())
    }

    pub async fn stop_monitoring(&self) {
        let mut running = self.running.lock().await;
        let Some(monitor) = running.take() else {
            return;
        };

        monitor.cancel.cancel();
        monitor.communicator.disconnect().await;

        if let Err(e) = monitor.periodic.await {
            tracing::warn!("{} refresh task panicked: {}", self.platform, e);
        }
        // the pump ends once the communicator drops its event sender
        if let Err(e) = monitor.pump.await {
            tracing::warn!("{} event pump panicked: {}", self.platform, e);
        }
        if let Some(queue) = &monitor.queue {
            queue.shutdown().await;
        }

        self.registry.remove_session_listener(monitor.session_listener);
        if let Ok(mut tracked) = monitor.tracked.lock() {
            tracked.clear();
        }

        set_status(&self.status, MonitorStatus::Stopped);
        tracing::info!("{} monitoring stopped", self.platform);
    }
}

fn set_status(status: &RwLock<MonitorStatus>, next: MonitorStatus) {
    match status.write() {
        Ok(mut guard) => *guard = next,
        Err(e) => tracing::warn!("Monitor status lock poisoned: {e}"),
    }
}

/// Track an account; true if it was not tracked before
fn track(tracked: &Mutex<HashSet<String>>, account_id: &str) -> bool {
    match tracked.lock() {
        Ok(mut set) => set.insert(account_id.to_string()),
        Err(e) => {
            tracing::warn!("Tracked account lock poisoned: {e}");
            false
        }
    }
}

async fn pump_events(
    mut events: mpsc::Receiver<LiveEvent>,
    registry: Arc<LiveRegistry>,
    communicator: Arc<dyn LiveCommunicator>,
    tracked: Arc<Mutex<HashSet<String>>>,
    status: Arc<RwLock<MonitorStatus>>,
) {
    let platform = communicator.platform();

    while let Some(event) = events.recv().await {
        match event {
            LiveEvent::User(update) => {
                let account_id = update.account_id.clone();
                registry.merge_user(update);
                if track(&tracked, &account_id) {
                    if let Err(e) = communicator.subscribe(&account_id).await {
                        tracing::debug!("{}: subscribe to {} failed: {}", platform, account_id, e);
                    }
                }
            }
            LiveEvent::Session(session) => {
                registry.merge_session_with_details(session);
            }
            LiveEvent::Connected { reconnected } => {
                if reconnected {
                    let accounts: Vec<String> = tracked
                        .lock()
                        .map(|set| set.iter().cloned().collect())
                        .unwrap_or_default();
                    tracing::info!("{}: re-subscribing {} accounts", platform, accounts.len());
                    for account_id in accounts {
                        if let Err(e) = communicator.subscribe(&account_id).await {
                            tracing::debug!("{}: re-subscribe to {} failed: {}", platform, account_id, e);
                        }
                    }
                }
            }
            LiveEvent::Disconnected => {
                tracing::debug!("{}: stream disconnected", platform);
            }
            LiveEvent::Fatal(e) => {
                tracing::error!("{}: monitoring failed: {}", platform, e);
                set_status(&status, MonitorStatus::Failed(e.to_string()));
            }
        }
    }
}

async fn periodic_refresh(
    communicator: Arc<dyn LiveCommunicator>,
    cache: Arc<MetadataCache>,
    period: Duration,
    cancel: CancellationToken,
) {
    let platform = communicator.platform();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let swept = cache.sweep();
                if swept.marked_stale > 0 || swept.purged > 0 {
                    tracing::debug!(
                        "{}: cache sweep marked {} stale, purged {}",
                        platform,
                        swept.marked_stale,
                        swept.purged
                    );
                }

                if communicator.state() != ConnectionState::Connected {
                    continue;
                }
                if let Err(e) = communicator.request_full_status().await {
                    tracing::debug!("{}: full status request failed: {}", platform, e);
                }
            }
        }
    }
}
