//! Background enrichment queue.
//!
//! Communicators never fetch world/instance metadata inline; they enqueue a
//! job here and keep processing their stream. A single worker task drains
//! the high-priority queue before the normal one.
//!
//! ```text
//!   enqueue ─► [high] ─┐
//!   enqueue ─► [normal]┴─► worker ─► MetadataSource ─► MetadataCache
//!                                        │
//!                 world job: world_cached (immediately)
//!                 instance job: batch ── flushed when no instance job is queued
//! ```
//!
//! Dedup differs by job kind: a world is queued at most once for the life
//! of the queue, while an instance may be queued again once it is no longer
//! pending.

use super::error::ApiError;
use super::metadata_cache::MetadataCache;
use crate::data::{InstanceMetadata, WorldMetadata};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Reference to a session to enrich
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionRef {
    pub session_id: String,
    pub world_id: Option<String>,
}

impl SessionRef {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            world_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueJob {
    World(String),
    Instance { session: SessionRef, fast_fetch: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPriority {
    High,
    Normal,
}

/// Platform REST lookups used by the worker.
///
/// `Ok(None)` means the platform has no such object.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch_world(&self, world_id: &str) -> Result<Option<WorldMetadata>, ApiError>;

    async fn fetch_instance(
        &self,
        session: &SessionRef,
        fast_fetch: bool,
    ) -> Result<Option<InstanceMetadata>, ApiError>;

    async fn fetch_thumbnail(&self, url: &str) -> Result<Option<Vec<u8>>, ApiError>;
}

/// Receives the results of completed jobs
pub trait EnrichmentSink: Send + Sync {
    fn world_cached(&self, world: &WorldMetadata);
    fn session_enriched(&self, instance: &InstanceMetadata);
}

#[derive(Default)]
struct QueueState {
    high: VecDeque<QueueJob>,
    normal: VecDeque<QueueJob>,
    worlds_ever_queued: HashSet<String>,
    pending_instances: HashSet<SessionRef>,
    batch: Vec<InstanceMetadata>,
    worker_running: bool,
}

impl QueueState {
    fn pop(&mut self) -> Option<QueueJob> {
        let job = self.high.pop_front().or_else(|| self.normal.pop_front())?;
        if let QueueJob::Instance { session, .. } = &job {
            self.pending_instances.remove(session);
        }
        Some(job)
    }
}

pub struct EnrichmentQueue {
    state: Mutex<QueueState>,
    source: Arc<dyn MetadataSource>,
    cache: Arc<MetadataCache>,
    sink: Arc<dyn EnrichmentSink>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EnrichmentQueue {
    pub fn new(
        source: Arc<dyn MetadataSource>,
        cache: Arc<MetadataCache>,
        sink: Arc<dyn EnrichmentSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            source,
            cache,
            sink,
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        })
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    /// Queue a job and make sure the worker is running.
    ///
    /// Returns false if the job was deduplicated.
    pub fn enqueue(self: &Arc<Self>, job: QueueJob, priority: JobPriority) -> bool {
        let queued = self.push(job, priority);
        if queued {
            self.wake();
        }
        queued
    }

    /// Queue a job without waking the worker
    pub fn push(&self, job: QueueJob, priority: JobPriority) -> bool {
        let Ok(mut state) = self.state.lock() else {
            tracing::warn!("Enrichment queue lock poisoned on push");
            return false;
        };

        let fresh = match &job {
            QueueJob::World(world_id) => state.worlds_ever_queued.insert(world_id.clone()),
            QueueJob::Instance { session, .. } => state.pending_instances.insert(session.clone()),
        };
        if !fresh {
            return false;
        }

        match priority {
            JobPriority::High => state.high.push_back(job),
            JobPriority::Normal => state.normal.push_back(job),
        }
        true
    }

    /// Start the worker unless it is already running
    pub fn wake(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }

        {
            let Ok(mut state) = self.state.lock() else {
                tracing::warn!("Enrichment queue lock poisoned on wake");
                return;
            };
            if state.worker_running || (state.high.is_empty() && state.normal.is_empty()) {
                return;
            }
            state.worker_running = true;
        }

        let queue = Arc::clone(self);
        let handle = tokio::spawn(async move { queue.run_worker().await });
        match self.worker.lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(e) => tracing::warn!("Enrichment worker slot lock poisoned: {e}"),
        }
    }

    /// True while a worker owns the queue
    pub fn is_worker_running(&self) -> bool {
        self.state.lock().map(|s| s.worker_running).unwrap_or(false)
    }

    pub fn pending_len(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.high.len() + s.normal.len())
            .unwrap_or(0)
    }

    /// Wait for the current worker (if any) to finish draining
    pub async fn join_worker(&self) {
        let handle = self.worker.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Enrichment worker panicked: {}", e);
            }
        }
    }

    /// Cancel the worker and wait for it to exit
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.join_worker().await;
    }

    async fn run_worker(self: Arc<Self>) {
        tracing::debug!("Enrichment worker started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let job = {
                let Ok(mut state) = self.state.lock() else {
                    tracing::warn!("Enrichment queue lock poisoned in worker");
                    return;
                };
                match state.pop() {
                    Some(job) => job,
                    None if state.batch.is_empty() => {
                        state.worker_running = false;
                        tracing::debug!("Enrichment worker idle");
                        return;
                    }
                    None => {
                        // still the only worker while flushing; jobs queued
                        // by the sink are picked up on the next pass
                        let leftover = std::mem::take(&mut state.batch);
                        drop(state);
                        self.flush(leftover);
                        continue;
                    }
                }
            };

            match job {
                QueueJob::World(world_id) => self.process_world(&world_id).await,
                QueueJob::Instance {
                    session,
                    fast_fetch,
                } => self.process_instance(&session, fast_fetch).await,
            }
        }

        if let Ok(mut state) = self.state.lock() {
            state.worker_running = false;
        }
        tracing::debug!("Enrichment worker cancelled");
    }

    async fn process_world(&self, world_id: &str) {
        let fetched = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.source.fetch_world(world_id) => result,
        };

        let world = match fetched {
            Ok(Some(world)) => world,
            Ok(None) => {
                tracing::debug!("World {} not found, dropping job", world_id);
                return;
            }
            Err(e) => {
                tracing::debug!("Failed to fetch world {}: {}", world_id, e);
                return;
            }
        };

        if let Some(url) = world.thumbnail_url.as_deref() {
            let thumbnail = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = self.source.fetch_thumbnail(url) => result,
            };
            match thumbnail {
                Ok(Some(bytes)) => self.cache.put_thumbnail(world_id, bytes),
                Ok(None) => {}
                Err(e) => tracing::debug!("Failed to fetch thumbnail for {}: {}", world_id, e),
            }
        }

        self.cache.put_world(world.clone());
        self.sink.world_cached(&world);
    }

    async fn process_instance(&self, session: &SessionRef, fast_fetch: bool) {
        let fetched = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.source.fetch_instance(session, fast_fetch) => result,
        };

        let instance = match fetched {
            Ok(Some(instance)) => Some(instance),
            Ok(None) => {
                tracing::debug!("Instance {} not found, dropping job", session.session_id);
                None
            }
            Err(e) => {
                tracing::debug!("Failed to fetch instance {}: {}", session.session_id, e);
                None
            }
        };

        let ready = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if let Some(instance) = instance {
                self.cache.put_instance(instance.clone());
                state.batch.push(instance);
            }
            if state.pending_instances.is_empty() {
                std::mem::take(&mut state.batch)
            } else {
                Vec::new()
            }
        };

        self.flush(ready);
    }

    fn flush(&self, batch: Vec<InstanceMetadata>) {
        if batch.is_empty() {
            return;
        }
        tracing::debug!("Flushing {} enriched sessions", batch.len());
        for instance in &batch {
            self.sink.session_enriched(instance);
        }
    }
}
