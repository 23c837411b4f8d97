//! Platform-independent live communicator.
//!
//! Owns one streaming connection per platform and runs the reconnect state
//! machine:
//!
//! ```text
//! Disconnected ─► Connecting ─► Connected ─(error)─► Disconnected ─► Reconnecting ─► Connecting …
//!                                   │
//!                                   └─(disconnect())─► Disconnected   (no reconnect)
//! ```
//!
//! Platform specifics (handshake, wire decoding, session derivation) live in
//! a [`PlatformAdapter`]. Inbound frames and outbound commands are handled
//! by the single connection task, so frame events are produced strictly in
//! order. Full polls run on a side task while the stream keeps flowing; their
//! results are delivered by the connection task once they complete.

use super::enrichment_queue::EnrichmentQueue;
use super::error::ApiError;
use super::metadata_cache::MetadataCache;
use super::retry::{reconnect_delay, sleep_or_cancel};
use super::session_hash::SessionHashResolver;
use super::transport::{StreamTransport, TransportConnector};
use crate::data::{LiveUserUpdate, NonIndexedSession, Platform, UpdateTrigger};
use crate::registry::SessionIdLookup;
use crate::util::send_or_log;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use uuid::Uuid;

/// A session that stays up this long resets the backoff sequence
const STABLE_CONNECTION: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Canonical events produced by a communicator
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    User(LiveUserUpdate),
    Session(NonIndexedSession),
    /// Streaming started; `reconnected` is false for the first connection
    Connected { reconnected: bool },
    Disconnected,
    /// The communicator gave up (auth expired) and will not reconnect
    Fatal(ApiError),
}

/// Events and frames produced while handling one input
#[derive(Debug, Default)]
pub struct FrameOutcome {
    pub events: Vec<LiveEvent>,
    /// Frames to send back on the same connection
    pub replies: Vec<String>,
}

impl FrameOutcome {
    pub fn events(events: Vec<LiveEvent>) -> Self {
        Self {
            events,
            replies: Vec::new(),
        }
    }
}

/// Per-connection context handed to the adapter
#[derive(Debug, Clone)]
pub struct LinkContext {
    pub connection_id: Uuid,
    pub cancel: CancellationToken,
}

/// Shared services a platform adapter resolves sessions against
#[derive(Clone)]
pub struct PlatformServices {
    pub resolver: Arc<SessionHashResolver>,
    pub cache: Arc<MetadataCache>,
    pub queue: Arc<EnrichmentQueue>,
    pub lookup: Option<Arc<dyn SessionIdLookup>>,
}

/// Wire mapping for one platform
#[async_trait]
pub trait PlatformAdapter: Send + Sync + 'static {
    fn platform(&self) -> Platform;

    /// Frames sent right after the transport opens
    fn handshake(&self) -> Vec<String> {
        Vec::new()
    }

    /// Period and frame of an application-level keepalive, if the protocol needs one
    fn keepalive(&self) -> Option<(Duration, String)> {
        None
    }

    /// Enumerate contacts and their current state
    async fn full_poll(
        &self,
        ctx: &LinkContext,
        trigger: UpdateTrigger,
    ) -> Result<FrameOutcome, ApiError>;

    /// Frame subscribing to one account's updates; `None` if the platform
    /// pushes every contact without being asked
    fn subscribe_frame(&self, account_id: &str) -> Option<String>;

    /// Frame asking the platform to push every contact's status again;
    /// `None` falls back to a full poll
    fn status_request_frame(&self) -> Option<String>;

    /// Decode one inbound frame.
    ///
    /// `ApiError::Protocol` skips the frame, `AuthExpired` stops the
    /// communicator, anything else drops the connection.
    async fn handle_frame(&self, frame: &str, ctx: &LinkContext) -> Result<FrameOutcome, ApiError>;
}

/// Lifecycle contract the orchestrator drives
#[async_trait]
pub trait LiveCommunicator: Send + Sync {
    fn platform(&self) -> Platform;

    fn state(&self) -> ConnectionState;

    /// Start the connection task; events are delivered on `events`
    async fn connect(&self, events: mpsc::Sender<LiveEvent>);

    /// Deliberately disconnect and wait for the connection task to exit
    async fn disconnect(&self);

    async fn subscribe(&self, account_id: &str) -> Result<(), ApiError>;

    /// Ask for a full status push (compensates for idle streams going quiet)
    async fn request_full_status(&self) -> Result<(), ApiError>;
}

enum Outbound {
    Frame(String),
    FullPoll,
}

enum SessionEnd {
    Stopped,
    Failed(String),
    Fatal(ApiError),
}

/// State shared between the communicator handle and its connection task
struct Link<A> {
    adapter: Arc<A>,
    connector: Arc<dyn TransportConnector>,
    state: Arc<RwLock<ConnectionState>>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Outbound>>>>,
    deliberate: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl<A: PlatformAdapter> Link<A> {
    fn set_state(&self, next: ConnectionState) {
        set_state(&self.state, self.adapter.platform().label(), next);
    }

    fn set_outbound(&self, tx: Option<mpsc::UnboundedSender<Outbound>>) {
        match self.outbound.lock() {
            Ok(mut slot) => *slot = tx,
            Err(e) => tracing::warn!("Outbound slot lock poisoned: {e}"),
        }
    }

    fn stopping(&self) -> bool {
        self.deliberate.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }
}

fn set_state(state: &RwLock<ConnectionState>, platform: &str, next: ConnectionState) {
    match state.write() {
        Ok(mut guard) => {
            if *guard != next {
                tracing::debug!("{} connection: {:?} -> {:?}", platform, *guard, next);
                *guard = next;
            }
        }
        Err(e) => tracing::warn!("Connection state lock poisoned: {e}"),
    }
}

/// Communicator for one platform, parameterized by its wire adapter
pub struct Communicator<A> {
    adapter: Arc<A>,
    connector: Arc<dyn TransportConnector>,
    state: Arc<RwLock<ConnectionState>>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Outbound>>>>,
    deliberate: Arc<AtomicBool>,
    cancel: Mutex<CancellationToken>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<A: PlatformAdapter> Communicator<A> {
    pub fn new(adapter: Arc<A>, connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            adapter,
            connector,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outbound: Arc::new(Mutex::new(None)),
            deliberate: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(CancellationToken::new()),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn adapter(&self) -> &Arc<A> {
        &self.adapter
    }

    fn send_outbound(&self, command: Outbound) -> Result<(), ApiError> {
        let sender = self
            .outbound
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().cloned());
        let Some(sender) = sender else {
            return Err(ApiError::Transient("not connected".to_string()));
        };
        sender
            .send(command)
            .map_err(|_| ApiError::Transient("connection closed".to_string()))
    }
}

#[async_trait]
impl<A: PlatformAdapter> LiveCommunicator for Communicator<A> {
    fn platform(&self) -> Platform {
        self.adapter.platform()
    }

    fn state(&self) -> ConnectionState {
        self.state
            .read()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Disconnected)
    }

    async fn connect(&self, events: mpsc::Sender<LiveEvent>) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            tracing::debug!("{} communicator already running", self.platform());
            return;
        }

        self.deliberate.store(false, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        match self.cancel.lock() {
            Ok(mut slot) => *slot = cancel.clone(),
            Err(e) => tracing::warn!("Cancel slot lock poisoned: {e}"),
        }

        let link = Link {
            adapter: Arc::clone(&self.adapter),
            connector: Arc::clone(&self.connector),
            state: Arc::clone(&self.state),
            outbound: Arc::clone(&self.outbound),
            deliberate: Arc::clone(&self.deliberate),
            cancel,
        };

        *task = Some(tokio::spawn(run_connection_loop(link, events)));
    }

    async fn disconnect(&self) {
        self.deliberate.store(true, Ordering::SeqCst);
        if let Ok(cancel) = self.cancel.lock() {
            cancel.cancel();
        }

        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("{} connection task panicked: {}", self.platform(), e);
            }
        }
        set_state(&self.state, self.platform().label(), ConnectionState::Disconnected);
    }

    async fn subscribe(&self, account_id: &str) -> Result<(), ApiError> {
        match self.adapter.subscribe_frame(account_id) {
            Some(frame) => self.send_outbound(Outbound::Frame(frame)),
            None => Ok(()),
        }
    }

    async fn request_full_status(&self) -> Result<(), ApiError> {
        match self.adapter.status_request_frame() {
            Some(frame) => self.send_outbound(Outbound::Frame(frame)),
            None => self.send_outbound(Outbound::FullPoll),
        }
    }
}

async fn run_connection_loop<A: PlatformAdapter>(link: Link<A>, events: mpsc::Sender<LiveEvent>) {
    let platform = link.adapter.platform();
    let mut attempt: u32 = 0;
    let mut has_connected = false;

    loop {
        if link.stopping() {
            break;
        }

        let delay = reconnect_delay(attempt);
        if !delay.is_zero() {
            tracing::info!("{}: reconnecting in {:?} (attempt {})", platform, delay, attempt);
        }
        if !sleep_or_cancel(delay, &link.cancel).await {
            break;
        }

        link.set_state(ConnectionState::Connecting);
        let connected = tokio::select! {
            _ = link.cancel.cancelled() => break,
            result = link.connector.connect() => result,
        };

        let transport = match connected {
            Ok(transport) => transport,
            Err(e) if e.is_fatal() => {
                tracing::error!("{}: {}; giving up", platform, e);
                link.set_state(ConnectionState::Disconnected);
                send_or_log(&events, LiveEvent::Fatal(e), "fatal event").await;
                break;
            }
            Err(e) => {
                tracing::warn!("{}: connect failed: {}", platform, e);
                attempt = attempt.saturating_add(1);
                link.set_state(ConnectionState::Reconnecting);
                continue;
            }
        };

        let started = Instant::now();
        let end = run_session(&link, transport, &events, has_connected).await;
        has_connected = true;
        link.set_outbound(None);
        link.set_state(ConnectionState::Disconnected);

        match end {
            SessionEnd::Stopped => break,
            SessionEnd::Fatal(e) => {
                tracing::error!("{}: {}; giving up", platform, e);
                send_or_log(&events, LiveEvent::Fatal(e), "fatal event").await;
                break;
            }
            SessionEnd::Failed(reason) => {
                if !send_or_log(&events, LiveEvent::Disconnected, "disconnect event").await {
                    break;
                }
                if link.stopping() {
                    break;
                }
                tracing::warn!("{}: connection lost: {}", platform, reason);
                attempt = if started.elapsed() >= STABLE_CONNECTION {
                    0
                } else {
                    attempt.saturating_add(1)
                };
                link.set_state(ConnectionState::Reconnecting);
            }
        }
    }

    link.set_outbound(None);
    link.set_state(ConnectionState::Disconnected);
    tracing::info!("{}: communicator stopped", platform);
}

async fn run_session<A: PlatformAdapter>(
    link: &Link<A>,
    mut transport: Box<dyn StreamTransport>,
    events: &mpsc::Sender<LiveEvent>,
    reconnected: bool,
) -> SessionEnd {
    let platform = link.adapter.platform();
    let ctx = LinkContext {
        connection_id: Uuid::new_v4(),
        cancel: link.cancel.clone(),
    };

    for frame in link.adapter.handshake() {
        if let Err(e) = transport.send_text(frame).await {
            return SessionEnd::Failed(format!("handshake failed: {e}"));
        }
    }

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    link.set_outbound(Some(out_tx));
    link.set_state(ConnectionState::Connected);
    tracing::info!("{}: connected ({})", platform, ctx.connection_id);

    let trigger = if reconnected {
        UpdateTrigger::Refresh
    } else {
        UpdateTrigger::InitialPoll
    };
    // polls run beside the stream so frames, pongs and keepalives keep flowing
    let mut poll = Some(spawn_full_poll(link, &ctx, trigger));
    let mut announced = false;

    let (mut ticker, ping_frame) = match link.adapter.keepalive() {
        Some((period, frame)) => {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            (Some(interval), Some(frame))
        }
        None => (None, None),
    };

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                transport.close().await;
                return SessionEnd::Stopped;
            }
            frame = transport.next_text() => {
                let text = match frame {
                    None => return SessionEnd::Failed("closed by peer".to_string()),
                    Some(Err(ApiError::Protocol(msg))) => {
                        tracing::warn!("{}: skipping undecodable frame: {}", platform, msg);
                        continue;
                    }
                    Some(Err(e)) if e.is_fatal() => return SessionEnd::Fatal(e),
                    Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
                    Some(Ok(text)) => text,
                };

                match link.adapter.handle_frame(&text, &ctx).await {
                    Ok(outcome) => {
                        if let Some(end) = deliver(outcome, &mut transport, events).await {
                            return end;
                        }
                    }
                    Err(ApiError::Protocol(msg)) => {
                        tracing::warn!("{}: skipping malformed message: {}", platform, msg);
                    }
                    Err(e) if e.is_fatal() => return SessionEnd::Fatal(e),
                    Err(ApiError::Cancelled) => return SessionEnd::Stopped,
                    Err(e) => {
                        tracing::error!("{}: failed to handle message: {}", platform, e);
                        return SessionEnd::Failed(e.to_string());
                    }
                }
            }
            joined = async {
                match poll.as_mut() {
                    Some(handle) => handle.await,
                    None => std::future::pending().await,
                }
            } => {
                poll = None;
                let result = joined.unwrap_or_else(|e| {
                    Err(ApiError::Transient(format!("full poll task failed: {e}")))
                });
                if let Some(end) = finish_full_poll(platform, result, &mut transport, events).await {
                    return end;
                }
                if !announced {
                    announced = true;
                    if !send_or_log(events, LiveEvent::Connected { reconnected }, "connected event").await {
                        return SessionEnd::Stopped;
                    }
                }
            }
            Some(command) = out_rx.recv() => match command {
                Outbound::Frame(frame) => {
                    if let Err(e) = transport.send_text(frame).await {
                        return SessionEnd::Failed(format!("send failed: {e}"));
                    }
                }
                Outbound::FullPoll => {
                    if poll.is_some() {
                        tracing::debug!("{}: full poll already running", platform);
                    } else {
                        poll = Some(spawn_full_poll(link, &ctx, UpdateTrigger::Refresh));
                    }
                }
            },
            _ = async {
                match ticker.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {
                if let Some(frame) = ping_frame.clone() {
                    if let Err(e) = transport.send_text(frame).await {
                        return SessionEnd::Failed(format!("keepalive failed: {e}"));
                    }
                }
            }
        }
    }
}

/// Start a full poll on its own task; it is aborted if the session ends first
fn spawn_full_poll<A: PlatformAdapter>(
    link: &Link<A>,
    ctx: &LinkContext,
    trigger: UpdateTrigger,
) -> AbortOnDropHandle<Result<FrameOutcome, ApiError>> {
    let adapter = Arc::clone(&link.adapter);
    let ctx = ctx.clone();
    AbortOnDropHandle::new(tokio::spawn(async move {
        adapter.full_poll(&ctx, trigger).await
    }))
}

/// Deliver a finished full poll.
///
/// Poll failures other than auth and cancellation leave the stream up.
async fn finish_full_poll(
    platform: Platform,
    result: Result<FrameOutcome, ApiError>,
    transport: &mut Box<dyn StreamTransport>,
    events: &mpsc::Sender<LiveEvent>,
) -> Option<SessionEnd> {
    match result {
        Ok(outcome) => {
            tracing::debug!(
                "{}: full poll produced {} events",
                platform,
                outcome.events.len()
            );
            deliver(outcome, transport, events).await
        }
        Err(ApiError::Cancelled) => Some(SessionEnd::Stopped),
        Err(e) if e.is_fatal() => Some(SessionEnd::Fatal(e)),
        Err(e) => {
            tracing::warn!("{}: full poll failed: {}", platform, e);
            None
        }
    }
}

async fn deliver(
    outcome: FrameOutcome,
    transport: &mut Box<dyn StreamTransport>,
    events: &mpsc::Sender<LiveEvent>,
) -> Option<SessionEnd> {
    for reply in outcome.replies {
        if let Err(e) = transport.send_text(reply).await {
            return Some(SessionEnd::Failed(format!("send failed: {e}")));
        }
    }
    for event in outcome.events {
        if !send_or_log(events, event, "live event").await {
            return Some(SessionEnd::Stopped);
        }
    }
    None
}
