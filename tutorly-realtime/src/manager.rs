//! Connection lifecycle and the automatic reconnect loop.
//!
//! ```text
//!            connect()               open
//!   Idle ───────────────► Connecting ─────► Open
//!                           ▲    │            │
//!           backoff timer   │    │ close      │ close(≠1000)
//!                           │    ▼            ▼
//!                        ReconnectPolicy ◄────┘
//!                           │         │
//!                 exhausted │         │ 1000 / local
//!                           ▼         ▼
//!                        Failed     Closed ◄── Closing ◄── disconnect()
//! ```
//!
//! All transitions happen under one mutex, which plays the role of the event
//! loop: transport events, the backoff timer and the public API never
//! interleave inside a transition. Every transport gets a generation number;
//! events tagged with a retired generation are ignored, as is everything
//! after disposal.
//!
//! Subscriber handlers and the error handler always run with no lock held.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;
use uuid::Uuid;

use crate::codec::{self, MessageEnvelope};
use crate::config::{self, ClientConfig};
use crate::error::ClientError;
use crate::policy::{CloseOrigin, ReconnectDecision, ReconnectPolicy, NORMAL_CLOSURE};
use crate::registry::SubscriberRegistry;
use crate::transport::{self, Outbound, Transport, TransportEvent, TransportFactory};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Never connected
    Idle,
    /// Handshake in flight, or waiting out a reconnect backoff
    Connecting,
    Open,
    /// Local close requested, waiting for the transport to confirm
    Closing,
    /// Closed on purpose; no reconnect scheduled
    Closed,
    /// Reconnect attempts exhausted; needs a manual `connect()`
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A scheduled reconnect, kept until it fires or is superseded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectAttempt {
    /// Zero-based within the current episode
    pub attempt_number: u32,
    pub scheduled_at: Instant,
    pub delay: Duration,
    pub close_code: u16,
    pub close_reason: String,
}

impl ReconnectAttempt {
    pub fn fires_at(&self) -> Instant {
        self.scheduled_at + self.delay
    }
}

type ErrorHandler = Arc<dyn Fn(&ClientError) + Send + Sync>;

struct PendingReconnect {
    attempt: ReconnectAttempt,
    timer: JoinHandle<()>,
}

struct Inner {
    state: ConnectionState,
    transport: Option<Box<dyn Transport>>,
    pump: Option<JoinHandle<()>>,
    /// Bumped for every transport; events carry the value they were opened with
    generation: u64,
    /// Reconnect attempts made in the current episode
    attempt: u32,
    /// Set by `disconnect()` so the next close is treated as local
    closing_locally: bool,
    reconnect: Option<PendingReconnect>,
    token: Option<String>,
    disposed: bool,
}

struct Shared {
    id: Uuid,
    endpoint: Url,
    token_param: String,
    policy: ReconnectPolicy,
    factory: Arc<dyn TransportFactory>,
    registry: Arc<SubscriberRegistry>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    message_tx: watch::Sender<Option<Arc<MessageEnvelope>>>,
    error_handler: RwLock<Option<ErrorHandler>>,
}

/// Owns one logical connection: its transport, state and reconnect timer.
///
/// Not `Clone`; the owner's lifetime is the connection's lifetime. Dropping
/// the manager disposes it. Methods never block, but must be called from
/// within a tokio runtime.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        config: &ClientConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, ClientError> {
        let endpoint = config.validate()?;
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (message_tx, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            endpoint,
            token_param: config.token_param.clone(),
            policy: ReconnectPolicy::new(config.reconnect.clone()),
            factory,
            registry: Arc::new(SubscriberRegistry::new()),
            inner: Mutex::new(Inner {
                state: ConnectionState::Idle,
                transport: None,
                pump: None,
                generation: 0,
                attempt: 0,
                closing_locally: false,
                reconnect: None,
                token: config.token.clone(),
                disposed: false,
            }),
            state_tx,
            message_tx,
            error_handler: RwLock::new(None),
        });
        Ok(Self { shared })
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.shared.registry
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.shared.policy
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Most recently delivered envelope.
    pub fn last_message(&self) -> Option<Arc<MessageEnvelope>> {
        self.shared.message_tx.borrow().clone()
    }

    pub fn watch_messages(&self) -> watch::Receiver<Option<Arc<MessageEnvelope>>> {
        self.shared.message_tx.subscribe()
    }

    /// Reconnect attempts made in the current episode.
    pub fn attempt(&self) -> u32 {
        self.shared.lock().attempt
    }

    /// The reconnect currently waiting on its backoff timer, if any.
    pub fn pending_reconnect(&self) -> Option<ReconnectAttempt> {
        self.shared.lock().reconnect.as_ref().map(|p| p.attempt.clone())
    }

    /// Token used by every later open, automatic reconnects included.
    pub fn set_token(&self, token: Option<String>) {
        self.shared.lock().token = token;
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        *self
            .shared
            .error_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.lock().disposed
    }

    /// Open a connection and start a fresh reconnect episode.
    ///
    /// No-op while connecting or open, and after disposal. During `Closing`
    /// the half-closed transport is retired without waiting for its echo.
    pub fn connect(&self) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if inner.disposed {
            log::warn!("[{}] connect() after dispose ignored", shared.id);
            return;
        }
        match inner.state {
            ConnectionState::Connecting | ConnectionState::Open => {
                log::debug!("[{}] connect() ignored while {}", shared.id, inner.state);
                return;
            }
            ConnectionState::Closing => {
                log::debug!("[{}] Abandoning unconfirmed close", shared.id);
                inner.transport = None;
            }
            ConnectionState::Idle | ConnectionState::Closed | ConnectionState::Failed => {}
        }
        inner.attempt = 0;
        shared.open_transport(&mut inner);
    }

    /// Fire-and-forget send. Dropped with a warning unless the state is `Open`.
    pub fn send(&self, message: impl Into<Outbound>) {
        let shared = &self.shared;
        let text = match message.into().into_text() {
            Ok(text) => text,
            Err(e) => {
                log::warn!("[{}] Failed to serialize outbound message: {e}", shared.id);
                return;
            }
        };
        let mut inner = shared.lock();
        if inner.state != ConnectionState::Open {
            log::warn!(
                "[{}] Cannot send message: connection is {}",
                shared.id,
                inner.state
            );
            return;
        }
        if let Some(transport) = inner.transport.as_mut() {
            if let Err(e) = transport.send(text) {
                log::warn!("[{}] Send failed: {e}", shared.id);
            }
        }
    }

    /// Close on purpose. The resulting close is never reconnected.
    ///
    /// `Closing` is observable as soon as this returns; `Closed` follows
    /// when the transport confirms. During a backoff wait the timer is
    /// cancelled and the state goes straight to `Closed`.
    pub fn disconnect(&self, code: u16, reason: &str) {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if inner.disposed || inner.state == ConnectionState::Closing {
            return;
        }
        if let Some(pending) = inner.reconnect.take() {
            pending.timer.abort();
            inner.attempt = 0;
            log::info!("[{}] Reconnect cancelled by disconnect()", shared.id);
            shared.set_state(&mut inner, ConnectionState::Closed);
            return;
        }
        if inner.transport.is_none() {
            log::debug!("[{}] disconnect() with no live connection", shared.id);
            return;
        }
        inner.closing_locally = true;
        shared.set_state(&mut inner, ConnectionState::Closing);
        if let Some(transport) = inner.transport.as_mut() {
            transport.close(code, reason);
        }
    }

    /// Tear down for good: cancel the timer, close the transport, stop the
    /// event pump and release every subscription. Idempotent.
    pub fn dispose(&self) {
        self.shared.dispose();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut Inner, next: ConnectionState) {
        if inner.state == next {
            return;
        }
        log::debug!("[{}] {} -> {}", self.id, inner.state, next);
        inner.state = next;
        self.state_tx.send_replace(next);
    }

    fn open_transport(self: &Arc<Self>, inner: &mut Inner) {
        if let Some(pending) = inner.reconnect.take() {
            pending.timer.abort();
        }
        if let Some(old) = inner.pump.take() {
            old.abort();
        }
        inner.generation += 1;
        inner.closing_locally = false;
        let generation = inner.generation;

        let url = config::endpoint_url(&self.endpoint, &self.token_param, inner.token.as_deref());
        log::info!(
            "[{}] Connecting to {}",
            self.id,
            config::redacted(&url, &self.token_param)
        );
        self.set_state(inner, ConnectionState::Connecting);

        let (sink, events) = transport::event_channel();
        inner.transport = Some(self.factory.open(url.as_str(), sink));
        inner.pump = Some(tokio::spawn(pump(Arc::downgrade(self), generation, events)));
    }

    fn handle_event(self: &Arc<Self>, generation: u64, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.on_open(generation),
            TransportEvent::Message(raw) => self.on_message(generation, &raw),
            TransportEvent::Close { code, reason } => self.on_close(generation, code, reason),
            TransportEvent::Error(cause) => self.on_transport_error(generation, cause),
        }
    }

    fn is_current(inner: &Inner, generation: u64) -> bool {
        !inner.disposed && inner.generation == generation && inner.transport.is_some()
    }

    fn on_open(&self, generation: u64) {
        let mut inner = self.lock();
        if !Self::is_current(&inner, generation) || inner.state != ConnectionState::Connecting {
            return;
        }
        inner.attempt = 0;
        self.set_state(&mut inner, ConnectionState::Open);
        log::info!("[{}] Connected", self.id);
    }

    fn on_message(&self, generation: u64, raw: &str) {
        {
            let inner = self.lock();
            if !Self::is_current(&inner, generation) {
                return;
            }
        }
        match codec::parse(raw) {
            Ok(envelope) => {
                let envelope = Arc::new(envelope);
                self.message_tx.send_replace(Some(Arc::clone(&envelope)));
                self.registry.dispatch(&envelope);
            }
            Err(e) => log::error!("[{}] Error parsing message: {e}", self.id),
        }
    }

    fn on_transport_error(&self, generation: u64, cause: String) {
        {
            let inner = self.lock();
            if !Self::is_current(&inner, generation) {
                return;
            }
        }
        log::warn!("[{}] Transport error: {cause}", self.id);
        self.report(&ClientError::Transport(cause));
    }

    fn on_close(self: &Arc<Self>, generation: u64, code: u16, reason: String) {
        let mut inner = self.lock();
        if !Self::is_current(&inner, generation) {
            return;
        }
        inner.transport = None;
        let origin = if std::mem::take(&mut inner.closing_locally) {
            CloseOrigin::Local
        } else {
            CloseOrigin::Remote
        };
        let attempt = inner.attempt;

        match self.policy.decide(code, origin, attempt) {
            ReconnectDecision::Stop => {
                log::info!("[{}] Connection closed (code {code})", self.id);
                inner.attempt = 0;
                self.set_state(&mut inner, ConnectionState::Closed);
            }
            ReconnectDecision::Exhausted => {
                log::warn!(
                    "[{}] Connection lost (code {code}); giving up after {attempt} reconnect attempts",
                    self.id
                );
                self.set_state(&mut inner, ConnectionState::Failed);
                drop(inner);
                self.report(&ClientError::ReconnectExhausted {
                    attempts: attempt,
                    close_code: code,
                });
            }
            ReconnectDecision::Retry(delay) => {
                log::info!(
                    "[{}] Connection lost (code {code}); reconnecting in {}ms (attempt {}/{})",
                    self.id,
                    delay.as_millis(),
                    attempt + 1,
                    self.policy.max_attempts()
                );
                let record = ReconnectAttempt {
                    attempt_number: attempt,
                    scheduled_at: Instant::now(),
                    delay,
                    close_code: code,
                    close_reason: reason,
                };
                inner.attempt = attempt + 1;
                self.set_state(&mut inner, ConnectionState::Connecting);
                let timer = tokio::spawn(reconnect_after(Arc::downgrade(self), generation, delay));
                inner.reconnect = Some(PendingReconnect {
                    attempt: record,
                    timer,
                });
            }
        }
    }

    fn fire_reconnect(self: &Arc<Self>, generation: u64) {
        let mut inner = self.lock();
        if inner.disposed || inner.generation != generation || inner.reconnect.is_none() {
            return;
        }
        // This task is the timer; dropping its handle just detaches it.
        inner.reconnect = None;
        self.open_transport(&mut inner);
    }

    fn report(&self, error: &ClientError) {
        let handler = self
            .error_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(error))).is_err() {
                log::error!("[{}] Error handler panicked", self.id);
            }
        }
    }

    fn dispose(&self) {
        let mut inner = self.lock();
        if inner.disposed {
            return;
        }
        inner.disposed = true;
        if let Some(pending) = inner.reconnect.take() {
            pending.timer.abort();
        }
        if let Some(mut transport) = inner.transport.take() {
            transport.close(NORMAL_CLOSURE, "client disposed");
        }
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        inner.closing_locally = false;
        self.set_state(&mut inner, ConnectionState::Closed);
        drop(inner);

        self.registry.clear();
        *self
            .error_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        log::debug!("[{}] Disposed", self.id);
    }
}

/// Feeds one transport's events into the manager, in order.
async fn pump(
    shared: Weak<Shared>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let closed = matches!(event, TransportEvent::Close { .. });
        shared.handle_event(generation, event);
        if closed {
            break;
        }
    }
}

async fn reconnect_after(shared: Weak<Shared>, generation: u64, delay: Duration) {
    tokio::time::sleep(delay).await;
    if let Some(shared) = shared.upgrade() {
        shared.fire_reconnect(generation);
    }
}
