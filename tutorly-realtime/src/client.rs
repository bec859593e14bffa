//! Public facade over one connection manager.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, automatic reconnect)
//! - Per-type subscriptions with disposer handles
//! - Observable connection state and a most-recent-message slot
//! - Disposal that leaves no timers, tasks or handlers behind
//!
//! A `RealtimeClient` is meant to live exactly as long as its owner (a
//! screen, a session, a service). Dropping it disposes it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::codec::MessageEnvelope;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::manager::{ConnectionManager, ConnectionState, ReconnectAttempt};
use crate::policy::NORMAL_CLOSURE;
use crate::registry::{HandlerId, SubscriberRegistry};
use crate::transport::{Outbound, TransportFactory, WsTransportFactory};

/// Disposer returned by the subscribe calls.
///
/// Calling [`Unsubscribe::unsubscribe`] more than once is harmless. Dropping
/// it does *not* unsubscribe; subscriptions end explicitly or with the client.
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    registry: Weak<SubscriberRegistry>,
    owned: Weak<Mutex<HashSet<HandlerId>>>,
    id: HandlerId,
}

impl Unsubscribe {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn unsubscribe(&self) {
        if let Some(owned) = self.owned.upgrade() {
            lock(&owned).remove(&self.id);
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(self.id);
        }
    }
}

/// The real-time client.
pub struct RealtimeClient {
    manager: ConnectionManager,
    /// Live subscriptions made through this facade, released on dispose
    owned: Arc<Mutex<HashSet<HandlerId>>>,
}

impl RealtimeClient {
    /// Client over the tokio-tungstenite WebSocket transport.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let mut factory =
            WsTransportFactory::new().with_connect_timeout(config.connect_timeout());
        if let Some(timeout) = config.close_timeout() {
            factory = factory.with_close_timeout(timeout);
        }
        Self::with_transport(config, Arc::new(factory))
    }

    /// Client over any transport, e.g. the in-memory one behind the `mock` feature.
    pub fn with_transport(
        config: ClientConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, ClientError> {
        let manager = ConnectionManager::new(&config, factory)?;
        Ok(Self {
            manager,
            owned: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn connect(&self) {
        self.manager.connect();
    }

    /// Normal closure (1000); never reconnected.
    pub fn disconnect(&self) {
        self.manager.disconnect(NORMAL_CLOSURE, "client disconnect");
    }

    pub fn disconnect_with(&self, code: u16, reason: &str) {
        self.manager.disconnect(code, reason);
    }

    /// Fire-and-forget; dropped with a warning unless connected.
    pub fn send(&self, message: impl Into<Outbound>) {
        self.manager.send(message);
    }

    pub fn send_json<T: Serialize>(&self, message: &T) {
        match serde_json::to_value(message) {
            Ok(value) => self.manager.send(value),
            Err(e) => log::warn!("Failed to serialize outbound message: {e}"),
        }
    }

    /// Receive the `data` payload of every `message_type` envelope.
    pub fn subscribe<F>(&self, message_type: impl Into<String>, handler: F) -> Unsubscribe
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe_envelopes(message_type, move |envelope| handler(&envelope.data))
    }

    /// Like [`subscribe`](Self::subscribe) but with the whole envelope.
    pub fn subscribe_envelopes<F>(&self, message_type: impl Into<String>, handler: F) -> Unsubscribe
    where
        F: Fn(&MessageEnvelope) + Send + Sync + 'static,
    {
        let id = self.manager.registry().subscribe(message_type, handler);
        self.track(id)
    }

    /// Receive envelopes whose type has no dedicated subscriber.
    pub fn subscribe_all<F>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(&MessageEnvelope) + Send + Sync + 'static,
    {
        let id = self.manager.registry().subscribe_all(handler);
        self.track(id)
    }

    fn track(&self, id: HandlerId) -> Unsubscribe {
        lock(&self.owned).insert(id);
        Unsubscribe {
            registry: Arc::downgrade(self.manager.registry()),
            owned: Arc::downgrade(&self.owned),
            id,
        }
    }

    /// Subscriptions made through this client that are still active.
    pub fn subscription_count(&self) -> usize {
        lock(&self.owned).len()
    }

    /// Called for transport faults and reconnect exhaustion.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.manager.on_error(handler);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.watch_state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Open
    }

    pub fn last_message(&self) -> Option<Arc<MessageEnvelope>> {
        self.manager.last_message()
    }

    pub fn watch_messages(&self) -> watch::Receiver<Option<Arc<MessageEnvelope>>> {
        self.manager.watch_messages()
    }

    pub fn reconnect_attempt(&self) -> Option<ReconnectAttempt> {
        self.manager.pending_reconnect()
    }

    /// Swap the bearer token used by later connects and reconnects.
    pub fn set_token(&self, token: impl Into<String>) {
        self.manager.set_token(Some(token.into()));
    }

    pub fn clear_token(&self) {
        self.manager.set_token(None);
    }

    /// Release everything this client owns. Idempotent.
    pub fn dispose(&self) {
        if self.manager.is_disposed() {
            return;
        }
        let owned = std::mem::take(&mut *lock(&self.owned));
        for id in owned {
            self.manager.registry().unsubscribe(id);
        }
        self.disconnect();
        self.manager.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.manager.is_disposed()
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
