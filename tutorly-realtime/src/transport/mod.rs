//! Transport seam between the connection manager and the network.
//!
//! A [`TransportFactory`] opens one [`Transport`] per connection attempt and
//! hands it an [`EventSink`]. The transport reports its lifecycle through the
//! sink in the order things happen on the wire:
//!
//! ```text
//! Open → Message* → Close          (clean session)
//! Error → Close                    (failed handshake or network fault)
//! ```
//!
//! Every abnormal termination must end with a `Close`; `Error` alone never
//! moves the state machine.

pub mod ws;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub use ws::WsTransportFactory;

/// Transport-level failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
}

/// Lifecycle events emitted by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Close { code: u16, reason: String },
    Error(String),
}

/// Sending half of a transport's ordered event stream.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    pub fn open(&self) {
        self.emit(TransportEvent::Open);
    }

    pub fn message(&self, text: impl Into<String>) {
        self.emit(TransportEvent::Message(text.into()));
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) {
        self.emit(TransportEvent::Close {
            code,
            reason: reason.into(),
        });
    }

    pub fn error(&self, cause: impl Into<String>) {
        self.emit(TransportEvent::Error(cause.into()));
    }

    /// Events after the manager stopped listening are discarded.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(event);
    }

    /// Whether the manager still listens to this connection.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create an event sink and the receiver the manager pumps.
pub fn event_channel() -> (EventSink, mpsc::UnboundedReceiver<TransportEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, rx)
}

/// One live connection, exclusively owned by a connection manager.
///
/// Both calls must return without blocking; outcomes are reported through
/// the [`EventSink`] given at open time.
pub trait Transport: Send {
    /// Queue a text frame.
    fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Request a close handshake; a `Close` event confirms it.
    fn close(&mut self, code: u16, reason: &str);
}

/// Opens transports. Injected into the manager so tests can substitute a fake.
pub trait TransportFactory: Send + Sync + 'static {
    /// Start connecting to `url`. Must return immediately.
    fn open(&self, url: &str, events: EventSink) -> Box<dyn Transport>;
}

/// Outbound message: a pre-serialized string or a JSON value.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Json(Value),
}

impl Outbound {
    /// Strings pass through; JSON values are stringified.
    pub fn into_text(self) -> Result<String, serde_json::Error> {
        match self {
            Self::Text(text) => Ok(text),
            Self::Json(value) => serde_json::to_string(&value),
        }
    }
}

impl From<String> for Outbound {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Outbound {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Value> for Outbound {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}
