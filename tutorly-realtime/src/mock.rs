//! In-memory transport for tests and tooling.
//!
//! Every `open()` records a [`MockConnection`]; the test drives it by
//! emitting events and inspects what the client sent:
//!
//! ```ignore
//! let factory = MockTransportFactory::new();
//! let client = RealtimeClient::with_transport(config, factory.clone())?;
//! client.connect();
//! let conn = factory.latest().unwrap();
//! conn.open();
//! conn.message(r#"{"type":"balance_update","data":{}}"#);
//! ```
//!
//! By default a requested close is confirmed right away with the same code,
//! like a well-behaved server.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::policy::ABNORMAL_CLOSURE;
use crate::transport::{EventSink, Transport, TransportError, TransportEvent, TransportFactory};

#[derive(Debug, Default)]
struct ConnectionLog {
    sent: Vec<String>,
    close_request: Option<(u16, String)>,
    closed: bool,
}

/// Test-side handle to one opened transport.
#[derive(Debug, Clone)]
pub struct MockConnection {
    url: String,
    events: EventSink,
    log: Arc<Mutex<ConnectionLog>>,
}

impl MockConnection {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn open(&self) {
        self.events.open();
    }

    pub fn message(&self, text: impl Into<String>) {
        self.events.message(text);
    }

    /// Server-side or network close.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        lock(&self.log).closed = true;
        self.events.close(code, reason);
    }

    pub fn error(&self, cause: impl Into<String>) {
        self.events.error(cause);
    }

    /// Network failure: an error immediately followed by a 1006 close.
    pub fn fail(&self, cause: &str) {
        self.error(cause);
        self.close(ABNORMAL_CLOSURE, cause);
    }

    pub fn emit(&self, event: TransportEvent) {
        self.events.emit(event);
    }

    /// Frames the client sent, in order.
    pub fn sent(&self) -> Vec<String> {
        lock(&self.log).sent.clone()
    }

    /// Code and reason of the client's close request, if any.
    pub fn close_request(&self) -> Option<(u16, String)> {
        lock(&self.log).close_request.clone()
    }

    /// Whether the manager still listens to this connection.
    pub fn is_listened(&self) -> bool {
        !self.events.is_closed()
    }
}

#[derive(Debug, Default)]
struct FactoryState {
    connections: Vec<MockConnection>,
}

/// Records every transport the manager opens.
#[derive(Debug)]
pub struct MockTransportFactory {
    state: Mutex<FactoryState>,
    echo_close: bool,
}

impl MockTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FactoryState::default()),
            echo_close: true,
        })
    }

    /// Close requests stay unconfirmed until the test calls `close()`.
    pub fn without_close_echo() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FactoryState::default()),
            echo_close: false,
        })
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).connections.len()
    }

    pub fn connection(&self, index: usize) -> Option<MockConnection> {
        lock(&self.state).connections.get(index).cloned()
    }

    pub fn latest(&self) -> Option<MockConnection> {
        lock(&self.state).connections.last().cloned()
    }
}

impl TransportFactory for MockTransportFactory {
    fn open(&self, url: &str, events: EventSink) -> Box<dyn Transport> {
        let log = Arc::new(Mutex::new(ConnectionLog::default()));
        lock(&self.state).connections.push(MockConnection {
            url: url.to_string(),
            events: events.clone(),
            log: Arc::clone(&log),
        });
        Box::new(MockTransport {
            events,
            log,
            echo_close: self.echo_close,
        })
    }
}

struct MockTransport {
    events: EventSink,
    log: Arc<Mutex<ConnectionLog>>,
    echo_close: bool,
}

impl Transport for MockTransport {
    fn send(&mut self, text: String) -> Result<(), TransportError> {
        let mut log = lock(&self.log);
        if log.closed {
            return Err(TransportError::Closed);
        }
        log.sent.push(text);
        Ok(())
    }

    fn close(&mut self, code: u16, reason: &str) {
        let mut log = lock(&self.log);
        log.close_request = Some((code, reason.to_string()));
        if self.echo_close && !log.closed {
            log.closed = true;
            self.events.close(code, reason);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
