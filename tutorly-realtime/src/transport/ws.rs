//! WebSocket transport over tokio-tungstenite.
//!
//! Each transport is one spawned task that owns the socket:
//!
//! ```text
//! WsTransport::send/close ──► command channel ──┐
//!                                               ▼
//!                                      ┌─────────────────┐
//!                                      │   socket task    │──► WebSocket
//!                                      │ (select! loop)   │◄── frames
//!                                      └────────┬────────┘
//!                                               ▼
//!                                          EventSink
//! ```
//!
//! Handshake and IO failures surface as `Error` followed by a 1006 close.
//! A requested close waits at most `close_timeout` for the peer's echo, then
//! reports the close anyway. Dropping the transport closes the socket.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use super::{EventSink, Transport, TransportError, TransportFactory};
use crate::policy::{ABNORMAL_CLOSURE, NO_STATUS_RECEIVED};

#[derive(Debug)]
enum Command {
    Send(String),
    Close(u16, String),
}

/// How long a requested close waits for the peer to echo it.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens tokio-tungstenite client connections.
#[derive(Debug, Clone)]
pub struct WsTransportFactory {
    connect_timeout: Option<Duration>,
    close_timeout: Duration,
}

impl Default for WsTransportFactory {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

impl WsTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up on a handshake that has not completed within `timeout`.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Stop waiting for the peer's close echo after `timeout`.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }
}

impl TransportFactory for WsTransportFactory {
    fn open(&self, url: &str, events: EventSink) -> Box<dyn Transport> {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(url.to_string(), self.clone(), rx, events));
        Box::new(WsTransport { commands })
    }
}

/// Handle to a socket task.
pub struct WsTransport {
    commands: mpsc::UnboundedSender<Command>,
}

impl Transport for WsTransport {
    fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.commands
            .send(Command::Send(text))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self, code: u16, reason: &str) {
        let _ = self.commands.send(Command::Close(code, reason.to_string()));
    }
}

async fn handshake(url: &str, connect_timeout: Option<Duration>) -> Result<WsStream, String> {
    let connect = tokio_tungstenite::connect_async(url);
    let result = match connect_timeout {
        Some(limit) => match tokio::time::timeout(limit, connect).await {
            Ok(result) => result,
            Err(_) => {
                let millis = limit.as_millis();
                return Err(format!("connection timed out after {millis}ms"));
            }
        },
        None => connect.await,
    };
    result.map(|(stream, _response)| stream).map_err(|e| e.to_string())
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn run_socket(
    url: String,
    settings: WsTransportFactory,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: EventSink,
) {
    let connecting = handshake(&url, settings.connect_timeout);
    tokio::pin!(connecting);

    // A close requested mid-handshake wins over the handshake.
    let connected = loop {
        tokio::select! {
            result = &mut connecting => break result,
            cmd = commands.recv() => match cmd {
                Some(Command::Send(_)) => {
                    log::warn!("Dropping outbound frame: socket not open yet");
                }
                Some(Command::Close(code, reason)) => {
                    events.close(code, reason);
                    return;
                }
                None => return,
            },
        }
    };

    let stream = match connected {
        Ok(stream) => stream,
        Err(cause) => {
            log::debug!("WebSocket handshake failed: {cause}");
            events.error(cause.clone());
            events.close(ABNORMAL_CLOSURE, cause);
            return;
        }
    };

    events.open();
    let (mut writer, mut reader) = stream.split();

    // Armed once a close frame is sent; the peer must echo it in time.
    let close_wait = tokio::time::sleep(settings.close_timeout);
    tokio::pin!(close_wait);
    let mut closing: Option<u16> = None;

    loop {
        tokio::select! {
            () = &mut close_wait, if closing.is_some() => {
                let code = closing.unwrap_or(ABNORMAL_CLOSURE);
                log::warn!(
                    "Peer did not confirm close within {}ms",
                    settings.close_timeout.as_millis()
                );
                events.close(code, "close handshake timed out");
                return;
            }
            cmd = commands.recv() => match cmd {
                Some(Command::Send(text)) => {
                    if let Err(e) = writer.send(Message::text(text)).await {
                        events.error(e.to_string());
                        events.close(ABNORMAL_CLOSURE, e.to_string());
                        return;
                    }
                }
                // Already waiting for the echo
                Some(Command::Close(..)) if closing.is_some() => {}
                Some(Command::Close(code, reason)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let sent = tokio::time::timeout(
                        settings.close_timeout,
                        writer.send(Message::Close(Some(frame))),
                    )
                    .await;
                    if !matches!(sent, Ok(Ok(()))) {
                        log::debug!("Close frame not delivered");
                        events.close(code, String::new());
                        return;
                    }
                    // Keep reading until the peer echoes the close.
                    closing = Some(code);
                    close_wait.as_mut().reset(Instant::now() + settings.close_timeout);
                }
                None => {
                    // Owner dropped us.
                    let _ = tokio::time::timeout(settings.close_timeout, writer.close()).await;
                    return;
                }
            },
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => events.message(text.as_str()),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => events.message(text),
                    Err(_) => {
                        log::warn!("Ignoring non-UTF-8 binary frame ({} bytes)", bytes.len())
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (u16::from(f.code), f.reason.as_str().to_owned()),
                        None => (NO_STATUS_RECEIVED, String::new()),
                    };
                    events.close(code, reason);
                    return;
                }
                // Ping/Pong are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    events.error(e.to_string());
                    events.close(ABNORMAL_CLOSURE, e.to_string());
                    return;
                }
                None => {
                    events.close(ABNORMAL_CLOSURE, "stream ended");
                    return;
                }
            },
        }
    }
}
