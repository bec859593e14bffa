//! # tutorly-realtime: Real-time update client for Tutorly
//!
//! Keeps one persistent WebSocket connection per endpoint and pushes server
//! events (balance changes, purchase approvals, transaction updates, fraud
//! alerts) to any number of in-process subscribers.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐  connect/send/   ┌───────────────────┐
//! │ RealtimeClient │ ───────────────► │ ConnectionManager │
//! │   (facade)     │  subscribe       │  (state machine)  │
//! └───────┬────────┘                  └───┬──────────┬────┘
//!         │                               │          │ close code
//!         ▼                               ▼          ▼
//! ┌────────────────┐   dispatch    ┌──────────┐  ┌─────────────────┐
//! │ Subscriber     │ ◄──────────── │  codec   │  │ ReconnectPolicy │
//! │ Registry       │   envelope    │ (parse)  │  │ (backoff, cap)  │
//! └────────────────┘               └────▲─────┘  └─────────────────┘
//!                                       │ text frames
//!                               ┌───────┴────────┐
//!                               │ dyn Transport  │  ws / mock
//!                               └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`]: JSON envelope parsing and validation
//! - [`policy`]: reconnection eligibility and exponential backoff
//! - [`registry`]: per-type subscriber fan-out with panic isolation
//! - [`transport`]: transport traits and the tokio-tungstenite implementation
//! - [`manager`]: connection lifecycle and auto-reconnect loop
//! - [`client`]: public facade with disposal semantics
//! - `mock`: in-memory transport for tests and tooling (feature `mock`)
//!
//! ## Defaults
//!
//! | Setting | Value |
//! |---------|-------|
//! | Base backoff delay | 1000 ms |
//! | Backoff cap | 30 000 ms |
//! | Reconnect attempts | 5 |
//! | Jitter | none |

pub mod codec;
pub mod policy;
pub mod registry;
pub mod transport;
pub mod manager;
pub mod client;
pub mod config;
pub mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

// Re-exports for convenience
pub use codec::{CodecError, MessageEnvelope, MessageKind};
pub use policy::{
    compute_delay, should_reconnect, CloseOrigin, ReconnectConfig, ReconnectDecision,
    ReconnectPolicy, ABNORMAL_CLOSURE, NORMAL_CLOSURE,
};
pub use registry::{HandlerId, SubscriberRegistry};
pub use transport::{
    Outbound, Transport, TransportError, TransportEvent, TransportFactory, WsTransportFactory,
};
pub use manager::{ConnectionManager, ConnectionState, ReconnectAttempt};
pub use client::{RealtimeClient, Unsubscribe};
pub use config::{ClientConfig, ConfigError};
pub use error::ClientError;
