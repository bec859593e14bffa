use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced to application code.
///
/// Parse failures never get here: they are logged and the frame dropped.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// Network or socket fault. The close that follows drives the state machine.
    #[error("Transport error: {0}")]
    Transport(String),
    /// Terminal until a manual `connect()`.
    #[error("Gave up reconnecting after {attempts} attempts (last close code {close_code})")]
    ReconnectExhausted { attempts: u32, close_code: u16 },
}
