//! Client configuration.
//!
//! ```json
//! {
//!   "url": "wss://api.tutorly.app/ws/notifications/",
//!   "token": "…",
//!   "tokenParam": "token",
//!   "connectTimeoutMs": 10000,
//!   "closeTimeoutMs": 5000,
//!   "reconnect": { "maxAttempts": 5, "baseDelayMs": 1000, "maxDelayMs": 30000, "jitterFactor": 0.0 }
//! }
//! ```
//!
//! Everything except `url` has a default.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::policy::ReconnectConfig;

pub const DEFAULT_TOKEN_PARAM: &str = "token";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported URL scheme '{0}' (expected ws or wss)")]
    UnsupportedScheme(String),
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Endpoint without the token, e.g. `wss://host/ws/notifications/`
    pub url: String,
    /// Bearer token appended as a query parameter at connect time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_token_param")]
    pub token_param: String,
    /// Handshake deadline for the WebSocket transport; none by default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
    /// How long a requested close waits for the server's echo
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_timeout_ms: Option<u64>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_token_param() -> String {
    DEFAULT_TOKEN_PARAM.to_string()
}

// Saturates; a u64 of milliseconds outlasts any realistic timeout.
fn millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            token_param: default_token_param(),
            connect_timeout_ms: None,
            close_timeout_ms: None,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = Some(millis(timeout));
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout_ms = Some(millis(timeout));
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn close_timeout(&self) -> Option<Duration> {
        self.close_timeout_ms.map(Duration::from_millis)
    }

    /// Parse and check the endpoint URL.
    pub fn validate(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.url)?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
    }
}

/// Endpoint with the token attached as a query parameter.
pub fn endpoint_url(base: &Url, token_param: &str, token: Option<&str>) -> Url {
    let mut url = base.clone();
    if let Some(token) = token {
        url.query_pairs_mut().append_pair(token_param, token);
    }
    url
}

/// `url` with the token query value masked, for log lines.
pub fn redacted(url: &Url, token_param: &str) -> String {
    if !url.query_pairs().any(|(k, _)| k == token_param) {
        return url.to_string();
    }
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == token_param { "***".to_string() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    let mut masked = url.clone();
    masked.query_pairs_mut().clear().extend_pairs(pairs);
    masked.to_string()
}
