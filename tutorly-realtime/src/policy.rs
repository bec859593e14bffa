//! Reconnection policy: who gets retried, and how long to wait.
//!
//! Pure functions only; the connection manager owns the timers.
//!
//! - [`should_reconnect`]: close-code and origin eligibility
//! - [`compute_delay`]: `min(max_delay, base_delay * 2^attempt)`
//! - [`ReconnectPolicy`]: the two combined with an attempt cap and optional jitter

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Normal closure; never reconnected.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Peer went away without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Close frame carried no status code.
pub const NO_STATUS_RECEIVED: u16 = 1005;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_JITTER_FACTOR: f64 = 0.0;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Tuning for automatic reconnection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    /// Reconnect attempts per episode before giving up (default: 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first attempt in ms (default: 1000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay in ms (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Symmetric jitter ratio 0.0–1.0 (default: 0.0, exact timing).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_jitter_factor() -> f64 {
    DEFAULT_JITTER_FACTOR
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pure rules
// ─────────────────────────────────────────────────────────────────────────────

/// Which side asked for the connection to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOrigin {
    /// `disconnect()` or disposal on this side
    Local,
    /// Server close frame, network drop or transport error
    Remote,
}

/// Whether a closure is eligible for reconnection at all.
///
/// Normal closure (1000) and anything this side initiated are final;
/// every other code counts as abnormal.
pub fn should_reconnect(close_code: u16, origin: CloseOrigin) -> bool {
    origin == CloseOrigin::Remote && close_code != NORMAL_CLOSURE
}

/// Exponential backoff: `min(max_delay_ms, base_delay_ms * 2^attempt)`.
///
/// `attempt` is zero-based. Saturates instead of overflowing.
pub fn compute_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    base_delay_ms.saturating_mul(factor).min(max_delay_ms)
}

/// Outcome of consulting the policy after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Normal or locally initiated closure
    Stop,
    /// Eligible, but the attempt budget is spent
    Exhausted,
    /// Open a new transport after this delay
    Retry(Duration),
}

// ─────────────────────────────────────────────────────────────────────────────
// Policy
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded exponential backoff policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}

impl ReconnectPolicy {
    /// Jitter is clamped to [0, 1]; a base delay above the cap is lowered to it.
    pub fn new(mut config: ReconnectConfig) -> Self {
        if !config.jitter_factor.is_finite() {
            config.jitter_factor = 0.0;
        }
        config.jitter_factor = config.jitter_factor.clamp(0.0, 1.0);
        config.base_delay_ms = config.base_delay_ms.min(config.max_delay_ms);
        Self { config }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Eligibility including the attempt cap.
    pub fn should_reconnect(&self, close_code: u16, origin: CloseOrigin, attempt: u32) -> bool {
        should_reconnect(close_code, origin) && attempt < self.config.max_attempts
    }

    /// Exact exponential delay for `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(compute_delay(
            attempt,
            self.config.base_delay_ms,
            self.config.max_delay_ms,
        ))
    }

    /// Delay for `attempt` with jitter applied.
    ///
    /// With a jitter factor `j` the result lies in
    /// `[base_delay * (1 - j), base_delay * (1 + j)]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.config.jitter_factor == 0.0 {
            return base;
        }
        let spread = base.as_secs_f64() * self.config.jitter_factor;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }

    pub fn decide(&self, close_code: u16, origin: CloseOrigin, attempt: u32) -> ReconnectDecision {
        if !should_reconnect(close_code, origin) {
            ReconnectDecision::Stop
        } else if attempt >= self.config.max_attempts {
            ReconnectDecision::Exhausted
        } else {
            ReconnectDecision::Retry(self.delay_for(attempt))
        }
    }
}
