//! Tunable configuration for the realtime channels.
//!
//! Deserializable with serde so a host application can layer it from its own
//! config file or env source; every field has a default, so `{}` (or
//! `RealtimeConfig::default()`) yields a working setup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level channel tuning.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

/// Socket channel tuning: reconnect backoff and heartbeat cadence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Delay before the first reconnect attempt; doubles per attempt.
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    /// Ceiling on the per-attempt delay.
    #[serde(default = "default_reconnect_cap_ms")]
    pub reconnect_cap_ms: u64,
    /// After this many consecutive failed attempts the channel gives up and
    /// stays disconnected until `connect()` is called again.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Keepalive send interval while connected.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}
fn default_reconnect_cap_ms() -> u64 {
    30_000
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_cap_ms: default_reconnect_cap_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl SocketConfig {
    /// Backoff delay before reconnect attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1), cap)`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let delay = self
            .reconnect_base_ms
            .saturating_mul(1u64.checked_shl(exp).unwrap_or(u64::MAX))
            .min(self.reconnect_cap_ms);
        Duration::from_millis(delay)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Event-stream channel tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Consecutive failures (without an intervening successful open) after
    /// which the channel tears itself down permanently.
    #[serde(default = "default_failure_ceiling")]
    pub failure_ceiling: u32,
    /// Fixed delay between retries; the stream has no backoff of its own.
    #[serde(default = "default_stream_retry_ms")]
    pub retry_delay_ms: u64,
}

fn default_failure_ceiling() -> u32 {
    5
}
fn default_stream_retry_ms() -> u64 {
    3_000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            failure_ceiling: default_failure_ceiling(),
            retry_delay_ms: default_stream_retry_ms(),
        }
    }
}

impl StreamConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
