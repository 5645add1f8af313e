//! Socket wire format: UTF-8 JSON text frames.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved keepalive request type. Answered immediately with a [`PONG`],
/// never surfaced to message handlers.
pub const PING: &str = "ping";

/// Reserved keepalive reply type. Swallowed on receipt.
pub const PONG: &str = "pong";

/// One socket frame: `{"type": ..., "payload": ..., "timestamp": ...}`.
///
/// `timestamp` is epoch milliseconds, stamped at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: i64,
}

impl WireMessage {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn ping() -> Self {
        Self::new(PING, Value::Null)
    }

    pub fn pong() -> Self {
        Self::new(PONG, Value::Null)
    }

    pub fn is_keepalive(&self) -> bool {
        self.kind == PING || self.kind == PONG
    }

    /// Serialize to a text frame.
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_frame(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}
