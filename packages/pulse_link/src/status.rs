//! Connection status shared by every channel kind.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a single transport channel.
///
/// Legal transitions:
/// - `Disconnected → Connecting`
/// - `Connecting → Connected | Error`
/// - `Connected → Disconnected`
/// - `Error → Connecting` (retry) or `Error → Disconnected` (teardown)
///
/// A fresh connection never skips `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ChannelStatus {
    /// True only for `Connected` — `Connecting` does not count toward liveness.
    pub fn is_connected(self) -> bool {
        matches!(self, ChannelStatus::Connected)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelStatus::Disconnected => "disconnected",
            ChannelStatus::Connecting => "connecting",
            ChannelStatus::Connected => "connected",
            ChannelStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connected_is_live() {
        assert!(ChannelStatus::Connected.is_connected());
        assert!(!ChannelStatus::Connecting.is_connected());
        assert!(!ChannelStatus::Disconnected.is_connected());
        assert!(!ChannelStatus::Error.is_connected());
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ChannelStatus::Connecting).unwrap(),
            "\"connecting\""
        );
        assert_eq!(ChannelStatus::Error.to_string(), "error");
    }
}
