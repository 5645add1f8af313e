//! Transport-level errors.
//!
//! These never cross the public channel API — connection failures surface as
//! status transitions, payload failures are logged and dropped. The error
//! type exists for the connector seams and the internal task loops.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Helper for test doubles and ad-hoc failures.
    pub fn other(msg: impl Into<String>) -> Self {
        TransportError::Other(msg.into())
    }
}
