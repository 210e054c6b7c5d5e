use thiserror::Error;

use gatetrust::GateTrustError;

/// All errors produced by the GateStream session layer.
#[derive(Debug, Error)]
pub enum GateStreamError {
    #[error(transparent)]
    Trust(#[from] GateTrustError),

    #[error("handshake did not complete within {0} ms")]
    HandshakeTimeout(u64),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("unmatched response for request {0}")]
    UnmatchedResponse(String),

    #[error("request {id} timed out after {timeout_ms} ms")]
    Timeout { id: String, timeout_ms: u64 },

    #[error("session closed")]
    SessionClosed,

    #[error("device {0} is not connected")]
    NotConnected(String),

    #[error("remote error {code}: {message}")]
    Remote { code: String, message: String },

    #[error("invalid session state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl GateStreamError {
    /// Errors after which the session must not process further frames.
    pub fn is_fatal_to_session(&self) -> bool {
        match self {
            GateStreamError::Trust(e) => e.is_fatal_to_session(),
            GateStreamError::UnmatchedResponse(_)
            | GateStreamError::Timeout { .. }
            | GateStreamError::Remote { .. }
            | GateStreamError::NotConnected(_) => false,
            _ => true,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GateStreamError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        GateStreamError::WebSocket(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GateStreamError>;
