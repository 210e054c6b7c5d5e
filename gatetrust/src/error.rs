// GateTrust error types

use thiserror::Error;

use crate::envelope::Direction;

/// Top-level error type for the GateTrust crate.
///
/// Display strings never carry key bytes, shared secrets, tokens or plaintext.
#[derive(Debug, Error)]
pub enum GateTrustError {
    // ── Key agreement / derivation ──────────────────────────────────────
    #[error("invalid peer public key")]
    InvalidPeerKey,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("signature verification failed")]
    SignatureVerification,

    // ── AEAD ────────────────────────────────────────────────────────────
    #[error("AEAD encryption failed")]
    Encryption,

    #[error("authentication failed")]
    AuthenticationFailed,

    // ── Envelope ────────────────────────────────────────────────────────
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    // ── Replay guard ────────────────────────────────────────────────────
    #[error("replay detected: {direction} seq={sequence} <= last={last}")]
    ReplayDetected {
        direction: Direction,
        sequence: u64,
        last: u64,
    },

    #[error("stale timestamp: ts={timestamp}, now={now}, tolerance={tolerance_ms}ms")]
    StaleTimestamp {
        timestamp: u64,
        now: u64,
        tolerance_ms: u64,
    },

    // ── Registration ledger ─────────────────────────────────────────────
    #[error("invalid or expired token")]
    InvalidOrExpiredToken,

    #[error("device is blocked")]
    DeviceBlocked,

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("device id already registered: {0}")]
    DeviceIdInUse(String),

    // ── Handshake ───────────────────────────────────────────────────────
    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("invalid handshake state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    // ── Storage ─────────────────────────────────────────────────────────
    #[error("secure store error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ── Generic ─────────────────────────────────────────────────────────
    #[error("buffer too small: need {need}, have {have}")]
    BufferTooSmall { need: usize, have: usize },
}

impl GateTrustError {
    /// Whether this error means the session's integrity can no longer be
    /// trusted. Such errors close the session instead of failing one frame.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            GateTrustError::AuthenticationFailed
                | GateTrustError::MalformedEnvelope(_)
                | GateTrustError::UnsupportedVersion(_)
                | GateTrustError::UnsupportedAlgorithm(_)
                | GateTrustError::ReplayDetected { .. }
                | GateTrustError::StaleTimestamp { .. }
                | GateTrustError::InvalidPeerKey
                | GateTrustError::DeviceBlocked
        )
    }
}

/// Crate-level result alias.
pub type Result<T> = std::result::Result<T, GateTrustError>;
