// GateTrust: end-to-end session cryptography for the n3n agent gateway
//
// Crate root: module declarations and public re-exports.

pub mod error;
pub mod crypto;
pub mod envelope;
pub mod replay;
pub mod ledger;
pub mod handshake;
pub mod storage;
#[cfg(feature = "ffi")]
pub mod ffi;

// Re-export key types at crate root for convenience.
pub use crypto::aead::Algorithm;
pub use crypto::identity::IdentityKeyPair;
pub use crypto::kdf::{derive_keys, DerivedKeySet};
pub use crypto::x25519::{EphemeralKeyPair, SharedSecret};
pub use envelope::{Direction, EnvelopeHeader, SecureEnvelope};
pub use error::{GateTrustError, Result};
pub use ledger::{AgentRegistration, RegistrationLedger, RegistrationStatus};
pub use replay::{ReplayGuard, SequenceWindow};

/// Current millisecond unix time. Callers that need determinism pass `now`
/// explicitly instead.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
