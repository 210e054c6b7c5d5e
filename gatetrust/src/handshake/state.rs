// Handshake state machine.

use crate::crypto::aead::Algorithm;
use crate::crypto::kdf::DerivedKeySet;
use crate::crypto::x25519::EphemeralKeyPair;
use crate::handshake::CHALLENGE_NONCE_LEN;

/// The current state of one side of a handshake.
#[derive(Debug)]
pub enum HandshakeState {
    /// Nothing sent or received yet.
    Idle,

    /// Responder has sent the challenge and waits for `handshake.auth`.
    ChallengeSent {
        /// Consumed by the Diffie-Hellman step.
        ephemeral: EphemeralKeyPair,
        nonce: [u8; CHALLENGE_NONCE_LEN],
        issued_at: u64,
    },

    /// Initiator has answered the challenge and waits for the accept.
    AuthSent {
        keys: DerivedKeySet,
        transcript_hash: [u8; 32],
        algorithm: Algorithm,
        platform_key: [u8; 32],
    },

    /// Keys handed off to the session.
    Complete,

    /// Any failure. Terminal.
    Failed,
}

impl HandshakeState {
    /// Human-readable label for the current state (used in error messages).
    pub fn label(&self) -> &'static str {
        match self {
            HandshakeState::Idle => "Idle",
            HandshakeState::ChallengeSent { .. } => "ChallengeSent",
            HandshakeState::AuthSent { .. } => "AuthSent",
            HandshakeState::Complete => "Complete",
            HandshakeState::Failed => "Failed",
        }
    }
}
