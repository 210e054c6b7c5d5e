// Agent/platform handshake: signed challenge, X25519 + HKDF, key confirmation.
//
//   Platform (responder)                      Agent (initiator)
//     |--- handshake.challenge (event) ------->|
//     |<-- handshake.auth (request) -----------|
//     |--- accept (response, confirm tag) ---->|
//     |====== encrypted envelopes ============|

pub mod messages;
pub mod protocol;
pub mod state;

pub use messages::{HandshakeAccept, HandshakeAuth, HandshakeChallenge};
pub use protocol::{EstablishedSession, Initiator, Registration, Responder};
pub use state::HandshakeState;

/// Event name of the platform's opening challenge.
pub const CHALLENGE_EVENT: &str = "handshake.challenge";

/// Request method carrying the agent's key share and proof.
pub const AUTH_METHOD: &str = "handshake.auth";

/// Error code of the single, generic handshake rejection.
pub const REJECTION_CODE: &str = "AUTH_REJECTED";

/// Domain separator at the start of every transcript.
pub const TRANSCRIPT_PREFIX: &[u8] = b"n3n-handshake-v1";

/// HKDF context prefix; the device id is appended.
pub const CONTEXT_PREFIX: &[u8] = b"n3n-agent-v1";

/// Label of the platform's key confirmation tag.
pub const SERVER_FINISHED: &[u8] = b"server-finished";

/// Challenge nonce length; also the HKDF salt.
pub const CHALLENGE_NONCE_LEN: usize = 32;

/// How long a challenge stays answerable.
pub const DEFAULT_CHALLENGE_TTL_MS: u64 = 60_000;

/// Longest accepted device identifier.
pub const MAX_DEVICE_ID_LEN: usize = 128;

/// `prefix || nonce || server_public`, signed by the platform identity.
pub fn challenge_transcript(nonce: &[u8], server_public: &[u8; 32]) -> Vec<u8> {
    let mut t = Vec::with_capacity(TRANSCRIPT_PREFIX.len() + nonce.len() + 32);
    t.extend_from_slice(TRANSCRIPT_PREFIX);
    t.extend_from_slice(nonce);
    t.extend_from_slice(server_public);
    t
}

/// Full transcript signed by the agent:
/// `prefix || nonce || server_public || client_public || device_id`.
pub fn auth_transcript(nonce: &[u8], server_public: &[u8; 32], client_public: &[u8; 32], device_id: &str) -> Vec<u8> {
    let mut t = challenge_transcript(nonce, server_public);
    t.extend_from_slice(client_public);
    t.extend_from_slice(device_id.as_bytes());
    t
}

/// HKDF context bound to one device.
pub fn session_context(device_id: &str) -> Vec<u8> {
    let mut c = Vec::with_capacity(CONTEXT_PREFIX.len() + device_id.len());
    c.extend_from_slice(CONTEXT_PREFIX);
    c.extend_from_slice(device_id.as_bytes());
    c
}
