// Handshake messages. They travel unencrypted inside plain protocol messages,
// so every binary field is base64url text and keys are camelCase.

use serde::{Deserialize, Serialize};

use crate::crypto::hash::b64url_decode;
use crate::error::{GateTrustError, Result};

/// Platform -> agent (payload of the `handshake.challenge` event).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeChallenge {
    /// Envelope protocol version the platform speaks.
    pub v: u32,
    /// Offered AEAD algorithms, preferred first.
    pub alg: Vec<String>,
    /// Platform time, unix ms.
    pub ts: u64,
    /// Fresh challenge nonce (HKDF salt).
    pub nonce: String,
    /// Platform's ephemeral X25519 public key.
    pub server_public_key: String,
    /// Platform's long-term Ed25519 public key.
    pub platform_key: String,
    /// Platform signature over the challenge transcript.
    pub signature: String,
}

/// Agent -> platform (params of the `handshake.auth` request).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAuth {
    pub device_id: String,
    /// Agent's ephemeral X25519 public key.
    pub client_public_key: String,
    /// Chosen AEAD algorithm.
    pub alg: String,
    /// Device identity signature over the full transcript.
    pub signature: String,
    /// First connection only: the one-time token or pairing code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_token: Option<String>,
    /// First connection only: the Ed25519 key to bind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

/// Platform -> agent (result of the accepted `handshake.auth` request).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAccept {
    pub connection_id: String,
    pub encrypted: bool,
    pub alg: String,
    /// HMAC(auth_key, "server-finished" || SHA-256(transcript)).
    pub confirm: String,
    pub platform_key: String,
    pub platform_fingerprint: String,
}

/// Decode a base64url field into exactly `N` bytes.
pub(crate) fn decode_fixed<const N: usize>(field: &str, value: &str) -> Result<[u8; N]> {
    b64url_decode(value)
        .and_then(|b| <[u8; N]>::try_from(b.as_slice()).ok())
        .ok_or_else(|| GateTrustError::Handshake(format!("bad {field}")))
}

/// Decode a variable-length base64url field.
pub(crate) fn decode_var(field: &str, value: &str) -> Result<Vec<u8>> {
    b64url_decode(value).ok_or_else(|| GateTrustError::Handshake(format!("bad {field}")))
}
