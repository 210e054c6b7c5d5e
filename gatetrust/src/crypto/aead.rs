// AEAD cipher suites: AES-256-GCM (mandatory) and ChaCha20-Poly1305.
//
// Algorithm identifiers match the envelope `alg` header field:
//   "A256GCM"  AES-256-GCM
//   "C20P"     ChaCha20-Poly1305 (RFC 8439)
//
// Both suites use a 12-byte nonce and a 16-byte tag. Nonces are never taken
// from callers on the sealing side: every seal consumes a `FreshNonce`.

// Both aes-gcm and chacha20poly1305 re-export the same `aead` traits.
// Import once from aes_gcm to avoid redundant imports.
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce as AesNonce};
use chacha20poly1305::{ChaCha20Poly1305, Nonce as ChaChaNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{GateTrustError, Result};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// AEAD algorithm identifier (wire value in the envelope header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Algorithm {
    /// AES-256-GCM, `"A256GCM"`.
    #[default]
    #[serde(rename = "A256GCM")]
    Aes256Gcm,
    /// ChaCha20-Poly1305, `"C20P"`.
    #[serde(rename = "C20P")]
    ChaCha20Poly1305,
}

impl Algorithm {
    /// All supported algorithms in preference order.
    pub const SUPPORTED: [Algorithm; 2] = [Algorithm::Aes256Gcm, Algorithm::ChaCha20Poly1305];

    /// Header identifier.
    pub fn wire_name(self) -> &'static str {
        match self {
            Algorithm::Aes256Gcm => "A256GCM",
            Algorithm::ChaCha20Poly1305 => "C20P",
        }
    }

    /// Resolve from a header identifier.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "A256GCM" => Some(Algorithm::Aes256Gcm),
            "C20P" => Some(Algorithm::ChaCha20Poly1305),
            _ => None,
        }
    }

    /// Numeric id used across the C FFI.
    pub fn ffi_id(self) -> u16 {
        match self {
            Algorithm::Aes256Gcm => 0x0001,
            Algorithm::ChaCha20Poly1305 => 0x0002,
        }
    }

    pub fn from_ffi_id(id: u16) -> Option<Self> {
        match id {
            0x0001 => Some(Algorithm::Aes256Gcm),
            0x0002 => Some(Algorithm::ChaCha20Poly1305),
            _ => None,
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// A nonce drawn from the OS RNG. Not `Clone`/`Copy` and only constructible
/// through [`FreshNonce::generate`], so each value seals at most one message.
#[derive(Debug)]
pub struct FreshNonce([u8; NONCE_LEN]);

impl FreshNonce {
    pub fn generate() -> Self {
        let mut n = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut n);
        Self(n)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

/// Output of a seal: nonce, ciphertext and detached tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBox {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// Unified AEAD key that dispatches between the two supported suites.
pub enum AeadKey {
    Aes256Gcm(Box<Aes256Gcm>),
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
}

impl AeadKey {
    /// Construct from a 32-byte key and the desired algorithm.
    pub fn new(algorithm: Algorithm, key: &[u8; 32]) -> Result<Self> {
        Ok(match algorithm {
            Algorithm::Aes256Gcm => AeadKey::Aes256Gcm(Box::new(
                Aes256Gcm::new_from_slice(key)
                    .map_err(|e| GateTrustError::InvalidKey(format!("aes-gcm init: {e}")))?,
            )),
            Algorithm::ChaCha20Poly1305 => AeadKey::ChaCha20Poly1305(Box::new(
                ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|e| GateTrustError::InvalidKey(format!("chacha init: {e}")))?,
            )),
        })
    }

    /// Seal `plaintext` under `nonce`, binding `aad`. Consumes the nonce.
    pub fn seal(&self, nonce: FreshNonce, plaintext: &[u8], aad: &[u8]) -> Result<SealedBox> {
        let payload = Payload { msg: plaintext, aad };
        let mut ciphertext = match self {
            AeadKey::Aes256Gcm(c) => c.encrypt(AesNonce::from_slice(&nonce.0), payload),
            AeadKey::ChaCha20Poly1305(c) => c.encrypt(ChaChaNonce::from_slice(&nonce.0), payload),
        }
        .map_err(|_| GateTrustError::Encryption)?;

        // The aead crates append the tag; detach it.
        let split = ciphertext
            .len()
            .checked_sub(TAG_LEN)
            .ok_or(GateTrustError::Encryption)?;
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&ciphertext[split..]);
        ciphertext.truncate(split);

        Ok(SealedBox {
            nonce: nonce.0,
            ciphertext,
            tag,
        })
    }

    /// Open a detached-tag ciphertext. Any mismatch is `AuthenticationFailed`
    /// and no partial plaintext is returned.
    pub fn open(
        &self,
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
        tag: &[u8; TAG_LEN],
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        combined.extend_from_slice(ciphertext);
        combined.extend_from_slice(tag);
        let payload = Payload {
            msg: &combined,
            aad,
        };
        match self {
            AeadKey::Aes256Gcm(c) => c.decrypt(AesNonce::from_slice(nonce), payload),
            AeadKey::ChaCha20Poly1305(c) => c.decrypt(ChaChaNonce::from_slice(nonce), payload),
        }
        .map_err(|_| GateTrustError::AuthenticationFailed)
    }
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn encrypt(algorithm: Algorithm, plaintext: &[u8], key: &[u8; 32], aad: &[u8]) -> Result<SealedBox> {
    AeadKey::new(algorithm, key)?.seal(FreshNonce::generate(), plaintext, aad)
}

/// Decrypt and authenticate; fails with `AuthenticationFailed` on any tamper.
pub fn decrypt(
    algorithm: Algorithm,
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
) -> Result<Vec<u8>> {
    AeadKey::new(algorithm, key)?.open(nonce, ciphertext, tag, aad)
}
