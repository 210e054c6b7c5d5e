// Session key derivation: HKDF-SHA256 over the X25519 shared secret.
//
//   master        = HKDF-Extract(salt, shared_secret)            (32 bytes)
//   encrypt_c2s   = HKDF-Expand(master, context || "encrypt-c2s", 32)
//   encrypt_s2c   = HKDF-Expand(master, context || "encrypt-s2c", 32)
//   auth          = HKDF-Expand(master, context || "auth",        32)
//
// An empty salt means the RFC 5869 default (HashLen zero bytes).

use std::fmt;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::x25519::SharedSecret;
use crate::envelope::Direction;
use crate::error::{GateTrustError, Result};

pub const LABEL_ENCRYPT_C2S: &[u8] = b"encrypt-c2s";
pub const LABEL_ENCRYPT_S2C: &[u8] = b"encrypt-s2c";
pub const LABEL_AUTH: &[u8] = b"auth";

/// Derived symmetric key length.
pub const KEY_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// The three per-session keys. Redacted in `Debug`, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeySet {
    encrypt_c2s: [u8; KEY_LEN],
    encrypt_s2c: [u8; KEY_LEN],
    auth: [u8; KEY_LEN],
}

impl DerivedKeySet {
    /// Key protecting agent -> platform frames.
    pub fn encrypt_client_to_server(&self) -> &[u8; KEY_LEN] {
        &self.encrypt_c2s
    }

    /// Key protecting platform -> agent frames.
    pub fn encrypt_server_to_client(&self) -> &[u8; KEY_LEN] {
        &self.encrypt_s2c
    }

    /// Key used for handshake key confirmation.
    pub fn auth_key(&self) -> &[u8; KEY_LEN] {
        &self.auth
    }

    /// The encryption key for frames travelling in `direction`.
    pub fn key_for(&self, direction: Direction) -> &[u8; KEY_LEN] {
        match direction {
            Direction::ClientToServer => &self.encrypt_c2s,
            Direction::ServerToClient => &self.encrypt_s2c,
        }
    }
}

impl fmt::Debug for DerivedKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKeySet(..)")
    }
}

/// Derive the session key set from an ECDH shared secret.
///
/// Deterministic: identical `(shared_secret, salt, context)` always yield
/// identical keys.
pub fn derive_keys(shared_secret: &SharedSecret, salt: &[u8], context: &[u8]) -> Result<DerivedKeySet> {
    derive_keys_from_bytes(shared_secret.as_bytes(), salt, context)
}

/// Same as [`derive_keys`] over raw input keying material (FFI and fixtures).
pub fn derive_keys_from_bytes(ikm: &[u8], salt: &[u8], context: &[u8]) -> Result<DerivedKeySet> {
    let salt = if salt.is_empty() { None } else { Some(salt) };
    let hk = Hkdf::<Sha256>::new(salt, ikm);

    let expand = |label: &[u8]| -> Result<[u8; KEY_LEN]> {
        let mut info = Vec::with_capacity(context.len() + label.len());
        info.extend_from_slice(context);
        info.extend_from_slice(label);
        let mut okm = [0u8; KEY_LEN];
        hk.expand(&info, &mut okm)
            .map_err(|e| GateTrustError::KeyDerivation(format!("HKDF expand error: {e}")))?;
        Ok(okm)
    };

    Ok(DerivedKeySet {
        encrypt_c2s: expand(LABEL_ENCRYPT_C2S)?,
        encrypt_s2c: expand(LABEL_ENCRYPT_S2C)?,
        auth: expand(LABEL_AUTH)?,
    })
}

/// HMAC-SHA256 key confirmation tag over `label || transcript_hash`.
pub fn confirmation_tag(auth_key: &[u8; KEY_LEN], label: &[u8], transcript_hash: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(auth_key)
        .map_err(|e| GateTrustError::InvalidKey(format!("hmac init: {e}")))?;
    mac.update(label);
    mac.update(transcript_hash);
    let mut tag = [0u8; 32];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    Ok(tag)
}

/// Constant-time check of a key confirmation tag.
pub fn verify_confirmation(
    auth_key: &[u8; KEY_LEN],
    label: &[u8],
    transcript_hash: &[u8],
    tag: &[u8],
) -> Result<()> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(auth_key)
        .map_err(|e| GateTrustError::InvalidKey(format!("hmac init: {e}")))?;
    mac.update(label);
    mac.update(transcript_hash);
    mac.verify_slice(tag)
        .map_err(|_| GateTrustError::AuthenticationFailed)
}
