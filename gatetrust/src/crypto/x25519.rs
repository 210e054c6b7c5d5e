// X25519 Diffie-Hellman key agreement for per-connection session keys.

use std::fmt;

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{GateTrustError, Result};

/// Length of an X25519 public key or shared secret.
pub const X25519_KEY_LEN: usize = 32;

/// An X25519 ephemeral keypair for exactly one handshake.
///
/// `diffie_hellman` consumes the pair, so the private half can never be used
/// for a second agreement. The secret is zeroized on drop.
pub struct EphemeralKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a new random ephemeral keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Create from existing secret bytes (used in deterministic tests and FFI).
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The 32-byte public key.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Perform Diffie-Hellman with a peer's public key.
    ///
    /// Fails with `InvalidPeerKey` when the encoding is not 32 bytes or the
    /// point is of low order (the agreement would be non-contributory).
    pub fn diffie_hellman(self, peer_public: &[u8]) -> Result<SharedSecret> {
        let peer = parse_public_key(peer_public)?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(GateTrustError::InvalidPeerKey);
        }
        Ok(SharedSecret(*shared.as_bytes()))
    }
}

impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

/// Raw ECDH output. Not `Clone`, not serializable, redacted in `Debug`,
/// zeroized on drop; it only lives long enough to be fed into HKDF.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Validate a raw X25519 public key encoding.
pub fn parse_public_key(bytes: &[u8]) -> Result<[u8; 32]> {
    <[u8; 32]>::try_from(bytes).map_err(|_| GateTrustError::InvalidPeerKey)
}
