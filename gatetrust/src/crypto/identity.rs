// Ed25519 long-term identity keys for agents and the platform.
//
// An agent's identity key is its "prior device credential": it signs the
// handshake transcript. The platform's identity signs every challenge so the
// agent can check it against the fingerprint pinned at registration.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::crypto::hash::{hash_sha256, to_hex};
use crate::error::{GateTrustError, Result};

/// An Ed25519 identity keypair.
#[derive(Debug)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl IdentityKeyPair {
    /// Generate a fresh random Ed25519 keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Reconstruct from a 32-byte secret seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// The 32-byte Ed25519 public key.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// The 32-byte secret key seed, wiped when the wrapper drops.
    pub fn seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// Lower-case hex SHA-256 of the public key.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key_bytes())
    }

    /// Sign arbitrary data.
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        let sig: Signature = self.signing_key.sign(data);
        sig.to_bytes()
    }

    /// Verify a signature against this public key.
    pub fn verify(&self, data: &[u8], signature: &[u8; 64]) -> Result<()> {
        let sig = Signature::from_bytes(signature);
        self.verifying_key
            .verify(data, &sig)
            .map_err(|_| GateTrustError::SignatureVerification)
    }
}

/// Fingerprint of a raw Ed25519 public key: lower-case hex SHA-256.
pub fn fingerprint(public_key: &[u8; 32]) -> String {
    to_hex(&hash_sha256(public_key))
}

/// Verify a signature given raw public key bytes, message, and signature bytes.
pub fn verify_signature(pubkey_bytes: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<()> {
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| GateTrustError::SignatureVerification)?;
    let vk = VerifyingKey::from_bytes(pubkey_bytes).map_err(|e| GateTrustError::InvalidKey(format!("{e}")))?;
    let sig = Signature::from_bytes(&sig_bytes);
    vk.verify_strict(message, &sig)
        .map_err(|_| GateTrustError::SignatureVerification)
}
