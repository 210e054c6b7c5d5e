//! Secure envelope codec.
//!
//! Compact wire form (three base64url segments, no padding):
//!
//! ```text
//! base64url(header_json) "." base64url(ciphertext) "." base64url(tag)
//! ```
//!
//! The header is sent in clear but its exact JSON bytes are the AEAD
//! associated data, so flipping any bit of `v`, `alg`, `did`, `ts`, `seq`,
//! `nonce` or `dir` makes the tag fail. On receive the AAD is the header bytes
//! as decoded from the wire, never a re-serialisation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::aead::{AeadKey, Algorithm, FreshNonce, NONCE_LEN, TAG_LEN};
use crate::crypto::hash::{b64url_decode, b64url_encode};
use crate::error::{GateTrustError, Result};

/// Envelope protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Segment delimiter of the compact form.
pub const COMPACT_DELIMITER: char = '.';

/// Direction tag carried in every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Agent -> platform.
    #[serde(rename = "c2s")]
    ClientToServer,
    /// Platform -> agent.
    #[serde(rename = "s2c")]
    ServerToClient,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::ClientToServer => "c2s",
            Direction::ServerToClient => "s2c",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clear-text, authenticated envelope header. Field order is the canonical
/// serialisation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    /// Protocol version.
    pub v: u32,
    /// AEAD algorithm identifier.
    pub alg: String,
    /// Device identifier.
    pub did: String,
    /// Sender timestamp, unix milliseconds.
    pub ts: u64,
    /// Per-direction sequence number.
    pub seq: u64,
    /// base64url nonce.
    pub nonce: String,
    /// Direction tag.
    pub dir: Direction,
}

impl EnvelopeHeader {
    /// Resolve `alg`, rejecting anything unsupported.
    pub fn algorithm(&self) -> Result<Algorithm> {
        Algorithm::from_wire_name(&self.alg).ok_or_else(|| GateTrustError::UnsupportedAlgorithm(self.alg.clone()))
    }

    /// Decode the nonce field.
    pub fn nonce_bytes(&self) -> Result<[u8; NONCE_LEN]> {
        b64url_decode(&self.nonce)
            .and_then(|b| <[u8; NONCE_LEN]>::try_from(b.as_slice()).ok())
            .ok_or_else(|| GateTrustError::MalformedEnvelope("bad nonce".into()))
    }

    /// Canonical header bytes (used as AAD when sealing).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Parameters for sealing one frame.
#[derive(Debug, Clone)]
pub struct SealParams<'a> {
    pub algorithm: Algorithm,
    pub device_id: &'a str,
    pub direction: Direction,
    pub sequence: u64,
    pub timestamp: u64,
}

/// The wire unit: header + ciphertext + detached tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureEnvelope {
    header: EnvelopeHeader,
    /// Exact header bytes bound as AAD.
    header_bytes: Vec<u8>,
    ciphertext: Vec<u8>,
    tag: [u8; TAG_LEN],
}

impl SecureEnvelope {
    /// Encrypt `plaintext` into a new envelope under `key`.
    ///
    /// The nonce is generated here and written into the header before the
    /// header is serialised, so it is covered by the AAD as well.
    pub fn seal(key: &[u8; 32], params: SealParams<'_>, plaintext: &[u8]) -> Result<Self> {
        let nonce = FreshNonce::generate();
        let header = EnvelopeHeader {
            v: PROTOCOL_VERSION,
            alg: params.algorithm.wire_name().to_string(),
            did: params.device_id.to_string(),
            ts: params.timestamp,
            seq: params.sequence,
            nonce: b64url_encode(nonce.as_bytes()),
            dir: params.direction,
        };
        let header_bytes = header.to_bytes()?;
        let sealed = AeadKey::new(params.algorithm, key)?.seal(nonce, plaintext, &header_bytes)?;
        Ok(Self {
            header,
            header_bytes,
            ciphertext: sealed.ciphertext,
            tag: sealed.tag,
        })
    }

    /// Authenticate and decrypt with `key`.
    ///
    /// Version and algorithm are checked before the cipher runs; a tag
    /// mismatch is `AuthenticationFailed` with no plaintext released.
    pub fn open(&self, key: &[u8; 32]) -> Result<Vec<u8>> {
        if self.header.v != PROTOCOL_VERSION {
            return Err(GateTrustError::UnsupportedVersion(self.header.v));
        }
        let algorithm = self.header.algorithm()?;
        let nonce = self.header.nonce_bytes()?;
        AeadKey::new(algorithm, key)?.open(&nonce, &self.ciphertext, &self.tag, &self.header_bytes)
    }

    /// Serialise to `header.ciphertext.tag`.
    pub fn to_compact_form(&self) -> String {
        let mut out = String::with_capacity((self.header_bytes.len() + self.ciphertext.len() + TAG_LEN) * 4 / 3 + 4);
        out.push_str(&b64url_encode(&self.header_bytes));
        out.push(COMPACT_DELIMITER);
        out.push_str(&b64url_encode(&self.ciphertext));
        out.push(COMPACT_DELIMITER);
        out.push_str(&b64url_encode(&self.tag));
        out
    }

    /// Parse the compact form. Fails with `MalformedEnvelope` unless the input
    /// is exactly three decodable segments with a parseable header.
    pub fn from_compact_form(compact: &str) -> Result<Self> {
        let parts: Vec<&str> = compact.split(COMPACT_DELIMITER).collect();
        if parts.len() != 3 {
            return Err(GateTrustError::MalformedEnvelope(format!(
                "expected 3 segments, got {}",
                parts.len()
            )));
        }

        let header_bytes =
            b64url_decode(parts[0]).ok_or_else(|| GateTrustError::MalformedEnvelope("header encoding".into()))?;
        let header: EnvelopeHeader = serde_json::from_slice(&header_bytes)
            .map_err(|e| GateTrustError::MalformedEnvelope(format!("header: {e}")))?;
        let ciphertext =
            b64url_decode(parts[1]).ok_or_else(|| GateTrustError::MalformedEnvelope("ciphertext encoding".into()))?;
        let tag = b64url_decode(parts[2])
            .and_then(|t| <[u8; TAG_LEN]>::try_from(t.as_slice()).ok())
            .ok_or_else(|| GateTrustError::MalformedEnvelope("tag encoding".into()))?;

        Ok(Self {
            header,
            header_bytes,
            ciphertext,
            tag,
        })
    }

    pub fn header(&self) -> &EnvelopeHeader {
        &self.header
    }

    /// The exact bytes authenticated as AAD.
    pub fn header_bytes(&self) -> &[u8] {
        &self.header_bytes
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn tag(&self) -> &[u8; TAG_LEN] {
        &self.tag
    }
}
