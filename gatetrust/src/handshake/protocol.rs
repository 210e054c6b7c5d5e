// Handshake protocol: signed challenge, X25519 DH + HKDF session keys, HMAC
// key confirmation.
//
//   Responder (platform)                      Initiator (agent)
//     create_challenge ---- challenge ------->  process_challenge
//     process_auth     <--- auth -------------
//                      ---- accept ---------->  process_accept
//
// Transcript T = "n3n-handshake-v1" || nonce || server_pub || client_pub || device_id
// keys         = HKDF(salt = nonce, ikm = DH, context = "n3n-agent-v1" || device_id)
// confirm      = HMAC(auth_key, "server-finished" || SHA-256(T))

use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};
use uuid::Uuid;

use crate::crypto::aead::Algorithm;
use crate::crypto::hash::{b64url_encode, hash_sha256};
use crate::crypto::identity::{fingerprint, verify_signature, IdentityKeyPair};
use crate::crypto::kdf::{confirmation_tag, derive_keys, verify_confirmation, DerivedKeySet};
use crate::crypto::x25519::EphemeralKeyPair;
use crate::envelope::PROTOCOL_VERSION;
use crate::error::{GateTrustError, Result};
use crate::handshake::messages::{decode_fixed, decode_var, HandshakeAccept, HandshakeAuth, HandshakeChallenge};
use crate::handshake::state::HandshakeState;
use crate::handshake::{
    auth_transcript, challenge_transcript, session_context, CHALLENGE_NONCE_LEN, DEFAULT_CHALLENGE_TTL_MS,
    MAX_DEVICE_ID_LEN, SERVER_FINISHED,
};
use crate::ledger::{DeviceInfo, RegistrationLedger};
use crate::replay::DEFAULT_TOLERANCE_MS;

/// Output of a completed handshake, handed to the session layer.
#[derive(Debug)]
pub struct EstablishedSession {
    pub connection_id: String,
    pub device_id: String,
    pub algorithm: Algorithm,
    pub keys: DerivedKeySet,
    /// Peer's long-term Ed25519 key (device identity or platform key).
    pub peer_identity: [u8; 32],
    /// True when this handshake redeemed a registration token.
    pub newly_registered: bool,
}

impl EstablishedSession {
    pub fn peer_fingerprint(&self) -> String {
        fingerprint(&self.peer_identity)
    }
}

fn invalid_transition(from: &HandshakeState, to: &str) -> GateTrustError {
    GateTrustError::InvalidStateTransition {
        from: from.label().into(),
        to: to.into(),
    }
}

fn validate_device_id(device_id: &str) -> Result<()> {
    if device_id.is_empty() || device_id.len() > MAX_DEVICE_ID_LEN || device_id.chars().any(char::is_control) {
        return Err(GateTrustError::Handshake("invalid device id".into()));
    }
    Ok(())
}

// ── Responder ────────────────────────────────────────────────────────────

/// Platform side of the handshake. One per connection.
pub struct Responder {
    identity: Arc<IdentityKeyPair>,
    supported: Vec<Algorithm>,
    challenge_ttl_ms: u64,
    state: HandshakeState,
}

impl Responder {
    pub fn new(identity: Arc<IdentityKeyPair>) -> Self {
        Self {
            identity,
            supported: Algorithm::SUPPORTED.to_vec(),
            challenge_ttl_ms: DEFAULT_CHALLENGE_TTL_MS,
            state: HandshakeState::Idle,
        }
    }

    /// Restrict the offered algorithms (preference order).
    pub fn with_algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.supported = algorithms;
        self
    }

    pub fn with_challenge_ttl(mut self, ttl_ms: u64) -> Self {
        self.challenge_ttl_ms = ttl_ms;
        self
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Step 1: a signed challenge carrying a fresh ephemeral key and nonce.
    pub fn create_challenge(&mut self, now: u64) -> Result<HandshakeChallenge> {
        if !matches!(self.state, HandshakeState::Idle) {
            return Err(invalid_transition(&self.state, "ChallengeSent"));
        }

        let ephemeral = EphemeralKeyPair::generate();
        let server_public = ephemeral.public_key_bytes();
        let mut nonce = [0u8; CHALLENGE_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let signature = self.identity.sign(&challenge_transcript(&nonce, &server_public));

        let challenge = HandshakeChallenge {
            v: PROTOCOL_VERSION,
            alg: self.supported.iter().map(|a| a.wire_name().to_string()).collect(),
            ts: now,
            nonce: b64url_encode(&nonce),
            server_public_key: b64url_encode(&server_public),
            platform_key: b64url_encode(&self.identity.public_key_bytes()),
            signature: b64url_encode(&signature),
        };
        self.state = HandshakeState::ChallengeSent {
            ephemeral,
            nonce,
            issued_at: now,
        };
        Ok(challenge)
    }

    /// Step 2: check the agent's proof against the ledger, then agree keys.
    ///
    /// A known device is looked up before the Diffie-Hellman step. A
    /// registration token is redeemed only once key agreement has succeeded,
    /// so a failed handshake leaves it unspent. On any error the responder
    /// is `Failed`.
    pub fn process_auth(
        &mut self,
        auth: &HandshakeAuth,
        ledger: &RegistrationLedger,
        now: u64,
    ) -> Result<(HandshakeAccept, EstablishedSession)> {
        let (ephemeral, nonce, issued_at) = match std::mem::replace(&mut self.state, HandshakeState::Failed) {
            HandshakeState::ChallengeSent {
                ephemeral,
                nonce,
                issued_at,
            } => (ephemeral, nonce, issued_at),
            other => return Err(invalid_transition(&other, "Complete")),
        };

        if now.saturating_sub(issued_at) > self.challenge_ttl_ms {
            return Err(GateTrustError::Handshake("challenge expired".into()));
        }
        validate_device_id(&auth.device_id)?;

        let algorithm = Algorithm::from_wire_name(&auth.alg)
            .filter(|a| self.supported.contains(a))
            .ok_or_else(|| GateTrustError::UnsupportedAlgorithm(auth.alg.clone()))?;
        let client_public = decode_fixed::<32>("clientPublicKey", &auth.client_public_key)
            .map_err(|_| GateTrustError::InvalidPeerKey)?;
        let signature = decode_var("signature", &auth.signature)?;
        let server_public = ephemeral.public_key_bytes();
        let transcript = auth_transcript(&nonce, &server_public, &client_public, &auth.device_id);

        let identity_key = match &auth.registration_token {
            Some(_) => {
                if ledger.is_blocked(&auth.device_id) {
                    return Err(GateTrustError::DeviceBlocked);
                }
                decode_fixed::<32>(
                    "identityKey",
                    auth.identity_key
                        .as_deref()
                        .ok_or_else(|| GateTrustError::Handshake("identityKey required".into()))?,
                )?
            }
            None => ledger.verify_device(&auth.device_id)?,
        };
        verify_signature(&identity_key, &transcript, &signature)?;

        let shared = ephemeral.diffie_hellman(&client_public)?;
        let keys = derive_keys(&shared, &nonce, &session_context(&auth.device_id))?;
        drop(shared);
        let confirm = confirmation_tag(keys.auth_key(), SERVER_FINISHED, &hash_sha256(&transcript))?;

        let newly_registered = match &auth.registration_token {
            Some(token) => {
                ledger.consume_token(
                    token,
                    DeviceInfo {
                        device_id: auth.device_id.clone(),
                        identity_key,
                        device_name: auth.device_name.clone(),
                        platform: auth.platform.clone(),
                    },
                    now,
                )?;
                true
            }
            None => false,
        };

        let connection_id = Uuid::new_v4().to_string();
        ledger.touch(&auth.device_id, now);

        let accept = HandshakeAccept {
            connection_id: connection_id.clone(),
            encrypted: true,
            alg: algorithm.wire_name().to_string(),
            confirm: b64url_encode(&confirm),
            platform_key: b64url_encode(&self.identity.public_key_bytes()),
            platform_fingerprint: self.identity.fingerprint(),
        };
        self.state = HandshakeState::Complete;
        info!(device_id = %auth.device_id, %connection_id, %algorithm, newly_registered, "handshake accepted");

        Ok((
            accept,
            EstablishedSession {
                connection_id,
                device_id: auth.device_id.clone(),
                algorithm,
                keys,
                peer_identity: identity_key,
                newly_registered,
            },
        ))
    }
}

// ── Initiator ────────────────────────────────────────────────────────────

/// First-connection credentials presented alongside the handshake.
#[derive(Clone)]
pub struct Registration {
    pub token: String,
    pub device_name: Option<String>,
    pub platform: Option<String>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("token", &"<redacted>")
            .field("device_name", &self.device_name)
            .field("platform", &self.platform)
            .finish()
    }
}

/// Agent side of the handshake.
pub struct Initiator {
    identity: IdentityKeyPair,
    device_id: String,
    preferred: Vec<Algorithm>,
    pinned_platform: Option<String>,
    registration: Option<Registration>,
    tolerance_ms: u64,
    state: HandshakeState,
}

impl Initiator {
    pub fn new(identity: IdentityKeyPair, device_id: impl Into<String>) -> Self {
        Self {
            identity,
            device_id: device_id.into(),
            preferred: Algorithm::SUPPORTED.to_vec(),
            pinned_platform: None,
            registration: None,
            tolerance_ms: DEFAULT_TOLERANCE_MS,
            state: HandshakeState::Idle,
        }
    }

    /// Algorithms this agent accepts, preferred first.
    pub fn with_algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.preferred = algorithms;
        self
    }

    /// Refuse any platform whose key fingerprint differs.
    pub fn with_pinned_platform(mut self, fingerprint: impl Into<String>) -> Self {
        self.pinned_platform = Some(fingerprint.into());
        self
    }

    /// Redeem a token or pairing code on this handshake.
    pub fn with_registration(mut self, registration: Registration) -> Self {
        self.registration = Some(registration);
        self
    }

    pub fn with_clock_tolerance(mut self, tolerance_ms: u64) -> Self {
        self.tolerance_ms = tolerance_ms;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Step 1 (agent side): verify the challenge and produce `handshake.auth`.
    pub fn process_challenge(&mut self, challenge: &HandshakeChallenge, now: u64) -> Result<HandshakeAuth> {
        if !matches!(self.state, HandshakeState::Idle) {
            return Err(invalid_transition(&self.state, "AuthSent"));
        }
        self.state = HandshakeState::Failed;

        if challenge.v != PROTOCOL_VERSION {
            return Err(GateTrustError::UnsupportedVersion(challenge.v));
        }
        if now.abs_diff(challenge.ts) > self.tolerance_ms {
            return Err(GateTrustError::StaleTimestamp {
                timestamp: challenge.ts,
                now,
                tolerance_ms: self.tolerance_ms,
            });
        }
        validate_device_id(&self.device_id)?;

        let nonce = decode_fixed::<CHALLENGE_NONCE_LEN>("nonce", &challenge.nonce)?;
        let server_public = decode_fixed::<32>("serverPublicKey", &challenge.server_public_key)
            .map_err(|_| GateTrustError::InvalidPeerKey)?;
        let platform_key = decode_fixed::<32>("platformKey", &challenge.platform_key)?;
        let platform_sig = decode_var("signature", &challenge.signature)?;

        verify_signature(&platform_key, &challenge_transcript(&nonce, &server_public), &platform_sig)?;
        if let Some(pinned) = &self.pinned_platform {
            if fingerprint(&platform_key) != *pinned {
                return Err(GateTrustError::Handshake("platform fingerprint mismatch".into()));
            }
        }

        let algorithm = self
            .preferred
            .iter()
            .copied()
            .find(|a| challenge.alg.iter().any(|offered| offered == a.wire_name()))
            .ok_or_else(|| GateTrustError::UnsupportedAlgorithm(challenge.alg.join(",")))?;

        let ephemeral = EphemeralKeyPair::generate();
        let client_public = ephemeral.public_key_bytes();
        let transcript = auth_transcript(&nonce, &server_public, &client_public, &self.device_id);
        let signature = self.identity.sign(&transcript);

        let shared = ephemeral.diffie_hellman(&server_public)?;
        let keys = derive_keys(&shared, &nonce, &session_context(&self.device_id))?;
        drop(shared);

        let registration = self.registration.as_ref();
        let auth = HandshakeAuth {
            device_id: self.device_id.clone(),
            client_public_key: b64url_encode(&client_public),
            alg: algorithm.wire_name().to_string(),
            signature: b64url_encode(&signature),
            registration_token: registration.map(|r| r.token.clone()),
            identity_key: registration.map(|_| b64url_encode(&self.identity.public_key_bytes())),
            device_name: registration.and_then(|r| r.device_name.clone()),
            platform: registration.and_then(|r| r.platform.clone()),
        };

        self.state = HandshakeState::AuthSent {
            keys,
            transcript_hash: hash_sha256(&transcript),
            algorithm,
            platform_key,
        };
        debug!(device_id = %self.device_id, %algorithm, "handshake auth prepared");
        Ok(auth)
    }

    /// Step 2 (agent side): check key confirmation and finish.
    pub fn process_accept(&mut self, accept: &HandshakeAccept) -> Result<EstablishedSession> {
        let (keys, transcript_hash, algorithm, platform_key) =
            match std::mem::replace(&mut self.state, HandshakeState::Failed) {
                HandshakeState::AuthSent {
                    keys,
                    transcript_hash,
                    algorithm,
                    platform_key,
                } => (keys, transcript_hash, algorithm, platform_key),
                other => return Err(invalid_transition(&other, "Complete")),
            };

        if accept.alg != algorithm.wire_name() {
            return Err(GateTrustError::UnsupportedAlgorithm(accept.alg.clone()));
        }
        if decode_fixed::<32>("platformKey", &accept.platform_key)? != platform_key {
            return Err(GateTrustError::Handshake("platform key changed mid-handshake".into()));
        }
        let confirm = decode_var("confirm", &accept.confirm)?;
        verify_confirmation(keys.auth_key(), SERVER_FINISHED, &transcript_hash, &confirm)?;

        self.state = HandshakeState::Complete;
        info!(device_id = %self.device_id, connection_id = %accept.connection_id, "handshake confirmed");
        Ok(EstablishedSession {
            connection_id: accept.connection_id.clone(),
            device_id: self.device_id.clone(),
            algorithm,
            keys,
            peer_identity: platform_key,
            newly_registered: self.registration.is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    fn registered(ledger: &RegistrationLedger, device_id: &str) -> IdentityKeyPair {
        let identity = IdentityKeyPair::generate();
        let t = ledger.issue_token("u", NOW);
        ledger
            .consume_token(
                &t.token,
                DeviceInfo {
                    device_id: device_id.into(),
                    identity_key: identity.public_key_bytes(),
                    device_name: None,
                    platform: None,
                },
                NOW,
            )
            .unwrap();
        identity
    }

    #[test]
    fn full_handshake_derives_matching_keys() {
        let ledger = RegistrationLedger::default();
        let agent_identity = registered(&ledger, "dev-1");
        let platform = Arc::new(IdentityKeyPair::generate());

        let mut responder = Responder::new(platform.clone());
        let mut initiator = Initiator::new(agent_identity, "dev-1").with_pinned_platform(platform.fingerprint());

        let challenge = responder.create_challenge(NOW).unwrap();
        let auth = initiator.process_challenge(&challenge, NOW).unwrap();
        let (accept, server) = responder.process_auth(&auth, &ledger, NOW).unwrap();
        let client = initiator.process_accept(&accept).unwrap();

        assert_eq!(server.keys.encrypt_client_to_server(), client.keys.encrypt_client_to_server());
        assert_eq!(server.keys.encrypt_server_to_client(), client.keys.encrypt_server_to_client());
        assert_eq!(server.connection_id, client.connection_id);
        assert_eq!(client.peer_identity, platform.public_key_bytes());
        assert!(!server.newly_registered);
        assert_eq!(responder.state().label(), "Complete");
    }

    #[test]
    fn blocked_device_rejected_before_key_agreement() {
        let ledger = RegistrationLedger::default();
        let agent_identity = registered(&ledger, "dev-1");
        ledger.block("dev-1", "test", NOW).unwrap();

        let mut responder = Responder::new(Arc::new(IdentityKeyPair::generate()));
        let mut initiator = Initiator::new(agent_identity, "dev-1");
        let challenge = responder.create_challenge(NOW).unwrap();
        let auth = initiator.process_challenge(&challenge, NOW).unwrap();
        let err = responder.process_auth(&auth, &ledger, NOW).unwrap_err();
        assert!(matches!(err, GateTrustError::DeviceBlocked));
        assert_eq!(responder.state().label(), "Failed");
    }

    #[test]
    fn expired_challenge_rejected() {
        let ledger = RegistrationLedger::default();
        let agent_identity = registered(&ledger, "dev-1");
        let mut responder = Responder::new(Arc::new(IdentityKeyPair::generate())).with_challenge_ttl(1_000);
        let mut initiator = Initiator::new(agent_identity, "dev-1");
        let challenge = responder.create_challenge(NOW).unwrap();
        let auth = initiator.process_challenge(&challenge, NOW).unwrap();
        let err = responder.process_auth(&auth, &ledger, NOW + 1_001).unwrap_err();
        assert!(matches!(err, GateTrustError::Handshake(_)));
    }

    #[test]
    fn wrong_device_key_fails_signature() {
        let ledger = RegistrationLedger::default();
        registered(&ledger, "dev-1");
        let mut responder = Responder::new(Arc::new(IdentityKeyPair::generate()));
        let mut impostor = Initiator::new(IdentityKeyPair::generate(), "dev-1");
        let challenge = responder.create_challenge(NOW).unwrap();
        let auth = impostor.process_challenge(&challenge, NOW).unwrap();
        let err = responder.process_auth(&auth, &ledger, NOW).unwrap_err();
        assert!(matches!(err, GateTrustError::SignatureVerification));
    }

    #[test]
    fn pinned_fingerprint_mismatch_rejected() {
        let mut responder = Responder::new(Arc::new(IdentityKeyPair::generate()));
        let mut initiator = Initiator::new(IdentityKeyPair::generate(), "dev-1").with_pinned_platform("00".repeat(32));
        let challenge = responder.create_challenge(NOW).unwrap();
        assert!(initiator.process_challenge(&challenge, NOW).is_err());
    }

    #[test]
    fn registration_token_redeemed_in_handshake() {
        let ledger = RegistrationLedger::default();
        let code = ledger.issue_pairing_code("u", NOW).unwrap();
        let mut responder = Responder::new(Arc::new(IdentityKeyPair::generate()));
        let mut initiator = Initiator::new(IdentityKeyPair::generate(), "new-dev").with_registration(Registration {
            token: code.token.clone(),
            device_name: Some("box".into()),
            platform: Some("linux".into()),
        });

        let challenge = responder.create_challenge(NOW).unwrap();
        let auth = initiator.process_challenge(&challenge, NOW).unwrap();
        assert!(auth.identity_key.is_some());
        let (accept, server) = responder.process_auth(&auth, &ledger, NOW).unwrap();
        assert!(server.newly_registered);
        initiator.process_accept(&accept).unwrap();

        let rec = ledger.get("new-dev").unwrap();
        assert_eq!(rec.device_name.as_deref(), Some("box"));
    }

    #[test]
    fn algorithm_negotiation_prefers_agent_order() {
        let ledger = RegistrationLedger::default();
        let identity = registered(&ledger, "d");
        let mut responder = Responder::new(Arc::new(IdentityKeyPair::generate()));
        let mut initiator = Initiator::new(identity, "d").with_algorithms(vec![Algorithm::ChaCha20Poly1305]);
        let challenge = responder.create_challenge(NOW).unwrap();
        let auth = initiator.process_challenge(&challenge, NOW).unwrap();
        assert_eq!(auth.alg, "C20P");
        let (_, server) = responder.process_auth(&auth, &ledger, NOW).unwrap();
        assert_eq!(server.algorithm, Algorithm::ChaCha20Poly1305);
    }

    #[test]
    fn tampered_confirm_rejected() {
        let ledger = RegistrationLedger::default();
        let identity = registered(&ledger, "d");
        let mut responder = Responder::new(Arc::new(IdentityKeyPair::generate()));
        let mut initiator = Initiator::new(identity, "d");
        let challenge = responder.create_challenge(NOW).unwrap();
        let auth = initiator.process_challenge(&challenge, NOW).unwrap();
        let (mut accept, _) = responder.process_auth(&auth, &ledger, NOW).unwrap();
        accept.confirm = b64url_encode(&[0u8; 32]);
        assert!(matches!(initiator.process_accept(&accept).unwrap_err(), GateTrustError::AuthenticationFailed));
    }

    #[test]
    fn challenge_twice_is_invalid_transition() {
        let mut responder = Responder::new(Arc::new(IdentityKeyPair::generate()));
        responder.create_challenge(NOW).unwrap();
        assert!(matches!(
            responder.create_challenge(NOW).unwrap_err(),
            GateTrustError::InvalidStateTransition { .. }
        ));
    }
}
