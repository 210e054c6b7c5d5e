//! Per-connection session state.
//!
//! A session moves Connecting -> Handshaking -> Authenticated -> Active ->
//! Closed, and may jump to Closed from anywhere. It is owned by exactly one
//! connection task, so inbound frames are opened strictly in arrival order and
//! the sequence counters need no lock.

use std::fmt;

use gatetrust::envelope::SealParams;
use gatetrust::handshake::EstablishedSession;
use gatetrust::{Algorithm, DerivedKeySet, Direction, GateTrustError, ReplayGuard, SecureEnvelope, SequenceWindow};
use tracing::debug;

use crate::error::{GateStreamError, Result};
use crate::message::ProtocolMessage;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport accepted, no cryptographic state yet.
    Connecting,
    /// Challenge sent or awaited.
    Handshaking,
    /// Keys derived and confirmed.
    Authenticated,
    /// Encrypted traffic flowing.
    Active,
    /// Terminal. Keys discarded.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Handshaking => write!(f, "Handshaking"),
            SessionState::Authenticated => write!(f, "Authenticated"),
            SessionState::Active => write!(f, "Active"),
            SessionState::Closed => write!(f, "Closed"),
        }
    }
}

/// Which end of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Platform,
    Agent,
}

impl Role {
    pub fn outbound(self) -> Direction {
        match self {
            Role::Platform => Direction::ServerToClient,
            Role::Agent => Direction::ClientToServer,
        }
    }

    pub fn inbound(self) -> Direction {
        self.outbound().reverse()
    }
}

/// Cryptographic state of one live connection.
pub struct Session {
    role: Role,
    state: SessionState,
    device_id: Option<String>,
    connection_id: Option<String>,
    algorithm: Algorithm,
    keys: Option<DerivedKeySet>,
    window: SequenceWindow,
    guard: ReplayGuard,
    max_frame_bytes: usize,
    last_seen_at: u64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("device_id", &self.device_id)
            .field("connection_id", &self.connection_id)
            .field("algorithm", &self.algorithm)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(role: Role, guard: ReplayGuard, max_frame_bytes: usize) -> Self {
        Self {
            role,
            state: SessionState::Connecting,
            device_id: None,
            connection_id: None,
            algorithm: Algorithm::default(),
            keys: None,
            window: SequenceWindow::new(),
            guard,
            max_frame_bytes,
            last_seen_at: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn last_seen_at(&self) -> u64 {
        self.last_seen_at
    }

    /// Last sequence sent by this side.
    pub fn last_outbound_sequence(&self) -> u64 {
        self.window.last(self.role.outbound())
    }

    pub fn last_inbound_sequence(&self) -> u64 {
        self.window.last(self.role.inbound())
    }

    fn transition(&mut self, to: SessionState) -> Result<()> {
        let allowed = matches!(
            (self.state, to),
            (SessionState::Connecting, SessionState::Handshaking)
                | (SessionState::Handshaking, SessionState::Authenticated)
                | (SessionState::Authenticated, SessionState::Active)
                | (_, SessionState::Closed)
        );
        if !allowed {
            return Err(GateStreamError::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Connecting -> Handshaking.
    pub fn begin_handshake(&mut self) -> Result<()> {
        self.transition(SessionState::Handshaking)
    }

    /// Handshaking -> Authenticated, taking ownership of the derived keys.
    pub fn establish(&mut self, established: EstablishedSession, now: u64) -> Result<()> {
        self.transition(SessionState::Authenticated)?;
        self.device_id = Some(established.device_id.clone());
        self.connection_id = Some(established.connection_id.clone());
        self.algorithm = established.algorithm;
        self.last_seen_at = now;
        self.keys = Some(established.keys);
        Ok(())
    }

    /// Authenticated -> Active.
    pub fn activate(&mut self) -> Result<()> {
        self.transition(SessionState::Active)
    }

    /// Encrypt one outbound message into a compact envelope.
    pub fn seal(&mut self, message: &ProtocolMessage, now: u64) -> Result<String> {
        if self.state != SessionState::Active {
            return Err(GateStreamError::SessionClosed);
        }
        let (Some(keys), Some(device_id)) = (self.keys.as_ref(), self.device_id.as_deref()) else {
            return Err(GateStreamError::SessionClosed);
        };
        let direction = self.role.outbound();
        let body = message.to_json()?;
        let sequence = self.window.next_outbound(direction);
        let envelope = SecureEnvelope::seal(
            keys.key_for(direction),
            SealParams {
                algorithm: self.algorithm,
                device_id,
                direction,
                sequence,
                timestamp: now,
            },
            body.as_bytes(),
        )?;
        debug!(device_id, seq = sequence, kind = message.kind(), "frame sealed");
        Ok(envelope.to_compact_form())
    }

    /// Parse, authenticate, replay-check and decode one inbound frame.
    ///
    /// Header fields that disagree with the session (direction, device,
    /// algorithm) are malformed. The replay window only moves after the tag
    /// verified.
    pub fn open(&mut self, frame: &str, now: u64) -> Result<ProtocolMessage> {
        if self.state != SessionState::Active {
            return Err(GateStreamError::SessionClosed);
        }
        if frame.len() > self.max_frame_bytes {
            return Err(GateTrustError::MalformedEnvelope(format!(
                "frame of {} bytes exceeds {}",
                frame.len(),
                self.max_frame_bytes
            ))
            .into());
        }
        let (Some(keys), Some(device_id)) = (self.keys.as_ref(), self.device_id.as_deref()) else {
            return Err(GateStreamError::SessionClosed);
        };

        let direction = self.role.inbound();
        let envelope = SecureEnvelope::from_compact_form(frame)?;
        let header = envelope.header();
        if header.dir != direction {
            return Err(GateTrustError::MalformedEnvelope("unexpected direction".into()).into());
        }
        if header.did != device_id {
            return Err(GateTrustError::MalformedEnvelope("device id mismatch".into()).into());
        }
        if header.alg != self.algorithm.wire_name() {
            return Err(GateTrustError::MalformedEnvelope(format!("algorithm {} not negotiated", header.alg)).into());
        }

        let plaintext = envelope.open(keys.key_for(direction))?;
        self.guard
            .validate(direction, header.ts, header.seq, &mut self.window, now)?;
        self.last_seen_at = now;
        debug!(device_id, seq = header.seq, "frame opened");
        ProtocolMessage::from_slice(&plaintext)
    }

    /// Move to Closed and drop (zeroize) the keys.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.keys = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatetrust::crypto::kdf::derive_keys_from_bytes;
    use serde_json::json;

    const NOW: u64 = 1_700_000_000_000;

    fn established(alg: Algorithm) -> EstablishedSession {
        EstablishedSession {
            connection_id: "conn-1".into(),
            device_id: "dev-1".into(),
            algorithm: alg,
            keys: derive_keys_from_bytes(&[1u8; 32], b"salt", b"ctx").unwrap(),
            peer_identity: [0u8; 32],
            newly_registered: false,
        }
    }

    fn active_pair(alg: Algorithm) -> (Session, Session) {
        let mut platform = Session::new(Role::Platform, ReplayGuard::default(), 1 << 20);
        let mut agent = Session::new(Role::Agent, ReplayGuard::default(), 1 << 20);
        for s in [&mut platform, &mut agent] {
            s.begin_handshake().unwrap();
            s.establish(established(alg), NOW).unwrap();
            s.activate().unwrap();
        }
        (platform, agent)
    }

    #[test]
    fn state_machine_rejects_skips() {
        let mut s = Session::new(Role::Platform, ReplayGuard::default(), 1024);
        assert!(matches!(s.activate(), Err(GateStreamError::InvalidStateTransition { .. })));
        s.begin_handshake().unwrap();
        assert!(s.begin_handshake().is_err());
        s.close();
        assert_eq!(s.state(), SessionState::Closed);
        assert!(s.begin_handshake().is_err());
    }

    #[test]
    fn agent_to_platform_and_back() {
        let (mut platform, mut agent) = active_pair(Algorithm::Aes256Gcm);
        let req = ProtocolMessage::request("ping", json!({}));
        let frame = agent.seal(&req, NOW).unwrap();
        assert_eq!(platform.open(&frame, NOW).unwrap(), req);

        let res = ProtocolMessage::success("x", json!({"ok": true}));
        let frame = platform.seal(&res, NOW).unwrap();
        assert_eq!(agent.open(&frame, NOW).unwrap(), res);
        assert_eq!(agent.last_outbound_sequence(), 1);
        assert_eq!(agent.last_inbound_sequence(), 1);
    }

    #[test]
    fn own_frame_reflected_back_is_rejected() {
        let (mut platform, _) = active_pair(Algorithm::Aes256Gcm);
        let frame = platform.seal(&ProtocolMessage::event("e", json!(null), 1), NOW).unwrap();
        let err = platform.open(&frame, NOW).unwrap_err();
        assert!(err.is_fatal_to_session());
    }

    #[test]
    fn replayed_frame_is_rejected() {
        let (mut platform, mut agent) = active_pair(Algorithm::ChaCha20Poly1305);
        let frame = agent.seal(&ProtocolMessage::event("e", json!(1), 1), NOW).unwrap();
        platform.open(&frame, NOW).unwrap();
        let err = platform.open(&frame, NOW).unwrap_err();
        assert!(matches!(err, GateStreamError::Trust(GateTrustError::ReplayDetected { .. })));
    }

    #[test]
    fn oversized_frame_is_malformed() {
        let mut platform = Session::new(Role::Platform, ReplayGuard::default(), 16);
        platform.begin_handshake().unwrap();
        platform.establish(established(Algorithm::Aes256Gcm), NOW).unwrap();
        platform.activate().unwrap();
        let err = platform.open(&"A".repeat(17), NOW).unwrap_err();
        assert!(matches!(err, GateStreamError::Trust(GateTrustError::MalformedEnvelope(_))));
    }

    #[test]
    fn closed_session_cannot_seal() {
        let (mut platform, _) = active_pair(Algorithm::Aes256Gcm);
        platform.close();
        assert!(matches!(
            platform.seal(&ProtocolMessage::event("e", json!(null), 1), NOW),
            Err(GateStreamError::SessionClosed)
        ));
    }
}
