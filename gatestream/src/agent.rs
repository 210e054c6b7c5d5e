//! Agent side: initiator handshake over any transport, then the shared Active
//! loop in the agent role.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::info;

use gatetrust::handshake::{HandshakeAccept, HandshakeChallenge, Initiator, Registration, AUTH_METHOD, CHALLENGE_EVENT, REJECTION_CODE};
use gatetrust::replay::DEFAULT_TOLERANCE_MS;
use gatetrust::{now_millis, Algorithm, IdentityKeyPair, ReplayGuard};

use crate::dispatcher::{recv_handshake_frame, run_active, ActiveContext, InboundEvent, RequestHandler, UnknownMethodHandler, EVENT_CHANNEL_CAPACITY};
use crate::error::{GateStreamError, Result};
use crate::message::ProtocolMessage;
use crate::registry::SessionHandle;
use crate::session::{Role, Session};
use crate::transport::Transport;

/// Builder for agent connections. Reusable: every `connect` runs a fresh
/// handshake with fresh ephemeral keys.
pub struct AgentConnector {
    identity: IdentityKeyPair,
    device_id: String,
    pinned_platform: Option<String>,
    registration: Option<Registration>,
    algorithms: Option<Vec<Algorithm>>,
    handler: Arc<dyn RequestHandler>,
    handshake_timeout: Duration,
    request_timeout: Duration,
    replay_tolerance_ms: u64,
    max_frame_bytes: usize,
    event_buffer: usize,
}

impl AgentConnector {
    pub fn new(identity: IdentityKeyPair, device_id: impl Into<String>) -> Self {
        Self {
            identity,
            device_id: device_id.into(),
            pinned_platform: None,
            registration: None,
            algorithms: None,
            handler: Arc::new(UnknownMethodHandler),
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            replay_tolerance_ms: DEFAULT_TOLERANCE_MS,
            max_frame_bytes: 1024 * 1024,
            event_buffer: EVENT_CHANNEL_CAPACITY,
        }
    }

    /// Require the platform identity to have this fingerprint.
    pub fn with_pinned_platform(mut self, fingerprint: impl Into<String>) -> Self {
        self.pinned_platform = Some(fingerprint.into());
        self
    }

    /// Redeem a registration token or pairing code in the next handshake.
    pub fn with_registration(mut self, registration: Registration) -> Self {
        self.registration = Some(registration);
        self
    }

    pub fn with_algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.algorithms = Some(algorithms);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_replay_tolerance(mut self, tolerance_ms: u64) -> Self {
        self.replay_tolerance_ms = tolerance_ms;
        self
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    /// Per-subscriber event backlog; see [`AgentHandle::subscribe`].
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Forget the registration once it has been redeemed.
    pub fn clear_registration(&mut self) {
        self.registration = None;
    }

    /// Handshake over `transport` and start the session task.
    pub async fn connect<T>(&self, mut transport: T) -> Result<AgentHandle>
    where
        T: Transport + 'static,
    {
        let mut session = Session::new(
            Role::Agent,
            ReplayGuard::new(self.replay_tolerance_ms),
            self.max_frame_bytes,
        );
        session.begin_handshake()?;

        let accepted = match self.handshake(&mut transport).await {
            Ok(v) => v,
            Err(e) => {
                session.close();
                let _ = transport.close().await;
                return Err(e);
            }
        };

        let now = now_millis();
        let (platform_fingerprint, established) = accepted;
        let connection_id = established.connection_id.clone();
        session.establish(established, now)?;
        session.activate()?;
        info!(device_id = %self.device_id, connection_id = %connection_id, alg = %session.algorithm(), "connected to platform");

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(SessionHandle::new(
            self.device_id.clone(),
            connection_id,
            tx,
            self.request_timeout,
            now,
        ));
        let (events, _) = broadcast::channel(self.event_buffer);
        let task = tokio::spawn(run_active(
            transport,
            session,
            handle.clone(),
            rx,
            ActiveContext {
                handler: self.handler.clone(),
                events: events.clone(),
                registry: None,
            },
        ));

        Ok(AgentHandle {
            handle,
            events,
            platform_fingerprint,
            task,
        })
    }

    async fn handshake<T: Transport>(
        &self,
        transport: &mut T,
    ) -> Result<(String, gatetrust::handshake::EstablishedSession)> {
        let mut initiator = Initiator::new(IdentityKeyPair::from_seed(&self.identity.seed()), self.device_id.clone())
            .with_clock_tolerance(self.replay_tolerance_ms);
        if let Some(fp) = &self.pinned_platform {
            initiator = initiator.with_pinned_platform(fp.clone());
        }
        if let Some(reg) = &self.registration {
            initiator = initiator.with_registration(reg.clone());
        }
        if let Some(algs) = &self.algorithms {
            initiator = initiator.with_algorithms(algs.clone());
        }

        let frame = recv_handshake_frame(transport, self.handshake_timeout).await?;
        let challenge: HandshakeChallenge = match ProtocolMessage::from_json(&frame)? {
            ProtocolMessage::Event { name, payload, .. } if name == CHALLENGE_EVENT => serde_json::from_value(payload)?,
            other => {
                return Err(GateStreamError::Protocol(format!(
                    "expected {CHALLENGE_EVENT}, got {}",
                    other.kind()
                )))
            }
        };

        let auth = initiator.process_challenge(&challenge, now_millis())?;
        let request = ProtocolMessage::request(AUTH_METHOD, serde_json::to_value(&auth)?);
        let ProtocolMessage::Request { id: request_id, .. } = &request else {
            return Err(GateStreamError::Protocol("request constructor returned a non-request".into()));
        };
        let request_id = request_id.clone();
        transport.send(request.to_json()?).await?;

        let frame = recv_handshake_frame(transport, self.handshake_timeout).await?;
        let accept: HandshakeAccept = match ProtocolMessage::from_json(&frame)? {
            ProtocolMessage::Response {
                id,
                success: true,
                result: Some(result),
                ..
            } if id == request_id => serde_json::from_value(result)?,
            ProtocolMessage::Response { success: false, error, .. } => {
                let code = error.map(|e| e.code).unwrap_or_else(|| REJECTION_CODE.to_string());
                return Err(GateStreamError::HandshakeRejected(code));
            }
            other => {
                return Err(GateStreamError::Protocol(format!(
                    "unexpected {} during handshake",
                    other.kind()
                )))
            }
        };

        let established = initiator.process_accept(&accept)?;
        Ok((established.peer_fingerprint(), established))
    }
}

/// A live agent session.
pub struct AgentHandle {
    handle: Arc<SessionHandle>,
    events: broadcast::Sender<InboundEvent>,
    platform_fingerprint: String,
    task: JoinHandle<Result<()>>,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("platform_fingerprint", &self.platform_fingerprint)
            .finish_non_exhaustive()
    }
}

impl AgentHandle {
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.handle.request(method, params).await
    }

    pub async fn request_with_timeout(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        self.handle.request_with_timeout(method, params, timeout).await
    }

    pub fn emit_event(&self, name: &str, payload: Value) -> Result<u64> {
        self.handle.emit_event(name, payload)
    }

    /// Events pushed by the platform from now on.
    ///
    /// Same lag rules as `Gateway::subscribe`: past the connector's event
    /// buffer the oldest events are dropped for this receiver and reported
    /// as `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.events.subscribe()
    }

    pub fn connection_id(&self) -> &str {
        self.handle.connection_id()
    }

    /// Fingerprint of the platform identity that signed the handshake.
    pub fn platform_fingerprint(&self) -> &str {
        &self.platform_fingerprint
    }

    pub fn last_outbound_sequence(&self) -> u64 {
        self.handle.last_outbound_sequence()
    }

    pub fn pending_requests(&self) -> usize {
        self.handle.pending().len()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    pub async fn closed(&self) {
        self.handle.closed().await
    }

    pub fn close(&self) {
        self.handle.close();
    }

    /// Wait for the session task to finish and return how it ended.
    pub async fn wait(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| GateStreamError::Protocol(format!("session task failed: {e}")))?
    }
}
