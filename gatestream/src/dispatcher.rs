//! Protocol dispatcher: drives the handshake on a fresh transport, then pumps
//! encrypted frames between the transport and the session handle.
//!
//! One task per connection. Inbound frames are opened and routed inside that
//! task in arrival order; request handlers run on their own tasks and reply
//! through the outbound queue, so a slow handler never stalls the reader.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use gatetrust::handshake::{HandshakeAuth, Responder, AUTH_METHOD, CHALLENGE_EVENT, REJECTION_CODE};
use gatetrust::{now_millis, IdentityKeyPair, RegistrationLedger, ReplayGuard};

use crate::config::GatewayConfig;
use crate::error::{GateStreamError, Result};
use crate::message::{ErrorBody, ProtocolMessage, RemoteResponse, PING_METHOD, UNKNOWN_METHOD};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::session::{Role, Session};
use crate::transport::Transport;

/// Default capacity of the inbound event broadcast.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// An event received from the peer, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub device_id: String,
    pub name: String,
    pub payload: Value,
    pub seq: u64,
}

/// Business logic behind remote method calls.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, device_id: &str, method: &str, params: Value) -> std::result::Result<Value, ErrorBody>;
}

/// Handler that knows no methods.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnknownMethodHandler;

#[async_trait]
impl RequestHandler for UnknownMethodHandler {
    async fn handle(&self, _device_id: &str, method: &str, _params: Value) -> std::result::Result<Value, ErrorBody> {
        Err(unknown_method(method))
    }
}

pub fn unknown_method(method: &str) -> ErrorBody {
    ErrorBody {
        code: UNKNOWN_METHOD.into(),
        message: format!("unknown method: {method}"),
    }
}

/// Shared state every platform-side connection task needs.
pub(crate) struct PlatformContext {
    pub identity: Arc<IdentityKeyPair>,
    pub ledger: Arc<RegistrationLedger>,
    pub registry: Arc<SessionRegistry>,
    pub handler: Arc<dyn RequestHandler>,
    pub events: broadcast::Sender<InboundEvent>,
    pub config: GatewayConfig,
}

/// What the Active loop needs besides the session itself.
pub(crate) struct ActiveContext {
    pub handler: Arc<dyn RequestHandler>,
    pub events: broadcast::Sender<InboundEvent>,
    /// Present on the platform side only.
    pub registry: Option<Arc<SessionRegistry>>,
}

/// Wait for one text frame under the handshake timeout.
pub(crate) async fn recv_handshake_frame<T: Transport>(transport: &mut T, timeout: Duration) -> Result<String> {
    match tokio::time::timeout(timeout, transport.recv()).await {
        Ok(Ok(Some(frame))) => Ok(frame),
        Ok(Ok(None)) => Err(GateStreamError::SessionClosed),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(GateStreamError::HandshakeTimeout(timeout.as_millis() as u64)),
    }
}

fn parse_auth(frame: &str) -> Result<(String, HandshakeAuth)> {
    match ProtocolMessage::from_json(frame)? {
        ProtocolMessage::Request { id, method, params } if method == AUTH_METHOD => {
            let auth: HandshakeAuth = serde_json::from_value(params)?;
            Ok((id, auth))
        }
        other => Err(GateStreamError::Protocol(format!("expected {AUTH_METHOD}, got {}", other.kind()))),
    }
}

/// Platform side of one connection, from challenge to close.
pub(crate) async fn serve_connection<T>(mut transport: T, ctx: Arc<PlatformContext>) -> Result<()>
where
    T: Transport + 'static,
{
    let config = &ctx.config;
    let mut session = Session::new(
        Role::Platform,
        ReplayGuard::new(config.replay_tolerance_ms),
        config.max_frame_bytes,
    );
    session.begin_handshake()?;

    let mut responder = Responder::new(ctx.identity.clone());
    let challenge = responder.create_challenge(now_millis())?;
    let challenge = ProtocolMessage::event(CHALLENGE_EVENT, serde_json::to_value(&challenge)?, 0);
    transport.send(challenge.to_json()?).await?;

    let frame = match recv_handshake_frame(&mut transport, config.handshake_timeout()).await {
        Ok(frame) => frame,
        Err(e) => {
            if matches!(e, GateStreamError::HandshakeTimeout(_)) {
                warn!(timeout_ms = config.handshake_timeout_ms, "handshake timed out");
            }
            session.close();
            let _ = transport.close().await;
            return Err(e);
        }
    };

    let outcome = parse_auth(&frame).and_then(|(request_id, auth)| {
        responder
            .process_auth(&auth, &ctx.ledger, now_millis())
            .map(|accepted| (request_id, accepted))
            .map_err(|e| {
                warn!(device_id = %auth.device_id, error = %e, "handshake rejected");
                GateStreamError::from(e)
            })
    });

    let (request_id, (accept, established)) = match outcome {
        Ok(v) => v,
        Err(e) => {
            // One generic rejection, in the clear, then close.
            let id = ProtocolMessage::from_json(&frame)
                .ok()
                .and_then(|m| match m {
                    ProtocolMessage::Request { id, .. } => Some(id),
                    _ => None,
                })
                .unwrap_or_default();
            let rejection = ProtocolMessage::failure(id, REJECTION_CODE, "authentication rejected");
            if let Ok(text) = rejection.to_json() {
                let _ = transport.send(text).await;
            }
            session.close();
            let _ = transport.close().await;
            debug!(error = %e, "handshake failed");
            return Err(GateStreamError::HandshakeRejected(REJECTION_CODE.into()));
        }
    };

    let now = now_millis();
    let device_id = established.device_id.clone();
    let connection_id = established.connection_id.clone();
    let newly_registered = established.newly_registered;
    session.establish(established, now)?;

    // Registered before the accept goes out, so the session is reachable as
    // soon as the agent considers itself connected.
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = Arc::new(SessionHandle::new(
        device_id.clone(),
        connection_id.clone(),
        tx,
        config.request_timeout(),
        now,
    ));
    ctx.registry.insert(handle.clone());
    // A block that landed between the ledger check and the insert above.
    if ctx.ledger.is_blocked(&device_id) {
        ctx.registry.remove_if_current(&device_id, &connection_id);
        handle.close();
    }

    let accept = ProtocolMessage::success(request_id, serde_json::to_value(&accept)?);
    let sent = match accept.to_json() {
        Ok(text) => transport.send(text).await,
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        ctx.registry.remove_if_current(&device_id, &connection_id);
        handle.close();
        session.close();
        return Err(e);
    }
    session.activate()?;
    info!(device_id = %device_id, connection_id = %connection_id, alg = %session.algorithm(), newly_registered, "session active");

    run_active(
        transport,
        session,
        handle,
        rx,
        ActiveContext {
            handler: ctx.handler.clone(),
            events: ctx.events.clone(),
            registry: Some(ctx.registry.clone()),
        },
    )
    .await
}

/// The Active phase, shared by both roles. Returns when the transport ends,
/// the handle is closed, or a frame fails integrity checks.
pub(crate) async fn run_active<T>(
    mut transport: T,
    mut session: Session,
    handle: Arc<SessionHandle>,
    mut outbound: mpsc::UnboundedReceiver<ProtocolMessage>,
    ctx: ActiveContext,
) -> Result<()>
where
    T: Transport,
{
    let device_id = handle.device_id().to_string();

    let outcome = loop {
        tokio::select! {
            biased;

            _ = handle.closed() => break Ok(()),

            Some(message) = outbound.recv() => {
                match session.seal(&message, now_millis()) {
                    Ok(frame) => {
                        handle.set_last_outbound_sequence(session.last_outbound_sequence());
                        if let Err(e) = transport.send(frame).await {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(e),
                }
            }

            inbound = transport.recv() => match inbound {
                Ok(Some(frame)) => match session.open(&frame, now_millis()) {
                    Ok(message) => {
                        handle.set_last_seen(session.last_seen_at());
                        route(message, &handle, &ctx);
                    }
                    Err(e) if e.is_fatal_to_session() => {
                        warn!(device_id = %device_id, error = %e, "rejecting frame, closing session");
                        break Err(e);
                    }
                    Err(e) => warn!(device_id = %device_id, error = %e, "dropping frame"),
                },
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            },
        }
    };

    session.close();
    handle.close();
    let _ = transport.close().await;
    if let Some(registry) = &ctx.registry {
        registry.remove_if_current(&device_id, handle.connection_id());
    }
    info!(device_id = %device_id, connection_id = handle.connection_id(), "session closed");
    outcome
}

fn route(message: ProtocolMessage, handle: &Arc<SessionHandle>, ctx: &ActiveContext) {
    match message {
        ProtocolMessage::Request { id, method, params } => {
            debug!(device_id = handle.device_id(), id = %id, method = %method, "request");
            if method == PING_METHOD {
                if handle.send(ProtocolMessage::success(id, json!({ "pong": now_millis() }))).is_err() {
                    debug!("session closed before ping reply");
                }
                return;
            }
            let handler = ctx.handler.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                let reply = match handler.handle(handle.device_id(), &method, params).await {
                    Ok(result) => ProtocolMessage::success(id, result),
                    Err(error) => ProtocolMessage::failure(id, error.code, error.message),
                };
                if handle.send(reply).is_err() {
                    debug!(method = %method, "session closed before reply");
                }
            });
        }
        ProtocolMessage::Response {
            id,
            success,
            result,
            error,
        } => {
            let response = RemoteResponse { success, result, error };
            if let Err(e) = handle.pending().resolve(&id, response) {
                warn!(device_id = handle.device_id(), error = %e, "dropping response");
            }
        }
        ProtocolMessage::Event { name, payload, seq } => {
            debug!(device_id = handle.device_id(), event = %name, seq, "event");
            // No subscribers is fine. Lagging subscribers see `Lagged` on
            // their next recv.
            let _ = ctx.events.send(InboundEvent {
                device_id: handle.device_id().to_string(),
                name,
                payload,
                seq,
            });
        }
    }
}
