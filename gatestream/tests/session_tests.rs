// End-to-end tests of gateway and agent over the in-process transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use gatestream::dispatcher::unknown_method;
use gatestream::message::UNKNOWN_METHOD;
use gatestream::{
    AgentConnector, AgentHandle, ChannelTransport, ErrorBody, GateStreamError, Gateway, GatewayConfig, ProtocolMessage,
    RequestHandler, Role, Session, Transport,
};
use gatetrust::handshake::{HandshakeAccept, HandshakeChallenge, Initiator, Registration, AUTH_METHOD, REJECTION_CODE};
use gatetrust::{now_millis, GateTrustError, IdentityKeyPair, RegistrationStatus, ReplayGuard};

struct Echo;

#[async_trait]
impl RequestHandler for Echo {
    async fn handle(&self, _device_id: &str, method: &str, params: Value) -> Result<Value, ErrorBody> {
        match method {
            "echo" => Ok(params),
            "slow" => {
                let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(60_000);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!("late"))
            }
            other => Err(unknown_method(other)),
        }
    }
}

fn gateway(config: GatewayConfig) -> Arc<Gateway> {
    Arc::new(Gateway::new(config, Arc::new(IdentityKeyPair::generate()), Arc::new(Echo)).unwrap())
}

fn registration(token: String) -> Registration {
    Registration {
        token,
        device_name: Some("laptop".into()),
        platform: Some("linux".into()),
    }
}

/// Start the platform side of a fresh channel and return the agent's end.
fn open_channel(gateway: &Arc<Gateway>) -> (ChannelTransport, JoinHandle<gatestream::Result<()>>) {
    let (platform_end, agent_end) = ChannelTransport::pair();
    let gw = gateway.clone();
    let server = tokio::spawn(async move { gw.accept(platform_end).await });
    (agent_end, server)
}

async fn pair(gateway: &Arc<Gateway>, device_id: &str, identity: &IdentityKeyPair) -> (AgentHandle, JoinHandle<gatestream::Result<()>>) {
    let token = gateway.issue_token("alice");
    let (transport, server) = open_channel(gateway);
    let agent = AgentConnector::new(IdentityKeyPair::from_seed(&identity.seed()), device_id)
        .with_registration(registration(token.token))
        .with_pinned_platform(gateway.platform_fingerprint())
        .with_handler(Arc::new(Echo))
        .connect(transport)
        .await
        .unwrap();
    (agent, server)
}

/// Hand-driven agent handshake, for tests that need raw frame access.
async fn raw_agent(transport: &mut ChannelTransport, device_id: &str, token: String) -> Session {
    let mut initiator = Initiator::new(IdentityKeyPair::generate(), device_id).with_registration(registration(token));

    let frame = transport.recv().await.unwrap().unwrap();
    let ProtocolMessage::Event { payload, .. } = ProtocolMessage::from_json(&frame).unwrap() else {
        panic!("expected challenge event");
    };
    let challenge: HandshakeChallenge = serde_json::from_value(payload).unwrap();
    let auth = initiator.process_challenge(&challenge, now_millis()).unwrap();
    let request = ProtocolMessage::request(AUTH_METHOD, serde_json::to_value(&auth).unwrap());
    transport.send(request.to_json().unwrap()).await.unwrap();

    let frame = transport.recv().await.unwrap().unwrap();
    let ProtocolMessage::Response { result: Some(result), .. } = ProtocolMessage::from_json(&frame).unwrap() else {
        panic!("expected accept");
    };
    let accept: HandshakeAccept = serde_json::from_value(result).unwrap();
    let established = initiator.process_accept(&accept).unwrap();

    let mut session = Session::new(Role::Agent, ReplayGuard::default(), 1 << 20);
    session.begin_handshake().unwrap();
    session.establish(established, now_millis()).unwrap();
    session.activate().unwrap();
    session
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

// ── Happy path ───────────────────────────────────────────────────────────

#[tokio::test]
async fn issue_token_pair_and_ping() {
    let gw = gateway(GatewayConfig::default());
    let identity = IdentityKeyPair::generate();
    let (agent, _server) = pair(&gw, "dev-1", &identity).await;

    let reply = agent.request("ping", json!({})).await.unwrap();
    assert!(reply["pong"].as_u64().unwrap() > 0);
    assert_eq!(agent.pending_requests(), 0);

    let record = gw.ledger().get("dev-1").unwrap();
    assert_eq!(record.status, RegistrationStatus::Registered);
    assert_eq!(gw.connected_devices(), vec!["dev-1".to_string()]);
    assert_eq!(agent.platform_fingerprint(), gw.platform_fingerprint());
}

#[tokio::test]
async fn raw_request_r1_gets_matching_response() {
    let gw = gateway(GatewayConfig::default());
    let (mut transport, _server) = open_channel(&gw);
    let mut session = raw_agent(&mut transport, "dev-raw", gw.issue_token("alice").token).await;

    let ping = ProtocolMessage::Request {
        id: "r1".into(),
        method: "ping".into(),
        params: json!({}),
    };
    transport.send(session.seal(&ping, now_millis()).unwrap()).await.unwrap();
    let reply = session.open(&transport.recv().await.unwrap().unwrap(), now_millis()).unwrap();
    assert!(matches!(reply, ProtocolMessage::Response { id, success: true, .. } if id == "r1"));
}

#[tokio::test]
async fn platform_invokes_agent() {
    let gw = gateway(GatewayConfig::default());
    let (_agent, _server) = pair(&gw, "dev-1", &IdentityKeyPair::generate()).await;

    let out = gw.invoke("dev-1", "echo", json!({"cmd": "ls"})).await.unwrap();
    assert_eq!(out, json!({"cmd": "ls"}));

    let err = gw.invoke("dev-1", "shell.format_disk", json!({})).await.unwrap_err();
    assert!(matches!(err, GateStreamError::Remote { code, .. } if code == UNKNOWN_METHOD));

    assert!(matches!(
        gw.invoke("dev-404", "echo", json!(null)).await,
        Err(GateStreamError::NotConnected(_))
    ));
}

#[tokio::test]
async fn events_arrive_in_order_both_ways() {
    let gw = gateway(GatewayConfig::default());
    let (agent, _server) = pair(&gw, "dev-1", &IdentityKeyPair::generate()).await;

    let mut platform_events = gw.subscribe();
    for n in 1..=5 {
        assert_eq!(agent.emit_event("screen.frame", json!({ "n": n })).unwrap(), n);
    }
    for n in 1..=5u64 {
        let ev = platform_events.recv().await.unwrap();
        assert_eq!(ev.device_id, "dev-1");
        assert_eq!(ev.name, "screen.frame");
        assert_eq!(ev.seq, n);
        assert_eq!(ev.payload["n"], json!(n));
    }

    let mut agent_events = agent.subscribe();
    gw.emit_event("dev-1", "flow.started", json!({"flow": "f1"})).unwrap();
    let ev = agent_events.recv().await.unwrap();
    assert_eq!(ev.name, "flow.started");
    assert_eq!(ev.seq, 1);
}

#[tokio::test]
async fn slow_subscriber_is_told_how_many_events_it_missed() {
    let gw = gateway(GatewayConfig {
        event_buffer: 2,
        ..GatewayConfig::default()
    });
    let (agent, _server) = pair(&gw, "dev-1", &IdentityKeyPair::generate()).await;

    let mut slow = gw.subscribe();
    for n in 1..=5 {
        agent.emit_event("tick", json!({ "n": n })).unwrap();
    }
    // Frames are routed in order, so the echo reply trails every event.
    assert_eq!(agent.request("echo", json!("sync")).await.unwrap(), json!("sync"));

    assert!(matches!(
        slow.recv().await,
        Err(tokio::sync::broadcast::error::RecvError::Lagged(3))
    ));
    assert_eq!(slow.recv().await.unwrap().seq, 4);
    assert_eq!(slow.recv().await.unwrap().seq, 5);
}

// ── Timeouts ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn request_timeout_fails_only_that_request() {
    let gw = gateway(GatewayConfig {
        request_timeout_ms: 50,
        ..GatewayConfig::default()
    });
    let (agent, _server) = pair(&gw, "dev-1", &IdentityKeyPair::generate()).await;

    let err = gw.invoke("dev-1", "slow", json!({"ms": 200})).await.unwrap_err();
    assert!(matches!(err, GateStreamError::Timeout { timeout_ms: 50, .. }));
    assert!(gw.session("dev-1").unwrap().pending().is_empty());

    // The late response is dropped as unmatched and the session survives it.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!agent.is_closed());
    assert_eq!(gw.invoke("dev-1", "echo", json!(7)).await.unwrap(), json!(7));
}

#[tokio::test]
async fn silent_agent_hits_handshake_timeout() {
    let gw = gateway(GatewayConfig {
        handshake_timeout_ms: 50,
        ..GatewayConfig::default()
    });
    let (mut transport, server) = open_channel(&gw);
    // Read the challenge, never answer.
    assert!(transport.recv().await.unwrap().is_some());
    assert!(matches!(server.await.unwrap(), Err(GateStreamError::HandshakeTimeout(50))));
    assert_eq!(transport.recv().await.unwrap(), None);
    assert!(gw.connected_devices().is_empty());
}

// ── Revocation ───────────────────────────────────────────────────────────

#[tokio::test]
async fn block_closes_session_and_fails_pending_immediately() {
    let gw = gateway(GatewayConfig::default());
    let identity = IdentityKeyPair::generate();
    let (agent, _server) = pair(&gw, "dev-1", &identity).await;

    let handle = gw.session("dev-1").unwrap();
    let call = {
        let gw = gw.clone();
        tokio::spawn(async move { gw.invoke("dev-1", "slow", json!({})).await })
    };
    eventually(|| handle.pending().len() == 1).await;

    gw.block("dev-1", "device reported stolen").unwrap();
    assert!(handle.is_closed());
    assert!(handle.pending().is_empty());
    assert!(gw.connected_devices().is_empty());
    assert!(matches!(call.await.unwrap(), Err(GateStreamError::SessionClosed)));

    tokio::time::timeout(Duration::from_secs(5), agent.closed()).await.unwrap();

    // The blocked identity cannot come back.
    let (transport, _server) = open_channel(&gw);
    let err = AgentConnector::new(IdentityKeyPair::from_seed(&identity.seed()), "dev-1")
        .connect(transport)
        .await
        .unwrap_err();
    assert!(matches!(err, GateStreamError::HandshakeRejected(code) if code == REJECTION_CODE));

    gw.unblock("dev-1").unwrap();
    let (transport, _server) = open_channel(&gw);
    AgentConnector::new(IdentityKeyPair::from_seed(&identity.seed()), "dev-1")
        .connect(transport)
        .await
        .unwrap();
}

#[tokio::test]
async fn reconnect_replaces_previous_session() {
    let gw = gateway(GatewayConfig::default());
    let identity = IdentityKeyPair::generate();
    let (first, _server) = pair(&gw, "dev-1", &identity).await;

    let (transport, _server2) = open_channel(&gw);
    let second = AgentConnector::new(IdentityKeyPair::from_seed(&identity.seed()), "dev-1")
        .with_pinned_platform(gw.platform_fingerprint())
        .connect(transport)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), first.closed()).await.unwrap();
    assert_ne!(first.connection_id(), second.connection_id());
    assert_eq!(gw.connected_devices(), vec!["dev-1".to_string()]);
    assert_eq!(gw.session("dev-1").unwrap().connection_id(), second.connection_id());
    assert!(second.request("ping", json!({})).await.is_ok());
}

#[tokio::test]
async fn disconnect_keeps_registration() {
    let gw = gateway(GatewayConfig::default());
    let (agent, _server) = pair(&gw, "dev-1", &IdentityKeyPair::generate()).await;
    assert!(gw.disconnect("dev-1"));
    tokio::time::timeout(Duration::from_secs(5), agent.closed()).await.unwrap();
    assert_eq!(gw.ledger().get("dev-1").unwrap().status, RegistrationStatus::Registered);
    assert!(!gw.disconnect("dev-1"));
}

// ── Rejections ───────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_device_is_generically_rejected() {
    let gw = gateway(GatewayConfig::default());
    let (transport, server) = open_channel(&gw);
    let err = AgentConnector::new(IdentityKeyPair::generate(), "stranger")
        .connect(transport)
        .await
        .unwrap_err();
    assert!(matches!(err, GateStreamError::HandshakeRejected(code) if code == REJECTION_CODE));
    assert!(matches!(server.await.unwrap(), Err(GateStreamError::HandshakeRejected(_))));
}

#[tokio::test]
async fn token_is_single_use() {
    let gw = gateway(GatewayConfig::default());
    let token = gw.issue_token("alice").token;

    let (transport, _s1) = open_channel(&gw);
    AgentConnector::new(IdentityKeyPair::generate(), "dev-a")
        .with_registration(registration(token.clone()))
        .connect(transport)
        .await
        .unwrap();

    let (transport, _s2) = open_channel(&gw);
    let err = AgentConnector::new(IdentityKeyPair::generate(), "dev-b")
        .with_registration(registration(token))
        .connect(transport)
        .await
        .unwrap_err();
    assert!(matches!(err, GateStreamError::HandshakeRejected(_)));
    assert!(gw.ledger().get("dev-b").is_none());
}

#[tokio::test]
async fn pinned_fingerprint_mismatch_aborts_agent() {
    let gw = gateway(GatewayConfig::default());
    let (transport, _server) = open_channel(&gw);
    let err = AgentConnector::new(IdentityKeyPair::generate(), "dev-1")
        .with_registration(registration(gw.issue_token("alice").token))
        .with_pinned_platform("00".repeat(32))
        .connect(transport)
        .await
        .unwrap_err();
    assert!(matches!(err, GateStreamError::Trust(_)));
    assert!(gw.ledger().get("dev-1").is_none());
}

// ── Fail-closed on integrity errors ──────────────────────────────────────

#[tokio::test]
async fn replayed_frame_closes_session() {
    let gw = gateway(GatewayConfig::default());
    let (mut transport, server) = open_channel(&gw);
    let mut session = raw_agent(&mut transport, "dev-raw", gw.issue_token("alice").token).await;

    let frame = session
        .seal(&ProtocolMessage::request("ping", json!({})), now_millis())
        .unwrap();
    transport.send(frame.clone()).await.unwrap();
    assert!(transport.recv().await.unwrap().is_some());

    transport.send(frame).await.unwrap();
    let outcome = server.await.unwrap();
    assert!(matches!(
        outcome,
        Err(GateStreamError::Trust(GateTrustError::ReplayDetected { .. }))
    ));
    assert_eq!(transport.recv().await.unwrap(), None);
    assert!(gw.connected_devices().is_empty());
}

#[tokio::test]
async fn tampered_frame_closes_session() {
    let gw = gateway(GatewayConfig::default());
    let (mut transport, server) = open_channel(&gw);
    let mut session = raw_agent(&mut transport, "dev-raw", gw.issue_token("alice").token).await;

    let frame = session
        .seal(&ProtocolMessage::event("x", json!({"a": 1}), 1), now_millis())
        .unwrap();
    let mut parts: Vec<String> = frame.split('.').map(str::to_string).collect();
    let flipped = if parts[1].starts_with('A') { "B" } else { "A" };
    parts[1].replace_range(0..1, flipped);
    transport.send(parts.join(".")).await.unwrap();

    assert!(matches!(
        server.await.unwrap(),
        Err(GateStreamError::Trust(GateTrustError::AuthenticationFailed))
    ));
}

#[tokio::test]
async fn stale_frame_closes_session() {
    let gw = gateway(GatewayConfig {
        replay_tolerance_ms: 1_000,
        ..GatewayConfig::default()
    });
    let (mut transport, server) = open_channel(&gw);
    let mut session = raw_agent(&mut transport, "dev-raw", gw.issue_token("alice").token).await;

    let frame = session
        .seal(&ProtocolMessage::request("ping", json!({})), now_millis() - 60_000)
        .unwrap();
    transport.send(frame).await.unwrap();
    assert!(matches!(
        server.await.unwrap(),
        Err(GateStreamError::Trust(GateTrustError::StaleTimestamp { .. }))
    ));
}

#[tokio::test]
async fn garbage_frame_closes_session() {
    let gw = gateway(GatewayConfig::default());
    let (mut transport, server) = open_channel(&gw);
    let _session = raw_agent(&mut transport, "dev-raw", gw.issue_token("alice").token).await;

    transport.send("not-an-envelope".into()).await.unwrap();
    assert!(matches!(
        server.await.unwrap(),
        Err(GateStreamError::Trust(GateTrustError::MalformedEnvelope(_)))
    ));
}
