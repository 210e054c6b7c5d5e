//! The platform-side service: ledger, live sessions and the operations the
//! rest of the platform calls.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::info;

use gatetrust::ledger::IssuedToken;
use gatetrust::{now_millis, AgentRegistration, IdentityKeyPair, RegistrationLedger};

use crate::config::GatewayConfig;
use crate::dispatcher::{serve_connection, InboundEvent, PlatformContext, RequestHandler};
use crate::error::{GateStreamError, Result};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::transport::Transport;

pub struct Gateway {
    ctx: Arc<PlatformContext>,
}

impl Gateway {
    /// Build a gateway. The session registry is hooked into the ledger so that
    /// `block` and `delete` close live sessions synchronously.
    pub fn new(config: GatewayConfig, identity: Arc<IdentityKeyPair>, handler: Arc<dyn RequestHandler>) -> Result<Self> {
        config.validate()?;
        let ledger = Arc::new(RegistrationLedger::new(config.token_ttl_ms(), config.pairing_ttl_ms()));
        let registry = Arc::new(SessionRegistry::new());
        ledger.add_revocation_hook(registry.clone());
        let (events, _) = broadcast::channel(config.event_buffer);
        info!(fingerprint = %identity.fingerprint(), "gateway identity loaded");
        Ok(Self {
            ctx: Arc::new(PlatformContext {
                identity,
                ledger,
                registry,
                handler,
                events,
                config,
            }),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.ctx.config
    }

    pub fn ledger(&self) -> &Arc<RegistrationLedger> {
        &self.ctx.ledger
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.ctx.registry
    }

    /// Fingerprint agents pin.
    pub fn platform_fingerprint(&self) -> String {
        self.ctx.identity.fingerprint()
    }

    /// Run one connection to completion: handshake, Active phase, close.
    pub async fn accept<T>(&self, transport: T) -> Result<()>
    where
        T: Transport + 'static,
    {
        serve_connection(transport, self.ctx.clone()).await
    }

    pub fn session(&self, device_id: &str) -> Result<Arc<SessionHandle>> {
        self.ctx
            .registry
            .get(device_id)
            .ok_or_else(|| GateStreamError::NotConnected(device_id.to_string()))
    }

    /// Call `method` on the agent and wait for its result.
    pub async fn invoke(&self, device_id: &str, method: &str, params: Value) -> Result<Value> {
        self.session(device_id)?.request(method, params).await
    }

    /// Push an event to the agent; returns the event sequence.
    pub fn emit_event(&self, device_id: &str, name: &str, payload: Value) -> Result<u64> {
        self.session(device_id)?.emit_event(name, payload)
    }

    /// Events from every agent, in per-session arrival order.
    ///
    /// Each receiver holds at most `event_buffer` undelivered events. A
    /// receiver that falls further behind loses the oldest ones and its next
    /// `recv` returns `RecvError::Lagged(n)` with the count skipped, then
    /// resumes from the oldest event still retained.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.ctx.events.subscribe()
    }

    pub fn connected_devices(&self) -> Vec<String> {
        self.ctx.registry.connected_devices()
    }

    /// Drop the live session without touching trust state.
    pub fn disconnect(&self, device_id: &str) -> bool {
        match self.ctx.registry.remove(device_id) {
            Some(handle) => {
                handle.close();
                info!(device_id, "disconnected");
                true
            }
            None => false,
        }
    }

    pub fn issue_token(&self, user_id: &str) -> IssuedToken {
        self.ctx.ledger.issue_token(user_id, now_millis())
    }

    pub fn issue_pairing_code(&self, user_id: &str) -> Result<IssuedToken> {
        Ok(self.ctx.ledger.issue_pairing_code(user_id, now_millis())?)
    }

    /// Block the device and terminate its live session.
    pub fn block(&self, device_id: &str, reason: &str) -> Result<()> {
        Ok(self.ctx.ledger.block(device_id, reason, now_millis())?)
    }

    pub fn unblock(&self, device_id: &str) -> Result<()> {
        Ok(self.ctx.ledger.unblock(device_id)?)
    }

    /// Remove the registration and terminate its live session.
    pub fn delete(&self, device_id: &str) -> Result<AgentRegistration> {
        Ok(self.ctx.ledger.delete(device_id)?)
    }

    pub fn purge_expired(&self) -> usize {
        self.ctx.ledger.purge_expired(now_millis())
    }

    /// Close every live session.
    pub fn shutdown(&self) {
        self.ctx.registry.close_all();
    }
}
