//! Live session registry: at most one active session per device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use gatetrust::ledger::RevocationHook;

use crate::error::{GateStreamError, Result};
use crate::message::ProtocolMessage;
use crate::pending::PendingRequests;

/// Cloneable front of a running connection task.
///
/// Outbound messages are queued to the task, which seals them in order. The
/// handle itself holds no key material.
pub struct SessionHandle {
    device_id: String,
    connection_id: String,
    outbound: mpsc::UnboundedSender<ProtocolMessage>,
    pending: Arc<PendingRequests>,
    closed: watch::Sender<bool>,
    last_seen_at: AtomicU64,
    event_seq: AtomicU64,
    last_outbound_seq: AtomicU64,
    request_timeout: Duration,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("device_id", &self.device_id)
            .field("connection_id", &self.connection_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionHandle {
    pub(crate) fn new(
        device_id: impl Into<String>,
        connection_id: impl Into<String>,
        outbound: mpsc::UnboundedSender<ProtocolMessage>,
        request_timeout: Duration,
        now: u64,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            device_id: device_id.into(),
            connection_id: connection_id.into(),
            outbound,
            pending: Arc::new(PendingRequests::new()),
            closed,
            last_seen_at: AtomicU64::new(now),
            event_seq: AtomicU64::new(0),
            last_outbound_seq: AtomicU64::new(0),
            request_timeout,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn last_seen_at(&self) -> u64 {
        self.last_seen_at.load(Ordering::Relaxed)
    }

    pub(crate) fn set_last_seen(&self, now: u64) {
        self.last_seen_at.store(now, Ordering::Relaxed);
    }

    /// Last frame sequence sent on this connection.
    pub fn last_outbound_sequence(&self) -> u64 {
        self.last_outbound_seq.load(Ordering::Relaxed)
    }

    pub(crate) fn set_last_outbound_sequence(&self, seq: u64) {
        self.last_outbound_seq.store(seq, Ordering::Relaxed);
    }

    pub(crate) fn send(&self, message: ProtocolMessage) -> Result<()> {
        if self.is_closed() {
            return Err(GateStreamError::SessionClosed);
        }
        self.outbound.send(message).map_err(|_| GateStreamError::SessionClosed)
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.request_with_timeout(method, params, self.request_timeout).await
    }

    pub async fn request_with_timeout(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let message = ProtocolMessage::request(method, params);
        let ProtocolMessage::Request { id, .. } = &message else {
            return Err(GateStreamError::Protocol("request constructor returned a non-request".into()));
        };
        let id = id.clone();
        let rx = self.pending.register(&id)?;
        if let Err(e) = self.send(message) {
            self.pending.remove(&id);
            return Err(e);
        }
        self.pending.wait(&id, rx, timeout).await?.into_result()
    }

    /// Emit an event; returns its event-stream sequence.
    pub fn emit_event(&self, name: &str, payload: Value) -> Result<u64> {
        let seq = self.event_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.send(ProtocolMessage::event(name, payload, seq))?;
        Ok(seq)
    }

    /// Close the session: fail pending requests and stop the connection task.
    pub fn close(&self) {
        self.pending.fail_all();
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once `close` was called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // Sender lives in self, so wait_for can only fail if self is gone.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Device id to live session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle`; any previous session of the same device is closed.
    pub fn insert(&self, handle: Arc<SessionHandle>) {
        let previous = self.sessions.write().insert(handle.device_id().to_string(), handle.clone());
        if let Some(old) = previous {
            if old.connection_id() != handle.connection_id() {
                info!(
                    device_id = handle.device_id(),
                    old = old.connection_id(),
                    new = handle.connection_id(),
                    "replacing existing session"
                );
                old.close();
            }
        }
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().get(device_id).cloned()
    }

    pub fn remove(&self, device_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.write().remove(device_id)
    }

    /// Remove the entry only if it still belongs to `connection_id`.
    pub fn remove_if_current(&self, device_id: &str, connection_id: &str) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(device_id) {
            Some(h) if h.connection_id() == connection_id => {
                sessions.remove(device_id);
                true
            }
            _ => false,
        }
    }

    /// Sorted device ids with a live session.
    pub fn connected_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close_all(&self) {
        let drained: Vec<Arc<SessionHandle>> = self.sessions.write().drain().map(|(_, h)| h).collect();
        for h in drained {
            h.close();
        }
    }
}

impl RevocationHook for SessionRegistry {
    fn device_revoked(&self, device_id: &str, reason: &str) {
        if let Some(handle) = self.remove(device_id) {
            warn!(device_id, reason, connection_id = handle.connection_id(), "closing revoked session");
            handle.close();
        }
    }
}
