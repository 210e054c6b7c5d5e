//! Outstanding request table for one session.
//!
//! Every entry is removed exactly once: by its response, by its timeout, or by
//! `fail_all` when the session closes.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{GateStreamError, Result};
use crate::message::RemoteResponse;

type Waiter = oneshot::Sender<Result<RemoteResponse>>;

#[derive(Default)]
struct Inner {
    waiters: HashMap<String, Waiter>,
    closed: bool,
}

/// Request-id to waiter map.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<Inner>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id`. Fails once the session closed.
    pub fn register(&self, id: &str) -> Result<oneshot::Receiver<Result<RemoteResponse>>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(GateStreamError::SessionClosed);
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(id.to_string(), tx);
        Ok(rx)
    }

    /// Complete the waiter for `id`.
    pub fn resolve(&self, id: &str, response: RemoteResponse) -> Result<()> {
        let waiter = self.inner.lock().waiters.remove(id);
        match waiter {
            Some(tx) => {
                // Receiver may have given up already; nothing to do then.
                let _ = tx.send(Ok(response));
                Ok(())
            }
            None => Err(GateStreamError::UnmatchedResponse(id.to_string())),
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        self.inner.lock().waiters.remove(id).is_some()
    }

    /// Fail every outstanding waiter with `SessionClosed` and refuse new ones.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<Waiter> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.waiters.drain().map(|(_, tx)| tx).collect()
        };
        let n = drained.len();
        for tx in drained {
            let _ = tx.send(Err(GateStreamError::SessionClosed));
        }
        if n > 0 {
            debug!(count = n, "failed pending requests on close");
        }
        n
    }

    pub fn len(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Wait for the response to `id`, removing the entry on timeout.
    pub async fn wait(
        &self,
        id: &str,
        rx: oneshot::Receiver<Result<RemoteResponse>>,
        timeout: Duration,
    ) -> Result<RemoteResponse> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(GateStreamError::SessionClosed),
            Err(_) => {
                self.remove(id);
                Err(GateStreamError::Timeout {
                    id: id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}
