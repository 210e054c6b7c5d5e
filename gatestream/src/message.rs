//! Decrypted protocol messages.
//!
//! One tagged union over request, response and event, discriminated by the
//! `type` key:
//!
//! ```text
//! {"type":"req",   "id", "method", "params"}
//! {"type":"res",   "id", "success", "result" | "error":{"code","message"}}
//! {"type":"event", "event", "payload", "seq"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{GateStreamError, Result};

/// Error code for methods nobody handles.
pub const UNKNOWN_METHOD: &str = "UNKNOWN_METHOD";

/// Error code for a handler that failed.
pub const HANDLER_ERROR: &str = "HANDLER_ERROR";

/// Built-in liveness method answered by the dispatcher itself.
pub const PING_METHOD: &str = "ping";

/// `error` body of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProtocolMessage {
    #[serde(rename = "req")]
    Request {
        id: String,
        method: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        params: Value,
    },

    #[serde(rename = "res")]
    Response {
        id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },

    #[serde(rename = "event")]
    Event {
        #[serde(rename = "event")]
        name: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        payload: Value,
        /// Event-stream sequence, independent of the frame sequence.
        #[serde(default)]
        seq: u64,
    },
}

impl ProtocolMessage {
    /// A request with a fresh random id.
    pub fn request(method: impl Into<String>, params: Value) -> Self {
        ProtocolMessage::Request {
            id: Uuid::new_v4().to_string(),
            method: method.into(),
            params,
        }
    }

    pub fn success(id: impl Into<String>, result: Value) -> Self {
        ProtocolMessage::Response {
            id: id.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        ProtocolMessage::Response {
            id: id.into(),
            success: false,
            result: None,
            error: Some(ErrorBody {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    pub fn event(name: impl Into<String>, payload: Value, seq: u64) -> Self {
        ProtocolMessage::Event {
            name: name.into(),
            payload,
            seq,
        }
    }

    /// Variant label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Request { .. } => "req",
            ProtocolMessage::Response { .. } => "res",
            ProtocolMessage::Event { .. } => "event",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| GateStreamError::Protocol(format!("bad message: {e}")))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| GateStreamError::Protocol(format!("bad message: {e}")))
    }
}

/// Outcome of a request as seen by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<ErrorBody>,
}

impl RemoteResponse {
    /// Successful result, or the remote error as `GateStreamError::Remote`.
    pub fn into_result(self) -> Result<Value> {
        if self.success {
            return Ok(self.result.unwrap_or(Value::Null));
        }
        let error = self.error.unwrap_or_else(|| ErrorBody {
            code: HANDLER_ERROR.into(),
            message: "request failed".into(),
        });
        Err(GateStreamError::Remote {
            code: error.code,
            message: error.message,
        })
    }
}
