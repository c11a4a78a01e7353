//! The call seam shared by every component above the connection.
//!
//! The offline queue, the write-buffer flush driver and the circuit breaker
//! decorator only ever see a [`ZomeCaller`]. The connection manager is the
//! production implementation; tests substitute scripted callers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ConnectError;

/// A remote call addressed by logical role rather than by cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZomeCall {
    /// Logical role name (e.g. "lamad", "imagodei")
    pub role_name: String,
    /// Zome (module) name
    pub zome_name: String,
    /// Function name
    pub fn_name: String,
    /// Arguments; encoded to msgpack on the wire
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ZomeCall {
    pub fn new(
        role_name: impl Into<String>,
        zome_name: impl Into<String>,
        fn_name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            role_name: role_name.into(),
            zome_name: zome_name.into(),
            fn_name: fn_name.into(),
            payload,
        }
    }
}

/// Why a call failed, so callers can decide whether to retry, queue or surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorKind {
    /// No session and none in progress
    NotConnected,
    /// Channel-level failure
    Transport,
    /// Backend rejected the call
    Zome,
    /// Role has no cell in this session
    NoCell,
    /// Circuit breaker failed the call fast
    CircuitOpen,
    /// Timed out waiting for a session or a response
    Timeout,
    /// Encoding, decoding or anything local
    Internal,
}

impl From<&ConnectError> for CallErrorKind {
    fn from(err: &ConnectError) -> Self {
        match err {
            ConnectError::NotConnected => CallErrorKind::NotConnected,
            ConnectError::NoCellForRole { .. } => CallErrorKind::NoCell,
            ConnectError::CircuitOpen(_) => CallErrorKind::CircuitOpen,
            ConnectError::Timeout(_) => CallErrorKind::Timeout,
            e if e.is_transport() => CallErrorKind::Transport,
            ConnectError::Zome(_) => CallErrorKind::Zome,
            _ => CallErrorKind::Internal,
        }
    }
}

/// Uniform call result. Calls never raise across this boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<CallErrorKind>,
}

impl CallOutcome {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_kind: None,
        }
    }

    pub fn failed(kind: CallErrorKind, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            error_kind: Some(kind),
        }
    }

    /// Convert back into a `Result` for `?`-style callers.
    pub fn into_result(self) -> Result<serde_json::Value, String> {
        if self.success {
            Ok(self.data.unwrap_or(serde_json::Value::Null))
        } else {
            Err(self.error.unwrap_or_else(|| "unknown error".to_string()))
        }
    }
}

impl From<ConnectError> for CallOutcome {
    fn from(err: ConnectError) -> Self {
        CallOutcome::failed(CallErrorKind::from(&err), err.to_string())
    }
}

/// Anything that can execute a [`ZomeCall`].
#[async_trait]
pub trait ZomeCaller: Send + Sync {
    async fn call(&self, call: &ZomeCall) -> CallOutcome;

    /// Whether a call issued now has a live session to go to.
    fn is_connected(&self) -> bool;
}
