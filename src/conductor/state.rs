//! Connection state machine
//!
//! ```text
//! disconnected --connect()--> connecting --admin open--> authenticating --ready--> connected
//!                                  |                          |                       |
//!                                  +---------> error <--------+-----------------------+
//!                                                |  ^
//!                              auto-reconnect    v  | attempt failed
//!                                            reconnecting --> connecting
//! ```
//!
//! `disconnect()` may reset from any phase; it is not a transition.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use super::backend::CellId;
use super::credentials::encode_hash;
use crate::config::ConnectionMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionPhase {
    pub fn can_transition_to(self, next: ConnectionPhase) -> bool {
        use ConnectionPhase::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Authenticating)
                | (Connecting, Error)
                | (Authenticating, Connected)
                | (Authenticating, Error)
                | (Connected, Error)
                | (Error, Connecting)
                | (Error, Reconnecting)
                | (Reconnecting, Connecting)
                | (Reconnecting, Error)
        )
    }

    /// A connect is under way and has not yet produced a session.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            ConnectionPhase::Connecting | ConnectionPhase::Authenticating | ConnectionPhase::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionPhase::Disconnected => "disconnected",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Authenticating => "authenticating",
            ConnectionPhase::Connected => "connected",
            ConnectionPhase::Reconnecting => "reconnecting",
            ConnectionPhase::Error => "error",
        };
        f.write_str(s)
    }
}

/// Opaque record of an open channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelHandle {
    pub url: String,
    pub opened_at: DateTime<Utc>,
}

/// Owned by the connection manager; everyone else gets snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub admin_channel: Option<ChannelHandle>,
    pub app_channel: Option<ChannelHandle>,
    pub agent_pub_key: Option<Vec<u8>>,
    /// At most one cell per role
    pub cells_by_role: BTreeMap<String, CellId>,
    pub last_error: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub reconnect_attempt: u32,
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        self.phase == ConnectionPhase::Connected && !self.cells_by_role.is_empty()
    }

    pub fn roles(&self) -> Vec<String> {
        self.cells_by_role.keys().cloned().collect()
    }
}

/// Read-only diagnostics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DisplayInfo {
    pub mode: ConnectionMode,
    pub phase: ConnectionPhase,
    pub admin_url: Option<String>,
    pub app_url: Option<String>,
    pub agent_pub_key: Option<String>,
    /// role -> DNA hash
    pub cells: BTreeMap<String, String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reconnect_attempt: u32,
}

impl DisplayInfo {
    pub fn from_state(mode: ConnectionMode, state: &ConnectionState) -> Self {
        Self {
            mode,
            phase: state.phase,
            admin_url: state.admin_channel.as_ref().map(|h| redacted(&h.url)),
            app_url: state.app_channel.as_ref().map(|h| redacted(&h.url)),
            agent_pub_key: state.agent_pub_key.as_deref().map(encode_hash),
            cells: state
                .cells_by_role
                .iter()
                .map(|(role, cell)| (role.clone(), cell.dna_hash_string()))
                .collect(),
            connected_at: state.connected_at,
            last_error: state.last_error.clone(),
            reconnect_attempt: state.reconnect_attempt,
        }
    }
}

fn redacted(url: &str) -> String {
    super::transport::redact(url).to_string()
}
