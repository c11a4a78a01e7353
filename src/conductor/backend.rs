//! Backend call contract
//!
//! The connection manager talks to the conductor only through these traits:
//! [`ConductorBackend`] opens channels, [`AdminChannel`] provisions and
//! authorizes, [`AppChannel`] executes zome calls. [`WsBackend`] is the
//! WebSocket implementation; tests plug in scripted backends.

use async_trait::async_trait;
use rmpv::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::admin::WsAdminChannel;
use super::app::WsAppChannel;
use super::credentials::{encode_hash, CallSigner};
use crate::error::Result;

/// A cell: one DNA instantiated for one agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId {
    pub dna_hash: Vec<u8>,
    pub agent_pub_key: Vec<u8>,
}

impl CellId {
    pub fn new(dna_hash: Vec<u8>, agent_pub_key: Vec<u8>) -> Self {
        Self {
            dna_hash,
            agent_pub_key,
        }
    }

    /// `[dna_hash, agent_pub_key]` as the conductor expects it.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::Binary(self.dna_hash.clone()),
            Value::Binary(self.agent_pub_key.clone()),
        ])
    }

    pub fn dna_hash_string(&self) -> String {
        encode_hash(&self.dna_hash)
    }
}

/// An installed app as reported by `list_apps`.
#[derive(Debug, Clone, PartialEq)]
pub struct InstalledApp {
    pub installed_app_id: String,
    pub agent_pub_key: Vec<u8>,
    /// Provisioned cells per role, in the order the conductor listed them
    pub cells: BTreeMap<String, Vec<CellId>>,
}

impl InstalledApp {
    /// One cell per role: the first provisioned cell. Roles without one are skipped.
    pub fn cells_by_role(&self) -> BTreeMap<String, CellId> {
        self.cells
            .iter()
            .filter_map(|(role, cells)| cells.first().map(|c| (role.clone(), c.clone())))
            .collect()
    }
}

/// An attached app interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInterfaceInfo {
    pub port: u16,
    /// App the interface is restricted to, if any
    pub installed_app_id: Option<String>,
}

impl AppInterfaceInfo {
    pub fn serves(&self, app_id: &str) -> bool {
        self.installed_app_id.as_deref().map_or(true, |id| id == app_id)
    }
}

#[derive(Debug, Clone)]
pub struct InstallAppRequest {
    pub installed_app_id: String,
    pub agent_key: Vec<u8>,
    pub bundle_path: String,
}

/// Assigned capability for one signing key on one cell.
#[derive(Debug, Clone)]
pub struct CapabilityGrant {
    pub cell_id: CellId,
    /// 39-byte agent key derived from the signing key
    pub signing_key: Vec<u8>,
    pub cap_secret: Vec<u8>,
    pub tag: String,
}

/// Administrative channel.
#[async_trait]
pub trait AdminChannel: Send + Sync {
    async fn list_apps(&self) -> Result<Vec<InstalledApp>>;

    async fn generate_agent_pub_key(&self) -> Result<Vec<u8>>;

    async fn install_app(&self, request: &InstallAppRequest) -> Result<()>;

    async fn enable_app(&self, installed_app_id: &str) -> Result<()>;

    async fn grant_zome_call_capability(&self, grant: &CapabilityGrant) -> Result<()>;

    async fn list_app_interfaces(&self) -> Result<Vec<AppInterfaceInfo>>;

    /// Attach a new app interface. Port 0 lets the conductor pick. Returns the bound port.
    async fn attach_app_interface(
        &self,
        port: u16,
        allowed_origins: &str,
        installed_app_id: Option<&str>,
    ) -> Result<u16>;

    async fn issue_app_authentication_token(
        &self,
        installed_app_id: &str,
        expiry_secs: u64,
    ) -> Result<Vec<u8>>;

    async fn close(&self);
}

/// Application channel, authenticated and ready for zome calls.
#[async_trait]
pub trait AppChannel: Send + Sync {
    /// Execute a zome call. `payload` and the result are msgpack bytes.
    async fn call_zome(
        &self,
        cell: &CellId,
        zome_name: &str,
        fn_name: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>>;

    fn is_open(&self) -> bool;

    /// Resolves when the channel is gone.
    async fn closed(&self);

    async fn close(&self);
}

/// Opens channels to a conductor.
#[async_trait]
pub trait ConductorBackend: Send + Sync {
    async fn open_admin(&self, url: &str) -> Result<Arc<dyn AdminChannel>>;

    async fn open_app(
        &self,
        url: &str,
        token: &[u8],
        signer: Arc<CallSigner>,
    ) -> Result<Arc<dyn AppChannel>>;
}

/// WebSocket backend.
pub struct WsBackend {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl WsBackend {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }
}

#[async_trait]
impl ConductorBackend for WsBackend {
    async fn open_admin(&self, url: &str) -> Result<Arc<dyn AdminChannel>> {
        let channel = WsAdminChannel::connect(url, self.connect_timeout, self.request_timeout).await?;
        Ok(Arc::new(channel))
    }

    async fn open_app(
        &self,
        url: &str,
        token: &[u8],
        signer: Arc<CallSigner>,
    ) -> Result<Arc<dyn AppChannel>> {
        let channel =
            WsAppChannel::connect(url, token, signer, self.connect_timeout, self.request_timeout)
                .await?;
        Ok(Arc::new(channel))
    }
}
