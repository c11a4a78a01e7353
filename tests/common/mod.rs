//! Shared fixtures: a scripted in-memory conductor and a scripted caller.

#![allow(dead_code)]

use async_trait::async_trait;
use elohim_connect::call::{CallErrorKind, CallOutcome, ZomeCall, ZomeCaller};
use elohim_connect::conductor::backend::{
    AdminChannel, AppChannel, AppInterfaceInfo, CapabilityGrant, CellId, ConductorBackend,
    InstallAppRequest, InstalledApp,
};
use elohim_connect::conductor::{CallSigner, ConnectionManager, DirectStrategy};
use elohim_connect::config::{ConnectionConfig, ReconnectConfig};
use elohim_connect::{ConnectError, MemoryStore, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

pub const AGENT: [u8; 39] = [7; 39];

pub fn lamad_cell() -> CellId {
    CellId::new(vec![1; 39], AGENT.to_vec())
}

pub fn imagodei_cell() -> CellId {
    CellId::new(vec![2; 39], AGENT.to_vec())
}

/// `elohim` with a `lamad` and an `imagodei` cell.
pub fn elohim_app() -> InstalledApp {
    let mut cells = BTreeMap::new();
    cells.insert("lamad".to_string(), vec![lamad_cell()]);
    cells.insert("imagodei".to_string(), vec![imagodei_cell()]);
    InstalledApp {
        installed_app_id: "elohim".into(),
        agent_pub_key: AGENT.to_vec(),
        cells,
    }
}

// =============================================================================
// Scripted conductor
// =============================================================================

/// Handshake step a conductor can be told to fail at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    OpenAdmin,
    ListApps,
    Install,
    Grant,
    ListInterfaces,
    Attach,
    IssueToken,
    OpenApp,
}

struct Script {
    apps: Vec<InstalledApp>,
    /// Becomes listed once `install_app` runs
    installable: Option<InstalledApp>,
    interfaces: Vec<AppInterfaceInfo>,
    fail_at: Option<Step>,
    /// `open_admin` fails this many more times
    admin_failures: u32,
    /// Every zome call fails with this error
    call_error: Option<ConnectError>,
    responses: HashMap<String, serde_json::Value>,
    attach_port: u16,
    admin_delay: Option<Duration>,
}

#[derive(Default)]
struct Shared {
    log: Mutex<Vec<String>>,
    admin_opens: AtomicUsize,
    app_closed: Mutex<Option<Arc<watch::Sender<bool>>>>,
}

/// In-memory conductor; every channel it opens shares the same script.
#[derive(Clone)]
pub struct MockConductor {
    script: Arc<Mutex<Script>>,
    shared: Arc<Shared>,
}

impl Default for MockConductor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConductor {
    /// `elohim` installed, no app interfaces attached yet.
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                apps: vec![elohim_app()],
                installable: None,
                interfaces: Vec::new(),
                fail_at: None,
                admin_failures: 0,
                call_error: None,
                responses: HashMap::new(),
                attach_port: 4445,
                admin_delay: None,
            })),
            shared: Arc::new(Shared::default()),
        }
    }

    /// Nothing installed; installing yields `app`.
    pub fn uninstalled(app: InstalledApp) -> Self {
        let conductor = Self::new();
        {
            let mut script = conductor.script.lock().unwrap();
            script.apps.clear();
            script.installable = Some(app);
        }
        conductor
    }

    pub fn with_apps(self, apps: Vec<InstalledApp>) -> Self {
        self.script.lock().unwrap().apps = apps;
        self
    }

    pub fn with_interfaces(self, interfaces: Vec<AppInterfaceInfo>) -> Self {
        self.script.lock().unwrap().interfaces = interfaces;
        self
    }

    pub fn fail_at(&self, step: Option<Step>) {
        self.script.lock().unwrap().fail_at = step;
    }

    pub fn fail_admin_opens(&self, times: u32) {
        self.script.lock().unwrap().admin_failures = times;
    }

    /// `open_admin` takes this long before answering.
    pub fn delay_admin_open(&self, delay: Duration) {
        self.script.lock().unwrap().admin_delay = Some(delay);
    }

    pub fn fail_calls(&self, error: Option<ConnectError>) {
        self.script.lock().unwrap().call_error = error;
    }

    pub fn respond(&self, fn_name: &str, value: serde_json::Value) {
        self.script
            .lock()
            .unwrap()
            .responses
            .insert(fn_name.to_string(), value);
    }

    /// Close the current app channel from the conductor side.
    pub fn drop_app_channel(&self) {
        if let Some(closed) = self.shared.app_closed.lock().unwrap().as_ref() {
            closed.send_replace(true);
        }
    }

    pub fn admin_opens(&self) -> usize {
        self.shared.admin_opens.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<String> {
        self.shared.log.lock().unwrap().clone()
    }

    pub fn logged(&self, prefix: &str) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|entry| entry.starts_with(prefix))
            .collect()
    }

    fn record(&self, entry: String) {
        self.shared.log.lock().unwrap().push(entry);
    }

    fn check(&self, step: Step) -> Result<()> {
        if self.script.lock().unwrap().fail_at == Some(step) {
            return Err(ConnectError::Connection(format!("scripted failure at {:?}", step)));
        }
        Ok(())
    }
}

#[async_trait]
impl ConductorBackend for MockConductor {
    async fn open_admin(&self, url: &str) -> Result<Arc<dyn AdminChannel>> {
        self.shared.admin_opens.fetch_add(1, Ordering::SeqCst);
        self.record(format!("open_admin {}", url));
        let delay = self.script.lock().unwrap().admin_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        {
            let mut script = self.script.lock().unwrap();
            if script.admin_failures > 0 {
                script.admin_failures -= 1;
                return Err(ConnectError::Connection("connection refused".into()));
            }
        }
        self.check(Step::OpenAdmin)?;
        Ok(Arc::new(MockAdmin {
            conductor: self.clone(),
        }))
    }

    async fn open_app(
        &self,
        url: &str,
        token: &[u8],
        signer: Arc<CallSigner>,
    ) -> Result<Arc<dyn AppChannel>> {
        self.record(format!("open_app {}", url));
        self.check(Step::OpenApp)?;
        assert!(!token.is_empty());
        assert!(!signer.provenance().is_empty());

        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        *self.shared.app_closed.lock().unwrap() = Some(Arc::clone(&closed));
        Ok(Arc::new(MockApp {
            conductor: self.clone(),
            closed,
        }))
    }
}

struct MockAdmin {
    conductor: MockConductor,
}

#[async_trait]
impl AdminChannel for MockAdmin {
    async fn list_apps(&self) -> Result<Vec<InstalledApp>> {
        self.conductor.record("list_apps".into());
        self.conductor.check(Step::ListApps)?;
        Ok(self.conductor.script.lock().unwrap().apps.clone())
    }

    async fn generate_agent_pub_key(&self) -> Result<Vec<u8>> {
        self.conductor.record("generate_agent_pub_key".into());
        Ok(AGENT.to_vec())
    }

    async fn install_app(&self, request: &InstallAppRequest) -> Result<()> {
        self.conductor
            .record(format!("install_app {} {}", request.installed_app_id, request.bundle_path));
        self.conductor.check(Step::Install)?;
        let mut script = self.conductor.script.lock().unwrap();
        if let Some(app) = script.installable.take() {
            script.apps.push(app);
        }
        Ok(())
    }

    async fn enable_app(&self, installed_app_id: &str) -> Result<()> {
        self.conductor.record(format!("enable_app {}", installed_app_id));
        Ok(())
    }

    async fn grant_zome_call_capability(&self, grant: &CapabilityGrant) -> Result<()> {
        self.conductor.record(format!("grant {}", grant.tag));
        self.conductor.check(Step::Grant)?;
        assert_eq!(grant.signing_key.len(), 39);
        Ok(())
    }

    async fn list_app_interfaces(&self) -> Result<Vec<AppInterfaceInfo>> {
        self.conductor.record("list_app_interfaces".into());
        self.conductor.check(Step::ListInterfaces)?;
        Ok(self.conductor.script.lock().unwrap().interfaces.clone())
    }

    async fn attach_app_interface(
        &self,
        port: u16,
        _allowed_origins: &str,
        installed_app_id: Option<&str>,
    ) -> Result<u16> {
        self.conductor.record(format!("attach {}", port));
        self.conductor.check(Step::Attach)?;
        let mut script = self.conductor.script.lock().unwrap();
        let bound = if port == 0 { script.attach_port } else { port };
        script.interfaces.push(AppInterfaceInfo {
            port: bound,
            installed_app_id: installed_app_id.map(str::to_string),
        });
        Ok(bound)
    }

    async fn issue_app_authentication_token(
        &self,
        installed_app_id: &str,
        _expiry_secs: u64,
    ) -> Result<Vec<u8>> {
        self.conductor.record(format!("issue_token {}", installed_app_id));
        self.conductor.check(Step::IssueToken)?;
        Ok(vec![42; 16])
    }

    async fn close(&self) {
        self.conductor.record("close_admin".into());
    }
}

struct MockApp {
    conductor: MockConductor,
    closed: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl AppChannel for MockApp {
    async fn call_zome(
        &self,
        cell: &CellId,
        zome_name: &str,
        fn_name: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        self.conductor
            .record(format!("call {} {}.{}", cell.dna_hash[0], zome_name, fn_name));

        let (error, response) = {
            let script = self.conductor.script.lock().unwrap();
            (
                script.call_error.as_ref().map(|e| match e {
                    ConnectError::Transport(m) => ConnectError::Transport(m.clone()),
                    ConnectError::Zome(m) => ConnectError::Zome(m.clone()),
                    other => ConnectError::Internal(other.to_string()),
                }),
                script.responses.get(fn_name).cloned(),
            )
        };
        if let Some(e) = error {
            return Err(e);
        }

        // Echo the payload unless a response is scripted
        let value = match response {
            Some(value) => value,
            None => rmp_serde::from_slice::<serde_json::Value>(&payload)
                .map_err(|e| ConnectError::Protocol(e.to_string()))?,
        };
        rmp_serde::to_vec_named(&value).map_err(|e| ConnectError::Protocol(e.to_string()))
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) {
        self.conductor.record("close_app".into());
        self.closed.send_replace(true);
    }
}

/// Direct-mode manager over `conductor` with an in-memory store.
pub fn manager(
    conductor: &MockConductor,
    config: ConnectionConfig,
    reconnect: ReconnectConfig,
) -> Arc<ConnectionManager> {
    ConnectionManager::new(
        config,
        &reconnect,
        Arc::new(DirectStrategy::new("ws://localhost:4444", "ws://localhost")),
        Arc::new(conductor.clone()),
        Arc::new(MemoryStore::new()),
    )
    .unwrap()
}

pub fn no_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        enabled: false,
        ..Default::default()
    }
}

// =============================================================================
// Scripted caller
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Failing {
    Times(u32),
    Always,
}

/// [`ZomeCaller`] with a connectivity switch and per-function failure scripts.
pub struct ScriptedCaller {
    connected: AtomicBool,
    failing: Mutex<HashMap<String, Failing>>,
    responses: Mutex<HashMap<String, serde_json::Value>>,
    calls: Mutex<Vec<ZomeCall>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedCaller {
    pub fn new(connected: bool) -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(connected),
            failing: Mutex::new(HashMap::new()),
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn fail_times(&self, fn_name: &str, times: u32) {
        self.failing
            .lock()
            .unwrap()
            .insert(fn_name.to_string(), Failing::Times(times));
    }

    pub fn fail_always(&self, fn_name: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert(fn_name.to_string(), Failing::Always);
    }

    pub fn succeed(&self, fn_name: &str) {
        self.failing.lock().unwrap().remove(fn_name);
    }

    pub fn respond(&self, fn_name: &str, value: serde_json::Value) {
        self.responses
            .lock()
            .unwrap()
            .insert(fn_name.to_string(), value);
    }

    /// Hold every call until [`release`](Self::release).
    pub fn hold(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn calls(&self) -> Vec<ZomeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fn_names(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.fn_name).collect()
    }

    pub fn count(&self, fn_name: &str) -> usize {
        self.calls().iter().filter(|c| c.fn_name == fn_name).count()
    }

    /// Most calls ever running at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn should_fail(&self, fn_name: &str) -> bool {
        let mut failing = self.failing.lock().unwrap();
        match failing.get(fn_name).copied() {
            Some(Failing::Always) => true,
            Some(Failing::Times(n)) if n > 0 => {
                failing.insert(fn_name.to_string(), Failing::Times(n - 1));
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ZomeCaller for ScriptedCaller {
    async fn call(&self, call: &ZomeCall) -> CallOutcome {
        self.calls.lock().unwrap().push(call.clone());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if !self.is_connected() {
            return CallOutcome::failed(CallErrorKind::NotConnected, "Not connected to conductor");
        }
        if self.should_fail(&call.fn_name) {
            return CallOutcome::failed(CallErrorKind::Zome, format!("{} failed", call.fn_name));
        }
        let response = self.responses.lock().unwrap().get(&call.fn_name).cloned();
        CallOutcome::ok(response.unwrap_or_else(|| call.payload.clone()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Let spawned tasks run until the runtime is idle.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
