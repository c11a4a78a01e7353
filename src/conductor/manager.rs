//! Connection Lifecycle Manager
//!
//! Owns the one session to the conductor: admin channel, app channel,
//! agent identity and the role-to-cell map. Everything above it calls
//! through [`ConnectionManager::call`] (or the [`ZomeCaller`] impl).
//!
//! # Connect sequence
//!
//! Strictly sequential; any failing step aborts the whole attempt:
//!
//! 1. strategy `prepare`, resolve the admin URL, open the admin channel
//! 2. restore or generate signing credentials
//! 3. find the app, installing and enabling it from the bundle if missing
//! 4. one cell per role, checked against the required roles
//! 5. grant a zome-call capability to the signing key on every cell
//! 6. reuse an app interface serving this app, or attach one
//! 7. issue an app token and open the authenticated app channel
//!
//! A failed attempt closes what it opened and leaves `phase = error`
//! with both handles cleared.
//!
//! # Reconnect
//!
//! A transport failure while connected (failed call or the app channel
//! closing under us) moves to `error` and, if enabled, starts the backoff
//! loop: `error -> reconnecting -> connecting -> ...` until it succeeds or
//! the attempt bound is reached.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::{
    AdminChannel, AppChannel, CapabilityGrant, CellId, ConductorBackend, InstallAppRequest,
    InstalledApp, WsBackend,
};
use super::backoff::ReconnectPolicy;
use super::credentials::CallSigner;
use super::http::HttpReader;
use super::protocol::{decode_value, msgpack_to_json};
use super::state::{ChannelHandle, ConnectionPhase, ConnectionState, DisplayInfo};
use super::strategy::{strategy_for, ConnectionStrategy};
use crate::call::{CallOutcome, ZomeCall, ZomeCaller};
use crate::config::{Config, ConnectionConfig, ConnectionMode, ReconnectConfig};
use crate::error::{ConnectError, Result};
use crate::observable::{ListenerId, Observable};
use crate::store::KeyValueStore;

/// Per-connect overrides of the configured app settings.
#[derive(Debug, Clone, Default)]
pub struct ConnectOverrides {
    pub app_id: Option<String>,
    pub required_roles: Option<Vec<String>>,
    pub happ_bundle_path: Option<String>,
}

struct ConnectSettings {
    app_id: String,
    required_roles: Vec<String>,
    happ_bundle_path: Option<String>,
}

struct LiveChannels {
    admin: Arc<dyn AdminChannel>,
    app: Arc<dyn AppChannel>,
}

struct Authorized {
    app: Arc<dyn AppChannel>,
    app_url: String,
    agent_pub_key: Vec<u8>,
    cells: BTreeMap<String, CellId>,
}

#[derive(Default)]
struct Tasks {
    reconnect: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    policy: ReconnectPolicy,
    strategy: Arc<dyn ConnectionStrategy>,
    backend: Arc<dyn ConductorBackend>,
    store: Arc<dyn KeyValueStore>,
    http: Option<HttpReader>,
    state: Observable<ConnectionState>,
    connected: watch::Sender<bool>,
    channels: RwLock<Option<LiveChannels>>,
    /// Serializes connect, reconnect and disconnect
    connect_lock: tokio::sync::Mutex<()>,
    last_overrides: Mutex<ConnectOverrides>,
    tasks: Mutex<Tasks>,
    transport_error_logged: AtomicBool,
    /// Bumped whenever the session is replaced or dropped; stale monitors compare against it
    generation: AtomicU64,
    weak_self: Weak<Self>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        reconnect: &ReconnectConfig,
        strategy: Arc<dyn ConnectionStrategy>,
        backend: Arc<dyn ConductorBackend>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Arc<Self>> {
        let http = strategy
            .http_base_url()
            .map(|base| HttpReader::new(base, config.doorway_api_key.clone()))
            .transpose()?;
        let (connected, _) = watch::channel(false);
        let policy = ReconnectPolicy::from(reconnect);

        Ok(Arc::new_cyclic(|weak_self| Self {
            config,
            policy,
            strategy,
            backend,
            store,
            http,
            state: Observable::new(ConnectionState::default()),
            connected,
            channels: RwLock::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            last_overrides: Mutex::new(ConnectOverrides::default()),
            tasks: Mutex::new(Tasks::default()),
            transport_error_logged: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        }))
    }

    /// Strategy from configuration, WebSocket backend.
    pub fn from_config(config: &Config, store: Arc<dyn KeyValueStore>) -> Result<Arc<Self>> {
        let strategy = strategy_for(&config.connection)?;
        let backend = Arc::new(WsBackend::new(
            strategy.connect_timeout(),
            config.connection.request_timeout(),
        ));
        Self::new(
            config.connection.clone(),
            &config.reconnect,
            strategy,
            backend,
            store,
        )
    }

    // =========================================================================
    // Observation
    // =========================================================================

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.with(|s| s.phase)
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == ConnectionPhase::Connected
    }

    pub fn mode(&self) -> ConnectionMode {
        self.strategy.mode()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn on_state_change(
        &self,
        listener: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> ListenerId {
        self.state.on_change(listener)
    }

    pub fn remove_state_listener(&self, id: ListenerId) {
        self.state.remove_listener(id);
    }

    /// `true` while connected. Only changes are published.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub fn display_info(&self) -> DisplayInfo {
        self.state.with(|s| DisplayInfo::from_state(self.mode(), s))
    }

    // =========================================================================
    // Connect / disconnect
    // =========================================================================

    /// Connect with the configured app settings.
    pub async fn connect(&self) -> Result<()> {
        self.connect_with(ConnectOverrides::default()).await
    }

    /// Connect, overriding app settings for this and later reconnects.
    ///
    /// A no-op when already connected. Handshake failures are returned
    /// after the state has moved to `error`.
    pub async fn connect_with(&self, overrides: ConnectOverrides) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        self.abort_reconnect();

        if self.is_connected() {
            return Ok(());
        }

        *lock(&self.last_overrides) = overrides;
        self.establish().await
    }

    /// Cancel any reconnect, close both channels and return to `disconnected`.
    ///
    /// Queued offline operations and buffered writes are not touched.
    pub async fn disconnect(&self) {
        let _guard = self.connect_lock.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut tasks = lock(&self.tasks);
            if let Some(task) = tasks.reconnect.take() {
                task.abort();
            }
            if let Some(task) = tasks.monitor.take() {
                task.abort();
            }
        }

        let channels = self.take_channels();
        if let Some(channels) = channels {
            channels.app.close().await;
            channels.admin.close().await;
        }
        self.strategy.release().await;

        self.state.set(ConnectionState::default());
        self.publish_connectivity();
        info!("Disconnected from conductor");
    }

    /// Wait until connected with at least one cell.
    ///
    /// `false` on timeout or when the attempt ends in `error`.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let wait = async move {
            rx.wait_for(|s| s.is_ready() || s.phase == ConnectionPhase::Error)
                .await
                .map(|s| s.is_ready())
                .unwrap_or(false)
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    fn connect_wait(&self) -> Duration {
        self.config
            .connect_wait_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.strategy.connect_timeout())
    }

    /// Run one connect attempt. Caller holds `connect_lock`.
    async fn establish(&self) -> Result<()> {
        let settings = self.settings();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let from = self.phase();
        if !self.try_transition(ConnectionPhase::Connecting, |s| s.last_error = None) {
            return Err(ConnectError::Internal(format!("Cannot connect from phase {}", from)));
        }
        info!(app_id = %settings.app_id, mode = ?self.mode(), "Connecting to conductor");

        match self.handshake(&settings).await {
            Ok((channels, admin_url, authorized)) => {
                let app = Arc::clone(&channels.app);
                *write(&self.channels) = Some(channels);

                let roles: Vec<String> = authorized.cells.keys().cloned().collect();
                let now = Utc::now();
                self.try_transition(ConnectionPhase::Connected, |s| {
                    s.admin_channel = Some(ChannelHandle {
                        url: admin_url,
                        opened_at: now,
                    });
                    s.app_channel = Some(ChannelHandle {
                        url: authorized.app_url,
                        opened_at: now,
                    });
                    s.agent_pub_key = Some(authorized.agent_pub_key);
                    s.cells_by_role = authorized.cells;
                    s.last_error = None;
                    s.connected_at = Some(now);
                    s.reconnect_attempt = 0;
                });
                self.transport_error_logged.store(false, Ordering::Relaxed);
                self.spawn_monitor(app, generation);

                info!(app_id = %settings.app_id, roles = ?roles, "Connected to conductor");
                Ok(())
            }
            Err(e) => {
                error!(app_id = %settings.app_id, error = %e, "Conductor connection failed");
                let message = e.to_string();
                self.try_transition(ConnectionPhase::Error, |s| {
                    clear_session(s);
                    s.last_error = Some(message);
                });
                Err(e)
            }
        }
    }

    async fn handshake(
        &self,
        settings: &ConnectSettings,
    ) -> Result<(LiveChannels, String, Authorized)> {
        self.strategy.prepare().await?;
        let admin_url = self.strategy.resolve_admin_url()?;
        let admin = self.backend.open_admin(&admin_url).await?;
        self.try_transition(ConnectionPhase::Authenticating, |_| {});

        match self.authorize(admin.as_ref(), settings).await {
            Ok(authorized) => {
                let channels = LiveChannels {
                    admin,
                    app: Arc::clone(&authorized.app),
                };
                Ok((channels, admin_url, authorized))
            }
            Err(e) => {
                admin.close().await;
                Err(e)
            }
        }
    }

    async fn authorize(
        &self,
        admin: &dyn AdminChannel,
        settings: &ConnectSettings,
    ) -> Result<Authorized> {
        let credentials = Arc::new(self.strategy.signing_credentials(self.store.as_ref())?);

        let installed = self.ensure_installed(admin, settings).await?;
        let cells = installed.cells_by_role();
        if cells.is_empty() {
            return Err(ConnectError::Connection(format!(
                "App '{}' has no provisioned cells",
                settings.app_id
            )));
        }
        for role in &settings.required_roles {
            if !cells.contains_key(role) {
                return Err(ConnectError::NoCellForRole {
                    role: role.clone(),
                    available: cells.keys().cloned().collect(),
                });
            }
        }

        let signing_key = credentials.signing_agent_key();
        for (role, cell) in &cells {
            admin
                .grant_zome_call_capability(&CapabilityGrant {
                    cell_id: cell.clone(),
                    signing_key: signing_key.clone(),
                    cap_secret: credentials.cap_secret().to_vec(),
                    tag: format!("elohim-connect-{}", role),
                })
                .await?;
            debug!(role = %role, "Granted zome call capability");
        }

        let port = self.app_interface_port(admin, &settings.app_id).await?;
        let signer = Arc::new(CallSigner::new(credentials, cells.values().cloned()));
        let token = admin
            .issue_app_authentication_token(&settings.app_id, self.config.auth_token_expiry_secs)
            .await?;

        let app_url = self.strategy.resolve_app_url(port)?;
        let app = self.backend.open_app(&app_url, &token, signer).await?;

        Ok(Authorized {
            app,
            app_url,
            agent_pub_key: installed.agent_pub_key,
            cells,
        })
    }

    async fn ensure_installed(
        &self,
        admin: &dyn AdminChannel,
        settings: &ConnectSettings,
    ) -> Result<InstalledApp> {
        let find = |apps: Vec<InstalledApp>| {
            apps.into_iter()
                .find(|a| a.installed_app_id == settings.app_id)
        };

        if let Some(app) = find(admin.list_apps().await?) {
            return Ok(app);
        }

        let bundle_path = settings.happ_bundle_path.clone().ok_or_else(|| {
            ConnectError::Config(format!(
                "App '{}' is not installed and no hApp bundle path is configured",
                settings.app_id
            ))
        })?;

        info!(app_id = %settings.app_id, bundle = %bundle_path, "Installing app");
        let agent_key = admin.generate_agent_pub_key().await?;
        admin
            .install_app(&InstallAppRequest {
                installed_app_id: settings.app_id.clone(),
                agent_key,
                bundle_path,
            })
            .await?;
        admin.enable_app(&settings.app_id).await?;

        find(admin.list_apps().await?).ok_or_else(|| {
            ConnectError::Connection(format!("App '{}' missing after install", settings.app_id))
        })
    }

    async fn app_interface_port(&self, admin: &dyn AdminChannel, app_id: &str) -> Result<u16> {
        let preferred = self.config.app_port;
        let interfaces = admin.list_app_interfaces().await?;

        if let Some(existing) = interfaces
            .iter()
            .filter(|i| i.serves(app_id))
            .find(|i| preferred == 0 || i.port == preferred)
        {
            debug!(port = existing.port, "Reusing app interface");
            return Ok(existing.port);
        }

        let port = admin
            .attach_app_interface(preferred, &self.config.allowed_origins, Some(app_id))
            .await?;
        info!(port, "Attached app interface");
        Ok(port)
    }

    fn settings(&self) -> ConnectSettings {
        let overrides = lock(&self.last_overrides).clone();
        ConnectSettings {
            app_id: overrides.app_id.unwrap_or_else(|| self.config.app_id.clone()),
            required_roles: overrides
                .required_roles
                .unwrap_or_else(|| self.config.required_roles.clone()),
            happ_bundle_path: overrides
                .happ_bundle_path
                .or_else(|| self.config.happ_bundle_path.clone()),
        }
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Call `zome_name::fn_name` on the cell serving `role`.
    pub async fn call(
        &self,
        role: &str,
        zome_name: &str,
        fn_name: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let (app, cell) = self.resolve(role).await?;
        let bytes = rmp_serde::to_vec_named(payload)
            .map_err(|e| ConnectError::Internal(format!("Failed to encode payload: {}", e)))?;

        match app.call_zome(&cell, zome_name, fn_name, bytes).await {
            Ok(result) => {
                self.transport_error_logged.store(false, Ordering::Relaxed);
                Ok(msgpack_to_json(decode_value(&result)?))
            }
            Err(e) => {
                if e.is_transport() {
                    if !self.transport_error_logged.swap(true, Ordering::Relaxed) {
                        warn!(role, zome = zome_name, function = fn_name, error = %e,
                            "Transport error on zome call, suppressing repeats");
                    } else {
                        debug!(role, zome = zome_name, function = fn_name, error = %e, "Transport error");
                    }
                    self.on_transport_failure(e.to_string());
                } else {
                    error!(role, zome = zome_name, function = fn_name, error = %e, "Zome call failed");
                }
                Err(e)
            }
        }
    }

    /// Side-effect-free call through the HTTP cache when the strategy has one,
    /// otherwise the same as [`call`](Self::call).
    pub async fn call_read(
        &self,
        role: &str,
        zome_name: &str,
        fn_name: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let Some(http) = &self.http else {
            return self.call(role, zome_name, fn_name, payload).await;
        };
        let (_, cell) = self.resolve(role).await?;
        http.read(&cell, zome_name, fn_name, payload).await
    }

    /// App channel and cell for `role`, waiting out a connect in progress.
    async fn resolve(&self, role: &str) -> Result<(Arc<dyn AppChannel>, CellId)> {
        match self.phase() {
            ConnectionPhase::Disconnected | ConnectionPhase::Error => {
                return Err(ConnectError::NotConnected)
            }
            ConnectionPhase::Connected => {}
            _ => {
                if !self.wait_for_connection(self.connect_wait()).await {
                    return Err(ConnectError::NotConnected);
                }
            }
        }

        let cell = self.state.with(|s| {
            s.cells_by_role
                .get(role)
                .cloned()
                .ok_or_else(|| ConnectError::NoCellForRole {
                    role: role.to_string(),
                    available: s.roles(),
                })
        })?;

        let app = read(&self.channels)
            .as_ref()
            .map(|c| Arc::clone(&c.app))
            .ok_or(ConnectError::NotConnected)?;

        Ok((app, cell))
    }

    // =========================================================================
    // Failure handling and reconnect
    // =========================================================================

    fn on_transport_failure(&self, reason: String) {
        if self.phase() != ConnectionPhase::Connected {
            return;
        }
        let moved = self.try_transition(ConnectionPhase::Error, |s| {
            clear_session(s);
            s.last_error = Some(reason.clone());
        });
        if !moved {
            return;
        }

        self.generation.fetch_add(1, Ordering::SeqCst);
        warn!(reason = %reason, "Conductor connection lost");

        if let Some(channels) = self.take_channels() {
            tokio::spawn(async move {
                channels.app.close().await;
                channels.admin.close().await;
            });
        }

        if self.policy.enabled {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&self) {
        let handle = tokio::spawn(Self::reconnect_loop(self.weak_self.clone()));
        if let Some(previous) = lock(&self.tasks).reconnect.replace(handle) {
            previous.abort();
        }
    }

    fn abort_reconnect(&self) {
        if let Some(task) = lock(&self.tasks).reconnect.take() {
            task.abort();
        }
    }

    async fn reconnect_loop(weak: Weak<Self>) {
        loop {
            let delay = {
                let Some(this) = weak.upgrade() else { return };
                let attempt = this.state.with(|s| s.reconnect_attempt);
                if !this.policy.should_retry(attempt) {
                    warn!(attempts = attempt, "Reconnect attempts exhausted, waiting for manual connect");
                    return;
                }
                if !this.try_transition(ConnectionPhase::Reconnecting, |s| {
                    s.reconnect_attempt = attempt + 1
                }) {
                    return;
                }
                let delay = this.policy.delay_for_attempt(attempt);
                info!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
                delay
            };

            tokio::time::sleep(delay).await;

            let Some(this) = weak.upgrade() else { return };
            let _guard = this.connect_lock.lock().await;
            if this.phase() != ConnectionPhase::Reconnecting {
                return;
            }
            match this.establish().await {
                Ok(()) => {
                    info!("Reconnected to conductor");
                    return;
                }
                Err(e) => warn!(error = %e, "Reconnect attempt failed"),
            }
        }
    }

    /// Watch the app channel; its closing counts as a transport failure.
    fn spawn_monitor(&self, app: Arc<dyn AppChannel>, generation: u64) {
        let weak = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            app.closed().await;
            if let Some(this) = weak.upgrade() {
                if this.generation.load(Ordering::SeqCst) == generation {
                    this.on_transport_failure("Application channel closed".to_string());
                }
            }
        });
        if let Some(previous) = lock(&self.tasks).monitor.replace(handle) {
            previous.abort();
        }
    }

    // =========================================================================
    // State plumbing
    // =========================================================================

    /// Apply `apply` and move to `next` if the table allows it.
    fn try_transition(&self, next: ConnectionPhase, apply: impl FnOnce(&mut ConnectionState)) -> bool {
        let from = self.state.update(|s| {
            let from = s.phase;
            if from.can_transition_to(next) {
                s.phase = next;
                apply(s);
                Ok(from)
            } else {
                Err(from)
            }
        });
        self.publish_connectivity();
        match from {
            Ok(from) => {
                debug!(from = %from, to = %next, "Connection phase change");
                true
            }
            Err(from) => {
                debug!(from = %from, to = %next, "Transition not allowed");
                false
            }
        }
    }

    fn publish_connectivity(&self) {
        let now = self.is_connected();
        self.connected.send_if_modified(|connected| {
            if *connected != now {
                *connected = now;
                true
            } else {
                false
            }
        });
    }

    fn take_channels(&self) -> Option<LiveChannels> {
        write(&self.channels).take()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = tasks.reconnect.take() {
            task.abort();
        }
        if let Some(task) = tasks.monitor.take() {
            task.abort();
        }
    }
}

fn clear_session(state: &mut ConnectionState) {
    state.admin_channel = None;
    state.app_channel = None;
    state.agent_pub_key = None;
    state.cells_by_role.clear();
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl ZomeCaller for ConnectionManager {
    async fn call(&self, call: &ZomeCall) -> CallOutcome {
        match ConnectionManager::call(self, &call.role_name, &call.zome_name, &call.fn_name, &call.payload)
            .await
        {
            Ok(data) => CallOutcome::ok(data),
            Err(e) => e.into(),
        }
    }

    fn is_connected(&self) -> bool {
        ConnectionManager::is_connected(self)
    }
}
