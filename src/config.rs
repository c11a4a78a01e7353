//! Configuration for elohim-connect

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default storage directory for credentials and queued writes
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("elohim-connect")
}

/// How the client reaches the conductor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Local conductor, admin and app interfaces reached directly
    #[default]
    Direct,
    /// Remote conductor proxied (and read-cached) by a doorway
    Doorway,
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,

    #[serde(default)]
    pub offline_queue: OfflineQueueConfig,

    #[serde(default)]
    pub write_buffer: WriteBufferSection,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }
}

/// Conductor endpoints and handshake parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub mode: ConnectionMode,

    /// Admin websocket URL (direct mode)
    #[serde(default = "default_admin_url")]
    pub admin_url: String,

    /// Host part of the app websocket URL; the port is discovered at connect
    #[serde(default = "default_app_host")]
    pub app_host: String,

    /// Preferred app interface port (0 = reuse any existing, else let conductor pick)
    #[serde(default)]
    pub app_port: u16,

    /// Installed app ID
    #[serde(default = "default_app_id")]
    pub app_id: String,

    /// Roles that must resolve to a cell for the connection to count as ready
    #[serde(default)]
    pub required_roles: Vec<String>,

    /// hApp bundle to install when the app is not yet provisioned
    #[serde(default)]
    pub happ_bundle_path: Option<String>,

    /// Doorway base URL (doorway mode)
    #[serde(default)]
    pub doorway_url: Option<String>,

    /// Doorway API key (doorway mode)
    #[serde(default)]
    pub doorway_api_key: Option<String>,

    /// Origins allowed on a newly attached app interface
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: String,

    /// Timeout for individual conductor requests
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// How long early callers wait for a connect in flight (None = strategy default)
    #[serde(default)]
    pub connect_wait_secs: Option<u64>,

    /// Lifetime of the app authentication token
    #[serde(default = "default_auth_token_expiry_secs")]
    pub auth_token_expiry_secs: u64,
}

fn default_admin_url() -> String {
    "ws://localhost:4444".to_string()
}

fn default_app_host() -> String {
    "ws://localhost".to_string()
}

fn default_app_id() -> String {
    "elohim".to_string()
}

fn default_allowed_origins() -> String {
    "*".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_auth_token_expiry_secs() -> u64 {
    3600
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mode: ConnectionMode::Direct,
            admin_url: default_admin_url(),
            app_host: default_app_host(),
            app_port: 0,
            app_id: default_app_id(),
            required_roles: Vec::new(),
            happ_bundle_path: None,
            doorway_url: None,
            doorway_api_key: None,
            allowed_origins: default_allowed_origins(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_wait_secs: None,
            auth_token_expiry_secs: default_auth_token_expiry_secs(),
        }
    }
}

impl ConnectionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Auto-reconnect policy after an observed transport failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_reconnect_base_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_reconnect_attempts")]
    pub max_attempts: u32,

    /// Jitter factor: delay is scaled by a random value in [1-jitter, 1+jitter]
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_true() -> bool {
    true
}

fn default_reconnect_base_ms() -> u64 {
    1000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_jitter() -> f64 {
    0.3
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: default_reconnect_base_ms(),
            max_delay_ms: default_reconnect_max_ms(),
            max_attempts: default_reconnect_attempts(),
            jitter: default_jitter(),
        }
    }
}

/// Defaults applied to circuits registered without overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_failure_window_ms")]
    pub failure_window_ms: u64,

    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_window_ms() -> u64 {
    60_000
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_success_threshold() -> u32 {
    2
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_ms: default_failure_window_ms(),
            reset_timeout_ms: default_reset_timeout_ms(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// Offline operation queue retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineQueueConfig {
    /// First retry delay; doubles per retry
    #[serde(default = "default_retry_base_ms")]
    pub base_retry_delay_ms: u64,

    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

fn default_retry_base_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self {
            base_retry_delay_ms: default_retry_base_ms(),
            default_max_retries: default_max_retries(),
        }
    }
}

impl OfflineQueueConfig {
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }
}

/// Write buffer sizing and dispatch target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBufferSection {
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Oldest queued op may wait this long before a flush is due
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: u32,

    /// Occupancy ratio at which the buffer reports backpressure
    #[serde(default = "default_backpressure_threshold")]
    pub backpressure_threshold: f64,

    /// Auto-flush tick
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_write_role")]
    pub role_name: String,

    #[serde(default = "default_write_zome")]
    pub zome_name: String,

    /// Zome function taking a single write
    #[serde(default = "default_write_fn")]
    pub write_fn_name: String,

    /// Zome function accepting a whole batch; unset = one call per operation
    #[serde(default)]
    pub batch_fn_name: Option<String>,
}

fn default_batch_size() -> u32 {
    50
}

fn default_max_latency_ms() -> u64 {
    100
}

fn default_max_queue_size() -> u32 {
    5000
}

fn default_backpressure_threshold() -> f64 {
    0.8
}

fn default_flush_interval_ms() -> u64 {
    100
}

fn default_write_role() -> String {
    "lamad".to_string()
}

fn default_write_zome() -> String {
    "content_store".to_string()
}

fn default_write_fn() -> String {
    "__doorway_write".to_string()
}

impl Default for WriteBufferSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_latency_ms: default_max_latency_ms(),
            max_queue_size: default_max_queue_size(),
            backpressure_threshold: default_backpressure_threshold(),
            flush_interval_ms: default_flush_interval_ms(),
            role_name: default_write_role(),
            zome_name: default_write_zome(),
            write_fn_name: default_write_fn(),
            batch_fn_name: None,
        }
    }
}

/// Local persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
        }
    }
}

impl StorageConfig {
    /// Path of the sled database
    pub fn db_path(&self) -> PathBuf {
        self.dir.join("state.sled")
    }
}
