//! Connection strategies
//!
//! | Strategy          | Admin URL                       | App URL                         | Reads      |
//! |-------------------|---------------------------------|---------------------------------|------------|
//! | `DirectStrategy`  | configured admin URL            | `{app_host}:{port}`             | websocket  |
//! | `DoorwayStrategy` | `wss://{doorway}/hc/admin`      | `wss://{doorway}/hc/app/{port}` | HTTP cache |
//!
//! The strategy is chosen once from configuration and handed to the
//! connection manager at construction.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use super::credentials::SigningCredentials;
use super::http::HttpReader;
use crate::config::{ConnectionConfig, ConnectionMode};
use crate::error::{ConnectError, Result};
use crate::store::KeyValueStore;

/// Environment-specific endpoint resolution and connection hooks.
#[async_trait]
pub trait ConnectionStrategy: Send + Sync {
    fn mode(&self) -> ConnectionMode;

    fn resolve_admin_url(&self) -> Result<String>;

    fn resolve_app_url(&self, port: u16) -> Result<String>;

    /// Base URL for cache-friendly HTTP reads, if this mode has one.
    fn http_base_url(&self) -> Option<String> {
        None
    }

    /// Runs first in every connect attempt.
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Runs on disconnect.
    async fn release(&self) {}

    fn signing_credentials(&self, store: &dyn KeyValueStore) -> Result<SigningCredentials> {
        SigningCredentials::load_or_generate(store)
    }

    /// How long callers issued mid-connect wait for the session.
    fn connect_timeout(&self) -> Duration;
}

// =============================================================================
// Direct
// =============================================================================

/// Local conductor reached directly.
pub struct DirectStrategy {
    admin_url: String,
    app_host: String,
}

impl DirectStrategy {
    pub fn new(admin_url: impl Into<String>, app_host: impl Into<String>) -> Self {
        Self {
            admin_url: admin_url.into(),
            app_host: app_host.into(),
        }
    }
}

#[async_trait]
impl ConnectionStrategy for DirectStrategy {
    fn mode(&self) -> ConnectionMode {
        ConnectionMode::Direct
    }

    fn resolve_admin_url(&self) -> Result<String> {
        Ok(self.admin_url.clone())
    }

    fn resolve_app_url(&self, port: u16) -> Result<String> {
        Ok(format!("{}:{}", self.app_host.trim_end_matches('/'), port))
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }
}

// =============================================================================
// Doorway
// =============================================================================

/// Remote conductor proxied by a doorway, which also serves cached reads.
pub struct DoorwayStrategy {
    http_base: Url,
    ws_base: Url,
    api_key: Option<String>,
    probe: HttpReader,
}

impl DoorwayStrategy {
    pub fn new(doorway_url: &str, api_key: Option<String>) -> Result<Self> {
        let http_base = Url::parse(doorway_url)
            .map_err(|e| ConnectError::Config(format!("Invalid doorway URL '{}': {}", doorway_url, e)))?;

        let ws_scheme = match http_base.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(ConnectError::Config(format!(
                    "Unsupported doorway URL scheme '{}'",
                    other
                )))
            }
        };
        let http_scheme = if ws_scheme == "wss" { "https" } else { "http" };

        let mut ws_base = http_base.clone();
        let mut http = http_base;
        ws_base
            .set_scheme(ws_scheme)
            .map_err(|_| ConnectError::Config("Cannot derive websocket URL".into()))?;
        http.set_scheme(http_scheme)
            .map_err(|_| ConnectError::Config("Cannot derive HTTP URL".into()))?;

        let probe = HttpReader::new(trimmed(&http), api_key.clone())?;
        Ok(Self {
            http_base: http,
            ws_base,
            api_key,
            probe,
        })
    }

    fn ws_url(&self, path: &str) -> String {
        let mut url = format!("{}{}", trimmed(&self.ws_base), path);
        if let Some(key) = &self.api_key {
            url.push_str("?apiKey=");
            url.push_str(key);
        }
        url
    }
}

fn trimmed(url: &Url) -> String {
    url.as_str().trim_end_matches('/').to_string()
}

#[async_trait]
impl ConnectionStrategy for DoorwayStrategy {
    fn mode(&self) -> ConnectionMode {
        ConnectionMode::Doorway
    }

    fn resolve_admin_url(&self) -> Result<String> {
        Ok(self.ws_url("/hc/admin"))
    }

    fn resolve_app_url(&self, port: u16) -> Result<String> {
        Ok(self.ws_url(&format!("/hc/app/{}", port)))
    }

    fn http_base_url(&self) -> Option<String> {
        Some(trimmed(&self.http_base))
    }

    /// Fail fast when the doorway itself is down.
    async fn prepare(&self) -> Result<()> {
        self.probe.probe().await?;
        debug!(doorway = %trimmed(&self.http_base), "Doorway is reachable");
        Ok(())
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }
}

/// Build the strategy named by configuration.
pub fn strategy_for(config: &ConnectionConfig) -> Result<Arc<dyn ConnectionStrategy>> {
    match config.mode {
        ConnectionMode::Direct => {
            info!(admin_url = %config.admin_url, "Using direct connection strategy");
            Ok(Arc::new(DirectStrategy::new(
                config.admin_url.clone(),
                config.app_host.clone(),
            )))
        }
        ConnectionMode::Doorway => {
            let url = config.doorway_url.as_deref().ok_or_else(|| {
                ConnectError::Config("Doorway mode requires connection.doorway_url".into())
            })?;
            info!(doorway = %url, "Using doorway connection strategy");
            Ok(Arc::new(DoorwayStrategy::new(url, config.doorway_api_key.clone())?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_urls() {
        let strategy = DirectStrategy::new("ws://localhost:4444", "ws://localhost/");
        assert_eq!(strategy.resolve_admin_url().unwrap(), "ws://localhost:4444");
        assert_eq!(strategy.resolve_app_url(4445).unwrap(), "ws://localhost:4445");
        assert!(strategy.http_base_url().is_none());
    }

    #[test]
    fn test_doorway_urls() {
        let strategy =
            DoorwayStrategy::new("https://doorway.elohim.host/", Some("k3y".into())).unwrap();
        assert_eq!(
            strategy.resolve_admin_url().unwrap(),
            "wss://doorway.elohim.host/hc/admin?apiKey=k3y"
        );
        assert_eq!(
            strategy.resolve_app_url(4445).unwrap(),
            "wss://doorway.elohim.host/hc/app/4445?apiKey=k3y"
        );
        assert_eq!(
            strategy.http_base_url().as_deref(),
            Some("https://doorway.elohim.host")
        );
    }

    #[test]
    fn test_plain_http_doorway() {
        let strategy = DoorwayStrategy::new("http://localhost:8888", None).unwrap();
        assert_eq!(strategy.resolve_admin_url().unwrap(), "ws://localhost:8888/hc/admin");
    }

    #[test]
    fn test_strategy_for_requires_doorway_url() {
        let config = ConnectionConfig {
            mode: ConnectionMode::Doorway,
            ..Default::default()
        };
        assert!(matches!(strategy_for(&config), Err(ConnectError::Config(_))));
    }
}
