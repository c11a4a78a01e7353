//! Cache-friendly HTTP read path
//!
//! Side-effect-free zome calls can go through the doorway's HTTP API, where
//! responses are cacheable:
//!
//! ```text
//! POST {base}/api/v1/zome/{dna_hash}/{zome}/{fn}   body: JSON payload
//! GET  {base}/health                               liveness probe
//! ```

use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

use super::backend::CellId;
use crate::error::{ConnectError, Result};

/// Fixed timeout for the liveness probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for reads
const READ_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpReader {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpReader {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(READ_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn zome_url(&self, cell: &CellId, zome_name: &str, fn_name: &str) -> String {
        format!(
            "{}/api/v1/zome/{}/{}/{}",
            self.base_url,
            cell.dna_hash_string(),
            zome_name,
            fn_name
        )
    }

    pub async fn read(
        &self,
        cell: &CellId,
        zome_name: &str,
        fn_name: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let url = self.zome_url(cell, zome_name, fn_name);
        debug!(url = %url, "HTTP zome read");

        let mut request = self.http.post(&url).json(payload);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ConnectError::Connection(format!("HTTP read failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(classify_status(status, body))
    }

    /// Short liveness probe against `/health`.
    pub async fn probe(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| ConnectError::Connection(format!("Probe of {} failed: {}", url, e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ConnectError::Connection(format!(
                "Probe of {} returned {}",
                url,
                response.status()
            )))
        }
    }
}

/// Gateway failures mean the conductor is unreachable; anything else is the call's fault.
fn classify_status(status: StatusCode, body: String) -> ConnectError {
    match status {
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            ConnectError::Connection(format!("HTTP {}: {}", status, body))
        }
        _ => ConnectError::Zome(format!("HTTP {}: {}", status, body)),
    }
}
