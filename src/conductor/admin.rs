//! Admin interface channel
//!
//! One persistent admin socket per connect. Provisioning, capability grants,
//! interface discovery and token issue all go through it, then it is kept
//! open until disconnect.

use async_trait::async_trait;
use rmpv::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use super::backend::{
    AdminChannel, AppInterfaceInfo, CapabilityGrant, CellId, InstallAppRequest, InstalledApp,
};
use super::protocol::{as_bytes, get_field, get_str, inner_request, response_value};
use super::session::Session;
use super::transport::{redact, Transport};
use crate::error::{ConnectError, Result};

pub struct WsAdminChannel {
    session: Session,
}

impl WsAdminChannel {
    pub async fn connect(url: &str, connect_timeout: Duration, request_timeout: Duration) -> Result<Self> {
        let transport = Transport::connect(url, connect_timeout).await?;
        info!(url = %redact(url), "Connected to admin interface");
        Ok(Self {
            session: Session::start("admin", transport, request_timeout),
        })
    }

    async fn request(&self, request_type: &str, value: Value) -> Result<Value> {
        debug!(request = request_type, "Admin request");
        self.session.request(&inner_request(request_type, value)).await
    }
}

fn map(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Value::String(k.into()), v))
            .collect(),
    )
}

fn expect_value<'a>(inner: &'a Value, operation: &str) -> Result<&'a Value> {
    response_value(inner)
        .ok_or_else(|| ConnectError::Protocol(format!("{} response has no value", operation)))
}

#[async_trait]
impl AdminChannel for WsAdminChannel {
    async fn list_apps(&self) -> Result<Vec<InstalledApp>> {
        let inner = self
            .request("list_apps", map(vec![("status_filter", Value::Nil)]))
            .await?;
        let apps = expect_value(&inner, "list_apps")?
            .as_array()
            .ok_or_else(|| ConnectError::Protocol("list_apps value is not an array".into()))?;
        Ok(apps.iter().filter_map(parse_app_info).collect())
    }

    async fn generate_agent_pub_key(&self) -> Result<Vec<u8>> {
        let inner = self.request("generate_agent_pub_key", Value::Nil).await?;
        expect_value(&inner, "generate_agent_pub_key")
            .ok()
            .and_then(as_bytes)
            .ok_or_else(|| ConnectError::Protocol("generate_agent_pub_key returned no key".into()))
    }

    async fn install_app(&self, request: &InstallAppRequest) -> Result<()> {
        self.request(
            "install_app",
            map(vec![
                ("installed_app_id", Value::String(request.installed_app_id.as_str().into())),
                ("agent_key", Value::Binary(request.agent_key.clone())),
                ("path", Value::String(request.bundle_path.as_str().into())),
            ]),
        )
        .await?;
        Ok(())
    }

    async fn enable_app(&self, installed_app_id: &str) -> Result<()> {
        self.request(
            "enable_app",
            map(vec![("installed_app_id", Value::String(installed_app_id.into()))]),
        )
        .await?;
        Ok(())
    }

    async fn grant_zome_call_capability(&self, grant: &CapabilityGrant) -> Result<()> {
        let access = map(vec![(
            "Assigned",
            map(vec![
                ("secret", Value::Binary(grant.cap_secret.clone())),
                ("assignees", Value::Array(vec![Value::Binary(grant.signing_key.clone())])),
            ]),
        )]);
        let cap_grant = map(vec![
            ("tag", Value::String(grant.tag.as_str().into())),
            ("access", access),
            ("functions", map(vec![("All", Value::Nil)])),
        ]);
        self.request(
            "grant_zome_call_capability",
            map(vec![("cell_id", grant.cell_id.to_value()), ("cap_grant", cap_grant)]),
        )
        .await?;
        Ok(())
    }

    async fn list_app_interfaces(&self) -> Result<Vec<AppInterfaceInfo>> {
        let inner = self.request("list_app_interfaces", Value::Nil).await?;
        let interfaces = match response_value(&inner) {
            Some(Value::Array(items)) => items,
            _ => return Ok(Vec::new()),
        };
        Ok(interfaces
            .iter()
            .filter_map(|iface| match iface {
                // Older conductors list bare ports
                Value::Integer(port) => port.as_u64().and_then(|p| u16::try_from(p).ok()).map(|port| {
                    AppInterfaceInfo {
                        port,
                        installed_app_id: None,
                    }
                }),
                Value::Map(m) => {
                    let port = get_field(m, "port")?.as_u64().and_then(|p| u16::try_from(p).ok())?;
                    Some(AppInterfaceInfo {
                        port,
                        installed_app_id: get_str(m, "installed_app_id").map(str::to_string),
                    })
                }
                _ => None,
            })
            .collect())
    }

    async fn attach_app_interface(
        &self,
        port: u16,
        allowed_origins: &str,
        installed_app_id: Option<&str>,
    ) -> Result<u16> {
        let port_value = if port == 0 {
            Value::Nil
        } else {
            Value::Integer(port.into())
        };
        let inner = self
            .request(
                "attach_app_interface",
                map(vec![
                    ("port", port_value),
                    ("allowed_origins", Value::String(allowed_origins.into())),
                    (
                        "installed_app_id",
                        installed_app_id.map_or(Value::Nil, |id| Value::String(id.into())),
                    ),
                ]),
            )
            .await?;
        let bound = match expect_value(&inner, "attach_app_interface")? {
            Value::Map(m) => get_field(m, "port").and_then(Value::as_u64),
            other => other.as_u64(),
        };
        bound
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| ConnectError::Protocol("attach_app_interface returned no port".into()))
    }

    async fn issue_app_authentication_token(
        &self,
        installed_app_id: &str,
        expiry_secs: u64,
    ) -> Result<Vec<u8>> {
        let inner = self
            .request(
                "issue_app_authentication_token",
                map(vec![
                    ("installed_app_id", Value::String(installed_app_id.into())),
                    ("expiry_seconds", Value::Integer(expiry_secs.into())),
                    ("single_use", Value::Boolean(false)),
                ]),
            )
            .await?;
        match expect_value(&inner, "issue_app_authentication_token")? {
            Value::Map(m) => get_field(m, "token").and_then(as_bytes),
            _ => None,
        }
        .ok_or_else(|| ConnectError::Auth("Token response has no 'token' field".into()))
    }

    async fn close(&self) {
        self.session.close().await;
    }
}

/// Parse one `AppInfo`. Apps without an id are skipped.
fn parse_app_info(app: &Value) -> Option<InstalledApp> {
    let info = app.as_map()?;
    let installed_app_id = get_str(info, "installed_app_id")?.to_string();

    let mut cells: BTreeMap<String, Vec<CellId>> = BTreeMap::new();
    if let Some(Value::Map(roles)) = get_field(info, "cell_info") {
        for (role, entries) in roles {
            let Some(role) = role.as_str() else { continue };
            let provisioned = entries
                .as_array()
                .map(|list| list.iter().filter_map(provisioned_cell_id).collect())
                .unwrap_or_default();
            cells.insert(role.to_string(), provisioned);
        }
    }

    let agent_pub_key = get_field(info, "agent_pub_key")
        .and_then(as_bytes)
        .or_else(|| {
            cells
                .values()
                .flatten()
                .next()
                .map(|c| c.agent_pub_key.clone())
        })?;

    Some(InstalledApp {
        installed_app_id,
        agent_pub_key,
        cells,
    })
}

/// Cell id of a provisioned cell. Cloned and stem cells are not addressed by role.
///
/// Accepts `{ type: "provisioned", value: { cell_id } }`, `{ provisioned: { cell_id } }`
/// and a bare `{ cell_id }`.
fn provisioned_cell_id(cell_info: &Value) -> Option<CellId> {
    let m = cell_info.as_map()?;
    let cell = match get_str(m, "type") {
        Some("provisioned") => get_field(m, "value")?.as_map()?,
        Some(_) => return None,
        None => match get_field(m, "provisioned") {
            Some(Value::Map(inner)) => inner,
            _ => m,
        },
    };
    let ids = get_field(cell, "cell_id")?.as_array()?;
    if ids.len() < 2 {
        return None;
    }
    Some(CellId::new(as_bytes(&ids[0])?, as_bytes(&ids[1])?))
}
