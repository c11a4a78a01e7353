//! Conductor Connection Module
//!
//! Everything needed to hold one authenticated session to a conductor,
//! either directly or through a doorway.
//!
//! # Architecture
//!
//! | Module        | Responsibility                                         |
//! |---------------|--------------------------------------------------------|
//! | `transport`   | WebSocket connect/send/receive                         |
//! | `protocol`    | Msgpack encoding, conductor wire format                |
//! | `session`     | Request/response correlation over one socket           |
//! | `credentials` | Signing keys, cap secret, signed zome call payloads    |
//! | `backend`     | Admin/app channel traits and the WebSocket backend     |
//! | `admin`       | Admin channel: apps, interfaces, grants, tokens        |
//! | `app`         | App channel: authenticate, signed zome calls           |
//! | `strategy`    | Direct vs doorway endpoint resolution                  |
//! | `http`        | Cache-friendly HTTP reads through the doorway          |
//! | `backoff`     | Reconnect delay policy                                 |
//! | `state`       | Connection phase machine and observable state          |
//! | `manager`     | Connect sequence, calls, reconnect                     |
//!
//! # Usage
//!
//! ```ignore
//! use elohim_connect::conductor::ConnectionManager;
//!
//! let manager = ConnectionManager::from_config(&config, store)?;
//! manager.connect().await?;
//!
//! let content = manager
//!     .call("lamad", "content_store", "get_content", &json!({"id": "manifesto"}))
//!     .await?;
//! ```
//!
//! Callers never see cells or channels. They name a role, and the manager
//! resolves it against the cells discovered at connect time.

pub mod admin;
pub mod app;
pub mod backend;
pub mod backoff;
pub mod credentials;
pub mod http;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod state;
pub mod strategy;
pub mod transport;

pub use backend::{
    AdminChannel, AppChannel, AppInterfaceInfo, CapabilityGrant, CellId, ConductorBackend,
    InstallAppRequest, InstalledApp, WsBackend,
};
pub use backoff::ReconnectPolicy;
pub use credentials::{CallSigner, SigningCredentials};
pub use http::HttpReader;
pub use manager::{ConnectOverrides, ConnectionManager};
pub use state::{ChannelHandle, ConnectionPhase, ConnectionState, DisplayInfo};
pub use strategy::{strategy_for, ConnectionStrategy, DirectStrategy, DoorwayStrategy};
