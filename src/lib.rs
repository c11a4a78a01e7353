//! Elohim Connect - resilient conductor connection for Elohim clients
//!
//! Keeps one authenticated session to a conductor and makes writes survive
//! it going away.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌────────────────────┐
//!  reads/writes ─►│  BreakerCaller     │  fail fast per "{role}.{zome}" circuit
//!                 └─────────┬──────────┘
//!                           ▼
//!                 ┌────────────────────┐   strategy: direct | doorway
//!                 │ ConnectionManager  │── admin channel + app channel
//!                 └─────────┬──────────┘
//!            connectivity   │  ZomeCaller
//!         ┌─────────────────┼─────────────────┐
//!         ▼                                   ▼
//!  ┌──────────────┐                   ┌────────────────┐
//!  │ OfflineQueue │ per-op retries    │ BufferedWriter │ priority batches
//!  └──────────────┘                   └────────────────┘
//! ```
//!
//! Components are constructed explicitly and share a [`KeyValueStore`] for
//! anything that must survive a restart (signing credentials, queued
//! operations, drained write batches).
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/elohim-connect/
//! ├── state.sled/      # credentials, offline queue, persisted writes
//! └── config.toml      # Configuration
//! ```

pub mod buffered_writer;
pub mod call;
pub mod circuit_breaker;
pub mod conductor;
pub mod config;
pub mod error;
pub mod observable;
pub mod offline_queue;
pub mod store;
pub mod write_buffer;

pub use buffered_writer::{BufferedWriter, FlushResult, WriteTarget};
pub use call::{CallErrorKind, CallOutcome, ZomeCall, ZomeCaller};
pub use circuit_breaker::{
    BreakerCaller, CircuitBreaker, CircuitConfig, CircuitError, CircuitOverrides, CircuitResult,
    CircuitState, CircuitStats,
};
pub use conductor::{ConnectOverrides, ConnectionManager, ConnectionPhase, ConnectionState};
pub use config::{Config, ConnectionMode};
pub use error::{ConnectError, Result};
pub use observable::{ListenerId, Observable};
pub use offline_queue::{NewOperation, OfflineOperation, OfflineQueue, OperationKind, QueueStats, SyncReport};
pub use store::{KeyValueStore, MemoryStore, SledStore};
pub use write_buffer::{
    WriteBatch, WriteBuffer, WriteBufferConfig, WriteBufferStats, WriteOpType, WriteOperation,
    WritePriority, WriteQueue,
};
