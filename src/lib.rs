//! MeshForge gate - single-connection broker for the mesh radio daemon.
//!
//! The mesh daemon's control socket (`127.0.0.1:4403` by default) accepts
//! one client at a time. This crate serializes access to it for every front
//! end in the process and gives callers that lose the race a cached view of
//! the daemon's state instead.
//!
//! # Architecture
//!
//! - **Broker** - the gate itself: acquire/release, holder identity,
//!   connection ownership
//! - **Cache** - read-only fallback snapshots of nodes and device info
//! - **Config** - target, timeouts and cache location, with env overrides
//!
//! # Modules
//!
//! - [`broker`] - [`ConnectionBroker`], scoped guards, connectors
//! - [`cache`] - [`CacheStore`] and real-user cache directory resolution
//! - [`config`] - configuration loading/saving
//! - [`commands`] - handlers behind the `meshforge-gate` binary

// Library modules
pub mod broker;
pub mod cache;
pub mod commands;
pub mod config;

// Re-export commonly used types
pub use broker::{
    AcquireOptions, Acquired, BrokerError, BrokerGuard, BrokerInfo, CloseHandle, ConnectionBroker,
    Connector, DaemonConnection, Link, LinkShutdown, Lookup, SharedConnection, TcpConnector,
};
pub use cache::{CacheKind, CacheStore};
pub use config::Config;
