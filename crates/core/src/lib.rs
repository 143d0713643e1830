//! Orchestration engine of the multipassd daemon.
//!
//! The daemon coordinates many independent long-running virtual machines
//! under concurrent client requests while keeping durable state consistent
//! with live state. This crate holds the engine: the in-memory registry, the
//! per-instance state rules, the RPC command dispatcher, the persisted
//! instance catalog, the MAC and name allocators, the cloud-init seed
//! builder, the mount manager and the asynchronous readiness pipeline that
//! follows VM starts.
//!
//! The hypervisor, image vault, blueprint provider, SSH transport and
//! settings store are reached only through the capability traits of
//! `multipassd-backend`; the RPC server framing is the caller's concern and
//! talks to [`Daemon`] through one async method per verb.

pub mod alloc;
pub mod catalog;
pub mod cloudinit;
pub mod config;
pub mod daemon;
pub mod maintenance;
pub mod mounts;
pub mod registry;
pub mod rpc;
pub mod select;
pub mod shutdown;
pub mod validate;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types
pub use config::DaemonConfig;
pub use daemon::Daemon;
pub use rpc::{ReplyStream, Status};

/// Version string reported by the `version` RPC.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
