//! Common types and utilities shared across the multipassd daemon.
//!
//! This crate provides:
//! - Core domain types (instance state, specs, interfaces, mounts)
//! - Memory size parsing and comparison
//! - Error handling types
//! - Configuration structures
//! - Settings key constants

pub mod config;
pub mod error;
pub mod memory;
pub mod settings;
pub mod types;

// Re-export commonly used items
pub use error::{Error, Result};
pub use memory::MemorySize;
pub use types::{InstanceState, MountKind, NetworkInterface, VMMount, VMSpecs};
