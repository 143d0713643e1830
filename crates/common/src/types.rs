//! Domain types used throughout the multipassd daemon.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::memory::MemorySize;

/// Lifecycle state of a virtual machine instance.
///
/// The integer values are persisted in the instance catalog and must not be
/// reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Off,
    Stopped,
    Starting,
    Restarting,
    Running,
    DelayedShutdown,
    Suspending,
    Suspended,
    Unknown,
}

impl InstanceState {
    /// Decode the catalog's integer representation. Out-of-range values map
    /// to `Unknown`.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Off,
            1 => Self::Stopped,
            2 => Self::Starting,
            3 => Self::Restarting,
            4 => Self::Running,
            5 => Self::DelayedShutdown,
            6 => Self::Suspending,
            7 => Self::Suspended,
            _ => Self::Unknown,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::Off => 0,
            Self::Stopped => 1,
            Self::Starting => 2,
            Self::Restarting => 3,
            Self::Running => 4,
            Self::DelayedShutdown => 5,
            Self::Suspending => 6,
            Self::Suspended => 7,
            Self::Unknown => 8,
        }
    }

    /// Whether the instance is up from a client's point of view.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::DelayedShutdown)
    }

    /// Terminal rest states that a stop request leaves untouched.
    pub fn is_at_rest(&self) -> bool {
        matches!(self, Self::Off | Self::Stopped | Self::Suspended)
    }
}

impl Default for InstanceState {
    fn default() -> Self {
        Self::Off
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Off => "off",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Restarting => "restarting",
            Self::Running => "running",
            Self::DelayedShutdown => "delayed shutdown",
            Self::Suspending => "suspending",
            Self::Suspended => "suspended",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// One extra network interface attached to an instance.
///
/// An empty `mac_address` means "allocate one". Order matters: cloud-init
/// numbers extra interfaces by position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub id: String,
    pub mac_address: String,
    pub auto_mode: bool,
}

/// How a host directory is mounted into the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountKind {
    /// Daemon-supplied SSHFS mount; needs the helper snap on the guest.
    Classic,
    /// Backend-supplied mount (e.g. virtiofs).
    Native,
}

impl MountKind {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Native,
            _ => Self::Classic,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::Classic => 0,
            Self::Native => 1,
        }
    }
}

/// Durable description of one mount, keyed by target path in the spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VMMount {
    pub source_path: String,
    pub uid_mappings: Vec<(i32, i32)>,
    pub gid_mappings: Vec<(i32, i32)>,
    pub mount_kind: MountKind,
}

impl VMMount {
    pub fn new(
        source_path: impl Into<String>,
        uid_mappings: Vec<(i32, i32)>,
        gid_mappings: Vec<(i32, i32)>,
        mount_kind: MountKind,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            uid_mappings: unique_id_mappings(uid_mappings),
            gid_mappings: unique_id_mappings(gid_mappings),
            mount_kind,
        }
    }
}

/// Deduplicate id mappings, preserving first-seen order.
pub fn unique_id_mappings(mappings: Vec<(i32, i32)>) -> Vec<(i32, i32)> {
    let mut seen = std::collections::HashSet::new();
    mappings
        .into_iter()
        .filter(|m| seen.insert(*m))
        .collect()
}

/// Durable description of one VM instance; the unit the catalog persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VMSpecs {
    pub num_cores: i32,
    pub mem_size: MemorySize,
    pub disk_space: MemorySize,
    pub default_mac_address: String,
    pub extra_interfaces: Vec<NetworkInterface>,
    pub ssh_username: String,
    pub state: InstanceState,
    pub mounts: BTreeMap<String, VMMount>,
    pub deleted: bool,
    pub metadata: serde_json::Value,
}

impl VMSpecs {
    /// All MAC addresses referenced by this spec: the default one plus every
    /// extra interface's.
    pub fn mac_set(&self) -> std::collections::HashSet<String> {
        let mut macs = std::collections::HashSet::new();
        macs.insert(self.default_mac_address.clone());
        for iface in &self.extra_interfaces {
            macs.insert(iface.mac_address.clone());
        }
        macs
    }
}

/// The name, parent and comment identifying one snapshot of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub parent: String,
    pub comment: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes_round_trip() {
        for code in 0..=8 {
            let state = InstanceState::from_code(code);
            assert_eq!(state.code(), code);
        }
        assert_eq!(InstanceState::from_code(42), InstanceState::Unknown);
    }

    #[test]
    fn test_state_predicates() {
        assert!(InstanceState::Running.is_running());
        assert!(InstanceState::DelayedShutdown.is_running());
        assert!(!InstanceState::Starting.is_running());

        assert!(InstanceState::Off.is_at_rest());
        assert!(InstanceState::Suspended.is_at_rest());
        assert!(!InstanceState::Running.is_at_rest());
    }

    #[test]
    fn test_unique_id_mappings_preserves_order() {
        let deduped = unique_id_mappings(vec![(1000, 0), (1001, 1), (1000, 0), (1000, 2)]);
        assert_eq!(deduped, vec![(1000, 0), (1001, 1), (1000, 2)]);
    }

    #[test]
    fn test_mac_set_collects_all_interfaces() {
        let specs = VMSpecs {
            num_cores: 1,
            mem_size: "1G".parse().unwrap(),
            disk_space: "5G".parse().unwrap(),
            default_mac_address: "52:54:00:aa:bb:cc".into(),
            extra_interfaces: vec![NetworkInterface {
                id: "eth1".into(),
                mac_address: "52:54:00:dd:ee:ff".into(),
                auto_mode: true,
            }],
            ssh_username: "ubuntu".into(),
            state: InstanceState::Off,
            mounts: BTreeMap::new(),
            deleted: false,
            metadata: serde_json::json!({}),
        };

        let macs = specs.mac_set();
        assert_eq!(macs.len(), 2);
        assert!(macs.contains("52:54:00:aa:bb:cc"));
        assert!(macs.contains("52:54:00:dd:ee:ff"));
    }
}
