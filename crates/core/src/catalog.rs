//! The persisted instance catalog.
//!
//! One JSON document maps instance name to spec. The whole document is
//! rewritten atomically after any mutation; at startup it is loaded from the
//! primary data directory, falling back to the legacy cache location. The
//! field names and value encodings are compatibility-critical.

use multipassd_common::memory::{size_or_default, DEFAULT_DISK_SIZE, DEFAULT_MEM_SIZE};
use multipassd_common::types::unique_id_mappings;
use multipassd_common::{
    Error, InstanceState, MemorySize, MountKind, NetworkInterface, Result, VMMount, VMSpecs,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use crate::alloc::valid_mac_address;

pub const INSTANCE_DB_NAME: &str = "multipassd-vm-instances.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UidMapRecord {
    host_uid: i32,
    instance_uid: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GidMapRecord {
    host_gid: i32,
    instance_gid: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MountRecord {
    #[serde(default)]
    source_path: String,
    #[serde(default)]
    target_path: String,
    #[serde(default)]
    uid_mappings: Vec<UidMapRecord>,
    #[serde(default)]
    gid_mappings: Vec<GidMapRecord>,
    #[serde(default)]
    mount_type: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct InterfaceRecord {
    #[serde(default)]
    id: String,
    #[serde(default)]
    mac_address: String,
    #[serde(default)]
    auto_mode: bool,
}

/// On-disk shape of one instance record. Field names are byte-exact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SpecRecord {
    #[serde(default)]
    num_cores: i32,
    #[serde(default)]
    mem_size: String,
    #[serde(default)]
    disk_space: String,
    #[serde(default)]
    ssh_username: String,
    #[serde(default)]
    state: i64,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    metadata: serde_json::Value,
    #[serde(default)]
    mac_addr: String,
    #[serde(default)]
    extra_interfaces: Vec<InterfaceRecord>,
    #[serde(default)]
    mounts: Vec<MountRecord>,
}

fn read_extra_interfaces(record: &SpecRecord) -> Result<Vec<NetworkInterface>> {
    let mut extra_interfaces = Vec::with_capacity(record.extra_interfaces.len());
    for entry in &record.extra_interfaces {
        if !valid_mac_address(&entry.mac_address) {
            return Err(Error::Runtime(format!(
                "Invalid MAC address {}",
                entry.mac_address
            )));
        }
        extra_interfaces.push(NetworkInterface {
            id: entry.id.clone(),
            mac_address: entry.mac_address.clone(),
            auto_mode: entry.auto_mode,
        });
    }
    Ok(extra_interfaces)
}

fn metadata_is_empty(metadata: &serde_json::Value) -> bool {
    match metadata {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn bytes_or_zero(size: &str) -> u64 {
    size.parse::<MemorySize>()
        .map(|s| s.in_bytes())
        .unwrap_or(0)
}

fn spec_from_record(key: &str, record: SpecRecord) -> Result<Option<VMSpecs>> {
    // Records with every field trivially empty are ghosts left behind by
    // interrupted creations.
    if record.num_cores == 0
        && !record.deleted
        && record.ssh_username.is_empty()
        && metadata_is_empty(&record.metadata)
        && bytes_or_zero(&record.mem_size) == 0
        && bytes_or_zero(&record.disk_space) == 0
    {
        tracing::warn!("Ignoring ghost instance in database: {}", key);
        return Ok(None);
    }

    let ssh_username = if record.ssh_username.is_empty() {
        "ubuntu".to_string()
    } else {
        record.ssh_username.clone()
    };

    if !valid_mac_address(&record.mac_addr) {
        return Err(Error::Runtime(format!(
            "Invalid MAC address {}",
            record.mac_addr
        )));
    }

    let extra_interfaces = read_extra_interfaces(&record)?;

    let mut mounts = BTreeMap::new();
    for entry in &record.mounts {
        let uid_mappings = unique_id_mappings(
            entry
                .uid_mappings
                .iter()
                .map(|m| (m.host_uid, m.instance_uid))
                .collect(),
        );
        let gid_mappings = unique_id_mappings(
            entry
                .gid_mappings
                .iter()
                .map(|m| (m.host_gid, m.instance_gid))
                .collect(),
        );
        mounts.insert(
            entry.target_path.clone(),
            VMMount {
                source_path: entry.source_path.clone(),
                uid_mappings,
                gid_mappings,
                mount_kind: MountKind::from_code(entry.mount_type),
            },
        );
    }

    Ok(Some(VMSpecs {
        num_cores: record.num_cores,
        mem_size: size_or_default(&record.mem_size, DEFAULT_MEM_SIZE)?,
        disk_space: size_or_default(&record.disk_space, DEFAULT_DISK_SIZE)?,
        default_mac_address: record.mac_addr,
        extra_interfaces,
        ssh_username,
        state: InstanceState::from_code(record.state),
        mounts,
        deleted: record.deleted,
        metadata: if record.metadata.is_null() {
            serde_json::json!({})
        } else {
            record.metadata
        },
    }))
}

fn record_from_spec(spec: &VMSpecs) -> SpecRecord {
    SpecRecord {
        num_cores: spec.num_cores,
        mem_size: spec.mem_size.in_bytes().to_string(),
        disk_space: spec.disk_space.in_bytes().to_string(),
        ssh_username: spec.ssh_username.clone(),
        state: spec.state.code(),
        deleted: spec.deleted,
        metadata: spec.metadata.clone(),
        mac_addr: spec.default_mac_address.clone(),
        extra_interfaces: spec
            .extra_interfaces
            .iter()
            .map(|iface| InterfaceRecord {
                id: iface.id.clone(),
                mac_address: iface.mac_address.clone(),
                auto_mode: iface.auto_mode,
            })
            .collect(),
        mounts: spec
            .mounts
            .iter()
            .map(|(target, mount)| MountRecord {
                source_path: mount.source_path.clone(),
                target_path: target.clone(),
                uid_mappings: mount
                    .uid_mappings
                    .iter()
                    .map(|&(host_uid, instance_uid)| UidMapRecord {
                        host_uid,
                        instance_uid,
                    })
                    .collect(),
                gid_mappings: mount
                    .gid_mappings
                    .iter()
                    .map(|&(host_gid, instance_gid)| GidMapRecord {
                        host_gid,
                        instance_gid,
                    })
                    .collect(),
                mount_type: mount.mount_kind.code(),
            })
            .collect(),
    }
}

/// Load all specs, trying the primary data directory first and the legacy
/// cache directory second. A missing or malformed document loads as empty.
pub fn load_db(data_path: &Path, cache_path: &Path) -> Result<BTreeMap<String, VMSpecs>> {
    let contents = match std::fs::read(data_path.join(INSTANCE_DB_NAME)) {
        Ok(c) => c,
        Err(_) => match std::fs::read(cache_path.join(INSTANCE_DB_NAME)) {
            Ok(c) => c,
            Err(_) => return Ok(BTreeMap::new()),
        },
    };

    let records: serde_json::Map<String, serde_json::Value> =
        match serde_json::from_slice(&contents) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => return Ok(BTreeMap::new()),
        };

    let mut reconstructed = BTreeMap::new();
    for (key, value) in records {
        match &value {
            serde_json::Value::Object(map) if !map.is_empty() => {}
            _ => return Ok(BTreeMap::new()),
        }

        let record: SpecRecord = serde_json::from_value(value)?;
        if let Some(spec) = spec_from_record(&key, record)? {
            reconstructed.insert(key, spec);
        }
    }

    Ok(reconstructed)
}

/// Atomically rewrite the whole catalog under `data_path`.
pub fn persist_db(data_path: &Path, specs: &BTreeMap<String, VMSpecs>) -> Result<()> {
    std::fs::create_dir_all(data_path)?;

    let records: BTreeMap<&String, SpecRecord> = specs
        .iter()
        .map(|(name, spec)| (name, record_from_spec(spec)))
        .collect();
    let contents = serde_json::to_vec_pretty(&records)?;

    let mut file = tempfile::NamedTempFile::new_in(data_path)?;
    file.write_all(&contents)?;
    file.persist(data_path.join(INSTANCE_DB_NAME))
        .map_err(|e| Error::Io(e.error))?;

    Ok(())
}
