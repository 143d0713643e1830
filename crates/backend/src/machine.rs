//! The per-instance virtual machine capability.

use async_trait::async_trait;
use multipassd_common::types::SnapshotInfo;
use multipassd_common::{InstanceState, MemorySize, NetworkInterface, Result, VMMount, VMSpecs};
use std::path::PathBuf;
use std::time::Duration;

use crate::mount::MountHandler;
use crate::vault::VMImage;

/// Everything a backend needs to create one virtual machine.
#[derive(Debug, Clone, Default)]
pub struct VirtualMachineDescription {
    pub num_cores: i32,
    pub mem_size: MemorySize,
    pub disk_space: MemorySize,
    pub vm_name: String,
    pub default_mac_address: String,
    pub extra_interfaces: Vec<NetworkInterface>,
    pub ssh_username: String,
    pub image: VMImage,
    pub cloud_init_iso: PathBuf,
    pub meta_data_config: serde_yaml::Value,
    pub user_data_config: serde_yaml::Value,
    pub vendor_data_config: serde_yaml::Value,
    pub network_data_config: serde_yaml::Value,
}

/// One managed virtual machine, as exposed by the hypervisor backend.
///
/// State reads are synchronous (backends cache their last observed state);
/// lifecycle operations and guest waits are asynchronous.
#[async_trait]
pub trait VirtualMachine: Send + Sync {
    fn name(&self) -> &str;

    fn current_state(&self) -> InstanceState;

    /// Force the recorded state. Used by the daemon for transitions it owns,
    /// such as entering and leaving delayed shutdown.
    fn set_state(&self, state: InstanceState);

    async fn start(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;

    async fn suspend(&self) -> Result<()>;

    fn ssh_hostname(&self) -> String;

    fn ssh_port(&self) -> u16;

    fn ssh_username(&self) -> String;

    /// The IPv4 address the daemon reaches the instance at, or empty when
    /// unknown.
    fn management_ipv4(&self) -> String;

    /// All global IPv4 addresses currently configured in the guest.
    async fn get_all_ipv4(&self) -> Vec<String>;

    /// Block until the guest accepts SSH connections.
    async fn wait_until_ssh_up(&self, timeout: Duration) -> Result<()>;

    /// Block until cloud-init finished inside the guest.
    async fn wait_for_cloud_init(&self, timeout: Duration) -> Result<()>;

    /// Capture a snapshot. An empty `name` asks the machine to generate one.
    async fn take_snapshot(
        &self,
        specs: &VMSpecs,
        name: &str,
        comment: &str,
    ) -> Result<SnapshotInfo>;

    /// Apply the named snapshot and write the captured fields back to `specs`.
    async fn restore_snapshot(&self, name: &str, specs: &mut VMSpecs) -> Result<()>;

    fn view_snapshots(&self) -> Vec<SnapshotInfo>;

    fn get_snapshot(&self, name: &str) -> Result<SnapshotInfo>;

    /// Build the backend's own mount handler for a NATIVE mount.
    fn make_native_mount_handler(
        &self,
        target: &str,
        mount: &VMMount,
    ) -> Result<Box<dyn MountHandler>>;
}
