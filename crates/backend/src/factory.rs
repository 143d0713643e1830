//! The hypervisor backend factory capability.

use async_trait::async_trait;
use multipassd_common::{NetworkInterface, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::machine::{VirtualMachine, VirtualMachineDescription};
use crate::vault::VMImage;

/// A host network interface the backend can attach instances to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaceInfo {
    pub id: String,
    pub if_type: String,
    pub description: String,
    /// Whether attaching requires the client to authorize bridging first.
    pub needs_authorization: bool,
}

/// The hypervisor backend: creates machines and owns host-side resources.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn create_virtual_machine(
        &self,
        desc: &VirtualMachineDescription,
    ) -> Result<Arc<dyn VirtualMachine>>;

    /// Host interfaces available for extra networks.
    async fn networks(&self) -> Result<Vec<NetworkInterfaceInfo>>;

    /// Verify the hypervisor is usable on this host.
    async fn hypervisor_health_check(&self) -> Result<()>;

    /// Host-side network setup for the requested extra interfaces.
    async fn prepare_networking(&self, extra_interfaces: &mut Vec<NetworkInterface>)
        -> Result<()>;

    /// Turn a fetched base image into this instance's disk.
    async fn prepare_instance_image(
        &self,
        image: &VMImage,
        desc: &VirtualMachineDescription,
    ) -> Result<()>;

    /// Backend-specific adjustments to a machine description before creation.
    async fn configure(&self, desc: &mut VirtualMachineDescription) -> Result<()>;

    /// Remove everything the backend holds for the named instance.
    async fn remove_resources_for(&self, name: &str) -> Result<()>;

    /// Subdirectory of the data/cache dirs this backend keeps its state in.
    fn backend_directory_name(&self) -> &str;

    fn backend_version_string(&self) -> String;
}
