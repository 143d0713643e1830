//! Capability interfaces between the multipassd core and its external
//! collaborators.
//!
//! The orchestration engine never talks to a hypervisor, image store or SSH
//! stack directly; it goes through the traits defined here. Concrete
//! implementations live with the platform integration (and in test code,
//! which substitutes mocks).

pub mod blueprint;
pub mod factory;
pub mod machine;
pub mod mount;
pub mod settings;
pub mod ssh;
pub mod vault;

// Re-export main types
pub use blueprint::{AliasDefinition, BlueprintProvider, ClientLaunchData};
pub use factory::{Backend, NetworkInterfaceInfo};
pub use machine::{VirtualMachine, VirtualMachineDescription};
pub use mount::{MountHandler, SshfsMountHandler};
pub use settings::Settings;
pub use ssh::{SshConnector, SshExec, SshKeyProvider, SshSession};
pub use vault::{ImageVault, ProgressFn, Query, QueryType, VMImage, VMImageInfo};
