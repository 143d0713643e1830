//! In-memory instance tables.
//!
//! All tables live in one [`DaemonState`] behind a single orchestration
//! mutex. Read-modify-write sequences across tables must hold the lock for
//! their whole duration; the dispatcher owns the `Arc<Mutex<DaemonState>>`.

use futures::future::{BoxFuture, Shared};
use multipassd_backend::{MountHandler, VirtualMachine};
use multipassd_common::VMSpecs;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::shutdown::DelayedShutdownTimer;

/// A per-instance readiness wait that concurrent RPCs can attach to.
///
/// Resolves to an error string; empty means the instance came up clean.
pub type ReadinessFuture = Shared<BoxFuture<'static, String>>;

/// The daemon's live tables, guarded by one mutex.
#[derive(Default)]
pub struct DaemonState {
    /// Instances clients can operate on, keyed by name.
    pub operative_instances: HashMap<String, Arc<dyn VirtualMachine>>,
    /// Logically removed instances, restorable via recover.
    pub deleted_instances: HashMap<String, Arc<dyn VirtualMachine>>,
    /// Names currently being created; they exist in no other table yet.
    pub preparing_instances: HashSet<String>,
    /// Pending delayed shutdowns, keyed by instance name.
    pub delayed_shutdowns: HashMap<String, DelayedShutdownTimer>,
    /// Live mount handlers: instance name -> target path -> handler.
    pub mounts: HashMap<String, HashMap<String, Box<dyn MountHandler>>>,
    /// Every MAC address referenced by any spec.
    pub allocated_macs: HashSet<String>,
    /// Durable spec for every instance, operative or deleted.
    pub specs: BTreeMap<String, VMSpecs>,
    /// In-flight readiness waits, at most one per instance name.
    pub readiness: HashMap<String, ReadinessFuture>,
}

impl DaemonState {
    /// Look a handle up in either live table.
    pub fn instance(&self, name: &str) -> Option<Arc<dyn VirtualMachine>> {
        self.operative_instances
            .get(name)
            .or_else(|| self.deleted_instances.get(name))
            .cloned()
    }

    /// Whether any operative instance is currently up.
    pub fn instances_running(&self) -> bool {
        self.operative_instances
            .values()
            .any(|vm| vm.current_state().is_running())
    }

    /// Names that a freshly generated instance name must avoid.
    pub fn used_names(&self) -> HashSet<String> {
        self.operative_instances
            .keys()
            .chain(self.deleted_instances.keys())
            .chain(self.preparing_instances.iter())
            .cloned()
            .collect()
    }
}
