//! Mount bookkeeping: building handlers, (re)initializing them from specs
//! and tearing them down around state transitions.

use multipassd_backend::{MountHandler, SshfsMountHandler, VirtualMachine};
use multipassd_common::{MountKind, Result, VMMount};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::DaemonConfig;
use crate::registry::DaemonState;

/// Build the handler for one mount: SSHFS for CLASSIC, the backend's own for
/// NATIVE.
pub fn make_mount(
    config: &DaemonConfig,
    vm: &Arc<dyn VirtualMachine>,
    target: &str,
    mount: &VMMount,
) -> Result<Box<dyn MountHandler>> {
    match mount.mount_kind {
        MountKind::Classic => Ok(Box::new(SshfsMountHandler::new(
            vm.name(),
            vm.ssh_hostname(),
            vm.ssh_port(),
            vm.ssh_username(),
            target,
            mount.clone(),
            config.ssh.clone(),
            config.ssh_key_provider.clone(),
        ))),
        MountKind::Native => vm.make_native_mount_handler(target, mount),
    }
}

/// Build handlers for every spec'd mount of `name` that has none yet.
/// Mounts whose handler cannot be built are dropped from the spec; returns
/// whether the spec changed (and so needs persisting).
pub fn init_mounts(state: &mut DaemonState, config: &DaemonConfig, name: &str) -> bool {
    let Some(vm) = state.operative_instances.get(name).cloned() else {
        return false;
    };
    let Some(spec) = state.specs.get_mut(name) else {
        return false;
    };

    let vm_mounts = state.mounts.entry(name.to_string()).or_default();
    let mut mounts_to_remove = Vec::new();
    for (target, vm_mount) in &spec.mounts {
        if vm_mounts.contains_key(target) {
            continue;
        }
        match make_mount(config, &vm, target, vm_mount) {
            Ok(handler) => {
                vm_mounts.insert(target.clone(), handler);
            }
            Err(e) => {
                tracing::warn!(
                    r#"Removing mount "{}" => "{}" from '{}': {}"#,
                    vm_mount.source_path,
                    target,
                    name,
                    e
                );
                mounts_to_remove.push(target.clone());
            }
        }
    }

    for target in &mounts_to_remove {
        spec.mounts.remove(target);
    }
    !mounts_to_remove.is_empty()
}

/// Deactivate every handler the backend does not manage itself. Used around
/// stop, suspend, restart and delayed shutdowns; errors are swallowed.
pub async fn stop_mounts(name: &str, handlers: &mut HashMap<String, Box<dyn MountHandler>>) {
    for (target, handler) in handlers.iter_mut() {
        if handler.is_mount_managed_by_backend() {
            continue;
        }
        if let Err(e) = handler.deactivate(true).await {
            tracing::warn!(
                instance = %name,
                target = %target,
                error = %e,
                "Failed to deactivate mount"
            );
        }
    }
}

/// Lexically normalize a target path: collapse separators, resolve `.` and
/// `..` without touching the filesystem.
pub fn clean_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if let Some(last) = parts.last() {
                    if *last != ".." {
                        parts.pop();
                        continue;
                    }
                }
                if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

const RESERVED_TARGET_PREFIXES: &[&str] = &[
    "/bin", "/boot", "/dev", "/etc", "/init", "/lib", "/proc", "/root", "/run", "/sbin", "/snap",
    "/sys", "/usr", "/var",
];

/// Targets the daemon refuses to mount over.
pub fn invalid_target_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    RESERVED_TARGET_PREFIXES
        .iter()
        .any(|prefix| path == *prefix || path.starts_with(&format!("{}/", prefix)))
}
