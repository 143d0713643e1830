//! Settings keys the daemon consumes from the settings store.

/// Whether privileged host-directory mounts are allowed.
pub const MOUNTS_KEY: &str = "local.privileged-mounts";

/// Host interface id the `--bridged` network shortcut resolves to.
pub const BRIDGED_INTERFACE_KEY: &str = "local.bridged-network";

/// Hash of the shared passphrase checked by `authenticate`.
pub const PASSPHRASE_KEY: &str = "local.passphrase";

/// Name clients use to request the bridged network shortcut.
pub const BRIDGED_NETWORK_NAME: &str = "bridged";
