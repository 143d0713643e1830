//! Configuration structures for the multipassd daemon.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Filesystem and timing configuration for the daemon.
///
/// The capability handles (backend factory, image vault, settings store, ...)
/// are injected separately; this is the part that comes from a config file or
/// the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonPaths {
    /// Where specs, images and per-instance data live.
    pub data_directory: PathBuf,
    /// Legacy location checked for the instance catalog before giving up.
    pub cache_directory: PathBuf,
    /// Default username set up in guests.
    #[serde(default = "default_ssh_username")]
    pub ssh_username: String,
    /// Interval between image maintenance runs, in seconds.
    #[serde(default = "default_image_refresh_secs")]
    pub image_refresh_secs: u64,
}

fn default_ssh_username() -> String {
    "ubuntu".to_string()
}

fn default_image_refresh_secs() -> u64 {
    // Six hours.
    6 * 60 * 60
}

impl DaemonPaths {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?
            .try_deserialize()
    }

    pub fn image_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.image_refresh_secs)
    }

    /// The per-backend subdirectory of `dir` for the given backend name.
    pub fn backend_directory(dir: &std::path::Path, backend_name: &str) -> PathBuf {
        dir.join(backend_name)
    }
}

/// Timeout applied to readiness waits when the client passes zero.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let paths: DaemonPaths = serde_json::from_value(serde_json::json!({
            "data_directory": "/var/lib/multipassd/data",
            "cache_directory": "/var/cache/multipassd",
        }))
        .unwrap();
        assert_eq!(paths.ssh_username, "ubuntu");
        assert_eq!(
            paths.image_refresh_interval(),
            Duration::from_secs(6 * 60 * 60)
        );
    }

    #[test]
    fn test_backend_directory() {
        let dir = DaemonPaths::backend_directory(std::path::Path::new("/data"), "qemu");
        assert_eq!(dir, PathBuf::from("/data/qemu"));
    }
}
