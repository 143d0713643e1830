//! Daemon configuration: filesystem locations plus the injected capability
//! handles the orchestration engine works through.

use multipassd_backend::{
    Backend, BlueprintProvider, ImageVault, Settings, SshConnector, SshKeyProvider,
};
use multipassd_common::config::DaemonPaths;
use std::path::PathBuf;
use std::sync::Arc;

use crate::alloc::NameGenerator;

/// Everything a [`crate::Daemon`] needs to run.
pub struct DaemonConfig {
    pub paths: DaemonPaths,
    pub factory: Arc<dyn Backend>,
    pub vault: Arc<dyn ImageVault>,
    pub blueprint_provider: Arc<dyn BlueprintProvider>,
    pub ssh_key_provider: Arc<dyn SshKeyProvider>,
    pub ssh: Arc<dyn SshConnector>,
    pub settings: Arc<dyn Settings>,
    pub name_generator: Arc<dyn NameGenerator>,
}

impl DaemonConfig {
    /// `<data_dir>/<backend>`: where this backend's catalog and blobs live.
    pub fn backend_data_directory(&self) -> PathBuf {
        DaemonPaths::backend_directory(
            &self.paths.data_directory,
            self.factory.backend_directory_name(),
        )
    }

    /// `<cache_dir>/<backend>`: legacy catalog location.
    pub fn backend_cache_directory(&self) -> PathBuf {
        DaemonPaths::backend_directory(
            &self.paths.cache_directory,
            self.factory.backend_directory_name(),
        )
    }
}
