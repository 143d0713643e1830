//! Mount handlers.
//!
//! A mount handler owns one target path inside one instance. CLASSIC mounts
//! are driven by the daemon over SSH using the guest's multipass-sshfs snap;
//! NATIVE mounts come from the backend itself (see
//! [`crate::machine::VirtualMachine::make_native_mount_handler`]).

use async_trait::async_trait;
use multipassd_common::{Error, Result, VMMount};
use std::sync::Arc;

use crate::ssh::{SshConnector, SshKeyProvider, SshSession};

/// Lifecycle of one mount inside one instance.
#[async_trait]
pub trait MountHandler: Send + Sync {
    /// Establish the mount in the guest.
    async fn activate(&mut self) -> Result<()>;

    /// Tear the mount down. With `force`, errors are swallowed.
    async fn deactivate(&mut self, force: bool) -> Result<()>;

    /// Whether the backend keeps this mount alive without daemon help.
    fn is_mount_managed_by_backend(&self) -> bool;
}

/// SSHFS-over-SSH mount driven from the daemon side.
pub struct SshfsMountHandler {
    instance: String,
    host: String,
    port: u16,
    username: String,
    target: String,
    mount: VMMount,
    connector: Arc<dyn SshConnector>,
    keys: Arc<dyn SshKeyProvider>,
    session: Option<Box<dyn SshSession>>,
}

impl SshfsMountHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        target: impl Into<String>,
        mount: VMMount,
        connector: Arc<dyn SshConnector>,
        keys: Arc<dyn SshKeyProvider>,
    ) -> Self {
        Self {
            instance: instance.into(),
            host: host.into(),
            port,
            username: username.into(),
            target: target.into(),
            mount,
            connector,
            keys,
            session: None,
        }
    }

    /// Locate the snap-provided sshfs in the guest, or fail with the
    /// dedicated missing-sshfs error.
    async fn find_sshfs(&self, session: &mut dyn SshSession) -> Result<(String, String)> {
        let env = session.exec("snap run multipass-sshfs.env").await?;
        if !env.succeeded() {
            return Err(Error::SshfsMissing(self.instance.clone()));
        }

        let mut ld_library_path = String::new();
        let mut snap_dir = String::new();
        for line in env.stdout.lines() {
            if let Some(value) = line.strip_prefix("LD_LIBRARY_PATH=") {
                ld_library_path = value.to_string();
            } else if let Some(value) = line.strip_prefix("SNAP=") {
                snap_dir = value.to_string();
            }
        }
        if snap_dir.is_empty() {
            return Err(Error::SshfsMissing(self.instance.clone()));
        }

        Ok((ld_library_path, snap_dir))
    }
}

/// Major component of "FUSE library version: X.Y.Z", if it parses.
fn fuse_major_version(version_output: &str) -> Option<u32> {
    let version = version_output
        .lines()
        .find_map(|l| l.strip_prefix("FUSE library version:"))?
        .trim();
    version.split('.').next()?.parse().ok()
}

#[async_trait]
impl MountHandler for SshfsMountHandler {
    async fn activate(&mut self) -> Result<()> {
        let mut session = self
            .connector
            .connect(&self.host, self.port, &self.username, self.keys.as_ref())
            .await?;

        let (ld_library_path, snap_dir) = self.find_sshfs(session.as_mut()).await?;
        let sshfs = format!(
            "sudo env LD_LIBRARY_PATH={} {}/bin/sshfs",
            ld_library_path, snap_dir
        );

        let version = session.exec(&format!("{} -V", sshfs)).await?;
        let mut options = String::from("-o slave -o transform_symlinks -o allow_other");
        match fuse_major_version(&version.stdout) {
            Some(major) if major < 3 => options.push_str(" -o nonempty"),
            Some(_) => {}
            None => tracing::error!(
                instance = %self.instance,
                "Unable to parse the FUSE library version"
            ),
        }

        let command = format!(
            "{} {} :\"{}\" \"{}\"",
            sshfs, options, self.mount.source_path, self.target
        );
        let exec = session.exec(&command).await?;
        if !exec.succeeded() && exec.exit_code.is_some() {
            return Err(Error::Runtime(format!(
                "sshfs exited with code {}: {}",
                exec.exit_code.unwrap_or(-1),
                exec.stderr
            )));
        }

        self.session = Some(session);
        tracing::info!(
            instance = %self.instance,
            source = %self.mount.source_path,
            target = %self.target,
            "Mount activated"
        );
        Ok(())
    }

    async fn deactivate(&mut self, force: bool) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        let result = session
            .exec(&format!("sudo umount \"{}\"", self.target))
            .await;
        match result {
            Ok(exec) if exec.succeeded() => Ok(()),
            Ok(exec) if force => {
                tracing::warn!(
                    instance = %self.instance,
                    target = %self.target,
                    code = ?exec.exit_code,
                    "Ignoring unmount failure"
                );
                Ok(())
            }
            Ok(exec) => Err(Error::Runtime(format!(
                "umount \"{}\" exited with code {}: {}",
                self.target,
                exec.exit_code.unwrap_or(-1),
                exec.stderr
            ))),
            Err(e) if force => {
                tracing::warn!(
                    instance = %self.instance,
                    target = %self.target,
                    error = %e,
                    "Ignoring unmount failure"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn is_mount_managed_by_backend(&self) -> bool {
        false
    }
}
