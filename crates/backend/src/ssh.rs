//! SSH transport capability.
//!
//! The daemon issues guest commands (reboot, info probes, mount helpers)
//! through these traits; the concrete session transport is provided by the
//! platform layer.

use async_trait::async_trait;
use multipassd_common::{Error, Result};

/// Provides the daemon's SSH keypair.
pub trait SshKeyProvider: Send + Sync {
    fn public_key_as_base64(&self) -> String;
    fn private_key_as_base64(&self) -> String;
}

/// Result of executing one command over SSH.
///
/// `exit_code` is `None` when the connection dropped before the command
/// reported an exit status. That is the expected outcome of `sudo reboot`.
#[derive(Debug, Clone, Default)]
pub struct SshExec {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl SshExec {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// One established SSH session into a guest.
#[async_trait]
pub trait SshSession: Send + Sync {
    async fn exec(&mut self, command: &str) -> Result<SshExec>;
}

/// Opens SSH sessions into guests.
#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        username: &str,
        keys: &dyn SshKeyProvider,
    ) -> Result<Box<dyn SshSession>>;
}

/// Run a command and return its trimmed stdout, failing on non-zero exit.
pub async fn run_in_session(session: &mut dyn SshSession, command: &str) -> Result<String> {
    let exec = session.exec(command).await?;
    match exec.exit_code {
        Some(0) => Ok(exec.stdout.trim_end().to_string()),
        Some(code) => Err(Error::Ssh(format!(
            "'{}' exited with code {}: {}",
            command, code, exec.stderr
        ))),
        None => Err(Error::Ssh(format!("'{}' exited without status", command))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedSession {
        replies: Vec<(String, SshExec)>,
    }

    #[async_trait]
    impl SshSession for ScriptedSession {
        async fn exec(&mut self, command: &str) -> Result<SshExec> {
            let pos = self
                .replies
                .iter()
                .position(|(cmd, _)| cmd == command)
                .ok_or_else(|| Error::Ssh(format!("unexpected command: {}", command)))?;
            Ok(self.replies.remove(pos).1)
        }
    }

    #[tokio::test]
    async fn test_run_in_session_trims_output() {
        let mut session = ScriptedSession {
            replies: vec![(
                "nproc".to_string(),
                SshExec {
                    exit_code: Some(0),
                    stdout: "4\n".to_string(),
                    stderr: String::new(),
                },
            )],
        };
        let out = run_in_session(&mut session, "nproc").await.unwrap();
        assert_eq!(out, "4");
    }

    #[tokio::test]
    async fn test_run_in_session_fails_on_nonzero_exit() {
        let mut session = ScriptedSession {
            replies: vec![(
                "false".to_string(),
                SshExec {
                    exit_code: Some(1),
                    ..Default::default()
                },
            )],
        };
        assert!(run_in_session(&mut session, "false").await.is_err());
    }
}
