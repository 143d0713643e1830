//! Delayed shutdown timers.
//!
//! A stop request with a delay arms one of these per instance. The timer
//! owns a best-effort SSH session for the courtesy wall message, deactivates
//! the instance's mounts when it fires, and erases its own registry entry on
//! expiry. Dropping the timer (stop --cancel, start, delete) cancels it.

use multipassd_backend::{SshSession, VirtualMachine};
use multipassd_common::InstanceState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::registry::DaemonState;
use crate::{catalog, mounts};

pub struct DelayedShutdownTimer {
    handle: JoinHandle<()>,
    deadline: Instant,
}

impl DelayedShutdownTimer {
    pub fn time_remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

impl Drop for DelayedShutdownTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Arm a shutdown for `vm` after `delay`. The returned timer must be stored
/// in the registry's delayed-shutdown table; the task erases that entry when
/// the shutdown runs.
pub fn schedule_shutdown(
    name: String,
    vm: Arc<dyn VirtualMachine>,
    delay: Duration,
    session: Option<Box<dyn SshSession>>,
    state: Arc<Mutex<DaemonState>>,
    catalog_dir: PathBuf,
) -> DelayedShutdownTimer {
    let deadline = Instant::now() + delay;

    let handle = tokio::spawn(async move {
        if !delay.is_zero() {
            vm.set_state(InstanceState::DelayedShutdown);
            if let Some(mut session) = session {
                let minutes = delay.as_secs().div_ceil(60);
                let wall = format!(
                    "wall \"The system is going down for poweroff in {} minute{}\"",
                    minutes,
                    if minutes == 1 { "" } else { "s" }
                );
                if let Err(e) = session.exec(&wall).await {
                    tracing::debug!(instance = %name, error = %e, "Could not warn guest users");
                }
            }
        }

        tokio::time::sleep_until(deadline).await;

        let handlers = { state.lock().await.mounts.remove(&name) };
        if let Some(mut handlers) = handlers {
            mounts::stop_mounts(&name, &mut handlers).await;
            state.lock().await.mounts.insert(name.clone(), handlers);
        }

        if let Err(e) = vm.shutdown().await {
            tracing::error!(instance = %name, error = %e, "Failed to shut instance down");
        }

        let mut st = state.lock().await;
        if let Some(spec) = st.specs.get_mut(&name) {
            spec.state = vm.current_state();
        }
        if let Err(e) = catalog::persist_db(&catalog_dir, &st.specs) {
            tracing::warn!(error = %e, "Could not persist instance specs");
        }
        // Last and with no awaits after: removing the entry drops this task's
        // own handle.
        st.delayed_shutdowns.remove(&name);
    });

    DelayedShutdownTimer { handle, deadline }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockVirtualMachine;

    #[tokio::test(start_paused = true)]
    async fn test_timer_shuts_down_and_erases_itself() {
        let vm = Arc::new(MockVirtualMachine::new("a", InstanceState::Running));
        let state = Arc::new(Mutex::new(DaemonState::default()));
        let dir = tempfile::tempdir().unwrap();

        let timer = schedule_shutdown(
            "a".into(),
            vm.clone(),
            Duration::from_secs(60),
            None,
            state.clone(),
            dir.path().to_path_buf(),
        );
        state
            .lock()
            .await
            .delayed_shutdowns
            .insert("a".into(), timer);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(vm.current_state(), InstanceState::DelayedShutdown);

        tokio::time::sleep(Duration::from_secs(61)).await;
        // Let the timer task run to completion.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(vm.current_state(), InstanceState::Off);
        assert!(state.lock().await.delayed_shutdowns.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_timer_cancels_shutdown() {
        let vm = Arc::new(MockVirtualMachine::new("a", InstanceState::Running));
        let state = Arc::new(Mutex::new(DaemonState::default()));
        let dir = tempfile::tempdir().unwrap();

        let timer = schedule_shutdown(
            "a".into(),
            vm.clone(),
            Duration::from_secs(60),
            None,
            state.clone(),
            dir.path().to_path_buf(),
        );
        assert!(timer.time_remaining() > Duration::from_secs(50));
        drop(timer);

        tokio::time::sleep(Duration::from_secs(120)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_ne!(vm.current_state(), InstanceState::Off);
    }
}
