use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::core::cancel::CancelToken;
use crate::core::error::{AgentError, Result};

/// Exit code when the driver binary is absent.
pub const EXIT_DRIVER_MISSING: i32 = 127;

/// The compiled invocation handed to the driver, consumed once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandPlan {
    pub driver: String,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Single-slot cell holding the running driver process.
///
/// Updated on spawn and cleared on exit; the signal handler reads it to
/// kill a running driver. Killing uses the non-blocking `start_kill` so the
/// handler never waits on the lock holder.
#[derive(Debug, Clone, Default)]
pub struct CurrentChild(Arc<Mutex<Option<Child>>>);

impl CurrentChild {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, child: Child) {
        *self.0.lock().expect("child cell lock") = Some(child);
    }

    /// Kill the stored child, if any. Safe to call from the signal task.
    pub fn kill(&self) {
        if let Ok(mut guard) = self.0.lock()
            && let Some(child) = guard.as_mut()
        {
            let _ = child.start_kill();
        }
    }

    /// Wait for the stored child to exit, clearing the slot.
    async fn wait(&self) -> std::io::Result<std::process::ExitStatus> {
        loop {
            {
                let mut guard = self.0.lock().expect("child cell lock");
                match guard.as_mut() {
                    Some(child) => {
                        if let Some(status) = child.try_wait()? {
                            *guard = None;
                            return Ok(status);
                        }
                    }
                    None => {
                        return Err(std::io::Error::other("no child process"));
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Install SIGINT/SIGTERM handlers: flag cancellation, record the exit
/// code, and kill the tracked child.
pub fn install_signal_handlers(
    cancel: CancelToken,
    current: CurrentChild,
    signal_code: Arc<AtomicI32>,
) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("failed to install SIGTERM handler: {e}");
                    let _ = tokio::signal::ctrl_c().await;
                    signal_code.store(130, Ordering::SeqCst);
                    cancel.cancel();
                    current.kill();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => signal_code.store(130, Ordering::SeqCst),
                _ = sigterm.recv() => signal_code.store(143, Ordering::SeqCst),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            signal_code.store(130, Ordering::SeqCst);
        }
        cancel.cancel();
        current.kill();
    });
}

/// Spawn the driver with inherited stdio and relay its exit code.
///
/// A missing driver binary is exit 127; a driver killed by a signal maps to
/// `128 + signo` on unix.
pub async fn spawn_driver(
    plan: &CommandPlan,
    current: &CurrentChild,
    cancel: &CancelToken,
) -> Result<i32> {
    tracing::debug!(driver = %plan.driver, argv = ?plan.argv, "spawning driver");

    let mut cmd = Command::new(&plan.driver);
    cmd.args(&plan.argv)
        .envs(plan.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            eprintln!(
                "Driver `{}` not found on PATH. Install it or override with --_command.",
                plan.driver
            );
            return Ok(EXIT_DRIVER_MISSING);
        }
        Err(e) => {
            return Err(AgentError::CommandFailed(format!(
                "failed to spawn driver `{}`: {e}",
                plan.driver
            )));
        }
    };

    current.store(child);
    let status = current
        .wait()
        .await
        .map_err(|e| AgentError::CommandFailed(format!("waiting for driver: {e}")))?;

    if cancel.is_cancelled() {
        // The signal handler owns the exit code in this case
        return Ok(130);
    }

    Ok(exit_code_of(status))
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    1
}
