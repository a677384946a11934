//! Handles to sandboxed OS processes.
//!
//! A background waiter reaps the child and publishes its exit code on a
//! watch channel, so any number of clones can wait on or poll the process.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use pocketbox_common::error::{PocketboxError, Result};
use pocketbox_common::types::ContainerId;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::{Mutex, watch};

use crate::logs::LogPaths;

struct Inner {
    pid: u32,
    stdin: Mutex<Option<ChildStdin>>,
    exit: watch::Receiver<Option<i32>>,
    logs: LogPaths,
}

/// A spawned sandbox process. Clones share the same process.
#[derive(Clone)]
pub struct ContainerProcess {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ContainerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerProcess")
            .field("pid", &self.inner.pid)
            .field("exit_code", &self.exit_code())
            .finish_non_exhaustive()
    }
}

impl ContainerProcess {
    /// Wraps a freshly spawned child and starts its waiter task.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::Spawn`] if the child already exited and
    /// has no pid.
    pub(crate) fn watch(mut child: Child, logs: LogPaths) -> Result<Self> {
        let pid = child.id().ok_or_else(|| PocketboxError::Spawn {
            message: "process exited before its pid was known".into(),
        })?;
        let stdin = child.stdin.take();
        let (tx, exit) = watch::channel(None);

        drop(tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    tracing::warn!(pid, error = %e, "failed to wait for sandbox process");
                    -1
                }
            };
            tracing::debug!(pid, code, "sandbox process exited");
            let _ = tx.send(Some(code));
        }));

        Ok(Self {
            inner: Arc::new(Inner {
                pid,
                stdin: Mutex::new(stdin),
                exit,
                logs,
            }),
        })
    }

    /// OS process id.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Where the process's output is captured.
    #[must_use]
    pub fn logs(&self) -> &LogPaths {
        &self.inner.logs
    }

    /// Exit code, or `None` while the process runs. Signals map to
    /// `128 + signo`.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        *self.inner.exit.borrow()
    }

    /// Returns `true` until the process has been reaped.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.exit_code().is_none()
    }

    /// Waits for the process to exit and returns its exit code.
    pub async fn wait(&self) -> i32 {
        let mut exit = self.inner.exit.clone();
        match exit.wait_for(Option::is_some).await {
            Ok(code) => code.unwrap_or(-1),
            Err(_) => -1,
        }
    }

    /// Writes `data` to the process's standard input.
    ///
    /// # Errors
    ///
    /// Fails if stdin was closed or the write fails.
    pub async fn write_stdin(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.inner.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| {
            PocketboxError::io("<stdin>", std::io::ErrorKind::BrokenPipe.into())
        })?;
        stdin
            .write_all(data)
            .await
            .map_err(|e| PocketboxError::io("<stdin>", e))?;
        stdin.flush().await.map_err(|e| PocketboxError::io("<stdin>", e))
    }

    /// Closes standard input so the process sees end-of-file.
    pub async fn close_stdin(&self) {
        drop(self.inner.stdin.lock().await.take());
    }

    /// Sends `SIGTERM`, waits up to `grace`, then sends `SIGKILL`. Returns
    /// the exit code once the process is gone.
    pub async fn terminate(&self, grace: Duration) -> i32 {
        if let Some(code) = self.exit_code() {
            return code;
        }
        self.close_stdin().await;
        self.signal(Signal::SIGTERM);
        if let Ok(code) = tokio::time::timeout(grace, self.wait()).await {
            return code;
        }
        tracing::info!(pid = self.inner.pid, "grace period elapsed, killing process");
        self.signal(Signal::SIGKILL);
        self.wait().await
    }

    /// Signals the process group, falling back to the process itself.
    fn signal(&self, signal: Signal) {
        let Ok(raw) = i32::try_from(self.inner.pid) else {
            return;
        };
        let pid = Pid::from_raw(raw);
        if killpg(pid, signal).is_ok() {
            tracing::debug!(pid = raw, ?signal, "signalled process group");
        } else if let Err(e) = kill(pid, signal) {
            if e != Errno::ESRCH {
                tracing::debug!(pid = raw, ?signal, error = %e, "signal failed");
            }
        }
    }
}

/// Role of a process within its container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    /// The container's main process.
    Main,
    /// A process started with exec.
    Exec,
}

/// An entry of the running-process index.
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    /// Owning container.
    pub container_id: ContainerId,
    /// Main or exec'd.
    pub kind: ProcessKind,
    /// The process itself.
    pub process: ContainerProcess,
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signo| 128 + signo))
        .unwrap_or(-1)
}
