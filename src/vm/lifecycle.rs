//! VM process lifecycle: spawn, kill, and wait.
//!
//! ## Architecture
//!
//! ```text
//! VmProcess::start(path, args)
//!     └─► tokio::process::Command  →  VM child process
//!             ├─► VmConsole { stdin, stdout }   (handed to scanner/trigger)
//!             ├─► stderr inherited              (straight to our stderr)
//!             └─► VmProcess::supervise()        (exit waiter task)
//! ```
//!
//! The child has no cooperative cancel protocol, so cancellation of the run
//! always ends in [`VmProcess::terminate`].

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SnapshotError};
use crate::vm::ErrorSink;

/// Set by the trigger right before `quit` goes out. An exit after that point
/// is expected.
#[derive(Debug, Clone, Default)]
pub struct QuitFlag(Arc<AtomicBool>);

impl QuitFlag {
    pub fn mark_sent(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_sent(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The piped console of a freshly spawned VM.
pub struct VmConsole {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// How the supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExit {
    /// Exited after `quit` was sent. Informational regardless of exit code.
    AfterQuit(ExitStatus),
    /// Killed because the run was cancelled.
    Killed(ExitStatus),
    /// Exited on its own while the run was still active.
    Died(ExitStatus),
}

impl VmExit {
    pub fn status(&self) -> ExitStatus {
        match self {
            VmExit::AfterQuit(s) | VmExit::Killed(s) | VmExit::Died(s) => *s,
        }
    }
}

/// A live VM child process. Dropping it kills the child.
pub struct VmProcess {
    child: Child,
    path: PathBuf,
    pid: Option<u32>,
}

impl VmProcess {
    /// Spawn `path` with `args`, piping stdin/stdout and inheriting stderr.
    pub fn start(path: &Path, args: &[String]) -> Result<(Self, VmConsole)> {
        let mut cmd = Command::new(path);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SnapshotError::ProcessStart {
            path: path.to_path_buf(),
            source,
        })?;

        let pid = child.id();
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            // Both are configured as piped above, tokio always hands them out.
            return Err(SnapshotError::ProcessStart {
                path: path.to_path_buf(),
                source: std::io::Error::other("VM stdio pipes were not captured"),
            });
        };

        info!(path = %path.display(), pid = ?pid, "VM started");

        Ok((
            Self {
                child,
                path: path.to_path_buf(),
                pid,
            },
            VmConsole { stdin, stdout },
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Send a kill signal. Safe to call repeatedly and after natural exit.
    pub fn terminate(&mut self) -> Result<()> {
        match self.child.start_kill() {
            Ok(()) => {
                debug!(pid = ?self.pid, "Sent kill to VM");
                Ok(())
            }
            // Already reaped: nothing left to kill.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(SnapshotError::stream(
                format!("failed to kill {}", self.path.display()),
                e,
            )),
        }
    }

    /// Block until the child exits.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let path = &self.path;
        self.child.wait().await.map_err(|e| {
            SnapshotError::stream(format!("failed waiting for {}", path.display()), e)
        })
    }

    /// Exit waiter: waits for the child, or kills it once `scope` is
    /// cancelled. An exit before `quit` was sent while the scope is still
    /// live is reported to `errors` as [`SnapshotError::ProcessDied`].
    pub async fn supervise(
        mut self,
        scope: CancellationToken,
        quit: QuitFlag,
        errors: ErrorSink,
    ) -> Result<VmExit> {
        tokio::select! {
            status = self.child.wait() => {
                let status = status.map_err(|e| {
                    SnapshotError::stream(format!("failed waiting for {}", self.path.display()), e)
                })?;
                if quit.is_sent() {
                    info!(pid = ?self.pid, exit_code = ?status.code(), "VM exited after quit");
                    Ok(VmExit::AfterQuit(status))
                } else if scope.is_cancelled() {
                    Ok(VmExit::Killed(status))
                } else {
                    warn!(pid = ?self.pid, exit_status = %status, "VM process exited unexpectedly");
                    errors.report(SnapshotError::ProcessDied { status });
                    Ok(VmExit::Died(status))
                }
            }
            _ = scope.cancelled() => {
                self.terminate()?;
                let status = self.wait().await?;
                info!(pid = ?self.pid, exit_status = %status, "VM killed");
                Ok(VmExit::Killed(status))
            }
        }
    }
}
