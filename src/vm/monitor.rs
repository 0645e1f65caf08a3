//! Monitor protocol: switch the console into the VM monitor, migrate the
//! running state into a file, then quit.
//!
//! The trigger is the only writer of the VM's stdin and does not write a
//! single byte before the scanner's detection signal arrives.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SnapshotRequest;
use crate::error::{Result, SnapshotError};
use crate::vm::lifecycle::QuitFlag;
use crate::vm::{Detection, PhaseTracker, RunPhase};

/// Ctrl-A C: toggles the emulated console into the monitor.
pub const MONITOR_ESCAPE: [u8; 2] = [0x01, b'c'];
pub const QUIT_COMMAND: &[u8] = b"quit\n";

/// Checks whether the state file has appeared.
pub trait StateFileProbe: Send {
    /// `Ok(Some(size))` once the file exists, `Ok(None)` while it does not.
    fn probe(&mut self, path: &Path) -> impl Future<Output = io::Result<Option<u64>>> + Send;
}

/// Probe backed by the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsProbe;

impl StateFileProbe for FsProbe {
    async fn probe(&mut self, path: &Path) -> io::Result<Option<u64>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// How the trigger finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// `quit` was written after the state file appeared.
    Completed {
        migrate_attempts: u32,
        state_file: PathBuf,
        state_file_bytes: u64,
    },
    /// The scope was cancelled, or the scanner went away without detecting.
    Cancelled,
}

pub struct SnapshotTrigger<W, P> {
    stdin: W,
    request: SnapshotRequest,
    probe: P,
    quit: QuitFlag,
    phase: PhaseTracker,
}

impl<W, P> SnapshotTrigger<W, P>
where
    W: AsyncWrite + Unpin + Send,
    P: StateFileProbe,
{
    pub fn new(
        stdin: W,
        request: SnapshotRequest,
        probe: P,
        quit: QuitFlag,
        phase: PhaseTracker,
    ) -> Self {
        Self {
            stdin,
            request,
            probe,
            quit,
            phase,
        }
    }

    /// Wait for detection, then enter the monitor, migrate until the state
    /// file exists, and quit.
    pub async fn run(
        mut self,
        detected: oneshot::Receiver<Detection>,
        scope: &CancellationToken,
    ) -> Result<TriggerOutcome> {
        let detection = tokio::select! {
            _ = scope.cancelled() => return Ok(TriggerOutcome::Cancelled),
            d = detected => match d {
                Ok(d) => d,
                Err(_) => {
                    debug!("Scanner ended without detecting the marker");
                    return Ok(TriggerOutcome::Cancelled);
                }
            },
        };
        debug!(bytes_read = detection.bytes_read, "Snapshot trigger armed");

        info!("Entering VM monitor (Ctrl-A C)");
        if !self.send(&MONITOR_ESCAPE, "failed to enter monitor", scope).await? {
            return Ok(TriggerOutcome::Cancelled);
        }

        self.phase.set(RunPhase::Migrating);
        let command = self.request.migrate_command();
        let target = self.request.target.clone();
        info!(command = %command.trim_end(), "Sending migrate command");

        let mut migrate_attempts = 0u32;
        let state_file_bytes = loop {
            if !self.send(command.as_bytes(), "failed to invoke migrate", scope).await? {
                return Ok(TriggerOutcome::Cancelled);
            }
            migrate_attempts += 1;

            tokio::select! {
                _ = scope.cancelled() => return Ok(TriggerOutcome::Cancelled),
                _ = tokio::time::sleep(self.request.poll_interval) => {}
            }

            match self.probe.probe(&target).await {
                Ok(Some(size)) => break size,
                Ok(None) => debug!(attempt = migrate_attempts, "State file not there yet"),
                Err(source) => return Err(SnapshotError::Filesystem { path: target, source }),
            }
        };

        self.phase.set(RunPhase::StateFileObserved);
        info!(
            path = %target.display(),
            bytes = state_file_bytes,
            attempts = migrate_attempts,
            "State file created"
        );

        self.phase.set(RunPhase::Quitting);
        info!("Finishing VM (sending quit)");
        self.quit.mark_sent();
        if !self.send(QUIT_COMMAND, "failed to invoke quit", scope).await? {
            return Ok(TriggerOutcome::Cancelled);
        }

        Ok(TriggerOutcome::Completed {
            migrate_attempts,
            state_file: target,
            state_file_bytes,
        })
    }

    /// Write and flush `bytes`. Returns `Ok(false)` if cancelled mid-write.
    async fn send(
        &mut self,
        bytes: &[u8],
        context: &str,
        scope: &CancellationToken,
    ) -> Result<bool> {
        let write = async {
            self.stdin.write_all(bytes).await?;
            self.stdin.flush().await?;
            Ok::<_, io::Error>(())
        };
        tokio::select! {
            _ = scope.cancelled() => Ok(false),
            res = write => res.map(|()| true).map_err(|e| SnapshotError::stream(context, e)),
        }
    }
}
