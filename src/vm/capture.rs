//! Coordinator for one boot-to-snapshot run.
//!
//! Owns the deadline and the cancellation scope, spawns the VM, starts the
//! four concurrent units, and turns the first terminal event (done, error,
//! or deadline) into the run's result. On every path the scope is cancelled
//! and every unit is joined before returning.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use tokio::io::AsyncWrite;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RunConfig;
use crate::error::{ErrorReport, Result, SnapshotError, round_millis};
use crate::vm::console::{ConsoleMirror, MarkerScanner};
use crate::vm::lifecycle::{QuitFlag, VmExit, VmProcess};
use crate::vm::monitor::{FsProbe, SnapshotTrigger, TriggerOutcome};
use crate::vm::progress::ProgressReporter;
use crate::vm::{ByteCounter, ErrorSink, PhaseTracker, RunPhase};

/// How long the console may keep producing output after the VM has exited.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// What a successful run produced.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub elapsed: Duration,
    pub bytes_read: u64,
    pub migrate_attempts: u32,
    pub state_file: PathBuf,
    pub state_file_bytes: u64,
    /// `None` if the VM had to be killed after `quit`.
    pub exit_status: Option<ExitStatus>,
    pub phase: RunPhase,
}

/// Run with the console mirrored to our stdout.
pub async fn capture(config: &RunConfig) -> std::result::Result<RunSummary, ErrorReport> {
    capture_with_mirror(config, ConsoleMirror::stdout()).await
}

/// Run with the console mirrored into `mirror`.
pub async fn capture_with_mirror<W>(
    config: &RunConfig,
    mirror: ConsoleMirror<W>,
) -> std::result::Result<RunSummary, ErrorReport>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let started = Instant::now();
    let deadline = tokio::time::Instant::from_std(started + config.timeout);

    info!(
        timeout = %humantime::format_duration(config.timeout),
        output = %config.snapshot.target.display(),
        "Starting snapshot capture"
    );
    info!(args = ?config.args, "VM arguments");

    let (vm, console) =
        VmProcess::start(&config.executable, &config.args).map_err(|e| fail(e, started))?;
    info!(pid = ?vm.pid(), "VM started, waiting for marker");

    let scope = CancellationToken::new();
    let reporter_stop = scope.child_token();
    let phase = PhaseTracker::new();
    let bytes_read = ByteCounter::default();
    let quit = QuitFlag::default();
    let (errors, mut error_rx) = ErrorSink::channel();
    let (detected_tx, detected_rx) = oneshot::channel();
    let (done_tx, mut done_rx) = oneshot::channel();

    let scanner = {
        let mut scanner = MarkerScanner::new(
            config.marker,
            mirror,
            bytes_read.clone(),
            phase.clone(),
            started,
        );
        let scope = scope.clone();
        let errors = errors.clone();
        let stdout = console.stdout;
        tokio::spawn(async move {
            if let Err(e) = scanner.run(stdout, detected_tx, &scope).await {
                errors.report(e);
            }
        })
    };

    let trigger = {
        let trigger = SnapshotTrigger::new(
            console.stdin,
            config.snapshot.clone(),
            FsProbe,
            quit.clone(),
            phase.clone(),
        );
        let scope = scope.clone();
        let errors = errors.clone();
        tokio::spawn(async move {
            match trigger.run(detected_rx, &scope).await {
                Ok(TriggerOutcome::Completed {
                    migrate_attempts,
                    state_file,
                    state_file_bytes,
                }) => {
                    let _ = done_tx.send((migrate_attempts, state_file, state_file_bytes));
                }
                Ok(TriggerOutcome::Cancelled) => debug!("Snapshot trigger cancelled"),
                Err(e) => {
                    errors.report(e);
                }
            }
        })
    };

    let reporter = tokio::spawn(
        ProgressReporter::new(
            config.progress_interval,
            started,
            bytes_read.clone(),
            phase.clone(),
        )
        .run(reporter_stop.clone()),
    );

    let mut waiter = tokio::spawn(vm.supervise(scope.clone(), quit, errors));

    // A dropped `done` means the trigger failed or stood down; its error (or
    // the scanner's) arrives on `error_rx`.
    let terminal = tokio::select! {
        Ok(done) = &mut done_rx => Ok(done),
        Some(err) = error_rx.recv() => Err(err),
        _ = tokio::time::sleep_until(deadline) => Err(timeout(started, &bytes_read, &phase)),
    };

    let (migrate_attempts, state_file, state_file_bytes) = match terminal {
        Ok(done) => done,
        Err(err) => {
            phase.set(RunPhase::Failed(err.kind()));
            scope.cancel();
            join_unit("scanner", scanner).await;
            join_unit("trigger", trigger).await;
            join_unit("reporter", reporter).await;
            match waiter.await {
                Ok(Ok(exit)) => debug!(exit_status = %exit.status(), "VM stopped after failure"),
                Ok(Err(e)) => warn!(error = %e, "Failed to stop VM"),
                Err(e) => warn!(error = %e, "VM exit waiter panicked"),
            }
            let report = ErrorReport::new(err, started.elapsed());
            error!(
                kind = %report.kind(),
                elapsed = %humantime::format_duration(round_millis(report.elapsed)),
                bytes_read = bytes_read.get(),
                "Error during snapshot capture: {}",
                report.error
            );
            return Err(report);
        }
    };

    reporter_stop.cancel();

    // Exit after quit is expected; only the deadline bounds how long we wait.
    let exit_status = tokio::select! {
        res = &mut waiter => exit_status_of(res),
        _ = tokio::time::sleep_until(deadline) => {
            warn!("VM did not exit after quit before the deadline, killing");
            scope.cancel();
            exit_status_of(waiter.await)
        }
    };

    // Let the scanner drain whatever the VM printed on its way out. Anything
    // else holding the pipe open (a leftover grandchild) only gets the grace.
    let drain_until = deadline.min(tokio::time::Instant::now() + DRAIN_GRACE);
    let mut scanner = scanner;
    let drained = tokio::time::timeout_at(drain_until, &mut scanner).await;
    scope.cancel();
    match drained {
        Ok(Err(e)) => warn!(unit = "scanner", error = %e, "Task ended abnormally"),
        Ok(Ok(())) => {}
        Err(_) => join_unit("scanner", scanner).await,
    }
    join_unit("trigger", trigger).await;
    join_unit("reporter", reporter).await;

    phase.set(RunPhase::Completed);
    let summary = RunSummary {
        elapsed: started.elapsed(),
        bytes_read: bytes_read.get(),
        migrate_attempts,
        state_file,
        state_file_bytes,
        exit_status,
        phase: phase.current(),
    };
    info!(
        elapsed = %humantime::format_duration(round_millis(summary.elapsed)),
        state_file = %summary.state_file.display(),
        bytes = summary.state_file_bytes,
        "Snapshot capture completed successfully"
    );
    Ok(summary)
}

fn exit_status_of(
    res: std::result::Result<Result<VmExit>, tokio::task::JoinError>,
) -> Option<ExitStatus> {
    match res {
        Ok(Ok(VmExit::AfterQuit(status))) => Some(status),
        Ok(Ok(exit)) => {
            info!(exit_status = %exit.status(), "VM exited");
            None
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Failed waiting for VM exit");
            None
        }
        Err(e) => {
            warn!(error = %e, "VM exit waiter panicked");
            None
        }
    }
}

async fn join_unit<T>(unit: &'static str, handle: JoinHandle<T>) {
    if let Err(e) = handle.await {
        warn!(unit, error = %e, "Task ended abnormally");
    }
}

fn timeout(started: Instant, bytes_read: &ByteCounter, phase: &PhaseTracker) -> SnapshotError {
    let waiting_for = match phase.current() {
        RunPhase::Booting => "marker",
        RunPhase::Quitting => "VM exit",
        _ => "state file",
    };
    SnapshotError::Timeout {
        waiting_for,
        elapsed: started.elapsed(),
        bytes_read: bytes_read.get(),
    }
}

fn fail(err: SnapshotError, started: Instant) -> ErrorReport {
    let report = ErrorReport::new(err, started.elapsed());
    error!(kind = %report.kind(), "{report}");
    report
}
