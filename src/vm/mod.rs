//! VM snapshot orchestration.
//!
//! Boots a VM process, waits for the guest's console marker, then drives the
//! monitor to migrate the running state into a file and quit.
//!
//! ```text
//! capture(RunConfig)
//!     └─► lifecycle::VmProcess::start  →  VM child process
//!             ├─► stdout  →  console::MarkerScanner  →  ConsoleMirror
//!             │                   └─► detection (oneshot)
//!             ├─► stdin   ←  monitor::SnapshotTrigger  →  done (oneshot)
//!             ├─► progress::ProgressReporter (heartbeat)
//!             └─► lifecycle::VmProcess::supervise (exit waiter)
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::error::{ErrorKind, SnapshotError};

pub mod capture;
pub mod console;
pub mod lifecycle;
pub mod monitor;
pub mod progress;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Where a run currently stands. Exactly one terminal phase is ever reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Booting,
    MarkerDetected,
    Migrating,
    StateFileObserved,
    Quitting,
    Completed,
    Failed(ErrorKind),
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed(_))
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Booting => f.write_str("booting"),
            RunPhase::MarkerDetected => f.write_str("marker-detected"),
            RunPhase::Migrating => f.write_str("migrating"),
            RunPhase::StateFileObserved => f.write_str("state-file-observed"),
            RunPhase::Quitting => f.write_str("quitting"),
            RunPhase::Completed => f.write_str("completed"),
            RunPhase::Failed(kind) => write!(f, "failed({kind})"),
        }
    }
}

/// Publishes the current [`RunPhase`]. Once a terminal phase is set, later
/// updates are ignored.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    tx: Arc<watch::Sender<RunPhase>>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RunPhase::Booting);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, phase: RunPhase) {
        self.tx.send_if_modified(|current| {
            if current.is_terminal() || *current == phase {
                return false;
            }
            *current = phase;
            true
        });
    }

    pub fn current(&self) -> RunPhase {
        *self.tx.borrow()
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes read from the VM console so far, shared by the scanner and reporter.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    pub fn add(&self, n: usize) {
        self.0.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fired once by the scanner when the marker run completes.
#[derive(Debug, Clone, Copy)]
pub struct Detection {
    pub bytes_read: u64,
    pub elapsed: Duration,
}

/// First-error-wins reporting channel. Sending never blocks; once the single
/// slot is taken, later errors are dropped.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    tx: mpsc::Sender<SnapshotError>,
}

impl ErrorSink {
    pub fn channel() -> (Self, mpsc::Receiver<SnapshotError>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Returns `false` when the error was discarded.
    pub fn report(&self, err: SnapshotError) -> bool {
        match self.tx.try_send(err) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e.into_inner(), "Discarding error, run already has one");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use capture::{RunSummary, capture, capture_with_mirror};
