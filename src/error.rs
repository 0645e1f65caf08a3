//! Error taxonomy for a snapshot run.
//!
//! Every concurrent unit reports failures as a [`SnapshotError`]. The
//! coordinator keeps the first one it sees, pairs it with the elapsed run
//! time in an [`ErrorReport`], and discards the rest.

use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Coarse classification of a [`SnapshotError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    ProcessStart,
    Stream,
    Timeout,
    Filesystem,
    ProcessDied,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Config => "config",
            ErrorKind::ProcessStart => "process-start",
            ErrorKind::Stream => "stream",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Filesystem => "filesystem",
            ErrorKind::ProcessDied => "process-died",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to start {}: {source}", .path.display())]
    ProcessStart {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Stream {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("VM output closed before marker (read {bytes_read} bytes)")]
    OutputClosed { bytes_read: u64 },

    #[error(
        "timeout waiting for {waiting_for} after {} (read {bytes_read} bytes)",
        fmt_elapsed(.elapsed)
    )]
    Timeout {
        waiting_for: &'static str,
        elapsed: Duration,
        bytes_read: u64,
    },

    #[error("failed to stat state file {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("VM process exited before the snapshot completed ({status})")]
    ProcessDied { status: ExitStatus },
}

impl SnapshotError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn stream(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Stream {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SnapshotError::Config(_) => ErrorKind::Config,
            SnapshotError::ProcessStart { .. } => ErrorKind::ProcessStart,
            SnapshotError::Stream { .. } | SnapshotError::OutputClosed { .. } => ErrorKind::Stream,
            SnapshotError::Timeout { .. } => ErrorKind::Timeout,
            SnapshotError::Filesystem { .. } => ErrorKind::Filesystem,
            SnapshotError::ProcessDied { .. } => ErrorKind::ProcessDied,
        }
    }
}

/// The terminal failure of a run: the winning error plus when it happened.
#[derive(Debug)]
pub struct ErrorReport {
    pub error: SnapshotError,
    pub elapsed: Duration,
}

impl ErrorReport {
    pub fn new(error: SnapshotError, elapsed: Duration) -> Self {
        Self { error, elapsed }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} error after {}: {}",
            self.kind(),
            humantime::format_duration(round_millis(self.elapsed)),
            self.error
        )
    }
}

impl std::error::Error for ErrorReport {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

fn fmt_elapsed(d: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(round_millis(*d))
}

/// Truncate to whole milliseconds so log lines stay readable.
pub fn round_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

pub type Result<T> = std::result::Result<T, SnapshotError>;
