//! Run configuration: what to launch, what to wait for, where to write.
//!
//! [`RunConfig::new`] is the only way to build a config and it validates
//! everything up front, so a bad config fails before any process is spawned.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, SnapshotError};

pub const DEFAULT_OUTPUT: &str = "vm.state";
pub const DEFAULT_MARKER_BYTE: u8 = b'=';
pub const DEFAULT_MARKER_LEN: usize = 10;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// A run of `len` identical `byte`s on the console means "ready to snapshot".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerPattern {
    byte: u8,
    len: usize,
}

impl MarkerPattern {
    pub fn new(byte: u8, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(SnapshotError::config("marker run length must be at least 1"));
        }
        Ok(Self { byte, len })
    }

    pub fn byte(&self) -> u8 {
        self.byte
    }

    pub fn run_len(&self) -> usize {
        self.len
    }
}

impl fmt::Display for MarkerPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = char::from(self.byte);
        for _ in 0..self.len {
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl Default for MarkerPattern {
    fn default() -> Self {
        Self {
            byte: DEFAULT_MARKER_BYTE,
            len: DEFAULT_MARKER_LEN,
        }
    }
}

/// Where the migrated state should land and how often to check for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub target: PathBuf,
    pub poll_interval: Duration,
}

impl SnapshotRequest {
    pub fn new(target: impl Into<PathBuf>) -> Result<Self> {
        let target = target.into();
        if target.as_os_str().is_empty() {
            return Err(SnapshotError::config("output file must not be empty"));
        }
        Ok(Self {
            target,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Result<Self> {
        if poll_interval.is_zero() {
            return Err(SnapshotError::config("poll interval must be greater than zero"));
        }
        self.poll_interval = poll_interval;
        Ok(self)
    }

    /// The monitor command that asks the VM to serialize itself to `target`.
    pub fn migrate_command(&self) -> String {
        format!("migrate file:{}\n", self.target.display())
    }
}

/// Everything one orchestration run needs.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub marker: MarkerPattern,
    pub snapshot: SnapshotRequest,
    pub timeout: Duration,
    pub progress_interval: Duration,
}

impl RunConfig {
    pub fn new(
        executable: impl Into<PathBuf>,
        args: Vec<String>,
        snapshot: SnapshotRequest,
    ) -> Result<Self> {
        let executable = executable.into();
        if executable.as_os_str().is_empty() {
            return Err(SnapshotError::config("VM executable must not be empty"));
        }
        Ok(Self {
            executable,
            args,
            marker: MarkerPattern::default(),
            snapshot,
            timeout: DEFAULT_TIMEOUT,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        })
    }

    pub fn with_marker(mut self, marker: MarkerPattern) -> Self {
        self.marker = marker;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        if timeout.is_zero() {
            return Err(SnapshotError::config("timeout must be greater than zero"));
        }
        self.timeout = timeout;
        Ok(self)
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(SnapshotError::config("progress interval must be greater than zero"));
        }
        self.progress_interval = interval;
        Ok(self)
    }
}

/// Read the VM argument list from a JSON file holding an array of strings.
pub fn load_args_json(path: &Path) -> Result<Vec<String>> {
    let data = std::fs::read(path).map_err(|e| {
        SnapshotError::config(format!("failed to read args json {}: {e}", path.display()))
    })?;
    let args: Vec<String> = serde_json::from_slice(&data).map_err(|e| {
        SnapshotError::config(format!("failed to parse args json {}: {e}", path.display()))
    })?;
    debug!(path = %path.display(), count = args.len(), "Loaded VM args");
    Ok(args)
}
