//! boot-snapshot: capture a resumable VM state file
//!
//! Boots the given VM binary with arguments from a JSON file, waits for the
//! guest to print its ready marker on the serial console, then migrates the
//! VM into a state file through the monitor and quits.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;

use boot_snapshot::config::{self, MarkerPattern, RunConfig, SnapshotRequest};
use boot_snapshot::{SnapshotError, logging, vm};

/// Boot a VM to its ready marker and save its state for fast resume
#[derive(Parser, Debug)]
#[command(name = "boot-snapshot", version, about)]
struct Args {
    /// VM executable to launch (e.g. qemu-system-x86_64)
    executable: PathBuf,

    /// JSON file holding the VM argument list as an array of strings
    #[arg(long)]
    args_json: Option<PathBuf>,

    /// Path the VM state is migrated to
    #[arg(short, long, default_value = config::DEFAULT_OUTPUT)]
    output: PathBuf,

    /// Give up if the snapshot is not complete after this long
    #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Console byte that makes up the ready marker
    #[arg(long, default_value_t = '=', value_parser = parse_marker_char)]
    marker: char,

    /// How many consecutive marker bytes signal readiness
    #[arg(long, default_value_t = config::DEFAULT_MARKER_LEN)]
    marker_len: usize,

    /// Delay between migrate attempts
    #[arg(long, default_value = "500ms", value_parser = humantime::parse_duration)]
    poll_interval: Duration,

    /// Interval between progress log lines
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    progress_interval: Duration,
}

fn parse_marker_char(s: &str) -> std::result::Result<char, String> {
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii() => Ok(c),
        _ => Err(format!("marker must be a single ASCII character, got {s:?}")),
    }
}

impl Args {
    fn into_run_config(self) -> std::result::Result<RunConfig, SnapshotError> {
        let args_json = self
            .args_json
            .ok_or_else(|| SnapshotError::config("specify --args-json"))?;
        let args = config::load_args_json(&args_json)?;

        let snapshot = SnapshotRequest::new(self.output)?.with_poll_interval(self.poll_interval)?;
        let marker = MarkerPattern::new(self.marker as u8, self.marker_len)?;

        RunConfig::new(self.executable, args, snapshot)?
            .with_marker(marker)
            .with_timeout(self.timeout)?
            .with_progress_interval(self.progress_interval)
    }
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let _log_guard = logging::init().context("Failed to initialise logging")?;

    let config = match args.into_run_config() {
        Ok(config) => config,
        Err(e) => {
            error!(kind = %e.kind(), "{e}");
            return Ok(ExitCode::FAILURE);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;

    let outcome = runtime.block_on(vm::capture(&config));

    // The VM is already reaped; don't let stray blocking tasks hold up exit.
    runtime.shutdown_timeout(Duration::from_secs(1));

    Ok(match outcome {
        Ok(_) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    })
}
