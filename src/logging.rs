//! Logging initialisation for boot-snapshot.
//!
//! Logs always go to stderr (filtered by `RUST_LOG`, `info` by default) so
//! they never interleave with the mirrored VM console on stdout. When the
//! `BOOT_SNAPSHOT_LOG` environment variable is set to `1`, structured logs
//! are also written to the OS data directory under
//! `boot-snapshot/boot-snapshot.log`.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::PathBuf;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const APP_NAME: &str = "boot-snapshot";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process.
pub fn init() -> anyhow::Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let file_guard = if std::env::var("BOOT_SNAPSHOT_LOG").as_deref() == Ok("1") {
        let dir = log_dir().unwrap_or_else(|| std::env::temp_dir().join(APP_NAME));
        std::fs::create_dir_all(&dir)?;
        let file_appender = tracing_appender::rolling::never(&dir, "boot-snapshot.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .with(file_layer)
            .try_init()?;

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .try_init()?;

        None
    };

    Ok(LogGuard { _file_guard: file_guard })
}

fn log_dir() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return Some(PathBuf::from(xdg).join(APP_NAME));
    }
    let home = PathBuf::from(std::env::var("HOME").ok()?);
    #[cfg(target_os = "macos")]
    let base = home.join("Library").join("Logs");
    #[cfg(not(target_os = "macos"))]
    let base = home.join(".local").join("share");
    Some(base.join(APP_NAME))
}
