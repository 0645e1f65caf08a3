//! boot-snapshot: boot a VM until its console prints a ready marker, then
//! migrate the running VM into a state file so later runs can resume from it
//! instead of cold-booting.
//!
//! The entry point is [`vm::capture`], driven by a validated
//! [`config::RunConfig`].

pub mod config;
pub mod error;
pub mod logging;
pub mod vm;

pub use config::{MarkerPattern, RunConfig, SnapshotRequest};
pub use error::{ErrorKind, ErrorReport, SnapshotError};
pub use vm::{RunSummary, capture, capture_with_mirror};
