//! End-to-end tests for the snapshot coordinator.
//!
//! Each test drives `/bin/sh` as a stand-in VM: the script prints to its
//! "console" and reacts to the monitor commands written to its stdin. The
//! state file is created either by the test itself or by the script.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use boot_snapshot::vm::RunPhase;
use boot_snapshot::vm::console::ConsoleMirror;
use boot_snapshot::{ErrorKind, RunConfig, SnapshotRequest, capture_with_mirror};
use tokio::io::AsyncReadExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Every stdin line is logged to `$2` prefixed with whether `$1` existed
/// when the line arrived. Exits 0 on `quit`.
const RECORDING_VM: &str = r#"
echo boot
echo ==========
while IFS= read -r line; do
  if [ -e "$1" ]; then seen=present; else seen=absent; fi
  printf '%s %s\n' "$seen" "$line" >> "$2"
  [ "$line" = quit ] && exit 0
done
exit 7
"#;

fn sh_config(script: &str, extra: &[&Path], state: &Path, timeout: Duration) -> RunConfig {
    let mut args = vec!["-c".to_string(), script.to_string(), "fake-vm".to_string()];
    args.extend(extra.iter().map(|p| p.display().to_string()));
    let request = SnapshotRequest::new(state)
        .unwrap()
        .with_poll_interval(Duration::from_millis(50))
        .unwrap();
    RunConfig::new("/bin/sh", args, request)
        .unwrap()
        .with_timeout(timeout)
        .unwrap()
}

async fn run_capturing_mirror(
    config: &RunConfig,
) -> (
    Result<boot_snapshot::RunSummary, boot_snapshot::ErrorReport>,
    String,
) {
    let (writer, mut reader) = tokio::io::duplex(64 * 1024);
    let result = capture_with_mirror(config, ConsoleMirror::new(writer)).await;
    let mut mirrored = Vec::new();
    reader.read_to_end(&mut mirrored).await.unwrap();
    (result, String::from_utf8_lossy(&mirrored).into_owned())
}

/// Create `state` once the VM has logged its first migrate command.
fn create_state_after_first_migrate(log: PathBuf, state: PathBuf) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Ok(text) = tokio::fs::read_to_string(&log).await {
                if text.contains("migrate file:") {
                    // Write then rename so the file never appears half-written.
                    let partial = state.with_extension("partial");
                    tokio::fs::write(&partial, b"QEVM").await.unwrap();
                    tokio::fs::rename(&partial, &state).await.unwrap();
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn boots_to_marker_and_captures_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("vm.state");
    let log = dir.path().join("stdin.log");
    let config = sh_config(RECORDING_VM, &[&state, &log], &state, Duration::from_secs(20));

    let creator = create_state_after_first_migrate(log.clone(), state.clone());
    let (result, mirrored) = run_capturing_mirror(&config).await;
    creator.await.unwrap();

    let summary = result.expect("capture should succeed");
    assert!(summary.migrate_attempts >= 1);
    assert_eq!(summary.state_file, state);
    assert_eq!(summary.state_file_bytes, 4);
    assert_eq!(summary.phase, RunPhase::Completed);
    assert!(summary.exit_status.expect("VM exited after quit").success());

    assert_eq!(mirrored, "boot\n\n");
    assert!(!mirrored.contains('='));

    let recorded = std::fs::read_to_string(&log).unwrap();
    let lines: Vec<&str> = recorded.lines().collect();
    let migrate = format!("migrate file:{}", state.display());

    // First line: monitor escape glued to the first migrate, file not there yet.
    assert_eq!(lines[0], format!("absent \x01c{migrate}"));
    for line in &lines[1..lines.len() - 1] {
        assert!(line.ends_with(&migrate), "unexpected command: {line:?}");
    }
    assert_eq!(*lines.last().unwrap(), "present quit");
    assert_eq!(lines.iter().filter(|l| l.ends_with("quit")).count(), 1);
}

#[tokio::test]
async fn missing_marker_times_out_and_kills_vm() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("vm.state");
    let timeout = Duration::from_millis(300);
    let config = sh_config("echo booting; echo =====; exec sleep 30", &[], &state, timeout);

    let started = Instant::now();
    let (result, mirrored) = run_capturing_mirror(&config).await;

    let report = result.expect_err("no marker means no snapshot");
    assert_eq!(report.kind(), ErrorKind::Timeout);
    assert!(report.elapsed >= timeout);
    assert!(report.to_string().contains("marker"), "{report}");
    assert!(started.elapsed() < Duration::from_secs(10), "VM was not killed promptly");
    assert_eq!(mirrored, "booting\n=====\n");
    assert!(!state.exists());
}

#[tokio::test]
async fn missing_state_file_times_out_while_migrating() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("vm.state");
    let log = dir.path().join("stdin.log");
    let script = r#"
echo ==========
while IFS= read -r line; do
  printf '%s\n' "$line" >> "$1"
done
"#;
    let timeout = Duration::from_secs(1);
    let config = sh_config(script, &[&log], &state, timeout);

    let started = Instant::now();
    let (result, _) = run_capturing_mirror(&config).await;

    let report = result.expect_err("the state file never appears");
    assert_eq!(report.kind(), ErrorKind::Timeout);
    assert!(report.elapsed >= timeout);
    assert!(report.to_string().contains("state file"), "{report}");
    assert!(started.elapsed() < Duration::from_secs(10), "VM was not killed promptly");
    assert!(!state.exists());

    let recorded = std::fs::read_to_string(&log).unwrap();
    let migrates = recorded.lines().filter(|l| l.contains("migrate file:")).count();
    assert!(migrates >= 2, "expected repeated migrate attempts, got {recorded:?}");
    assert!(!recorded.contains("quit"));
}

#[tokio::test]
async fn background_child_holding_stdout_does_not_delay_success() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("vm.state");
    let script = r#"
sleep 30 </dev/null &
echo ==========
while IFS= read -r line; do
  case "$line" in
    *"migrate file:"*) : > "$1" ;;
    quit) exit 0 ;;
  esac
done
"#;
    let config = sh_config(script, &[&state], &state, Duration::from_secs(20));

    let started = Instant::now();
    let (result, _) = run_capturing_mirror(&config).await;

    let summary = result.expect("VM quit cleanly");
    assert_eq!(summary.exit_status.and_then(|s| s.code()), Some(0));
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "success waited on the inherited pipe: {:?}",
        started.elapsed()
    );
    assert!(summary.elapsed < Duration::from_secs(5));
}

#[tokio::test]
async fn vm_exiting_before_marker_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("vm.state");
    let config = sh_config("echo boot; exit 3", &[], &state, Duration::from_secs(20));

    let started = Instant::now();
    let (result, _) = run_capturing_mirror(&config).await;

    let report = result.expect_err("VM died during boot");
    assert!(
        matches!(report.kind(), ErrorKind::Stream | ErrorKind::ProcessDied),
        "unexpected kind {}",
        report.kind()
    );
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn closed_stdin_is_a_stream_error() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("vm.state");
    let config = sh_config(
        "exec 0<&-; echo ==========; exec sleep 30",
        &[],
        &state,
        Duration::from_secs(20),
    );

    let started = Instant::now();
    let (result, _) = run_capturing_mirror(&config).await;

    let report = result.expect_err("writes to a closed stdin must fail");
    assert_eq!(report.kind(), ErrorKind::Stream);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn nonzero_exit_after_quit_is_still_success() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("vm.state");
    let script = r#"
echo ==========
while IFS= read -r line; do
  case "$line" in
    *"migrate file:"*) : > "$1" ;;
    quit) exit 3 ;;
  esac
done
"#;
    let config = sh_config(script, &[&state], &state, Duration::from_secs(20));

    let (result, _) = run_capturing_mirror(&config).await;

    let summary = result.expect("exit after quit is informational");
    assert_eq!(summary.exit_status.and_then(|s| s.code()), Some(3));
    assert_eq!(summary.state_file_bytes, 0);
}

#[tokio::test]
async fn vm_ignoring_quit_is_killed_at_the_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("vm.state");
    let script = r#"
echo ==========
while IFS= read -r line; do
  case "$line" in
    *"migrate file:"*) : > "$1" ;;
    quit) exec sleep 30 ;;
  esac
done
"#;
    let config = sh_config(script, &[&state], &state, Duration::from_secs(2));

    let started = Instant::now();
    let (result, _) = run_capturing_mirror(&config).await;

    let summary = result.expect("state file was written before the deadline");
    assert!(summary.exit_status.is_none());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn missing_executable_fails_before_anything_runs() {
    let dir = tempfile::tempdir().unwrap();
    let request = SnapshotRequest::new(dir.path().join("vm.state")).unwrap();
    let config = RunConfig::new(dir.path().join("no-such-vm"), vec![], request).unwrap();

    let (result, mirrored) = run_capturing_mirror(&config).await;

    let report = result.expect_err("spawn should fail");
    assert_eq!(report.kind(), ErrorKind::ProcessStart);
    assert!(mirrored.is_empty());
}
