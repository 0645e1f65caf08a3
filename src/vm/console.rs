//! VM console output: marker detection and mirroring.
//!
//! The scanner is the single reader of the VM's stdout. Until the marker run
//! completes it tracks a run counter across reads; afterwards it copies the
//! remaining output to the mirror untouched.

use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::MarkerPattern;
use crate::error::{Result, SnapshotError, round_millis};
use crate::vm::{ByteCounter, Detection, PhaseTracker, RunPhase};

const READ_CHUNK: usize = 4096;

/// Passthrough sink for console bytes. Observability only.
pub struct ConsoleMirror<W> {
    sink: W,
}

impl ConsoleMirror<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Unpin> ConsoleMirror<W> {
    pub fn new(sink: W) -> Self {
        Self { sink }
    }

    pub async fn forward(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.sink
            .write_all(bytes)
            .await
            .map_err(|e| SnapshotError::stream("failed to copy VM output", e))?;
        self.sink
            .flush()
            .await
            .map_err(|e| SnapshotError::stream("failed to copy VM output", e))
    }

    pub fn get_ref(&self) -> &W {
        &self.sink
    }
}

/// Result of feeding one chunk through the run counter.
#[derive(Debug, PartialEq, Eq)]
struct ScanStep {
    /// Bytes to forward to the mirror, in order.
    forward: Vec<u8>,
    /// Offset just past the completed marker run, if it completed in this chunk.
    detected_at: Option<usize>,
}

/// Run counter over the marker byte. Marker bytes of an unfinished run are
/// held back until the run either completes (dropped) or breaks (released
/// ahead of the breaking byte). A run cut off by the end of the stream is
/// released through [`RunCounter::take_held`].
#[derive(Debug)]
struct RunCounter {
    pattern: MarkerPattern,
    run: usize,
}

impl RunCounter {
    fn new(pattern: MarkerPattern) -> Self {
        Self { pattern, run: 0 }
    }

    fn feed(&mut self, chunk: &[u8]) -> ScanStep {
        let marker = self.pattern.byte();
        let mut forward = Vec::with_capacity(chunk.len());
        for (i, &b) in chunk.iter().enumerate() {
            if b == marker {
                self.run += 1;
                if self.run == self.pattern.run_len() {
                    self.run = 0;
                    return ScanStep {
                        forward,
                        detected_at: Some(i + 1),
                    };
                }
            } else {
                forward.extend(std::iter::repeat_n(marker, self.run));
                self.run = 0;
                forward.push(b);
            }
        }
        ScanStep {
            forward,
            detected_at: None,
        }
    }

    fn take_held(&mut self) -> Vec<u8> {
        let held = vec![self.pattern.byte(); self.run];
        self.run = 0;
        held
    }
}

/// Single reader of the VM's stdout.
pub struct MarkerScanner<W> {
    counter: RunCounter,
    mirror: ConsoleMirror<W>,
    bytes_read: ByteCounter,
    phase: PhaseTracker,
    started: Instant,
}

impl<W: AsyncWrite + Unpin> MarkerScanner<W> {
    pub fn new(
        pattern: MarkerPattern,
        mirror: ConsoleMirror<W>,
        bytes_read: ByteCounter,
        phase: PhaseTracker,
        started: Instant,
    ) -> Self {
        Self {
            counter: RunCounter::new(pattern),
            mirror,
            bytes_read,
            phase,
            started,
        }
    }

    pub fn mirror(&self) -> &ConsoleMirror<W> {
        &self.mirror
    }

    /// Scan `output` until the marker run completes, fire `detected`, then
    /// copy the rest of the stream to the mirror until EOF.
    ///
    /// EOF or a read error before detection is fatal; if the scope was
    /// cancelled first the error is a timeout instead.
    pub async fn run<R>(
        &mut self,
        mut output: R,
        detected: oneshot::Sender<Detection>,
        scope: &CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; READ_CHUNK];

        let scanned = loop {
            let read = tokio::select! {
                biased;
                _ = scope.cancelled() => None,
                read = output.read(&mut buf) => Some(read),
            };
            let n = match read {
                Some(Ok(0)) => {
                    break Err(SnapshotError::OutputClosed {
                        bytes_read: self.bytes_read.get(),
                    });
                }
                Some(Ok(n)) => n,
                None => break Err(self.timeout()),
                Some(Err(_)) if scope.is_cancelled() => break Err(self.timeout()),
                Some(Err(e)) => {
                    break Err(SnapshotError::stream(
                        format!("failed to read VM output after {} bytes", self.bytes_read.get()),
                        e,
                    ));
                }
            };

            let step = self.counter.feed(&buf[..n]);
            self.bytes_read.add(step.detected_at.unwrap_or(n));
            self.mirror.forward(&step.forward).await?;
            if let Some(end) = step.detected_at {
                break Ok((end, n));
            }
        };

        let (end, n) = match scanned {
            Ok(found) => found,
            Err(e) => {
                self.release_held().await;
                return Err(e);
            }
        };

        let detection = Detection {
            bytes_read: self.bytes_read.get(),
            elapsed: self.started.elapsed(),
        };
        info!(
            marker = %self.counter.pattern,
            elapsed = %humantime::format_duration(round_millis(detection.elapsed)),
            bytes_read = detection.bytes_read,
            "Detected marker"
        );
        self.phase.set(RunPhase::MarkerDetected);
        if detected.send(detection).is_err() {
            debug!("Detection receiver already gone");
        }

        self.bytes_read.add(n - end);
        self.mirror.forward(&buf[end..n]).await?;
        self.copy_rest(output, &mut buf, scope).await
    }

    /// Unconditional copy mode. Errors only count while the scope is live.
    async fn copy_rest<R>(
        &mut self,
        mut output: R,
        buf: &mut [u8],
        scope: &CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let read = tokio::select! {
                biased;
                _ = scope.cancelled() => return Ok(()),
                read = output.read(buf) => read,
            };
            match read {
                Ok(0) => {
                    debug!(bytes_read = self.bytes_read.get(), "VM output closed");
                    return Ok(());
                }
                Ok(n) => {
                    self.bytes_read.add(n);
                    if let Err(e) = self.mirror.forward(&buf[..n]).await {
                        return if scope.is_cancelled() { Ok(()) } else { Err(e) };
                    }
                }
                Err(_) if scope.is_cancelled() => return Ok(()),
                Err(e) => return Err(SnapshotError::stream("failed to read VM output", e)),
            }
        }
    }

    /// Forward the marker bytes of a run the stream ended in the middle of.
    async fn release_held(&mut self) {
        let held = self.counter.take_held();
        if let Err(e) = self.mirror.forward(&held).await {
            debug!(error = %e, "Failed to mirror trailing marker bytes");
        }
    }

    fn timeout(&self) -> SnapshotError {
        SnapshotError::Timeout {
            waiting_for: "marker",
            elapsed: self.started.elapsed(),
            bytes_read: self.bytes_read.get(),
        }
    }
}
