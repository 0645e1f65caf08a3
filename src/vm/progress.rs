//! Heartbeat logging while a run is in flight. Purely observational.

use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::vm::{ByteCounter, PhaseTracker};

pub struct ProgressReporter {
    interval: Duration,
    started: Instant,
    bytes_read: ByteCounter,
    phase: PhaseTracker,
}

impl ProgressReporter {
    pub fn new(
        interval: Duration,
        started: Instant,
        bytes_read: ByteCounter,
        phase: PhaseTracker,
    ) -> Self {
        Self {
            interval,
            started,
            bytes_read,
            phase,
        }
    }

    /// Log a heartbeat every interval until `stop` is cancelled. Returns the
    /// number of heartbeats logged.
    pub async fn run(self, stop: CancellationToken) -> u64 {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut beats = 0;
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    debug!(beats, "Progress reporter stopped");
                    return beats;
                }
                _ = ticker.tick() => {
                    beats += 1;
                    let elapsed = Duration::from_secs(self.started.elapsed().as_secs());
                    info!(
                        elapsed = %humantime::format_duration(elapsed),
                        bytes_read = self.bytes_read.get(),
                        phase = %self.phase.current(),
                        "Still waiting..."
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn beats_once_per_interval_until_stopped() {
        let stop = CancellationToken::new();
        let reporter = ProgressReporter::new(
            Duration::from_secs(10),
            Instant::now(),
            ByteCounter::default(),
            PhaseTracker::new(),
        );
        let handle = tokio::spawn(reporter.run(stop.clone()));

        tokio::time::sleep(Duration::from_secs(35)).await;
        stop.cancel();

        assert_eq!(handle.await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_before_first_interval_logs_nothing() {
        let stop = CancellationToken::new();
        stop.cancel();
        let reporter = ProgressReporter::new(
            Duration::from_secs(10),
            Instant::now(),
            ByteCounter::default(),
            PhaseTracker::new(),
        );

        assert_eq!(reporter.run(stop).await, 0);
    }
}
