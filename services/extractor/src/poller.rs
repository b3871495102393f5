use crate::orchestrator::{CycleReport, Pipeline};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Runs pipeline cycles on a fixed interval until cancelled.
///
/// Cycles never overlap: a tick that falls due while a cycle is still
/// running is delayed until it finishes.
pub struct Poller {
    pipeline: Arc<Pipeline>,
    interval: Duration,
}

impl Poller {
    pub fn new(pipeline: Arc<Pipeline>, interval: Duration) -> Self {
        Self { pipeline, interval }
    }

    /// Poll until `shutdown` is cancelled. An in-flight cycle is always finished first.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs_f64(), "Poller started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Poller stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.run_once().await;
                    debug!(received = report.received, "Poll cycle done");
                }
            }
        }
    }

    /// Run a single cycle immediately
    pub async fn run_once(&self) -> CycleReport {
        self.pipeline.run_cycle().await
    }
}
