//! Event loop that drives a scheduler from a host process.

use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::Scheduler;

impl Scheduler {
    /// Tick whenever work is due until `shutdown_rx` reads `true`.
    ///
    /// Sleeps between ticks for [`Scheduler::sleep_duration`] and sweeps
    /// expired records every `gc_interval` when retention is configured.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!("scheduler starting");
        let mut last_gc = Instant::now();

        loop {
            if *shutdown_rx.borrow() {
                info!("scheduler shutting down");
                break;
            }

            let now = self.clock().now();
            let report = self.tick(now).await;
            if !report.is_empty() {
                debug!(
                    dispatched = report.dispatched.len(),
                    outcomes = report.outcomes.len(),
                    "tick finished"
                );
            }

            if self.config().retention.is_some() && last_gc.elapsed() >= self.config().gc_interval
            {
                self.collect_garbage().await;
                last_gc = Instant::now();
            }

            let sleep_duration = self.sleep_duration().await;

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("scheduler received shutdown signal");
                    }
                }
                _ = sleep(sleep_duration) => {}
            }
        }

        info!("scheduler shut down gracefully");
    }
}
