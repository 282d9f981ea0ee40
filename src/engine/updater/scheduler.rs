//! Periodic update checks.
//!
//! The timer is re-armed only after a cycle finishes, so at most one cycle is
//! ever in flight from here.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::download::Fetcher;
use super::pipeline::{CheckOptions, UpdatePipeline};
use super::verify::{KeyRecovery, Secp256k1Recovery};

/// Default interval between checks (20 minutes).
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(20 * 60);

pub struct UpdateScheduler<F, R = Secp256k1Recovery> {
    pipeline: Arc<UpdatePipeline<F, R>>,
    interval: Duration,
    check_on_start: bool,
    options: CheckOptions,
}

impl<F, R> UpdateScheduler<F, R>
where
    F: Fetcher + 'static,
    R: KeyRecovery + 'static,
{
    pub fn new(pipeline: Arc<UpdatePipeline<F, R>>, interval: Duration) -> Self {
        Self {
            pipeline,
            interval,
            check_on_start: false,
            options: CheckOptions::default(),
        }
    }

    /// Run the first check immediately instead of after one interval.
    pub fn check_on_start(mut self, enabled: bool) -> Self {
        self.check_on_start = enabled;
        self
    }

    pub fn with_options(mut self, options: CheckOptions) -> Self {
        self.options = options;
        self
    }

    /// Check every interval until `shutdown` becomes true or its sender is
    /// dropped. A cycle in flight at shutdown is abandoned. Returns the number
    /// of completed cycles.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> usize {
        info!(interval_secs = self.interval.as_secs(), "Web update checks scheduled");
        let mut completed = 0;
        let mut wait = if self.check_on_start {
            Duration::ZERO
        } else {
            self.interval
        };

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            tokio::select! {
                outcome = self.pipeline.check_for_update(self.options) => {
                    debug!(outcome = %outcome, "Scheduled update check finished");
                    completed += 1;
                }
                _ = shutdown.changed() => {
                    info!("Abandoning update check on shutdown");
                    break;
                }
            }

            wait = self.interval;
        }

        info!(cycles = completed, "Web update scheduler shutting down");
        completed
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<usize> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
