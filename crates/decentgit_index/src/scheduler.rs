//! Fixed-cadence driver for the replay engine.

use crate::chain::BlockSource;
use crate::replay::{CycleError, CycleReport, ReplayEngine};
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

/// Runs one replay cycle at a time, waiting `interval` after each one returns.
///
/// Cycles never overlap: the wait only starts once the previous cycle,
/// including its commit, has finished. A failed cycle is logged and the next
/// one runs on schedule.
pub struct Scheduler<S> {
    engine: ReplayEngine<S>,
    interval: Duration,
}

impl<S: BlockSource> Scheduler<S> {
    pub fn new(engine: ReplayEngine<S>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    pub fn engine(&self) -> &ReplayEngine<S> {
        &self.engine
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One cycle with errors logged and swallowed.
    pub async fn tick(&self) -> Option<CycleReport> {
        match self.engine.run_cycle().await {
            Ok(report) => Some(report),
            Err(CycleError::Fetch(e)) => {
                warn!(error = %e, "fetching chain failed; retrying next cycle");
                None
            }
            Err(CycleError::Store(e)) => {
                error!(error = %e, "store failure; retrying from last checkpoint next cycle");
                None
            }
        }
    }

    /// Run exactly `cycles` cycles, sleeping between them, handing each
    /// successful report to `on_report`. Returns how many succeeded.
    pub async fn run_cycles<F>(&self, cycles: u64, mut on_report: F) -> u64
    where
        F: FnMut(&CycleReport),
    {
        let mut ok = 0;
        for i in 0..cycles {
            if i > 0 {
                tokio::time::sleep(self.interval).await;
            }
            if let Some(report) = self.tick().await {
                on_report(&report);
                ok += 1;
            }
        }
        ok
    }

    /// Poll until `shutdown` resolves. Shutdown is only observed between
    /// cycles, so an in-flight cycle always runs to completion.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(interval_secs = self.interval.as_secs(), "poller started");
        tokio::pin!(shutdown);
        loop {
            self.tick().await;
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("poller stopped");
    }
}
