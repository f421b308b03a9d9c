use crate::{metrics::Metrics, pool::Pool, Client};
use commonware_runtime::{Clock, Handle, Metrics as RuntimeMetrics, Spawner};
use rand::Rng;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

/// Snapshot of the pipeline's progress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    /// Next index the arranger is waiting for.
    pub cursor: u64,
    /// Index of the last committed record.
    pub committed: Option<u64>,
    /// Best height reported by any source.
    pub best_height: Option<u64>,
    /// Records between the cursor and the best height (inclusive).
    pub lag: u64,
    /// Whether every source is unreachable.
    pub all_down: bool,
    /// Active fetch workers.
    pub workers: usize,
    /// Records waiting in the reorder buffer.
    pub buffered: usize,
}

/// Read-only view of the pipeline's progress.
#[derive(Clone)]
pub struct Monitor<E: Clock + Spawner + RuntimeMetrics + Rng, C: Client> {
    context: E,
    pool: Pool<E, C>,
    metrics: Arc<Metrics>,
    report_interval: Duration,
}

impl<E: Clock + Spawner + RuntimeMetrics + Rng, C: Client> Monitor<E, C> {
    pub(crate) fn new(
        context: E,
        pool: Pool<E, C>,
        metrics: Arc<Metrics>,
        report_interval: Duration,
    ) -> Self {
        Self {
            context,
            pool,
            metrics,
            report_interval,
        }
    }

    /// Returns the current status of the pipeline.
    pub fn status(&self) -> Status {
        let cursor = self.metrics.cursor.get().max(0) as u64;
        let best_height = self.pool.best_height();
        Status {
            cursor,
            committed: u64::try_from(self.metrics.committed.get()).ok(),
            best_height,
            lag: best_height.map_or(0, |best| (best + 1).saturating_sub(cursor)),
            all_down: best_height.is_none(),
            workers: self.metrics.workers.get().max(0) as usize,
            buffered: self.metrics.buffered.get().max(0) as usize,
        }
    }

    /// Log progress every `report_interval` until the runtime shuts down.
    pub fn start(self) -> Handle<()> {
        self.context
            .with_label("reporter")
            .spawn(move |_| async move {
                let mut last = self.status();
                loop {
                    self.context.sleep(self.report_interval).await;
                    let status = self.status();
                    self.metrics.lag.set(status.lag as i64);
                    self.report(&last, &status);
                    last = status;
                }
            })
    }

    fn report(&self, last: &Status, status: &Status) {
        if status.all_down {
            warn!(
                cursor = status.cursor,
                committed = ?status.committed,
                "all sources down, ingestion paused"
            );
            return;
        }
        let advanced = status.cursor.saturating_sub(last.cursor);
        let rate = advanced as f64 / self.report_interval.as_secs_f64();
        let eta = (rate > 0.0).then(|| Duration::from_secs_f64(status.lag as f64 / rate));
        info!(
            cursor = status.cursor,
            committed = ?status.committed,
            best = ?status.best_height,
            lag = status.lag,
            workers = status.workers,
            buffered = status.buffered,
            rate = %format!("{rate:.1}/s"),
            eta = ?eta,
            "progress"
        );
    }
}
