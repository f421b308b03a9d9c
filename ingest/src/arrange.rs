//! Drain the reorder buffer in index order.
//!
//! The [Arranger] is the only stage that enforces ordering. It pops exactly the index it needs
//! next (the cursor) and forwards it to the persist stage over a bounded channel. When the
//! channel is full, it blocks: this is where backpressure from persistence propagates back.
//!
//! # Stalls
//!
//! While the cursor is missing but other records are buffered, the cursor is stalled (the
//! worker responsible for it is slow, or the record was lost). After `stall_warn`, a warning is
//! logged once. After `stall_heal`, the arranger fetches the cursor itself and re-arms the timer.
//! An empty buffer is not a stall: nothing has been fetched yet.

use crate::{
    buffer::Buffer, fetcher::Fetcher, metrics::Metrics, pool::Pool, Client, Config, Error, Record,
};
use commonware_runtime::{Clock, Metrics as RuntimeMetrics, Spawner};
use futures::{channel::mpsc, SinkExt};
use rand::Rng;
use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};
use tracing::{debug, info, warn};

/// Pops records from the [Buffer] in strictly ascending, contiguous order.
pub struct Arranger<E: Clock + Spawner + RuntimeMetrics + Rng, C: Client> {
    context: E,
    pool: Pool<E, C>,
    fetcher: Fetcher<E, C>,
    buffer: Buffer,

    poll_interval: Duration,
    stall_warn: Duration,
    stall_heal: Duration,

    cursor: u64,
    metrics: Arc<Metrics>,
}

impl<E: Clock + Spawner + RuntimeMetrics + Rng, C: Client> Arranger<E, C> {
    /// Create an arranger that starts draining at `cursor`.
    pub fn new(
        context: E,
        cfg: &Config,
        pool: Pool<E, C>,
        fetcher: Fetcher<E, C>,
        buffer: Buffer,
        metrics: Arc<Metrics>,
        cursor: u64,
    ) -> Self {
        Self {
            context,
            pool,
            fetcher,
            buffer,
            poll_interval: cfg.poll_interval,
            stall_warn: cfg.stall_warn,
            stall_heal: cfg.stall_heal,
            cursor,
            metrics,
        }
    }

    /// Drain the buffer into `output` for the lifetime of the pipeline.
    ///
    /// Only returns if `output` is closed.
    pub async fn run(mut self, mut output: mpsc::Sender<Record>) -> Result<(), Error> {
        let mut paused = false;
        let mut stalled: Option<SystemTime> = None;
        let mut warned = false;
        self.metrics.cursor.set(self.cursor as i64);
        loop {
            self.metrics.buffered.set(self.buffer.size() as i64);

            // Wait for any source to come back
            if self.pool.all_down() {
                if !paused {
                    warn!(cursor = self.cursor, "all sources down, pausing drain");
                    paused = true;
                }
                stalled = None;
                self.context.sleep(self.poll_interval).await;
                continue;
            }
            if paused {
                info!(cursor = self.cursor, "sources available, resuming drain");
                paused = false;
            }

            // Forward the next record
            if let Some(record) = self.buffer.pop(self.cursor) {
                output.send(record).await.map_err(|_| Error::Closed)?;
                self.cursor += 1;
                self.metrics.cursor.set(self.cursor as i64);
                stalled = None;
                warned = false;
                continue;
            }
            self.context.sleep(self.poll_interval).await;
            if self.buffer.is_empty() {
                stalled = None;
                continue;
            }

            // The cursor is missing while later records are buffered
            let now = self.context.current();
            let since = *stalled.get_or_insert(now);
            let waited = now.duration_since(since).unwrap_or_default();
            if waited >= self.stall_heal {
                warn!(
                    cursor = self.cursor,
                    ?waited,
                    buffered = self.buffer.size(),
                    "record stalled, fetching directly"
                );
                self.metrics.self_heals.inc();
                if let Some(record) = self.fetcher.fetch(self.cursor, self.cursor).await {
                    debug!(cursor = self.cursor, "stalled record fetched");
                    self.buffer.put(record);
                }
                stalled = None;
                warned = false;
            } else if waited >= self.stall_warn && !warned {
                warn!(
                    cursor = self.cursor,
                    ?waited,
                    buffered = self.buffer.size(),
                    highest = ?self.buffer.highest(),
                    "waiting for record"
                );
                warned = true;
            }
        }
    }
}
