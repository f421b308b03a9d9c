//! Dynamically sized set of fetch workers.
//!
//! # Regimes
//!
//! With a single active worker, the worker fetches [Buffer::next_index] (the frontier). This keeps
//! it on the true frontier even when the arranger inserts a record out-of-band. The index is
//! reserved ([Buffer::reserve]) so that it is not claimed by any worker started in the meantime.
//! With several active workers, each one claims indices with [Buffer::next_assignable] so that no
//! index is fetched twice. A worker keeps its claim until the record is buffered.
//!
//! Once the buffer reaches its ceiling, workers stop taking new claims. A claim already held is
//! still retried: it is usually the index the arranger is waiting for.
//!
//! # Scaling
//!
//! A supervisor re-evaluates the number of workers every `scale_interval`. While the frontier is
//! behind the best height reported by the pool (and the buffer is below its ceiling), it starts
//! workers until there is one per `lag_per_worker` records of lag, capped at `max_workers`. It
//! never starts a worker once the frontier has caught up.
//!
//! Workers are never stopped by the supervisor. Instead, a worker that finds its index unavailable
//! at or beyond the best height asks to retire ([Workers::request_retire]). The request is refused
//! for the last worker, which instead backs off exponentially until new records are produced. The
//! number of active workers therefore never drops below one.

use crate::{buffer::Buffer, fetcher::Fetcher, metrics::Metrics, pool::Pool, Client, Config};
use commonware_runtime::{Clock, Handle, Metrics as RuntimeMetrics, Spawner};
use rand::Rng;
use std::{
    collections::BTreeMap,
    mem,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{debug, info};

struct State {
    active: usize,
    next_id: u64,

    /// Tasks of the active workers.
    tasks: BTreeMap<u64, Handle<()>>,
    stopped: bool,
}

/// Pool of fetch workers.
#[derive(Clone)]
pub struct Workers<E: Clock + Spawner + RuntimeMetrics + Rng, C: Client> {
    context: E,
    pool: Pool<E, C>,
    fetcher: Fetcher<E, C>,
    buffer: Buffer,
    state: Arc<Mutex<State>>,

    buffer_ceiling: usize,
    max_workers: usize,
    lag_per_worker: u64,
    scale_interval: Duration,
    retry_delay: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
    poll_interval: Duration,

    metrics: Arc<Metrics>,
}

impl<E: Clock + Spawner + RuntimeMetrics + Rng, C: Client> Workers<E, C> {
    /// Create a worker pool with no active workers.
    pub fn new(
        context: E,
        cfg: &Config,
        pool: Pool<E, C>,
        fetcher: Fetcher<E, C>,
        buffer: Buffer,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            context,
            pool,
            fetcher,
            buffer,
            state: Arc::new(Mutex::new(State {
                active: 0,
                next_id: 0,
                tasks: BTreeMap::new(),
                stopped: false,
            })),
            buffer_ceiling: cfg.buffer_ceiling,
            max_workers: cfg.max_workers,
            lag_per_worker: cfg.lag_per_worker,
            scale_interval: cfg.scale_interval,
            retry_delay: cfg.retry_delay,
            backoff_initial: cfg.backoff_initial,
            backoff_max: cfg.backoff_max,
            poll_interval: cfg.poll_interval,
            metrics,
        }
    }

    /// Number of active workers.
    pub fn active(&self) -> usize {
        self.state.lock().unwrap().active
    }

    /// Start one more worker (unless the pool was stopped).
    pub fn scale_up(&self) {
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            return;
        }
        state.active += 1;
        state.next_id += 1;
        let id = state.next_id;
        self.metrics.workers.set(state.active as i64);
        info!(id, active = state.active, "worker started");
        let worker = self.clone();
        let task = self
            .context
            .with_label("worker")
            .spawn(move |_| worker.run(id));
        state.tasks.insert(id, task);
    }

    /// Abort every worker and refuse to start new ones.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        for (_, task) in mem::take(&mut state.tasks) {
            task.abort();
        }
        state.active = 0;
        self.metrics.workers.set(0);
        debug!("workers stopped");
    }

    /// Ask for the worker `id` to retire.
    ///
    /// Returns false if `id` is the last active worker (which must keep running).
    pub fn request_retire(&self, id: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.active <= 1 {
            return false;
        }
        state.active -= 1;
        state.tasks.remove(&id);
        self.metrics.workers.set(state.active as i64);
        info!(id, active = state.active, "worker retired");
        true
    }

    /// Number of workers the current lag calls for (0 if caught up or throttled).
    fn target(&self) -> usize {
        let Some(best) = self.pool.best_height() else {
            return 0;
        };
        if self.buffer.size() >= self.buffer_ceiling {
            return 0;
        }
        let lag = (best + 1).saturating_sub(self.buffer.next_index());
        if lag == 0 {
            return 0;
        }
        let target = (lag / self.lag_per_worker).min(self.max_workers as u64) as usize;
        target.max(1)
    }

    /// Start the first worker and the supervisor that scales the pool.
    pub fn start(self) -> Handle<()> {
        self.scale_up();
        self.context
            .with_label("supervisor")
            .spawn(move |_| async move {
                loop {
                    self.context.sleep(self.scale_interval).await;
                    let target = self.target();
                    let active = self.active();
                    if target <= active {
                        continue;
                    }
                    debug!(target, active, "scaling up");
                    for _ in active..target {
                        self.scale_up();
                    }
                }
            })
    }

    async fn run(self, id: u64) {
        let mut claim: Option<u64> = None;
        let mut backoff = self.backoff_initial;
        let mut waiting = false;
        loop {
            // Nothing can be fetched while every source is down
            if self.pool.all_down() {
                self.context.sleep(self.poll_interval).await;
                continue;
            }

            // Leave room for the arranger to catch up (a held claim may be the index it waits for)
            if claim.is_none() && self.buffer.size() >= self.buffer_ceiling {
                self.context.sleep(self.poll_interval).await;
                continue;
            }

            // Pick the index to fetch
            let index = if self.active() == 1 {
                let index = self.buffer.next_index();
                if let Some(previous) = claim.replace(index) {
                    if previous != index {
                        self.buffer.release(previous);
                    }
                }
                self.buffer.reserve(index);
                index
            } else {
                *claim.get_or_insert_with(|| self.buffer.next_assignable())
            };

            if let Some(record) = self.fetcher.fetch(index, index).await {
                self.buffer.put(record);
                claim = None;
                backoff = self.backoff_initial;
                waiting = false;
                continue;
            }

            // Retry anything the sources should already have
            let Some(best) = self.pool.best_height() else {
                self.context.sleep(self.retry_delay).await;
                continue;
            };
            if index < best {
                self.context.sleep(self.retry_delay).await;
                continue;
            }

            // Caught up with the chain
            if self.request_retire(id) {
                if let Some(index) = claim {
                    self.buffer.release(index);
                }
                return;
            }
            if !waiting {
                waiting = true;
                self.metrics.caught_up.inc();
                let cursor = self.metrics.cursor.get().max(0) as u64;
                info!(
                    id,
                    index,
                    best,
                    lag = (best + 1).saturating_sub(cursor),
                    buffered = self.buffer.size(),
                    "caught up, waiting for new records"
                );
            } else {
                debug!(id, index, best, backoff = ?backoff, "waiting for new records");
            }
            self.context.sleep(backoff).await;
            backoff = (backoff * 2).min(self.backoff_max);
        }
    }
}
