//! Track the height of every source and select one that can serve a given index.
//!
//! # Heights
//!
//! Each source is in one of three states: never probed ([Height::Unknown]), failed its last
//! probe or request ([Height::Unreachable]), or confirmed at some height ([Height::At]). The
//! pool's best height is the maximum confirmed height. When no source is confirmed, the pool is
//! "all down" and every stage of the pipeline pauses until a probe succeeds again.
//!
//! # Selection
//!
//! [Pool::select] picks uniformly at random among the sources that have reached the requested
//! index. Local sources (see [Endpoint::is_local]) are entered `local_weight` times into the
//! candidate list, so with the default weight they are twice as likely to be picked as a remote
//! source at the same height.
//!
//! # Locking
//!
//! The source list is guarded by a read/write lock. Probes run without holding it: the lock is
//! only taken once every probe has resolved (or timed out) to apply the results.

use crate::{endpoint::Endpoint, metrics::Metrics, Client, Config};
use commonware_macros::select;
use commonware_runtime::{Clock, Handle, Metrics as RuntimeMetrics, Spawner};
use futures::future::join_all;
use rand::Rng;
use std::{
    sync::{Arc, RwLock},
    time::Duration,
};
use tracing::{debug, error, info, warn};

/// Last known height of a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Height {
    /// The source has not been probed yet.
    Unknown,
    /// The last probe (or request) to the source failed.
    Unreachable,
    /// The source reported this height.
    At(u64),
}

impl Height {
    /// Returns the confirmed height, if any.
    pub fn get(&self) -> Option<u64> {
        match self {
            Height::At(height) => Some(*height),
            _ => None,
        }
    }
}

struct Source {
    endpoint: Endpoint,
    height: Height,
}

struct State {
    sources: Vec<Source>,
    best: Option<u64>,

    /// Whether the "all down" condition has been logged (and not yet recovered).
    down: bool,
}

impl State {
    /// Apply a new height to the source at `idx`, logging any change in availability.
    fn update(&mut self, idx: usize, height: Height) {
        let source = &mut self.sources[idx];
        let endpoint = source.endpoint.url();
        match (source.height, height) {
            (Height::At(_), Height::Unreachable) => warn!(endpoint, "source down"),
            (Height::Unknown, Height::Unreachable) => warn!(endpoint, "source unreachable"),
            (Height::Unknown, Height::At(height)) => info!(endpoint, height, "source up"),
            (Height::Unreachable, Height::At(height)) => {
                info!(endpoint, height, "source recovered")
            }
            _ => {}
        }
        source.height = height;
    }

    /// Recompute the best height and log entering or leaving the "all down" condition.
    fn recompute(&mut self) {
        self.best = self.sources.iter().filter_map(|s| s.height.get()).max();
        match (self.best, self.down) {
            (None, false) => {
                error!(sources = self.sources.len(), "all sources down");
                self.down = true;
            }
            (Some(best), true) => {
                info!(best, "sources available again");
                self.down = false;
            }
            _ => {}
        }
    }
}

/// Tracks the height of every configured source.
#[derive(Clone)]
pub struct Pool<E: Clock + Spawner + RuntimeMetrics + Rng, C: Client> {
    context: E,
    client: C,
    state: Arc<RwLock<State>>,

    probe_timeout: Duration,
    refresh_interval: Duration,
    local_weight: usize,

    metrics: Arc<Metrics>,
}

impl<E: Clock + Spawner + RuntimeMetrics + Rng, C: Client> Pool<E, C> {
    /// Create a pool where every source starts as [Height::Unknown].
    pub fn new(
        context: E,
        client: C,
        endpoints: Vec<Endpoint>,
        cfg: &Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        let sources = endpoints
            .into_iter()
            .map(|endpoint| Source {
                endpoint,
                height: Height::Unknown,
            })
            .collect();
        Self {
            context,
            client,
            state: Arc::new(RwLock::new(State {
                sources,
                best: None,
                down: false,
            })),
            probe_timeout: cfg.probe_timeout,
            refresh_interval: cfg.refresh_interval,
            local_weight: cfg.local_weight,
            metrics,
        }
    }

    /// Probe every source concurrently and update the best height.
    pub async fn refresh(&self) {
        let urls: Vec<String> = {
            let state = self.state.read().unwrap();
            state
                .sources
                .iter()
                .map(|source| source.endpoint.url().to_string())
                .collect()
        };
        let heights = join_all(urls.iter().map(|url| self.probe(url))).await;

        let mut state = self.state.write().unwrap();
        for (idx, height) in heights.into_iter().enumerate() {
            state.update(idx, height);
        }
        state.recompute();
        self.record(&state);
    }

    /// Request the height of a single source, treating a timeout as a failure.
    async fn probe(&self, url: &str) -> Height {
        select! {
            result = self.client.height(url) => {
                match result {
                    Ok(height) => Height::At(height),
                    Err(err) => {
                        debug!(?err, endpoint = url, "probe failed");
                        Height::Unreachable
                    }
                }
            },
            _ = self.context.sleep(self.probe_timeout) => {
                debug!(endpoint = url, "probe timed out");
                Height::Unreachable
            },
        }
    }

    /// Mark a single source unreachable until its next successful probe.
    pub fn mark_down(&self, url: &str) {
        let mut state = self.state.write().unwrap();
        let Some(idx) = state
            .sources
            .iter()
            .position(|source| source.endpoint.url() == url)
        else {
            return;
        };
        state.update(idx, Height::Unreachable);
        state.recompute();
        self.record(&state);
    }

    /// Select a source that has reached `min_height`.
    ///
    /// Returns `None` if no source qualifies (the caller should wait and try again).
    pub fn select(&self, min_height: u64) -> Option<String> {
        let state = self.state.read().unwrap();
        let mut candidates = Vec::new();
        for (idx, source) in state.sources.iter().enumerate() {
            let Some(height) = source.height.get() else {
                continue;
            };
            if height < min_height {
                continue;
            }
            let weight = if source.endpoint.is_local() {
                self.local_weight
            } else {
                1
            };
            candidates.extend(std::iter::repeat(idx).take(weight));
        }
        if candidates.is_empty() {
            return None;
        }
        let pick = self.context.clone().gen_range(0..candidates.len());
        Some(state.sources[candidates[pick]].endpoint.url().to_string())
    }

    /// Returns the highest height confirmed by any source.
    pub fn best_height(&self) -> Option<u64> {
        self.state.read().unwrap().best
    }

    /// Returns true if no source has a confirmed height.
    pub fn all_down(&self) -> bool {
        self.best_height().is_none()
    }

    /// Returns the last known height of every source.
    pub fn heights(&self) -> Vec<(String, Height)> {
        self.state
            .read()
            .unwrap()
            .sources
            .iter()
            .map(|source| (source.endpoint.url().to_string(), source.height))
            .collect()
    }

    /// Returns a handle to the same sources that probes (and spawns) with `context`.
    pub(crate) fn with_context(&self, context: E) -> Self {
        Self {
            context,
            ..self.clone()
        }
    }

    /// Refresh the pool every `refresh_interval` until the runtime shuts down.
    pub fn start(self) -> Handle<()> {
        self.context
            .with_label("refresher")
            .spawn(move |_| async move {
                loop {
                    self.context.sleep(self.refresh_interval).await;
                    self.refresh().await;
                }
            })
    }

    fn record(&self, state: &State) {
        let up = state
            .sources
            .iter()
            .filter(|source| source.height.get().is_some())
            .count();
        self.metrics.sources_up.set(up as i64);
        self.metrics
            .best_height
            .set(state.best.map_or(-1, |best| best as i64));
    }
}
