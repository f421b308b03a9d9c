use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the ingestion pipeline.
#[derive(Default)]
pub struct Metrics {
    /// Next index the arranger is waiting for
    pub cursor: Gauge,
    /// Index of the last committed record
    pub committed: Gauge,
    /// Best height reported by any source (-1 if all are down)
    pub best_height: Gauge,
    /// Number of records between the cursor and the best height
    pub lag: Gauge,
    /// Number of active fetch workers
    pub workers: Gauge,
    /// Number of records waiting in the reorder buffer
    pub buffered: Gauge,
    /// Number of sources that answered the last probe
    pub sources_up: Gauge,
    /// Number of records fetched from sources
    pub fetched: Counter,
    /// Number of fetch attempts that did not return a record
    pub fetch_misses: Counter,
    /// Number of times the sole worker caught up with the best height
    pub caught_up: Counter,
    /// Number of stalled records fetched directly by the arranger
    pub self_heals: Counter,
    /// Number of committed batches
    pub batches: Counter,
    /// Number of committed payload bytes
    pub bytes: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Self::default();
        context.register(
            "cursor",
            "Next index the arranger is waiting for",
            metrics.cursor.clone(),
        );
        context.register(
            "committed",
            "Index of the last committed record",
            metrics.committed.clone(),
        );
        context.register(
            "best_height",
            "Best height reported by any source",
            metrics.best_height.clone(),
        );
        context.register(
            "lag",
            "Number of records between the cursor and the best height",
            metrics.lag.clone(),
        );
        context.register(
            "workers",
            "Number of active fetch workers",
            metrics.workers.clone(),
        );
        context.register(
            "buffered",
            "Number of records waiting in the reorder buffer",
            metrics.buffered.clone(),
        );
        context.register(
            "sources_up",
            "Number of sources that answered the last probe",
            metrics.sources_up.clone(),
        );
        context.register(
            "fetched",
            "Number of records fetched from sources",
            metrics.fetched.clone(),
        );
        context.register(
            "fetch_misses",
            "Number of fetch attempts that did not return a record",
            metrics.fetch_misses.clone(),
        );
        context.register(
            "caught_up",
            "Number of times the sole worker caught up with the best height",
            metrics.caught_up.clone(),
        );
        context.register(
            "self_heals",
            "Number of stalled records fetched directly",
            metrics.self_heals.clone(),
        );
        context.register(
            "batches",
            "Number of committed batches",
            metrics.batches.clone(),
        );
        context.register(
            "bytes",
            "Number of committed payload bytes",
            metrics.bytes.clone(),
        );
        metrics
    }
}
