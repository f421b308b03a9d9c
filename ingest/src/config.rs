use crate::{endpoint::Endpoint, Error};
use std::time::Duration;

/// Configuration for the [Engine](crate::Engine).
#[derive(Clone, Debug)]
pub struct Config {
    /// Endpoints of the remote sources (at least one is required).
    pub sources: Vec<String>,

    /// First index to ingest when nothing has been persisted yet.
    pub genesis: u64,

    /// Number of buffered records above which workers stop fetching.
    ///
    /// The buffer never rejects a record, this is only checked by the workers.
    pub buffer_ceiling: usize,

    /// Accumulated payload size (in bytes) that triggers a batch commit.
    pub batch_bytes: usize,

    /// Capacity of the ordered queue between the arranger and the persist stage.
    pub output_capacity: usize,

    /// How often every source is probed for its height.
    pub refresh_interval: Duration,

    /// Maximum time to wait for a single height probe.
    pub probe_timeout: Duration,

    /// Maximum time to wait for a single record request.
    pub request_timeout: Duration,

    /// Number of times a local source is entered in the selection pool
    /// (remote sources are entered once).
    pub local_weight: usize,

    /// Maximum number of concurrent fetch workers.
    pub max_workers: usize,

    /// Lag (in records) required for each additional fetch worker.
    pub lag_per_worker: u64,

    /// How often the worker supervisor re-evaluates the number of workers.
    pub scale_interval: Duration,

    /// How long a worker waits before retrying a record that could not be fetched.
    pub retry_delay: Duration,

    /// Initial backoff of the sole worker once it has caught up.
    pub backoff_initial: Duration,

    /// Maximum backoff of the sole worker once it has caught up.
    pub backoff_max: Duration,

    /// How long the arranger sleeps when the next record is missing.
    pub poll_interval: Duration,

    /// How long the next record may be missing before a warning is logged.
    pub stall_warn: Duration,

    /// How long the next record may be missing before it is fetched directly.
    pub stall_heal: Duration,

    /// Number of recently persisted records kept in memory.
    pub cache_capacity: usize,

    /// How often progress is reported.
    pub report_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            genesis: 0,
            buffer_ceiling: 1024,
            batch_bytes: 2 * 1024 * 1024,
            output_capacity: 256,
            refresh_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            local_weight: 2,
            max_workers: 32,
            lag_per_worker: 64,
            scale_interval: Duration::from_secs(1),
            retry_delay: Duration::from_millis(100),
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
            stall_warn: Duration::from_secs(5),
            stall_heal: Duration::from_secs(15),
            cache_capacity: 128,
            report_interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Parse all configured sources, failing on the first malformed endpoint.
    pub fn endpoints(&self) -> Result<Vec<Endpoint>, Error> {
        if self.sources.is_empty() {
            return Err(Error::NoSources);
        }
        self.sources.iter().map(|s| Endpoint::parse(s)).collect()
    }

    /// Ensure the configuration can be used to start the pipeline.
    pub fn validate(&self) -> Result<(), Error> {
        self.endpoints()?;
        if self.buffer_ceiling == 0 {
            return Err(Error::InvalidConfig("buffer_ceiling must be positive"));
        }
        if self.batch_bytes == 0 {
            return Err(Error::InvalidConfig("batch_bytes must be positive"));
        }
        if self.output_capacity == 0 {
            return Err(Error::InvalidConfig("output_capacity must be positive"));
        }
        if self.local_weight == 0 {
            return Err(Error::InvalidConfig("local_weight must be positive"));
        }
        if self.max_workers == 0 {
            return Err(Error::InvalidConfig("max_workers must be positive"));
        }
        if self.lag_per_worker == 0 {
            return Err(Error::InvalidConfig("lag_per_worker must be positive"));
        }
        if self.backoff_initial.is_zero() || self.backoff_initial > self.backoff_max {
            return Err(Error::InvalidConfig(
                "backoff_initial must be positive and at most backoff_max",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("poll_interval must be positive"));
        }
        if self.stall_warn > self.stall_heal {
            return Err(Error::InvalidConfig("stall_warn must not exceed stall_heal"));
        }
        if self.cache_capacity == 0 {
            return Err(Error::InvalidConfig("cache_capacity must be positive"));
        }
        Ok(())
    }
}
