use thiserror::Error;

/// Errors that stop the pipeline.
///
/// Failures of individual sources are never surfaced here: they are retried against other
/// sources. Everything in this enum is either a configuration problem (detected before the
/// pipeline starts) or an integrity problem (the ordered stream can no longer be trusted).
#[derive(Error, Debug)]
pub enum Error {
    #[error("no sources configured")]
    NoSources,
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("gap in batch: expected {expected}, got {got}")]
    Gap { expected: u64, got: u64 },
    #[error("failed to read committed index: {0}")]
    Committed(Box<dyn std::error::Error + Send + Sync>),
    #[error("failed to persist {first}..={last}: {source}")]
    Persist {
        first: u64,
        last: u64,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("channel closed")]
    Closed,
}
