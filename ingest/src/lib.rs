//! Ingest numbered records from unreliable sources in strict, gap-free order.
//!
//! # Overview
//!
//! Records (blocks) are produced by an external, append-only chain and served by a set of
//! independently-progressing remote sources. Sources may go down, lag behind each other, or
//! answer slowly and out of order. This crate turns that into a single ascending, contiguous
//! stream of records handed to a [Persister] in size-bounded batches.
//!
//! The pipeline is composed of the following stages (leaves first):
//!
//! ```txt
//!              +------------+   heights    +-----------+
//!   sources -->|    Pool    |------------->|  Workers  |--(unordered)--+
//!              +------------+              +-----------+               |
//!                    |                                                 v
//!                    |                     +-----------+        +------------+
//!                    +-------------------->|  Arrange  |<-------|   Buffer   |
//!                                          +-----------+  pop   +------------+
//!                                                |
//!                                  (ordered, bounded queue)
//!                                                v
//!                                          +-----------+        +------------+
//!                                          |  Persist  |------->| Persister  |
//!                                          +-----------+        +------------+
//! ```
//!
//! - [pool::Pool] tracks the height of every source and selects one that can serve an index.
//! - [fetcher::Fetcher] performs a single bounded read against a selected source.
//! - [buffer::Buffer] holds fetched records keyed by index until they can be drained.
//! - [workers::Workers] runs a dynamically sized set of fetch tasks.
//! - [arrange::Arranger] pops records in order and re-fetches any index that stalls.
//! - [persist::Persist] batches the ordered stream and commits it.
//!
//! # Ordering
//!
//! Only the [arrange::Arranger] enforces ordering: it pops exactly the next index it needs and
//! nothing else. The buffer and the workers are free to receive records in any order.
//!
//! # Liveness
//!
//! When every source is unreachable, [pool::Pool::all_down] is set and every stage pauses until
//! some source reports a height again. This is not an error.

use bytes::Bytes;
use std::future::Future;

pub mod arrange;
pub mod buffer;
pub mod cache;
mod config;
pub use config::Config;
pub mod endpoint;
mod engine;
pub use engine::Engine;
mod error;
pub use error::Error;
pub mod fetcher;
pub mod metrics;
pub mod monitor;
pub mod persist;
pub mod pool;
pub mod workers;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

/// A single record retrieved from a source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    /// Position of the record in the chain.
    pub index: u64,

    /// Opaque contents of the record.
    pub payload: Bytes,
}

impl Record {
    /// Create a new record.
    pub fn new(index: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            index,
            payload: payload.into(),
        }
    }

    /// Number of bytes the record contributes to a batch.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Client is the interface responsible for reading from remote sources.
///
/// Calls must be idempotent: the same request may be retried against any endpoint.
pub trait Client: Clone + Send + Sync + 'static {
    /// Error returned when a request to an endpoint fails.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Return the height currently reported by `endpoint`.
    fn height(&self, endpoint: &str) -> impl Future<Output = Result<u64, Self::Error>> + Send;

    /// Return the payload at `index` from `endpoint`, or `None` if it has not been produced yet.
    fn fetch(
        &self,
        endpoint: &str,
        index: u64,
    ) -> impl Future<Output = Result<Option<Bytes>, Self::Error>> + Send;
}

/// Persister is the interface responsible for durably committing ordered batches.
pub trait Persister: Send + 'static {
    /// Error returned when a commit cannot be performed.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Return the index of the last committed record, if any.
    ///
    /// This is read once when the pipeline starts.
    fn committed(&mut self) -> impl Future<Output = Result<Option<u64>, Self::Error>> + Send;

    /// Atomically commit a contiguous batch of records.
    ///
    /// The first record of `batch` always follows the last committed record.
    fn commit(&mut self, batch: Vec<Record>) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
