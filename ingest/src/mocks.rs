//! Mock implementations of [crate::Client] and [crate::Persister] for testing.

use crate::Record;
use bytes::Bytes;
use commonware_runtime::Clock;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;

/// Errors returned by the mocks.
#[derive(Error, Debug)]
pub enum Error {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("commit rejected")]
    Rejected,
}

/// Deterministic payload of `size` bytes for `index`.
pub fn payload(index: u64, size: usize) -> Bytes {
    let seed = index.to_be_bytes();
    (0..size).map(|i| seed[i % seed.len()]).collect()
}

struct State {
    /// Height reported by each endpoint (`None` if the endpoint is down).
    heights: HashMap<String, Option<u64>>,

    /// Indices no endpoint will serve.
    withheld: HashSet<u64>,

    /// Size of every served payload.
    payload_size: usize,

    /// Every record request received (endpoint, index).
    requests: Vec<(String, u64)>,
}

/// A scripted set of sources sharing one chain.
///
/// Every request completes after `latency` so that tasks using the client yield to the runtime.
#[derive(Clone)]
pub struct Client<E: Clock> {
    context: E,
    latency: Duration,
    state: Arc<Mutex<State>>,
}

impl<E: Clock> Client<E> {
    /// Create a client with no endpoints.
    pub fn new(context: E, latency: Duration) -> Self {
        Self {
            context,
            latency,
            state: Arc::new(Mutex::new(State {
                heights: HashMap::new(),
                withheld: HashSet::new(),
                payload_size: 8,
                requests: Vec::new(),
            })),
        }
    }

    /// Set the height of `endpoint` (`None` takes it down).
    pub fn set_height(&self, endpoint: &str, height: Option<u64>) {
        self.state
            .lock()
            .unwrap()
            .heights
            .insert(endpoint.to_string(), height);
    }

    /// Set the size of every served payload.
    pub fn set_payload_size(&self, size: usize) {
        self.state.lock().unwrap().payload_size = size;
    }

    /// Refuse to serve `index` from any endpoint.
    pub fn withhold(&self, index: u64) {
        self.state.lock().unwrap().withheld.insert(index);
    }

    /// Serve `index` again.
    pub fn release(&self, index: u64) {
        self.state.lock().unwrap().withheld.remove(&index);
    }

    /// Number of requests made for `index`.
    pub fn requests(&self, index: u64) -> usize {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|(_, i)| *i == index)
            .count()
    }

    /// Endpoints that were asked for a record, in request order.
    pub fn endpoints(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .map(|(endpoint, _)| endpoint.clone())
            .collect()
    }
}

impl<E: Clock> crate::Client for Client<E> {
    type Error = Error;

    async fn height(&self, endpoint: &str) -> Result<u64, Self::Error> {
        self.context.sleep(self.latency).await;
        let state = self.state.lock().unwrap();
        match state.heights.get(endpoint) {
            Some(Some(height)) => Ok(*height),
            _ => Err(Error::Unreachable(endpoint.to_string())),
        }
    }

    async fn fetch(&self, endpoint: &str, index: u64) -> Result<Option<Bytes>, Self::Error> {
        self.context.sleep(self.latency).await;
        let mut state = self.state.lock().unwrap();
        state.requests.push((endpoint.to_string(), index));
        let height = match state.heights.get(endpoint) {
            Some(Some(height)) => *height,
            _ => return Err(Error::Unreachable(endpoint.to_string())),
        };
        if index > height || state.withheld.contains(&index) {
            return Ok(None);
        }
        Ok(Some(payload(index, state.payload_size)))
    }
}

/// Records every committed batch in memory.
#[derive(Clone)]
pub struct Persister {
    committed: Option<u64>,
    batches: Arc<Mutex<Vec<Vec<Record>>>>,
    reject: bool,
}

impl Persister {
    /// Create a persister that reports `committed` as the last committed index.
    pub fn new(committed: Option<u64>) -> Self {
        Self {
            committed,
            batches: Arc::new(Mutex::new(Vec::new())),
            reject: false,
        }
    }

    /// Create a persister that rejects every commit.
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::new(None)
        }
    }

    /// All committed batches, in commit order.
    pub fn batches(&self) -> Vec<Vec<Record>> {
        self.batches.lock().unwrap().clone()
    }

    /// Indices of all committed records, in commit order.
    pub fn indices(&self) -> Vec<u64> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|record| record.index)
            .collect()
    }
}

impl crate::Persister for Persister {
    type Error = Error;

    async fn committed(&mut self) -> Result<Option<u64>, Self::Error> {
        Ok(self.committed)
    }

    async fn commit(&mut self, batch: Vec<Record>) -> Result<(), Self::Error> {
        if self.reject {
            return Err(Error::Rejected);
        }
        self.committed = batch.last().map(|record| record.index);
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }
}
