//! Unordered store of fetched records, keyed by index.
//!
//! The buffer never enforces ordering and never rejects a record on capacity: workers check
//! [Buffer::size] against their ceiling themselves, and the [Arranger](crate::arrange::Arranger)
//! restores order by popping exactly the index it needs next.
//!
//! Besides the records themselves, the buffer hands out indices to fetch:
//!
//! - [Buffer::next_assignable] is a claim counter for the multi-worker regime. Every call returns a
//!   different index so no two workers fetch the same record.
//! - [Buffer::next_index] is the frontier (one past the highest record seen) for the single-worker
//!   regime. It is not a claim: calling it twice returns the same index.
//!
//! A worker that gives up on a claim (because it retires) hands it back with [Buffer::release].
//! Released indices are served again before anything above the frontier.

use crate::Record;
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex},
};

struct Inner {
    entries: HashMap<u64, Record>,

    /// Highest index ever inserted (or one below the start, if nothing was).
    highest: Option<u64>,

    /// Next index returned by the claim counter.
    next: u64,

    /// Lowest index that may still be inserted (everything below has been popped).
    floor: u64,

    /// Abandoned claims that must be fetched again.
    released: BTreeSet<u64>,
}

impl Inner {
    /// One past the highest index seen.
    fn frontier(&self) -> u64 {
        self.highest.map_or(self.floor, |highest| (highest + 1).max(self.floor))
    }

    /// Lowest released claim that is still missing, discarding stale ones.
    fn first_released(&mut self) -> Option<u64> {
        while let Some(&index) = self.released.first() {
            if index >= self.floor && !self.entries.contains_key(&index) {
                return Some(index);
            }
            self.released.pop_first();
        }
        None
    }
}

/// Reorder buffer shared by the workers and the arranger.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<Mutex<Inner>>,
}

impl Buffer {
    /// Create an empty buffer that will be drained starting at `start`.
    pub fn new(start: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                highest: start.checked_sub(1),
                next: start,
                floor: start,
                released: BTreeSet::new(),
            })),
        }
    }

    /// Insert a record.
    ///
    /// Returns false (and leaves the buffer untouched) if the index is already buffered or has
    /// already been drained.
    pub fn put(&self, record: Record) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let index = record.index;
        if index < inner.floor || inner.entries.contains_key(&index) {
            return false;
        }
        inner.entries.insert(index, record);
        inner.released.remove(&index);
        inner.highest = Some(inner.highest.map_or(index, |highest| highest.max(index)));
        true
    }

    /// Remove and return the record at `index`, if present.
    pub fn pop(&self, index: u64) -> Option<Record> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.entries.remove(&index)?;
        inner.floor = inner.floor.max(index + 1);
        Some(record)
    }

    /// Number of buffered records.
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Returns true if no records are buffered.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Highest index ever inserted.
    pub fn highest(&self) -> Option<u64> {
        self.inner.lock().unwrap().highest
    }

    /// Claim the next index to fetch.
    ///
    /// Released claims are returned first. Otherwise the counter never falls behind the frontier,
    /// so records inserted out-of-band are not claimed again.
    pub fn next_assignable(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        if let Some(index) = inner.first_released() {
            inner.released.remove(&index);
            return index;
        }
        let index = inner.next.max(inner.frontier());
        inner.next = index + 1;
        index
    }

    /// Next index a sole worker should fetch (without claiming it).
    pub fn next_index(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let frontier = inner.frontier();
        inner
            .first_released()
            .map_or(frontier, |released| released.min(frontier))
    }

    /// Reserve `index` (returned by [Buffer::next_index]) so that it is not claimed again.
    pub fn reserve(&self, index: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.released.remove(&index);
        inner.next = inner.next.max(index + 1);
    }

    /// Hand back a claim that will not be fetched by its owner.
    pub fn release(&self, index: u64) {
        let mut inner = self.inner.lock().unwrap();
        if index >= inner.floor && !inner.entries.contains_key(&index) {
            inner.released.insert(index);
        }
    }
}
