//! Most recently persisted records, kept in memory for downstream readers.

use crate::Record;
use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

/// Bounded cache of the most recent records, keyed by index.
///
/// Only the persist stage inserts (after a successful commit). Clones share the same records and
/// can only read them.
#[derive(Clone)]
pub struct Cache {
    records: Arc<RwLock<BTreeMap<u64, Record>>>,
    capacity: usize,
}

impl Cache {
    /// Create an empty cache holding at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(BTreeMap::new())),
            capacity,
        }
    }

    pub(crate) fn insert(&self, record: Record) {
        let mut records = self.records.write().unwrap();
        records.insert(record.index, record);
        while records.len() > self.capacity {
            records.pop_first();
        }
    }

    /// Get the record at `index`, if cached.
    pub fn get(&self, index: u64) -> Option<Record> {
        self.records.read().unwrap().get(&index).cloned()
    }

    /// Get the record with the highest index.
    pub fn latest(&self) -> Option<Record> {
        self.records
            .read()
            .unwrap()
            .last_key_value()
            .map(|(_, record)| record.clone())
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
