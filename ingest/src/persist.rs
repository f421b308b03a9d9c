//! Commit the ordered stream in size-bounded batches.
//!
//! Records are accumulated until either their total payload size reaches `batch_bytes` or the
//! last record is the highest one fetched so far (nothing more is imminently available, so the
//! batch is flushed to keep latency bounded).
//!
//! Every batch must extend the committed sequence without gaps. A gap or a failed commit stops
//! the pipeline: persisting out of order (or skipping a record) cannot be repaired later.

use crate::{buffer::Buffer, cache::Cache, metrics::Metrics, Error, Persister, Record};
use futures::{channel::mpsc, StreamExt};
use std::sync::Arc;
use tracing::{debug, error};

/// Records waiting to be committed.
#[derive(Default)]
pub struct Batch {
    records: Vec<Record>,
    bytes: usize,
}

impl Batch {
    /// Append a record.
    pub fn push(&mut self, record: Record) {
        self.bytes += record.size();
        self.records.push(record);
    }

    /// Total payload size of the batch.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove and return every record.
    pub fn take(&mut self) -> Vec<Record> {
        self.bytes = 0;
        std::mem::take(&mut self.records)
    }
}

/// Consumes the ordered stream and commits it to a [Persister].
pub struct Persist<P: Persister> {
    persister: P,
    buffer: Buffer,
    cache: Cache,
    batch_bytes: usize,

    /// Index the next committed record must have.
    next: u64,

    metrics: Arc<Metrics>,
}

impl<P: Persister> Persist<P> {
    /// Create a persist stage whose first committed record will be `next`.
    pub fn new(
        persister: P,
        buffer: Buffer,
        cache: Cache,
        batch_bytes: usize,
        next: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            persister,
            buffer,
            cache,
            batch_bytes,
            next,
            metrics,
        }
    }

    /// Commit records from `input` until it closes.
    ///
    /// Whatever is pending when `input` closes is committed before returning.
    pub async fn run(mut self, mut input: mpsc::Receiver<Record>) -> Result<(), Error> {
        let mut batch = Batch::default();
        while let Some(record) = input.next().await {
            let index = record.index;
            batch.push(record);
            if batch.bytes() >= self.batch_bytes || self.buffer.highest() == Some(index) {
                self.flush(&mut batch).await?;
            }
        }
        if !batch.is_empty() {
            self.flush(&mut batch).await?;
        }
        Ok(())
    }

    async fn flush(&mut self, batch: &mut Batch) -> Result<(), Error> {
        let bytes = batch.bytes();
        let records = batch.take();
        for (expected, record) in (self.next..).zip(records.iter()) {
            if record.index != expected {
                error!(expected, got = record.index, "gap in ordered stream");
                return Err(Error::Gap {
                    expected,
                    got: record.index,
                });
            }
        }
        let (Some(first), Some(last)) = (records.first(), records.last()) else {
            return Ok(());
        };
        let (first, last) = (first.index, last.index);
        if let Err(err) = self.persister.commit(records.clone()).await {
            error!(first, last, ?err, "failed to commit batch");
            return Err(Error::Persist {
                first,
                last,
                source: Box::new(err),
            });
        }
        debug!(first, last, bytes, "committed batch");
        self.next = last + 1;
        self.metrics.committed.set(last as i64);
        self.metrics.batches.inc();
        self.metrics.bytes.inc_by(bytes as u64);
        for record in records {
            self.cache.insert(record);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks;
    use commonware_runtime::{deterministic, Clock, Runner, Spawner};
    use futures::SinkExt;
    use std::time::Duration;

    const MIB: usize = 1024 * 1024;

    fn record(index: u64, size: usize) -> Record {
        Record::new(index, mocks::payload(index, size))
    }

    fn create_persist(
        persister: mocks::Persister,
        buffer: Buffer,
        next: u64,
    ) -> Persist<mocks::Persister> {
        Persist::new(
            persister,
            buffer,
            Cache::new(16),
            2 * MIB,
            next,
            Arc::new(Metrics::default()),
        )
    }

    #[test]
    fn test_batch() {
        let mut batch = Batch::default();
        assert!(batch.is_empty());
        batch.push(record(0, 10));
        batch.push(record(1, 20));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.bytes(), 30);
        let records = batch.take();
        assert_eq!(records.len(), 2);
        assert!(batch.is_empty());
        assert_eq!(batch.bytes(), 0);
    }

    #[test]
    fn test_flush_on_threshold() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let persister = mocks::Persister::new(None);
            let buffer = Buffer::new(0);
            buffer.put(record(100, 1));
            let persist = create_persist(persister.clone(), buffer, 0);
            let (mut sender, receiver) = mpsc::channel(16);
            context
                .with_label("persist")
                .spawn(|_| persist.run(receiver));

            // 600 KiB records cross 2 MiB on the fourth one
            for index in 0..6 {
                sender.send(record(index, 600 * 1024)).await.unwrap();
            }
            context.sleep(Duration::from_millis(100)).await;
            let batches = persister.batches();
            assert_eq!(batches.len(), 1);
            assert_eq!(
                batches[0].iter().map(|r| r.index).collect::<Vec<_>>(),
                vec![0, 1, 2, 3]
            );
        });
    }

    #[test]
    fn test_flush_at_head() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let persister = mocks::Persister::new(Some(9));
            let buffer = Buffer::new(10);
            buffer.put(record(15, 8));
            let cache = Cache::new(16);
            let metrics = Arc::new(Metrics::default());
            let persist = Persist::new(
                persister.clone(),
                buffer,
                cache.clone(),
                2 * MIB,
                10,
                metrics.clone(),
            );
            let (mut sender, receiver) = mpsc::channel(16);
            context
                .with_label("persist")
                .spawn(|_| persist.run(receiver));

            // Far below the threshold, held until the head arrives
            for index in 10..15 {
                sender.send(record(index, 8)).await.unwrap();
            }
            context.sleep(Duration::from_millis(100)).await;
            assert!(persister.batches().is_empty());
            assert!(cache.is_empty());

            sender.send(record(15, 8)).await.unwrap();
            context.sleep(Duration::from_millis(100)).await;
            assert_eq!(persister.indices(), (10..=15).collect::<Vec<_>>());
            assert_eq!(persister.batches().len(), 1);

            // Committed records are mirrored
            assert_eq!(cache.len(), 6);
            assert_eq!(cache.latest().unwrap().index, 15);
            assert_eq!(metrics.committed.get(), 15);
            assert_eq!(metrics.batches.get(), 1);
            assert_eq!(metrics.bytes.get(), 48);
        });
    }

    #[test]
    fn test_flush_on_close() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let persister = mocks::Persister::new(None);
            let persist = create_persist(persister.clone(), Buffer::new(0), 0);
            let (mut sender, receiver) = mpsc::channel(16);
            sender.send(record(0, 8)).await.unwrap();
            sender.send(record(1, 8)).await.unwrap();
            drop(sender);
            persist.run(receiver).await.unwrap();
            assert_eq!(persister.indices(), vec![0, 1]);
        });
    }

    #[test]
    fn test_gap() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let persister = mocks::Persister::new(Some(4));
            let buffer = Buffer::new(5);
            buffer.put(record(7, 8));
            let persist = create_persist(persister.clone(), buffer, 5);
            let (mut sender, receiver) = mpsc::channel(16);
            sender.send(record(5, 8)).await.unwrap();
            sender.send(record(7, 8)).await.unwrap();
            let result = persist.run(receiver).await;
            assert!(matches!(
                result,
                Err(Error::Gap {
                    expected: 6,
                    got: 7
                })
            ));
            assert!(persister.batches().is_empty());
        });
    }

    #[test]
    fn test_commit_failure() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let persister = mocks::Persister::rejecting();
            let buffer = Buffer::new(0);
            buffer.put(record(1, 8));
            let persist = create_persist(persister, buffer, 0);
            let (mut sender, receiver) = mpsc::channel(16);
            sender.send(record(0, 8)).await.unwrap();
            sender.send(record(1, 8)).await.unwrap();
            let result = persist.run(receiver).await;
            assert!(matches!(
                result,
                Err(Error::Persist {
                    first: 0,
                    last: 1,
                    ..
                })
            ));
        });
    }
}
