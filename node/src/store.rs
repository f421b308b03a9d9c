//! Persist ordered batches to an append-only record log.
//!
//! # Format
//!
//! The `records` blob is a sequence of frames, one per record:
//!
//! ```txt
//! +---------------+-------------+-----------------+--------------+
//! | index (u64)   | len (u32)   | payload (len)   | crc32 (u32)  |
//! +---------------+-------------+-----------------+--------------+
//! ```
//!
//! The `head` blob holds two slots of `index (u64) | offset (u64) | crc32 (u32)`: the index of the
//! last committed record and the size of the log once it was written. Commits alternate between
//! slots, so a torn head write leaves the previous slot intact.
//!
//! # Commits
//!
//! A commit appends (and syncs) every frame of the batch before writing (and syncing) the head.
//! Anything in the log past the offset of the latest valid head was never committed: it is
//! truncated on [Store::init].

use crate::Error;
use blockflow_ingest::{Persister, Record};
use bytes::Bytes;
use commonware_runtime::{Blob, Storage};
use tracing::{debug, info, warn};

const RECORDS: &[u8] = b"records";
const HEAD: &[u8] = b"head";

/// Size of a head slot.
const SLOT_SIZE: u64 = 8 + 8 + 4;

/// Bytes added to every payload in the log.
const FRAME_OVERHEAD: usize = 8 + 4 + 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Head {
    index: u64,
    offset: u64,
}

impl Head {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SLOT_SIZE as usize);
        buf.extend_from_slice(&self.index.to_be_bytes());
        buf.extend_from_slice(&self.offset.to_be_bytes());
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != SLOT_SIZE as usize {
            return None;
        }
        let stored = u32::from_be_bytes(buf[16..20].try_into().ok()?);
        if crc32fast::hash(&buf[..16]) != stored {
            return None;
        }
        Some(Self {
            index: u64::from_be_bytes(buf[..8].try_into().ok()?),
            offset: u64::from_be_bytes(buf[8..16].try_into().ok()?),
        })
    }
}

/// Blob-backed implementation of [Persister].
pub struct Store<E: Storage> {
    log: E::Blob,
    head: E::Blob,

    /// Size of the committed portion of the log.
    size: u64,
    committed: Option<u64>,

    /// Head slot written by the next commit.
    slot: u64,
}

impl<E: Storage> Store<E> {
    /// Open (or create) the store in `partition`, discarding any uncommitted records.
    pub async fn init(context: E, partition: &str) -> Result<Self, Error> {
        // Find the latest valid head
        let (head, head_len) = context.open(partition, HEAD).await?;
        let mut latest: Option<(u64, Head)> = None;
        for slot in 0..2 {
            let offset = slot * SLOT_SIZE;
            if head_len < offset + SLOT_SIZE {
                continue;
            }
            let buf = head.read_at(vec![0u8; SLOT_SIZE as usize], offset).await?;
            let Some(candidate) = Head::decode(buf.as_ref()) else {
                warn!(slot, "ignoring invalid head slot");
                continue;
            };
            if latest.is_none_or(|(_, current)| candidate.index > current.index) {
                latest = Some((slot, candidate));
            }
        }
        let (size, committed, slot) = match latest {
            Some((slot, head)) => (head.offset, Some(head.index), 1 - slot),
            None => (0, None, 0),
        };

        // Drop anything written after the head
        let (log, log_len) = context.open(partition, RECORDS).await?;
        if log_len < size {
            return Err(Error::Corrupt("record log shorter than head"));
        }
        if log_len > size {
            warn!(log_len, size, "truncating uncommitted records");
            log.resize(size).await?;
            log.sync().await?;
        }
        info!(?committed, size, "opened store");
        Ok(Self {
            log,
            head,
            size,
            committed,
            slot,
        })
    }

    /// Index of the last committed record.
    pub fn committed(&self) -> Option<u64> {
        self.committed
    }

    /// Read every committed record, verifying each frame.
    pub async fn replay(&self) -> Result<Vec<Record>, Error> {
        if self.size == 0 {
            return Ok(Vec::new());
        }
        let buf = self.log.read_at(vec![0u8; self.size as usize], 0).await?;
        let buf = buf.as_ref();
        let mut records = Vec::new();
        let mut offset = 0;
        while offset < buf.len() {
            let Some(header) = buf.get(offset..offset + 12) else {
                return Err(Error::Corrupt("truncated frame header"));
            };
            let index = u64::from_be_bytes(header[..8].try_into().unwrap());
            let len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
            let end = offset + 12 + len;
            let Some(frame) = buf.get(offset..end + 4) else {
                return Err(Error::Corrupt("truncated frame"));
            };
            let stored = u32::from_be_bytes(frame[12 + len..].try_into().unwrap());
            if crc32fast::hash(&frame[..12 + len]) != stored {
                return Err(Error::Corrupt("frame checksum mismatch"));
            }
            records.push(Record::new(
                index,
                Bytes::copy_from_slice(&frame[12..12 + len]),
            ));
            offset = end + 4;
        }
        Ok(records)
    }

    /// Append `batch` to the log and advance the head.
    async fn append(&mut self, batch: Vec<Record>) -> Result<(), Error> {
        let Some(first) = batch.first().map(|record| record.index) else {
            return Ok(());
        };
        if let Some(committed) = self.committed {
            if first <= committed {
                return Err(Error::Duplicate(first));
            }
            if first != committed + 1 {
                return Err(Error::Gap {
                    expected: committed + 1,
                    got: first,
                });
            }
        }

        // Encode every frame
        let payload: usize = batch.iter().map(|record| record.size()).sum();
        let mut buf = Vec::with_capacity(payload + batch.len() * FRAME_OVERHEAD);
        for (expected, record) in (first..).zip(batch.iter()) {
            if record.index != expected {
                return Err(Error::Gap {
                    expected,
                    got: record.index,
                });
            }
            let len = u32::try_from(record.size())
                .map_err(|_| Error::RecordTooLarge(record.size()))?;
            let start = buf.len();
            buf.extend_from_slice(&record.index.to_be_bytes());
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(&record.payload);
            let crc = crc32fast::hash(&buf[start..]);
            buf.extend_from_slice(&crc.to_be_bytes());
        }
        let last = first + batch.len() as u64 - 1;
        let written = buf.len() as u64;

        // Records must be durable before the head points past them
        self.log.write_at(buf, self.size).await?;
        self.log.sync().await?;
        let head = Head {
            index: last,
            offset: self.size + written,
        };
        self.head
            .write_at(head.encode(), self.slot * SLOT_SIZE)
            .await?;
        self.head.sync().await?;

        self.slot = 1 - self.slot;
        self.size = head.offset;
        self.committed = Some(last);
        debug!(first, last, bytes = written, "appended records");
        Ok(())
    }
}

impl<E: Storage> Persister for Store<E> {
    type Error = Error;

    async fn committed(&mut self) -> Result<Option<u64>, Self::Error> {
        Ok(self.committed)
    }

    async fn commit(&mut self, batch: Vec<Record>) -> Result<(), Self::Error> {
        self.append(batch).await
    }
}
