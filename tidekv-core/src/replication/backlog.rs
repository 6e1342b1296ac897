//! Replication backlog
//!
//! A fixed-capacity circular byte buffer addressed by absolute stream offset.
//! It keeps the most recent `capacity` bytes of the replication stream so a
//! replica that briefly lost its link can resume from the byte it last
//! received instead of transferring a whole snapshot.
//!
//! Only the coordinator task appends. Senders are fed by the coordinator with
//! copies of ranges, so the buffer itself carries no interior locking.

use bytes::Bytes;
use thiserror::Error;

/// Default backlog capacity (1 MB)
pub const DEFAULT_BACKLOG_CAPACITY: usize = 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BacklogError {
    #[error("record of {len} bytes exceeds backlog capacity of {capacity} bytes")]
    RecordTooLarge { len: usize, capacity: usize },

    #[error("backlog capacity must be greater than zero")]
    ZeroCapacity,
}

/// Circular buffer of replication stream bytes
#[derive(Debug)]
pub struct Backlog {
    buf: Box<[u8]>,
    /// Stream offset at which this backlog started recording
    start_offset: u64,
    /// Stream offset one past the last appended byte
    offset: u64,
}

impl Backlog {
    /// Create a backlog that starts recording at `start_offset`
    pub fn new(capacity: usize, start_offset: u64) -> Result<Self, BacklogError> {
        if capacity == 0 {
            return Err(BacklogError::ZeroCapacity);
        }
        Ok(Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            start_offset,
            offset: start_offset,
        })
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Oldest offset still held
    pub fn low_water(&self) -> u64 {
        self.offset
            .saturating_sub(self.capacity() as u64)
            .max(self.start_offset)
    }

    /// Offset one past the newest byte
    pub fn high_water(&self) -> u64 {
        self.offset
    }

    /// Number of bytes currently retained
    pub fn histlen(&self) -> u64 {
        self.high_water() - self.low_water()
    }

    /// Whether a consumer positioned at `offset` can be served incrementally.
    ///
    /// `offset == high_water` counts: that consumer is caught up.
    pub fn can_serve(&self, offset: u64) -> bool {
        offset >= self.low_water() && offset <= self.high_water()
    }

    /// Append one record and return the new high-water mark
    pub fn append(&mut self, record: &[u8]) -> Result<u64, BacklogError> {
        let capacity = self.capacity();
        if record.len() > capacity {
            return Err(BacklogError::RecordTooLarge {
                len: record.len(),
                capacity,
            });
        }

        let pos = (self.offset % capacity as u64) as usize;
        let first = record.len().min(capacity - pos);
        self.buf[pos..pos + first].copy_from_slice(&record[..first]);
        let rest = record.len() - first;
        if rest > 0 {
            self.buf[..rest].copy_from_slice(&record[first..]);
        }

        self.offset += record.len() as u64;
        Ok(self.offset)
    }

    /// Copy up to `max_bytes` starting at `from`.
    ///
    /// Empty when `from` is below the low-water mark, at or above the
    /// high-water mark, or `max_bytes` is zero. Callers tell "caught up" from
    /// "too far behind" by comparing `from` with the watermarks.
    pub fn read(&self, from: u64, max_bytes: usize) -> Bytes {
        if from < self.low_water() || from >= self.high_water() || max_bytes == 0 {
            return Bytes::new();
        }

        let capacity = self.capacity();
        let len = ((self.high_water() - from) as usize).min(max_bytes);
        let pos = (from % capacity as u64) as usize;
        let first = len.min(capacity - pos);

        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&self.buf[pos..pos + first]);
        out.extend_from_slice(&self.buf[..len - first]);
        Bytes::from(out)
    }
}
