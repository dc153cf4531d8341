//! RAM staging buffer for log records
//!
//! Holds whole encoded records between flushes. Capacity is reserved once up
//! front and never grows; when a new record does not fit, the oldest records
//! are dropped to make room. Dropping whole records keeps the buffer
//! parseable from its first byte.

use alloc::vec::Vec;

use super::StorageError;
use super::record::{LogRecord, MAX_RECORD_LEN, RECORD_HEADER_LEN};

pub struct StagingBuffer {
    buf: Vec<u8>,
    capacity: usize,
    dropped: u32,
}

/// Fallibly allocate an empty `Vec` with exactly `capacity` bytes reserved.
pub(crate) fn try_alloc(capacity: usize) -> Result<Vec<u8>, StorageError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(capacity)
        .map_err(|_| StorageError::Allocation { bytes: capacity })?;
    Ok(buf)
}

impl StagingBuffer {
    /// Reserve `capacity` bytes. Fails instead of aborting when the heap is
    /// exhausted.
    pub fn try_new(capacity: usize) -> Result<Self, StorageError> {
        if capacity < MAX_RECORD_LEN {
            return Err(StorageError::RecordTooLarge {
                len: MAX_RECORD_LEN,
            });
        }
        Ok(Self {
            buf: try_alloc(capacity)?,
            capacity,
            dropped: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Records dropped to make room since creation.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Append one record, evicting the oldest records if needed.
    ///
    /// Returns how many records were evicted.
    pub fn push(&mut self, record: &LogRecord) -> Result<usize, StorageError> {
        let len = record.encoded_len();
        if len > self.capacity {
            return Err(StorageError::RecordTooLarge { len });
        }

        let mut evict = 0;
        let mut evicted = 0;
        while self.buf.len() - evict + len > self.capacity {
            evict += RECORD_HEADER_LEN + self.buf[evict + RECORD_HEADER_LEN - 1] as usize;
            evicted += 1;
        }
        if evict > 0 {
            self.buf.drain(..evict);
            self.dropped = self.dropped.saturating_add(evicted as u32);
        }

        self.buf.extend_from_slice(&record.header());
        self.buf.extend_from_slice(&record.payload);
        Ok(evicted)
    }

    /// Move the staged bytes into `out` (which must be empty and have at
    /// least this buffer's capacity) and leave this buffer empty.
    ///
    /// Swaps the two allocations, so nothing is copied or allocated.
    pub fn swap_out(&mut self, out: &mut Vec<u8>) {
        debug_assert!(out.is_empty());
        core::mem::swap(&mut self.buf, out);
        self.buf.clear();
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
