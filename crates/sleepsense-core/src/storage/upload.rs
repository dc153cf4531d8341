//! Chunked log upload
//!
//! The log is streamed as a sequence of chunks, each a 7-byte header followed
//! by raw log bytes:
//!
//! ```text
//! ['B'][sequence:4 BE][chunk_len:2 BE][chunk_len bytes]
//! ```
//!
//! Chunk boundaries ignore record boundaries; the receiver concatenates the
//! payloads (see [`ChunkAssembler`]) and parses records from the result.

use alloc::vec::Vec;

use embassy_time::Timer;
use embedded_io_async::{Error as _, ErrorKind, Write};
use embedded_storage::nor_flash::NorFlashError;
use log::{debug, info};
use thiserror_no_std::Error;

use super::StorageError;
use super::flash::LogFlash;
use super::log_store::PersistentLogStore;
use super::record::RecordReader;
use crate::config::{MAX_CHUNK_LEN, UploadConfig};

pub const CHUNK_MARKER: u8 = b'B';
pub const CHUNK_HEADER_LEN: usize = 7;

/// Byte sink for an upload, typically a BLE UART characteristic.
pub trait UploadLink: Write {
    /// Whether a peer is connected right now.
    fn is_connected(&self) -> bool;
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadError {
    #[error("no peer connected")]
    NotConnected,
    #[error("link write failed: {0:?}")]
    Link(ErrorKind),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub sequence: u32,
    pub len: u16,
}

impl ChunkHeader {
    pub fn encode(&self) -> [u8; CHUNK_HEADER_LEN] {
        let s = self.sequence.to_be_bytes();
        let l = self.len.to_be_bytes();
        [CHUNK_MARKER, s[0], s[1], s[2], s[3], l[0], l[1]]
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let h = bytes.get(..CHUNK_HEADER_LEN)?;
        if h[0] != CHUNK_MARKER {
            return None;
        }
        Some(Self {
            sequence: u32::from_be_bytes([h[1], h[2], h[3], h[4]]),
            len: u16::from_be_bytes([h[5], h[6]]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UploadSummary {
    pub chunks: u32,
    pub bytes: u32,
}

impl<F: LogFlash> PersistentLogStore<F> {
    /// Stream the whole log to `link`.
    ///
    /// Re-probes an offline flash and flushes staged records first, then holds the write pointer fixed while
    /// streaming `base..write_ptr` in `config.chunk_len` pieces. Appends made
    /// during the upload stay staged and go out next time.
    pub async fn upload<L: UploadLink>(
        &self,
        link: &mut L,
        config: &UploadConfig,
    ) -> Result<UploadSummary, UploadError> {
        if !link.is_connected() {
            return Err(UploadError::NotConnected);
        }

        let mut state = self.flush_and_freeze().await?;
        let end = state.write_ptr;
        let mut addr = state.region.base();
        let chunk_len = config.chunk_len.clamp(1, MAX_CHUNK_LEN) as u32;
        let pacing = config.pacing();

        info!("upload: streaming {} bytes", end - addr);
        let mut payload = [0u8; MAX_CHUNK_LEN as usize];
        let mut summary = UploadSummary::default();

        while addr < end {
            let len = (end - addr).min(chunk_len);
            let buf = &mut payload[..len as usize];
            state.flash.read(addr, buf).map_err(|e| StorageError::Read {
                addr,
                kind: e.kind(),
            })?;

            let header = ChunkHeader {
                sequence: summary.chunks,
                len: len as u16,
            };
            debug!(
                "upload: chunk seq={} addr={:#010x} len={}",
                header.sequence, addr, len
            );
            link.write_all(&header.encode())
                .await
                .map_err(|e| UploadError::Link(e.kind()))?;
            Timer::after(pacing).await;
            link.write_all(buf)
                .await
                .map_err(|e| UploadError::Link(e.kind()))?;
            Timer::after(pacing).await;

            addr += len;
            summary.chunks += 1;
            summary.bytes += len;
        }

        link.flush().await.map_err(|e| UploadError::Link(e.kind()))?;
        info!(
            "upload: done, {} chunks, {} bytes",
            summary.chunks, summary.bytes
        );
        Ok(summary)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkError {
    #[error("expected chunk marker, found {0:#04x}")]
    BadMarker(u8),
    #[error("chunk {got} out of sequence, expected {expected}")]
    OutOfSequence { expected: u32, got: u32 },
}

/// Receiver side: rebuilds the log byte stream from uploaded chunks.
///
/// Input may arrive split at arbitrary points; partial headers and payloads
/// are buffered until complete.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    pending: Vec<u8>,
    data: Vec<u8>,
    next_sequence: u32,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes received from the link.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), ChunkError> {
        self.pending.extend_from_slice(bytes);

        let mut used = 0;
        let result = loop {
            let rest = &self.pending[used..];
            let Some(&marker) = rest.first() else {
                break Ok(());
            };
            if marker != CHUNK_MARKER {
                break Err(ChunkError::BadMarker(marker));
            }
            let Some(header) = ChunkHeader::decode(rest) else {
                break Ok(());
            };
            let total = CHUNK_HEADER_LEN + header.len as usize;
            if rest.len() < total {
                break Ok(());
            }
            if header.sequence != self.next_sequence {
                break Err(ChunkError::OutOfSequence {
                    expected: self.next_sequence,
                    got: header.sequence,
                });
            }
            self.data.extend_from_slice(&rest[CHUNK_HEADER_LEN..total]);
            self.next_sequence += 1;
            used += total;
        };

        self.pending.drain(..used);
        result
    }

    /// Chunks accepted so far.
    pub fn chunks(&self) -> u32 {
        self.next_sequence
    }

    /// Reassembled log bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes received that do not yet form a complete chunk.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn records(&self) -> RecordReader<'_> {
        RecordReader::new(&self.data)
    }
}
