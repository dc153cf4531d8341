//! Flash-backed sample log
//!
//! Samples are serialized into a RAM staging buffer as they arrive, flushed to
//! a dedicated NOR flash region in batches, and streamed back out in chunks on
//! request.

pub mod flash;
pub mod log_store;
pub mod record;
pub mod staging;
pub mod upload;

use embedded_storage::nor_flash::NorFlashErrorKind;
use thiserror_no_std::Error;

pub use flash::{FlashRegion, LogFlash, RamFlash};
pub use log_store::{LogStats, PersistentLogStore};
pub use record::{LogRecord, RecordReader};
pub use staging::StagingBuffer;
pub use upload::{ChunkAssembler, ChunkHeader, UploadError, UploadLink, UploadSummary};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    #[error("could not allocate {bytes} byte staging buffer")]
    Allocation { bytes: usize },
    #[error("flash did not respond")]
    FlashUnavailable,
    #[error("invalid log region: {0}")]
    Region(&'static str),
    #[error("record of {len} bytes does not fit the staging buffer")]
    RecordTooLarge { len: usize },
    #[error("flash read at {addr:#010x} failed: {kind:?}")]
    Read { addr: u32, kind: NorFlashErrorKind },
    #[error("flash erase at {addr:#010x} failed: {kind:?}")]
    Erase { addr: u32, kind: NorFlashErrorKind },
    #[error("flash write at {addr:#010x} failed: {kind:?}")]
    Write { addr: u32, kind: NorFlashErrorKind },
}
