//! NOR flash access for the log region

use alloc::vec;
use alloc::vec::Vec;

use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

use super::StorageError;

/// Flash device that can hold the log.
///
/// Any [`NorFlash`] works; `probe` lets a driver report that the chip is
/// missing (e.g. a bad JEDEC id) so the store can degrade and retry later.
pub trait LogFlash: NorFlash {
    fn probe(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Sector-aligned byte range of flash reserved for the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashRegion {
    base: u32,
    len: u32,
    sector: u32,
}

impl FlashRegion {
    pub fn new(base: u32, len: u32, sector: u32) -> Result<Self, StorageError> {
        if sector == 0 || len == 0 {
            return Err(StorageError::Region("empty region or sector"));
        }
        if base % sector != 0 || len % sector != 0 {
            return Err(StorageError::Region("region not sector aligned"));
        }
        if base.checked_add(len).is_none() {
            return Err(StorageError::Region("region overflows address space"));
        }
        Ok(Self { base, len, sector })
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn end(&self) -> u32 {
        self.base + self.len
    }

    pub fn sector_size(&self) -> u32 {
        self.sector
    }

    pub fn sector_start(&self, addr: u32) -> u32 {
        addr - (addr % self.sector)
    }

    /// First sector boundary at or after `addr`.
    pub fn align_up(&self, addr: u32) -> u32 {
        match addr % self.sector {
            0 => addr,
            rem => addr + (self.sector - rem),
        }
    }

    pub fn sector_count(&self) -> u32 {
        self.len / self.sector
    }
}

/// Error raised by [`RamFlash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamFlashError {
    OutOfBounds,
    NotAligned,
    /// Failure injected by a test.
    Injected,
}

impl NorFlashError for RamFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            Self::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            Self::NotAligned => NorFlashErrorKind::NotAligned,
            Self::Injected => NorFlashErrorKind::Other,
        }
    }
}

/// In-memory NOR flash: erase sets bytes to `0xFF`, program can only clear
/// bits. Used by host tests and the simulator.
pub struct RamFlash<const SECTOR: usize = 4096> {
    data: Vec<u8>,
    present: bool,
    fail_erase: bool,
    fail_write: bool,
    erases: u32,
}

impl<const SECTOR: usize> RamFlash<SECTOR> {
    /// `capacity` is rounded down to a whole number of sectors.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0xFF; capacity - capacity % SECTOR],
            present: true,
            fail_erase: false,
            fail_write: false,
            erases: 0,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Sectors erased so far.
    pub fn erase_count(&self) -> u32 {
        self.erases
    }

    pub fn set_present(&mut self, present: bool) {
        self.present = present;
    }

    pub fn fail_erases(&mut self, fail: bool) {
        self.fail_erase = fail;
    }

    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_write = fail;
    }

    fn check(&self, offset: u32, len: usize) -> Result<core::ops::Range<usize>, RamFlashError> {
        let start = offset as usize;
        let end = start.checked_add(len).ok_or(RamFlashError::OutOfBounds)?;
        if end > self.data.len() {
            return Err(RamFlashError::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl<const SECTOR: usize> ErrorType for RamFlash<SECTOR> {
    type Error = RamFlashError;
}

impl<const SECTOR: usize> ReadNorFlash for RamFlash<SECTOR> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.check(offset, bytes.len())?;
        bytes.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl<const SECTOR: usize> NorFlash for RamFlash<SECTOR> {
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = SECTOR;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from > to || from as usize % SECTOR != 0 || to as usize % SECTOR != 0 {
            return Err(RamFlashError::NotAligned);
        }
        let range = self.check(from, (to - from) as usize)?;
        if self.fail_erase {
            return Err(RamFlashError::Injected);
        }
        self.erases += (to - from) / SECTOR as u32;
        self.data[range].fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let range = self.check(offset, bytes.len())?;
        if self.fail_write {
            return Err(RamFlashError::Injected);
        }
        for (cell, b) in self.data[range].iter_mut().zip(bytes) {
            *cell &= *b;
        }
        Ok(())
    }
}

impl<const SECTOR: usize> LogFlash for RamFlash<SECTOR> {
    fn probe(&mut self) -> Result<(), Self::Error> {
        if self.present {
            Ok(())
        } else {
            Err(RamFlashError::Injected)
        }
    }
}
