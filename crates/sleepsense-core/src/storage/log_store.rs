//! Persistent append-only sample log
//!
//! ## Layout
//!
//! Records are packed from the start of the region; the first unwritten byte
//! is the write pointer. Free space reads as `0xFF`.
//!
//! ## Write path
//!
//! 1. `append` encodes the record into the RAM staging buffer under a
//!    critical-section mutex. It never waits on flash.
//! 2. `flush` swaps the staged bytes out under the same mutex, then (holding
//!    only the flash lock) makes sure the destination is erased and programs
//!    it.
//!
//! The store remembers how far ahead of the write pointer the region is known
//! to be erased, so a flush only erases sectors it is about to enter and never
//! the partly written sector that holds earlier records.
//!
//! ## Wraparound
//!
//! When a batch does not fit before the end of the region, the whole region is
//! erased and writing restarts at the base. All earlier records are lost.

use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};

use alloc::vec::Vec;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_time::{Duration, Timer};
use embedded_storage::nor_flash::NorFlashError;
use log::{debug, error, info, warn};

use super::StorageError;
use super::flash::{FlashRegion, LogFlash};
use super::record::{LogRecord, RECORD_HEADER_LEN};
use super::staging::{StagingBuffer, try_alloc};
use crate::config::StorageConfig;
use crate::sensors::{SAMPLE_CAPACITY, Sample, SampleSink};

const SCAN_CHUNK: usize = 256;
const ERASED: u8 = 0xFF;

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogStats {
    pub write_ptr: u32,
    pub staged_bytes: usize,
    pub appended: u32,
    pub evicted: u32,
    pub flushed_bytes: u32,
    pub wraps: u32,
}

pub(crate) struct FlashState<F> {
    pub(crate) flash: F,
    pub(crate) region: FlashRegion,
    pub(crate) write_ptr: u32,
    /// Everything in `[write_ptr, erased_end)` is known to read as `0xFF`.
    erased_end: u32,
    online: bool,
    batch: Vec<u8>,
    wraps: u32,
}

pub struct PersistentLogStore<F> {
    staging: BlockingMutex<CriticalSectionRawMutex, RefCell<StagingBuffer>>,
    flash: Mutex<CriticalSectionRawMutex, FlashState<F>>,
    appended: AtomicU32,
    flushed_bytes: AtomicU32,
}

fn read_err<E: NorFlashError>(addr: u32) -> impl FnOnce(E) -> StorageError {
    move |e| StorageError::Read {
        addr,
        kind: e.kind(),
    }
}

impl<F: LogFlash> FlashState<F> {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        self.flash.read(addr, buf).map_err(read_err(addr))
    }

    fn is_erased(&mut self, from: u32, to: u32) -> Result<bool, StorageError> {
        let mut buf = [0u8; SCAN_CHUNK];
        let mut addr = from;
        while addr < to {
            let n = (to - addr).min(SCAN_CHUNK as u32) as usize;
            self.read(addr, &mut buf[..n])?;
            if buf[..n].iter().any(|&b| b != ERASED) {
                return Ok(false);
            }
            addr += n as u32;
        }
        Ok(true)
    }

    /// Find the first erased byte at a record boundary.
    ///
    /// Walks record headers from the base; a boundary whose first byte is
    /// `0xFF` is free space. A malformed header falls back to scanning for the
    /// first `0xFF` byte from that point.
    fn find_write_ptr(&mut self) -> Result<u32, StorageError> {
        let end = self.region.end();
        let mut addr = self.region.base();
        let mut header = [0u8; RECORD_HEADER_LEN];

        while addr < end {
            let n = ((end - addr) as usize).min(RECORD_HEADER_LEN);
            self.read(addr, &mut header[..n])?;
            if header[0] == ERASED {
                return Ok(addr);
            }
            let len = header[RECORD_HEADER_LEN - 1] as usize;
            if n < RECORD_HEADER_LEN || len > SAMPLE_CAPACITY {
                break;
            }
            addr += (RECORD_HEADER_LEN + len) as u32;
        }
        if addr >= end {
            return Ok(end);
        }

        warn!("log: malformed record at {:#010x}, scanning for free space", addr);
        let mut buf = [0u8; SCAN_CHUNK];
        while addr < end {
            let n = ((end - addr) as usize).min(SCAN_CHUNK);
            self.read(addr, &mut buf[..n])?;
            if let Some(i) = buf[..n].iter().position(|&b| b == ERASED) {
                return Ok(addr + i as u32);
            }
            addr += n as u32;
        }
        Ok(end)
    }

    /// Probe the chip and recover the write pointer.
    fn bring_online(&mut self) -> Result<(), StorageError> {
        self.flash.probe().map_err(|_| StorageError::FlashUnavailable)?;

        let ptr = self.find_write_ptr()?;
        let sector_end = self.region.align_up(ptr).min(self.region.end());
        if self.is_erased(ptr, sector_end)? {
            self.write_ptr = ptr;
            self.erased_end = sector_end;
        } else {
            // Torn tail: leave the damaged bytes behind and continue in the
            // next sector.
            warn!(
                "log: unerased bytes after {:#010x}, skipping to {:#010x}",
                ptr, sector_end
            );
            self.write_ptr = sector_end;
            self.erased_end = sector_end;
        }

        self.online = true;
        info!(
            "log: flash online, write pointer {:#010x} ({} bytes used)",
            self.write_ptr,
            self.write_ptr - self.region.base()
        );
        Ok(())
    }

    fn erase(&mut self, from: u32, to: u32) -> Result<(), StorageError> {
        self.flash.erase(from, to).map_err(|e| StorageError::Erase {
            addr: from,
            kind: e.kind(),
        })
    }

    fn erase_region(&mut self) -> Result<(), StorageError> {
        let (base, end) = (self.region.base(), self.region.end());
        self.erase(base, end)?;
        self.write_ptr = base;
        self.erased_end = end;
        Ok(())
    }

    /// Program the staged batch at the write pointer.
    fn write_batch(&mut self) -> Result<u32, StorageError> {
        let len = self.batch.len() as u32;

        if self.write_ptr + len > self.region.end() {
            info!("log: region full, erasing {} bytes", self.region.len());
            self.erase_region()?;
            self.wraps += 1;
        }

        let dest_end = self.write_ptr + len;
        if dest_end > self.erased_end {
            let from = self.erased_end;
            let to = self.region.align_up(dest_end);
            debug!("log: erasing {:#010x}..{:#010x}", from, to);
            self.erase(from, to)?;
            self.erased_end = to;
        }

        let at = self.write_ptr;
        self.flash.write(at, &self.batch).map_err(|e| StorageError::Write {
            addr: at,
            kind: e.kind(),
        })?;
        self.write_ptr = dest_end;
        Ok(len)
    }
}

impl<F: LogFlash> PersistentLogStore<F> {
    /// Allocate the staging buffer and bring up flash.
    ///
    /// Allocation failure is returned so the caller can run without
    /// persistence. A flash that does not respond is not an error: the store
    /// comes up offline and every flush re-probes.
    pub fn init(config: &StorageConfig, flash: F) -> Result<Self, StorageError> {
        if F::WRITE_SIZE != 1 || F::READ_SIZE != 1 {
            return Err(StorageError::Region("flash must be byte addressable"));
        }
        let region = FlashRegion::new(
            config.region_base,
            config.region_len,
            F::ERASE_SIZE as u32,
        )?;
        if region.end() as usize > flash.capacity() {
            return Err(StorageError::Region("region exceeds flash capacity"));
        }
        let capacity = config.staging_capacity as usize;
        if capacity > region.len() as usize {
            return Err(StorageError::Region("staging buffer larger than region"));
        }

        let staging = StagingBuffer::try_new(capacity)?;
        let batch = try_alloc(capacity)?;

        let mut state = FlashState {
            flash,
            region,
            write_ptr: region.base(),
            erased_end: region.base(),
            online: false,
            batch,
            wraps: 0,
        };
        if let Err(e) = state.bring_online() {
            warn!("log: flash unavailable at init ({}), will retry on flush", e);
        }

        Ok(Self {
            staging: BlockingMutex::new(RefCell::new(staging)),
            flash: Mutex::new(state),
            appended: AtomicU32::new(0),
            flushed_bytes: AtomicU32::new(0),
        })
    }

    /// Stage one sample for the next flush. Empty samples are ignored.
    ///
    /// Never waits: when the staging buffer is full the oldest staged records
    /// are dropped.
    pub fn append(&self, sensor_index: u8, sample: &Sample) -> Result<(), StorageError> {
        if sample.is_empty() {
            return Ok(());
        }
        let record = LogRecord::from_sample(sensor_index, sample);
        let (evicted, staged) = self.staging.lock(|s| {
            let mut s = s.borrow_mut();
            s.push(&record).map(|evicted| (evicted, s.len()))
        })?;
        self.appended.fetch_add(1, Ordering::Relaxed);

        if evicted > 0 {
            warn!(
                "log: staging full, dropped {} oldest record(s) for sensor {}",
                evicted, sensor_index
            );
        }
        debug!(
            "log: appended sensor={} len={} staged={}",
            sensor_index,
            sample.len(),
            staged
        );
        Ok(())
    }

    /// Move staged records to flash. Returns bytes written (0 if nothing was
    /// staged).
    ///
    /// On any flash failure the batch is dropped and the error returned.
    pub async fn flush(&self) -> Result<u32, StorageError> {
        let mut state = self.flash.lock().await;
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut FlashState<F>) -> Result<u32, StorageError> {
        state.batch.clear();
        self.staging
            .lock(|s| s.borrow_mut().swap_out(&mut state.batch));
        if state.batch.is_empty() {
            return Ok(0);
        }

        let result = if state.online {
            state.write_batch()
        } else {
            state.bring_online().and_then(|()| state.write_batch())
        };
        let dropped = state.batch.len();
        state.batch.clear();

        match result {
            Ok(written) => {
                self.flushed_bytes.fetch_add(written, Ordering::Relaxed);
                info!(
                    "log: flushed {} bytes, write pointer {:#010x}",
                    written, state.write_ptr
                );
                Ok(written)
            }
            Err(e) => {
                if matches!(e, StorageError::Write { .. }) {
                    state.online = false;
                }
                error!("log: flush failed, dropped {} bytes: {}", dropped, e);
                Err(e)
            }
        }
    }

    /// Erase the whole region and restart at its base. Staged records are
    /// kept and land at the start of the fresh log.
    pub async fn erase_all(&self) -> Result<(), StorageError> {
        let mut state = self.flash.lock().await;
        if !state.online {
            state.bring_online()?;
        }
        state.erase_region()?;
        info!("log: erased all");
        Ok(())
    }

    /// Flush every `interval`, forever. Failures are logged and retried on
    /// the next tick.
    pub async fn run_flush(&self, interval: Duration) -> ! {
        loop {
            Timer::after(interval).await;
            let _ = self.flush().await;
        }
    }

    /// Flush, then hold the flash lock so the write pointer stays frozen for
    /// the caller (the upload path).
    ///
    /// An offline store is re-probed first even when nothing is staged, so
    /// the write pointer covers everything already on the chip.
    pub(crate) async fn flush_and_freeze(
        &self,
    ) -> Result<MutexGuard<'_, CriticalSectionRawMutex, FlashState<F>>, StorageError> {
        let mut state = self.flash.lock().await;
        if !state.online {
            state.bring_online()?;
        }
        if let Err(e) = self.flush_locked(&mut state) {
            warn!("log: pre-upload flush failed: {}", e);
        }
        Ok(state)
    }

    pub async fn stats(&self) -> LogStats {
        let state = self.flash.lock().await;
        let (staged_bytes, evicted) = self.staging.lock(|s| {
            let s = s.borrow();
            (s.len(), s.dropped())
        });
        LogStats {
            write_ptr: state.write_ptr,
            staged_bytes,
            appended: self.appended.load(Ordering::Relaxed),
            evicted,
            flushed_bytes: self.flushed_bytes.load(Ordering::Relaxed),
            wraps: state.wraps,
        }
    }

    /// Run `f` against the underlying flash, e.g. to inject faults in tests.
    pub async fn with_flash<R>(&self, f: impl FnOnce(&mut F) -> R) -> R {
        let mut state = self.flash.lock().await;
        f(&mut state.flash)
    }
}

impl<F: LogFlash> SampleSink for PersistentLogStore<F> {
    fn accept(&self, sensor_index: u8, sample: &Sample) {
        if let Err(e) = self.append(sensor_index, sample) {
            warn!("log: sample from sensor {} not staged: {}", sensor_index, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::flash::RamFlash;
    use crate::storage::record::RecordReader;
    use embassy_futures::block_on;
    use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};
    use std::vec::Vec;

    const SECTOR: usize = 256;

    fn config(region_len: u32, staging: u32) -> StorageConfig {
        StorageConfig {
            region_base: 0,
            region_len,
            staging_capacity: staging,
            flush_interval_ms: 1000,
        }
    }

    fn sample(ts: u32, bytes: &[u8]) -> Sample {
        Sample::from_bytes(bytes, ts).unwrap()
    }

    fn used_bytes(store: &PersistentLogStore<RamFlash<SECTOR>>) -> Vec<u8> {
        block_on(store.with_flash(|f| f.bytes().to_vec()))
    }

    fn records_on_flash(store: &PersistentLogStore<RamFlash<SECTOR>>) -> Vec<LogRecord> {
        let ptr = block_on(store.stats()).write_ptr as usize;
        RecordReader::new(&used_bytes(store)[..ptr]).collect()
    }

    #[test]
    fn test_append_flush_round_trip() {
        let store = PersistentLogStore::init(&config(4096, 512), RamFlash::<SECTOR>::new(4096)).unwrap();
        store.append(0, &sample(100, &[1, 2, 3])).unwrap();
        store.append(2, &sample(150, &[0xFF, 0xFF])).unwrap();

        assert_eq!(block_on(store.flush()), Ok(9 + 8));
        let records = records_on_flash(&store);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].timestamp, 100);
        assert_eq!(records[1].sensor_index, 2);
        assert_eq!(&records[1].payload[..], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_empty_samples_not_logged_and_empty_flush_is_noop() {
        let store = PersistentLogStore::init(&config(4096, 512), RamFlash::<SECTOR>::new(4096)).unwrap();
        store.append(0, &Sample::EMPTY).unwrap();
        assert_eq!(block_on(store.flush()), Ok(0));
        let stats = block_on(store.stats());
        assert_eq!(stats.write_ptr, 0);
        assert_eq!(stats.appended, 0);
        assert_eq!(block_on(store.with_flash(|f| f.erase_count())), 0);
    }

    #[test]
    fn test_flush_preserves_records_in_partial_sector() {
        let store = PersistentLogStore::init(&config(4096, 512), RamFlash::<SECTOR>::new(4096)).unwrap();
        for round in 0..20u32 {
            store.append(1, &sample(round, &[round as u8; 10])).unwrap();
            block_on(store.flush()).unwrap();
        }
        let records = records_on_flash(&store);
        assert_eq!(records.len(), 20);
        assert!(records.iter().enumerate().all(|(i, r)| r.timestamp == i as u32));
    }

    #[test]
    fn test_write_pointer_recovered_after_restart() {
        let mut flash = RamFlash::<SECTOR>::new(4096);
        {
            let store = PersistentLogStore::init(&config(4096, 512), flash).unwrap();
            // Payload full of 0xFF must not confuse recovery.
            store.append(0, &sample(1, &[0xFF; 12])).unwrap();
            store.append(0, &sample(2, &[7; 3])).unwrap();
            block_on(store.flush()).unwrap();
            flash = block_on(store.with_flash(|f| core::mem::replace(f, RamFlash::new(0))));
        }

        let store = PersistentLogStore::init(&config(4096, 512), flash).unwrap();
        assert_eq!(block_on(store.stats()).write_ptr, 18 + 9);

        store.append(0, &sample(3, &[9])).unwrap();
        block_on(store.flush()).unwrap();
        let ts: Vec<u32> = records_on_flash(&store).iter().map(|r| r.timestamp).collect();
        assert_eq!(ts, [1, 2, 3]);
    }

    #[test]
    fn test_torn_tail_skips_to_next_sector() {
        let mut flash = RamFlash::<SECTOR>::new(1024);
        // One good record, a gap, then stray programmed bytes in the same sector.
        let rec = LogRecord::from_sample(0, &sample(5, &[1, 2]));
        flash.write(0, &rec.header()).unwrap();
        flash.write(6, &rec.payload).unwrap();
        flash.write(40, &[0x00]).unwrap();

        let store = PersistentLogStore::init(&config(1024, 256), flash).unwrap();
        assert_eq!(block_on(store.stats()).write_ptr, SECTOR as u32);
    }

    #[test]
    fn test_wraparound_erases_region() {
        let store = PersistentLogStore::init(&config(512, 256), RamFlash::<SECTOR>::new(512)).unwrap();
        // 70-byte records: seven fit in 512 bytes
        for ts in 0..7u32 {
            store.append(0, &sample(ts, &[0x11; 64])).unwrap();
            block_on(store.flush()).unwrap();
        }
        assert_eq!(block_on(store.stats()).write_ptr, 490);

        store.append(0, &sample(7, &[0x22; 64])).unwrap();
        block_on(store.flush()).unwrap();
        let stats = block_on(store.stats());
        assert_eq!(stats.write_ptr, 70);
        assert_eq!(stats.wraps, 1);

        let records = records_on_flash(&store);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp, 7);
        assert!(used_bytes(&store)[70..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_erase_failure_drops_batch() {
        let store = PersistentLogStore::init(&config(1024, 256), RamFlash::<SECTOR>::new(1024)).unwrap();
        block_on(store.with_flash(|f| f.fail_erases(true)));
        store.append(0, &sample(1, &[1])).unwrap();
        assert!(matches!(
            block_on(store.flush()),
            Err(StorageError::Erase { addr: 0, .. })
        ));

        block_on(store.with_flash(|f| f.fail_erases(false)));
        assert_eq!(block_on(store.flush()), Ok(0));
        assert_eq!(block_on(store.stats()).write_ptr, 0);
    }

    #[test]
    fn test_write_failure_takes_store_offline_until_next_flush() {
        let store = PersistentLogStore::init(&config(1024, 256), RamFlash::<SECTOR>::new(1024)).unwrap();
        store.append(0, &sample(1, &[1, 2])).unwrap();
        assert_eq!(block_on(store.flush()), Ok(8));

        block_on(store.with_flash(|f| f.fail_writes(true)));
        store.append(0, &sample(2, &[3])).unwrap();
        assert!(matches!(
            block_on(store.flush()),
            Err(StorageError::Write { addr: 8, .. })
        ));
        let stats = block_on(store.stats());
        assert_eq!(stats.write_ptr, 8);
        assert_eq!(stats.staged_bytes, 0);
        assert!(!block_on(store.flash.lock()).online);

        block_on(store.with_flash(|f| f.fail_writes(false)));
        store.append(0, &sample(3, &[4])).unwrap();
        assert_eq!(block_on(store.flush()), Ok(7));
        assert!(block_on(store.flash.lock()).online);
        let ts: Vec<u32> = records_on_flash(&store).iter().map(|r| r.timestamp).collect();
        assert_eq!(ts, [1, 3]);
    }

    #[test]
    fn test_offline_flash_reprobed_lazily() {
        let mut flash = RamFlash::<SECTOR>::new(1024);
        flash.set_present(false);
        let store = PersistentLogStore::init(&config(1024, 256), flash).unwrap();

        store.append(0, &sample(1, &[1])).unwrap();
        assert_eq!(block_on(store.flush()), Err(StorageError::FlashUnavailable));

        block_on(store.with_flash(|f| f.set_present(true)));
        store.append(0, &sample(2, &[2])).unwrap();
        assert_eq!(block_on(store.flush()), Ok(7));
        assert_eq!(records_on_flash(&store)[0].timestamp, 2);
    }

    #[test]
    fn test_erase_all_resets_pointer() {
        let store = PersistentLogStore::init(&config(1024, 256), RamFlash::<SECTOR>::new(1024)).unwrap();
        store.append(0, &sample(1, &[1, 2, 3])).unwrap();
        block_on(store.flush()).unwrap();
        block_on(store.erase_all()).unwrap();
        assert_eq!(block_on(store.stats()).write_ptr, 0);
        assert!(used_bytes(&store).iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_init_validates_geometry() {
        assert!(matches!(
            PersistentLogStore::init(&config(8192, 256), RamFlash::<SECTOR>::new(4096)),
            Err(StorageError::Region(_))
        ));
        assert!(matches!(
            PersistentLogStore::init(&config(1000, 256), RamFlash::<SECTOR>::new(4096)),
            Err(StorageError::Region(_))
        ));
        assert!(matches!(
            PersistentLogStore::init(&config(4096, u32::MAX), RamFlash::<SECTOR>::new(4096)),
            Err(StorageError::Region(_))
        ));
    }

    #[test]
    fn test_capacity_reports_flash_size() {
        let flash = RamFlash::<SECTOR>::new(1000);
        assert_eq!(flash.capacity(), 768);
        assert_eq!(<RamFlash<SECTOR> as NorFlash>::ERASE_SIZE, SECTOR);
    }
}
