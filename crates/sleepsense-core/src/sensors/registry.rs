//! Sensor registry
//!
//! Fixed table of sensor descriptors plus their last-value caches. The table
//! is filled at boot; each [`SensorRegistry::register`] call claims one slot,
//! probes the sensor under the bus arbiter and hands a [`SensorTask`] to the
//! caller's spawn hook. Slots are never freed once a task is running.
//!
//! Control calls (`enable`, `disable`, `set_frequency`) only touch atomics and
//! then wake the task; the task itself decides whether it is active.

use core::cell::RefCell;
use core::fmt::Debug;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::Duration;
use log::{debug, error, info, warn};
use thiserror_no_std::Error;

use super::task::{RunState, SensorTask, period_for};
use super::{SENSOR_NAME_MAX, Sample, Sensor, SensorError, print_hex};
use crate::bus::{BusArbiter, DEFAULT_BUS_TIMEOUT};

/// Name as stored in the registry, truncated to [`SENSOR_NAME_MAX`].
pub type SensorName = heapless::String<SENSOR_NAME_MAX>;

/// Dumps a cached sample in a sensor-specific format.
pub type PrintFn = fn(&str, &Sample);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("sensor table is full")]
    Full,
    #[error("could not create task for sensor {index}")]
    TaskCreation { index: usize },
    #[error("no sensor registered at index {index}")]
    UnknownSensor { index: usize },
}

struct SlotMeta {
    name: SensorName,
    print: PrintFn,
}

/// One sensor descriptor. Created empty, filled once by `register`.
pub struct SensorSlot {
    meta: BlockingMutex<CriticalSectionRawMutex, RefCell<SlotMeta>>,
    /// `f32` bit pattern; `<= 0` means never scheduled
    freq_bits: AtomicU32,
    enabled: AtomicBool,
    present: AtomicBool,
    bus_skips: AtomicU32,
    pub(crate) resume: Signal<CriticalSectionRawMutex, ()>,
    last: BlockingMutex<CriticalSectionRawMutex, RefCell<Sample>>,
}

impl SensorSlot {
    const fn new() -> Self {
        Self {
            meta: BlockingMutex::new(RefCell::new(SlotMeta {
                name: heapless::String::new(),
                print: print_hex,
            })),
            freq_bits: AtomicU32::new(0),
            enabled: AtomicBool::new(false),
            present: AtomicBool::new(false),
            bus_skips: AtomicU32::new(0),
            resume: Signal::new(),
            last: BlockingMutex::new(RefCell::new(Sample::EMPTY)),
        }
    }

    pub fn frequency(&self) -> f32 {
        f32::from_bits(self.freq_bits.load(Ordering::Acquire))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::Acquire)
    }

    pub(crate) fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::Release);
    }

    pub(crate) fn note_bus_skip(&self) -> u32 {
        self.bus_skips.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Whether the task should be ticking or parked, from the current
    /// enabled flag and frequency.
    pub fn run_state(&self) -> RunState {
        if self.is_enabled() && period_for(self.frequency()).is_some() {
            RunState::Active
        } else {
            RunState::Suspended
        }
    }

    fn name(&self) -> SensorName {
        self.meta.lock(|m| m.borrow().name.clone())
    }

    fn reset(&self, name: &str, print: PrintFn, freq_hz: f32, enabled: bool) {
        self.meta.lock(|m| {
            let mut m = m.borrow_mut();
            m.name.clear();
            for c in name.chars() {
                if m.name.push(c).is_err() {
                    break;
                }
            }
            m.print = print;
        });
        self.freq_bits.store(freq_hz.to_bits(), Ordering::Release);
        self.enabled.store(enabled, Ordering::Release);
        self.present.store(false, Ordering::Release);
        self.bus_skips.store(0, Ordering::Relaxed);
        self.last.lock(|l| *l.borrow_mut() = Sample::EMPTY);
        self.resume.reset();
    }
}

/// Point-in-time copy of one descriptor, for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSnapshot {
    pub index: usize,
    pub name: SensorName,
    pub enabled: bool,
    pub present: bool,
    pub freq_hz: f32,
    pub bus_skips: u32,
    pub last: Sample,
}

/// Owner of up to `N` sensor descriptors.
///
/// Typically placed in a `static` so tasks can borrow it for `'static`.
pub struct SensorRegistry<const N: usize> {
    slots: [SensorSlot; N],
    count: AtomicUsize,
    bus_timeout: Duration,
}

impl<const N: usize> Default for SensorRegistry<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> SensorRegistry<N> {
    /// Sensor indices go into one byte of every log record.
    const INDEX_FITS_BYTE: () = assert!(N <= 256, "at most 256 sensors");

    pub const fn new() -> Self {
        Self::with_bus_timeout(DEFAULT_BUS_TIMEOUT)
    }

    /// Registry whose tasks wait at most `bus_timeout` for the bus each cycle.
    pub const fn with_bus_timeout(bus_timeout: Duration) -> Self {
        let () = Self::INDEX_FITS_BYTE;
        Self {
            slots: [const { SensorSlot::new() }; N],
            count: AtomicUsize::new(0),
            bus_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn bus_timeout(&self) -> Duration {
        self.bus_timeout
    }

    pub(crate) fn slot(&self, index: usize) -> &SensorSlot {
        &self.slots[index]
    }

    fn checked_slot(&self, index: usize) -> Result<&SensorSlot, RegistryError> {
        if index < self.len() {
            Ok(&self.slots[index])
        } else {
            Err(RegistryError::UnknownSensor { index })
        }
    }

    fn claim(&self) -> Result<usize, RegistryError> {
        critical_section::with(|_| {
            let index = self.count.load(Ordering::Relaxed);
            if index >= N {
                return Err(RegistryError::Full);
            }
            self.count.store(index + 1, Ordering::Release);
            Ok(index)
        })
    }

    /// Give back a slot whose task could not be started. Only the most
    /// recently claimed slot can be returned; otherwise the slot stays
    /// claimed but disabled.
    fn release(&self, index: usize) {
        let slot = &self.slots[index];
        slot.enabled.store(false, Ordering::Release);
        slot.freq_bits.store(0f32.to_bits(), Ordering::Release);
        critical_section::with(|_| {
            if self.count.load(Ordering::Relaxed) == index + 1 {
                self.count.store(index, Ordering::Release);
            }
        });
    }

    /// Register a sensor and start its periodic task.
    ///
    /// The sensor's `init` runs first, under `bus` with the registry's bus
    /// timeout. A failed probe is not fatal: the slot is marked absent and the
    /// task keeps re-probing each cycle. `spawn` receives the task and must
    /// start it; if it fails, the slot is released and
    /// [`RegistryError::TaskCreation`] is returned.
    ///
    /// Returns the sensor's index, which is also its index in log records.
    pub async fn register<'a, B, S, F, E>(
        &'a self,
        name: &str,
        mut sensor: S,
        bus: &'a BusArbiter<B>,
        freq_hz: f32,
        start_enabled: bool,
        spawn: F,
    ) -> Result<usize, RegistryError>
    where
        S: Sensor<B>,
        F: FnOnce(SensorTask<'a, B, S, N>) -> Result<(), E>,
        E: Debug,
    {
        let index = self.claim()?;
        let slot = &self.slots[index];
        slot.reset(name, <S as Sensor<B>>::print, freq_hz, start_enabled);

        let probe = match bus.lock(self.bus_timeout).await {
            Some(mut guard) => sensor.init(&mut *guard).await,
            None => Err(SensorError::BusUnavailable),
        };
        match probe {
            Ok(()) => slot.set_present(true),
            Err(e) => warn!("sensor {} ({}) init failed: {}", name, index, e),
        }

        let task = SensorTask::new(self, bus, index, sensor);
        if let Err(e) = spawn(task) {
            error!("failed to create task for sensor {} idx={}: {:?}", name, index, e);
            self.release(index);
            return Err(RegistryError::TaskCreation { index });
        }

        info!(
            "registered sensor {} idx={} freq={}Hz enabled={}",
            name, index, freq_hz, start_enabled
        );
        Ok(index)
    }

    pub fn enable(&self, index: usize) -> Result<(), RegistryError> {
        let slot = self.checked_slot(index)?;
        slot.enabled.store(true, Ordering::Release);
        slot.resume.signal(());
        Ok(())
    }

    /// Stop scheduling a sensor. Cooperative: a cycle already in progress
    /// finishes first.
    pub fn disable(&self, index: usize) -> Result<(), RegistryError> {
        let slot = self.checked_slot(index)?;
        slot.enabled.store(false, Ordering::Release);
        slot.resume.signal(());
        Ok(())
    }

    /// Change a sensor's rate. `freq_hz <= 0` parks the task.
    pub fn set_frequency(&self, index: usize, freq_hz: f32) -> Result<(), RegistryError> {
        let slot = self.checked_slot(index)?;
        slot.freq_bits.store(freq_hz.to_bits(), Ordering::Release);
        slot.resume.signal(());
        Ok(())
    }

    /// Copy of the last cached sample, or `None` if the last cycle produced
    /// nothing (or the sensor was never sampled).
    pub fn get_last(&self, index: usize) -> Option<Sample> {
        let slot = self.checked_slot(index).ok()?;
        slot.last.lock(|l| {
            let last = l.borrow();
            (!last.is_empty()).then(|| last.clone())
        })
    }

    /// Timestamp of the last cycle, whether or not it produced data.
    pub fn last_timestamp(&self, index: usize) -> Option<u32> {
        let slot = self.checked_slot(index).ok()?;
        Some(slot.last.lock(|l| l.borrow().timestamp))
    }

    /// Store the outcome of one sensor cycle stamped with `now_ms`.
    ///
    /// A successful read replaces the cached payload; a failed one clears it.
    /// The timestamp advances either way so callers can tell "never sampled"
    /// from "sampled but empty". Returns the cached sample.
    pub(crate) fn record_cycle(
        &self,
        index: usize,
        result: Result<&Sample, SensorError>,
        now_ms: u32,
    ) -> Sample {
        let slot = &self.slots[index];
        slot.last.lock(|l| {
            let mut last = l.borrow_mut();
            match result {
                Ok(sample) => last.payload.clone_from(&sample.payload),
                Err(_) => last.payload.clear(),
            }
            last.timestamp = now_ms;
            last.clone()
        })
    }

    pub fn snapshot(&self, index: usize) -> Option<SensorSnapshot> {
        let slot = self.checked_slot(index).ok()?;
        Some(SensorSnapshot {
            index,
            name: slot.name(),
            enabled: slot.is_enabled(),
            present: slot.is_present(),
            freq_hz: slot.frequency(),
            bus_skips: slot.bus_skips.load(Ordering::Relaxed),
            last: slot.last.lock(|l| l.borrow().clone()),
        })
    }

    /// Log every registered sensor and its cached sample.
    pub fn print_all(&self) {
        info!("==== SENSORS SNAPSHOT ====");
        for index in 0..self.len() {
            let Some(snap) = self.snapshot(index) else {
                continue;
            };
            info!(
                "[{}] {} : enabled={} present={} freq={:.2}Hz last_len={} ts={}",
                index,
                snap.name,
                snap.enabled as u8,
                snap.present as u8,
                snap.freq_hz,
                snap.last.len(),
                snap.last.timestamp
            );
            let print = self.slots[index].meta.lock(|m| m.borrow().print);
            print(&snap.name, &snap.last);
        }
        info!("==========================");
    }

    pub(crate) fn log_parked(&self, index: usize) {
        debug!(
            "sensor {} idx={} parked (enabled={}, freq={})",
            self.slots[index].name(),
            index,
            self.slots[index].is_enabled(),
            self.slots[index].frequency()
        );
    }

    pub(crate) fn name_of(&self, index: usize) -> SensorName {
        self.slots[index].name()
    }
}
