//! Per-sensor periodic task

use embassy_futures::select::{Either, select};
use embassy_time::{Duration, Ticker};
use log::{debug, info, warn};

use super::registry::SensorRegistry;
use super::{Sample, Sensor, SensorError};
use crate::bus::BusArbiter;
use crate::now_ms;

/// Shortest period a sensor can be scheduled at.
const MIN_PERIOD: Duration = Duration::from_millis(1);
/// Longest period; keeps ticker deadlines far from the end of the clock.
const MAX_PERIOD: Duration = Duration::from_secs(u32::MAX as u64);

/// Receives every sample a task caches, e.g. the flash log.
pub trait SampleSink {
    fn accept(&self, sensor_index: u8, sample: &Sample);
}

/// Scheduling state of a sensor task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Enabled with a positive frequency: cycles run on a fixed cadence.
    Active,
    /// Disabled or at `freq <= 0`: parked until a control call.
    Suspended,
}

/// What one scheduling cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// New sample cached.
    Stored,
    /// Read ran but produced nothing; cache cleared.
    NoData,
    /// Bus not acquired in time; cycle skipped, cache untouched.
    BusBusy,
    /// Sensor still not responding to its probe; cache cleared.
    Absent,
}

/// Task body for one registered sensor.
///
/// Created by [`SensorRegistry::register`] and handed to the spawn hook. On
/// target the hook wraps [`SensorTask::run`] in an embassy task; on host it
/// can simply be pushed into a list of futures.
pub struct SensorTask<'a, B, S, const N: usize> {
    registry: &'a SensorRegistry<N>,
    bus: &'a BusArbiter<B>,
    index: usize,
    sensor: S,
    sink: Option<&'a dyn SampleSink>,
    scratch: Sample,
}

/// Period for `freq_hz`, or `None` when the sensor should not be scheduled.
pub fn period_for(freq_hz: f32) -> Option<Duration> {
    if freq_hz.is_nan() || freq_hz <= 0.0 {
        return None;
    }
    let micros = ((1_000_000.0 / freq_hz) as u64).min(MAX_PERIOD.as_micros());
    Some(Duration::from_micros(micros).max(MIN_PERIOD))
}

impl<'a, B, S, const N: usize> SensorTask<'a, B, S, N>
where
    S: Sensor<B>,
{
    pub(crate) fn new(
        registry: &'a SensorRegistry<N>,
        bus: &'a BusArbiter<B>,
        index: usize,
        sensor: S,
    ) -> Self {
        Self {
            registry,
            bus,
            index,
            sensor,
            sink: None,
            scratch: Sample::EMPTY,
        }
    }

    /// Forward each successful sample to `sink`.
    pub fn with_sink(mut self, sink: &'a dyn SampleSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Run forever.
    ///
    /// While the sensor is active, cycles are paced by a [`Ticker`], so each
    /// deadline is absolute and a slow read does not push later cycles back.
    /// While disabled (or at `freq <= 0`) the task parks until a control call
    /// wakes it.
    pub async fn run(mut self) -> ! {
        let slot = self.registry.slot(self.index);
        loop {
            let freq = slot.frequency();
            let period = match (slot.run_state(), period_for(freq)) {
                (RunState::Active, Some(period)) => period,
                _ => {
                    self.registry.log_parked(self.index);
                    slot.resume.wait().await;
                    continue;
                }
            };

            let mut ticker = Ticker::every(period);
            'active: loop {
                self.cycle().await;
                loop {
                    match select(ticker.next(), slot.resume.wait()).await {
                        Either::First(()) => break,
                        // Woken by a control call: keep waiting on the same
                        // deadline unless something that matters changed.
                        Either::Second(()) => {
                            if slot.run_state() == RunState::Suspended || slot.frequency() != freq {
                                break 'active;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Run exactly one cycle: bounded bus wait, read, cache, forward.
    pub async fn cycle(&mut self) -> CycleOutcome {
        let slot = self.registry.slot(self.index);

        let Some(mut bus) = self.bus.lock(self.registry.bus_timeout()).await else {
            let skips = slot.note_bus_skip();
            warn!(
                "sensor {} idx={}: bus busy, cycle skipped ({} total)",
                self.registry.name_of(self.index),
                self.index,
                skips
            );
            return CycleOutcome::BusBusy;
        };

        if !slot.is_present() {
            if let Err(e) = self.sensor.init(&mut *bus).await {
                drop(bus);
                debug!("sensor idx={} still absent: {}", self.index, e);
                self.registry
                    .record_cycle(self.index, Err(e), now_ms());
                return CycleOutcome::Absent;
            }
            slot.set_present(true);
            info!(
                "sensor {} idx={} came online",
                self.registry.name_of(self.index),
                self.index
            );
        }

        self.scratch.payload.clear();
        let result = self.sensor.read(&mut *bus, &mut self.scratch).await;
        drop(bus);

        let now = now_ms();
        match result {
            Ok(()) if !self.scratch.is_empty() => {
                let cached = self.registry.record_cycle(self.index, Ok(&self.scratch), now);
                if let Some(sink) = self.sink {
                    sink.accept(self.index as u8, &cached);
                }
                CycleOutcome::Stored
            }
            Ok(()) => {
                self.registry
                    .record_cycle(self.index, Err(SensorError::NoData), now);
                CycleOutcome::NoData
            }
            Err(e) => {
                debug!("sensor idx={} read failed: {}", self.index, e);
                self.registry.record_cycle(self.index, Err(e), now);
                CycleOutcome::NoData
            }
        }
    }
}
