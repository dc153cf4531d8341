//! Sensor framework
//!
//! Sensors are registered once at boot with a [`registry::SensorRegistry`],
//! which hands each one a periodic [`task::SensorTask`]. The task owns the
//! sensor; everything else sees its output through the registry's last-value
//! cache.

pub mod fusion;
pub mod registry;
pub mod task;

use core::fmt::Write as _;

use log::info;
use thiserror_no_std::Error;

pub use fusion::{Estimate, FusionCombiner, Spo2Fusion};
pub use registry::{RegistryError, SensorRegistry, SensorSnapshot};
pub use task::{CycleOutcome, RunState, SampleSink, SensorTask};

/// Largest payload a single sample can carry.
pub const SAMPLE_CAPACITY: usize = 64;

/// Longest sensor name kept by the registry.
pub const SENSOR_NAME_MAX: usize = 24;

/// Fixed-capacity sample payload.
pub type Payload = heapless::Vec<u8, SAMPLE_CAPACITY>;

/// One reading: raw payload bytes plus the time it was taken (ms since boot).
///
/// Samples are always copied out of the cache, never borrowed across tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub payload: Payload,
    pub timestamp: u32,
}

impl Sample {
    /// Empty sample with timestamp 0 (never sampled).
    pub const EMPTY: Sample = Sample {
        payload: heapless::Vec::new(),
        timestamp: 0,
    };

    /// Build a sample from raw bytes. Fails if `bytes` exceeds
    /// [`SAMPLE_CAPACITY`].
    pub fn from_bytes(bytes: &[u8], timestamp: u32) -> Result<Self, SensorError> {
        let payload = Payload::from_slice(bytes).map_err(|_| SensorError::PayloadTooLarge {
            len: bytes.len(),
        })?;
        Ok(Self { payload, timestamp })
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Clear the payload and write `values` as consecutive big-endian `f32`s.
    pub fn write_f32s(&mut self, values: &[f32]) -> Result<(), SensorError> {
        self.payload.clear();
        for v in values {
            self.payload
                .extend_from_slice(&v.to_be_bytes())
                .map_err(|_| SensorError::PayloadTooLarge {
                    len: values.len() * 4,
                })?;
        }
        Ok(())
    }

    /// Big-endian `f32` at word offset `index`, if present.
    pub fn f32_at(&self, index: usize) -> Option<f32> {
        let start = index * 4;
        let bytes = self.payload.get(start..start + 4)?;
        Some(f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl Default for Sample {
    fn default() -> Self {
        Self::EMPTY
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    #[error("{sensor} did not respond at init")]
    NotPresent { sensor: &'static str },
    #[error("no new data this cycle")]
    NoData,
    #[error("bus not available")]
    BusUnavailable,
    #[error("{sensor} bus error during {operation}")]
    Bus {
        sensor: &'static str,
        operation: &'static str,
    },
    #[error("payload of {len} bytes exceeds sample capacity")]
    PayloadTooLarge { len: usize },
}

/// Capabilities a sensor driver provides to the scheduler.
///
/// `B` is the bus type guarded by the arbiter; `init` and `read` are only
/// ever called while the caller holds it.
pub trait Sensor<B> {
    /// Probe and configure the hardware. Called once at registration.
    fn init(&mut self, bus: &mut B) -> impl Future<Output = Result<(), SensorError>>;

    /// Take one reading into `out.payload`. The scheduler stamps the time.
    ///
    /// Returns [`SensorError::NoData`] when nothing new is available.
    fn read(
        &mut self,
        bus: &mut B,
        out: &mut Sample,
    ) -> impl Future<Output = Result<(), SensorError>>;

    /// Human-readable dump of a cached sample. Defaults to a hex dump.
    fn print(name: &str, sample: &Sample)
    where
        Self: Sized,
    {
        print_hex(name, sample);
    }
}

/// Log a sample's payload as hex, or "(no data)" if empty.
pub fn print_hex(name: &str, sample: &Sample) {
    if sample.is_empty() {
        info!("  {}: (no data)", name);
        return;
    }
    let mut line: heapless::String<{ SAMPLE_CAPACITY * 3 }> = heapless::String::new();
    for b in &sample.payload {
        let _ = write!(line, "{:02X} ", b);
    }
    info!("  {}: {}", name, line.trim_end());
}

/// Readings produced by one MAX3010x-style pulse oximeter.
///
/// Encoded as five big-endian `f32`s in field order.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Spo2Reading {
    pub ac_dc_ir: f32,
    pub ac_dc_red: f32,
    pub raw_spo2: f32,
    pub spo2: f32,
    pub heart_rate: f32,
}

impl Spo2Reading {
    pub const ENCODED_LEN: usize = 20;

    pub fn write_to(&self, out: &mut Sample) -> Result<(), SensorError> {
        out.write_f32s(&[
            self.ac_dc_ir,
            self.ac_dc_red,
            self.raw_spo2,
            self.spo2,
            self.heart_rate,
        ])
    }

    /// Decode from a cached sample. `None` if the payload is too short.
    pub fn from_sample(sample: &Sample) -> Option<Self> {
        Some(Self {
            ac_dc_ir: sample.f32_at(0)?,
            ac_dc_red: sample.f32_at(1)?,
            raw_spo2: sample.f32_at(2)?,
            spo2: sample.f32_at(3)?,
            heart_rate: sample.f32_at(4)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_capacity_enforced() {
        assert!(Sample::from_bytes(&[0u8; SAMPLE_CAPACITY], 1).is_ok());
        assert_eq!(
            Sample::from_bytes(&[0u8; SAMPLE_CAPACITY + 1], 1),
            Err(SensorError::PayloadTooLarge {
                len: SAMPLE_CAPACITY + 1
            })
        );
    }

    #[test]
    fn test_spo2_reading_encoding() {
        let reading = Spo2Reading {
            ac_dc_ir: 0.9,
            ac_dc_red: 0.85,
            raw_spo2: 97.0,
            spo2: 97.5,
            heart_rate: 62.0,
        };
        let mut sample = Sample::EMPTY;
        reading.write_to(&mut sample).unwrap();

        assert_eq!(sample.len(), Spo2Reading::ENCODED_LEN);
        assert_eq!(&sample.payload[12..16], &97.5f32.to_be_bytes());
        assert_eq!(Spo2Reading::from_sample(&sample), Some(reading));
    }

    #[test]
    fn test_short_payload_does_not_decode() {
        let sample = Sample::from_bytes(&[0u8; 19], 5).unwrap();
        assert_eq!(Spo2Reading::from_sample(&sample), None);
    }
}
