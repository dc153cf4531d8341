//! Redundant SpO2 fusion
//!
//! Two pulse oximeters watch the same wearer. Each reading is scored by
//! signal quality and distance from a physiological baseline; the fused
//! output is the mean when every source is trustworthy, otherwise the best
//! source above a lower bar, otherwise nothing.

use log::info;

use super::registry::SensorRegistry;
use super::{Sample, Sensor, SensorError, Spo2Reading};
use crate::config::FusionConfig;

/// One producer's estimate and how much it is trusted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub spo2: f32,
    pub heart_rate: f32,
    pub confidence: f32,
}

/// Fused output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fused {
    pub spo2: f32,
    pub heart_rate: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionCombiner {
    pub baseline: f32,
    pub spread: f32,
    pub high_threshold: f32,
    pub mid_threshold: f32,
}

impl Default for FusionCombiner {
    fn default() -> Self {
        Self::from_config(&FusionConfig::default())
    }
}

impl FusionCombiner {
    pub fn from_config(config: &FusionConfig) -> Self {
        Self {
            baseline: config.baseline,
            spread: config.spread,
            high_threshold: config.high_threshold,
            mid_threshold: config.mid_threshold,
        }
    }

    /// `min(quality_a, quality_b) * (1 - |estimate - baseline| / spread)`,
    /// clamped to `[0, 1]`.
    pub fn confidence(&self, quality_a: f32, quality_b: f32, estimate: f32) -> f32 {
        let deviation = estimate - self.baseline;
        let deviation = if deviation < 0.0 { -deviation } else { deviation };
        let penalty = deviation / self.spread;
        let c = quality_a.min(quality_b) * (1.0 - penalty);
        // NaN inputs fall through to 0
        if c > 0.0 { c.min(1.0) } else { 0.0 }
    }

    pub fn estimate(&self, reading: &Spo2Reading) -> Estimate {
        Estimate {
            spo2: reading.spo2,
            heart_rate: reading.heart_rate,
            confidence: self.confidence(reading.ac_dc_ir, reading.ac_dc_red, reading.spo2),
        }
    }

    /// Combine any number of estimates.
    ///
    /// All above the high threshold: arithmetic mean. Otherwise the most
    /// confident estimate above the mid threshold (earliest wins ties).
    /// Otherwise `None`.
    pub fn combine(&self, estimates: &[Estimate]) -> Option<Fused> {
        if estimates.is_empty() {
            return None;
        }

        if estimates.iter().all(|e| e.confidence > self.high_threshold) {
            let n = estimates.len() as f32;
            let spo2 = estimates.iter().map(|e| e.spo2).sum::<f32>() / n;
            let heart_rate = estimates.iter().map(|e| e.heart_rate).sum::<f32>() / n;
            return Some(Fused { spo2, heart_rate });
        }

        estimates
            .iter()
            .filter(|e| e.confidence > self.mid_threshold)
            .fold(None, |best: Option<&Estimate>, e| match best {
                Some(b) if b.confidence >= e.confidence => Some(b),
                _ => Some(e),
            })
            .map(|e| Fused {
                spo2: e.spo2,
                heart_rate: e.heart_rate,
            })
    }
}

/// Virtual sensor fusing the cached output of two SpO2 sensors.
///
/// Registered like any other sensor; its payload is `spo2` then
/// `heart_rate`, both big-endian `f32`.
pub struct Spo2Fusion<'a, const N: usize> {
    registry: &'a SensorRegistry<N>,
    sources: [usize; 2],
    combiner: FusionCombiner,
}

impl<'a, const N: usize> Spo2Fusion<'a, N> {
    pub const ENCODED_LEN: usize = 8;

    pub fn new(registry: &'a SensorRegistry<N>, sources: [usize; 2], combiner: FusionCombiner) -> Self {
        Self {
            registry,
            sources,
            combiner,
        }
    }

    /// Fuse whatever the source sensors last cached.
    pub fn fuse(&self) -> Option<Fused> {
        let mut estimates: heapless::Vec<Estimate, 2> = heapless::Vec::new();
        for &index in &self.sources {
            let reading = self
                .registry
                .get_last(index)
                .as_ref()
                .and_then(Spo2Reading::from_sample);
            if let Some(reading) = reading {
                // capacity equals sources.len()
                let _ = estimates.push(self.combiner.estimate(&reading));
            }
        }
        // A source that never produced data counts as zero confidence, which
        // rules out the mean.
        if estimates.len() < self.sources.len() {
            let _ = estimates.push(Estimate {
                spo2: 0.0,
                heart_rate: 0.0,
                confidence: 0.0,
            });
        }
        self.combiner.combine(&estimates)
    }
}

impl<B, const N: usize> Sensor<B> for Spo2Fusion<'_, N> {
    async fn init(&mut self, _bus: &mut B) -> Result<(), SensorError> {
        info!("spo2 fusion: sources {:?}", self.sources);
        Ok(())
    }

    async fn read(&mut self, _bus: &mut B, out: &mut Sample) -> Result<(), SensorError> {
        let fused = self.fuse().ok_or(SensorError::NoData)?;
        out.write_f32s(&[fused.spo2, fused.heart_rate])
    }

    fn print(name: &str, sample: &Sample) {
        match (sample.f32_at(0), sample.f32_at(1)) {
            (Some(spo2), Some(hr)) => info!("  {}: HR {:.1}, SpO2 {:.2}", name, hr, spo2),
            _ => info!("  {}: (no data)", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusArbiter;
    use embassy_futures::block_on;

    fn est(spo2: f32, confidence: f32) -> Estimate {
        Estimate {
            spo2,
            heart_rate: spo2 - 30.0,
            confidence,
        }
    }

    #[test]
    fn test_confidence_formula() {
        let c = FusionCombiner::default();
        assert_eq!(c.confidence(0.9, 1.0, 98.0), 0.9);
        // 10 points off baseline: 0.9 * (1 - 0.2)
        assert!((c.confidence(0.9, 1.0, 88.0) - 0.72).abs() < 1e-6);
        assert_eq!(c.confidence(1.0, 1.0, 30.0), 0.0);
        assert_eq!(c.confidence(2.0, 3.0, 98.0), 1.0);
        assert_eq!(c.confidence(f32::NAN, 1.0, 98.0), 0.0);
    }

    #[test]
    fn test_both_confident_gives_mean() {
        let c = FusionCombiner::default();
        let fused = c.combine(&[est(96.0, 0.9), est(98.0, 0.85)]).unwrap();
        assert_eq!(fused.spo2, 97.0);
        assert_eq!(fused.heart_rate, 67.0);

        let fused = c.combine(&[est(98.0, 0.9), est(97.0, 0.95)]).unwrap();
        assert_eq!(fused.spo2, 97.5);
    }

    #[test]
    fn test_single_confident_source_selected() {
        let c = FusionCombiner::default();
        assert_eq!(c.combine(&[est(96.0, 0.9), est(80.0, 0.3)]).unwrap().spo2, 96.0);
        assert_eq!(c.combine(&[est(96.0, 0.6), est(97.0, 0.7)]).unwrap().spo2, 97.0);
        assert_eq!(c.combine(&[est(96.0, 0.7), est(97.0, 0.7)]).unwrap().spo2, 96.0);
        // Below every threshold next to one above the middle: the latter, unchanged.
        assert_eq!(c.combine(&[est(91.0, 0.2), est(97.3, 0.6)]).unwrap().spo2, 97.3);
    }

    #[test]
    fn test_low_confidence_gives_nothing() {
        let c = FusionCombiner::default();
        assert!(c.combine(&[est(96.0, 0.5), est(97.0, 0.1)]).is_none());
        assert!(c.combine(&[est(96.0, 0.0), est(97.0, 0.0)]).is_none());
        assert!(c.combine(&[]).is_none());
    }

    #[test]
    fn test_generalizes_to_more_producers() {
        let c = FusionCombiner::default();
        let all = [est(95.0, 0.9), est(96.0, 0.95), est(97.0, 0.99)];
        assert_eq!(c.combine(&all).unwrap().spo2, 96.0);
        let mixed = [est(95.0, 0.6), est(96.0, 0.95), est(97.0, 0.4)];
        assert_eq!(c.combine(&mixed).unwrap().spo2, 96.0);
    }

    #[test]
    fn test_fusion_sensor_reads_registry_caches() {
        let registry: SensorRegistry<3> = SensorRegistry::new();
        let bus = BusArbiter::new(());
        let mut fusion = Spo2Fusion::new(&registry, [0, 1], FusionCombiner::default());

        // Claim two slots for the sources; their tasks are never run.
        struct Idle;
        impl Sensor<()> for Idle {
            async fn init(&mut self, _: &mut ()) -> Result<(), SensorError> {
                Ok(())
            }
            async fn read(&mut self, _: &mut (), _: &mut Sample) -> Result<(), SensorError> {
                Err(SensorError::NoData)
            }
        }
        for name in ["spo2", "spo2_2"] {
            block_on(registry.register(name, Idle, &bus, 0.2, true, |_| Ok::<(), ()>(())))
                .unwrap();
        }

        let mut out = Sample::EMPTY;
        assert_eq!(
            block_on(fusion.read(&mut (), &mut out)),
            Err(SensorError::NoData)
        );

        let good = |spo2: f32, hr: f32| {
            let mut s = Sample::EMPTY;
            Spo2Reading {
                ac_dc_ir: 0.95,
                ac_dc_red: 0.9,
                raw_spo2: spo2,
                spo2,
                heart_rate: hr,
            }
            .write_to(&mut s)
            .unwrap();
            s
        };

        // Only one source has data: it is used on its own.
        registry.record_cycle(0, Ok(&good(98.0, 60.0)), 100);
        block_on(fusion.read(&mut (), &mut out)).unwrap();
        assert_eq!(out.len(), Spo2Fusion::<3>::ENCODED_LEN);
        assert_eq!(out.f32_at(0), Some(98.0));
        assert_eq!(out.f32_at(1), Some(60.0));

        registry.record_cycle(1, Ok(&good(98.0, 64.0)), 120);
        block_on(fusion.read(&mut (), &mut out)).unwrap();
        assert_eq!(out.f32_at(0), Some(98.0));
        assert_eq!(out.f32_at(1), Some(62.0));
    }
}
