// ============================================================================
// SECTION: SIGNALS & PREPROCESSING
// ============================================================================
// Turns raw provider samples into an evenly spaced signal, and answers
// questions about cycles: how many fit, where the last one starts, and
// whether the signal repeats at a given cycle length.
// ============================================================================

use std::time::Duration;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use super::fft;
use crate::error::{DataError, DataResult};
use crate::types::Sample;
use crate::{COLD_DATA_GAP, MIN_CYCLES, PERIODICITY_FREQUENCY_TOLERANCE, PERIODICITY_MIN_DOMINANCE};

/// Evenly spaced samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub samples: Vec<f64>,
    /// Samples per second
    pub sample_rate: f64,
}

impl Signal {
    pub fn new(samples: Vec<f64>, sample_rate: f64) -> Self {
        Self { samples, sample_rate }
    }

    pub fn from_step(samples: Vec<f64>, step: Duration) -> Self {
        Self::new(samples, 1.0 / step.as_secs_f64())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples in one cycle of length `cycle`
    pub fn samples_per(&self, cycle: Duration) -> usize {
        (cycle.as_secs_f64() * self.sample_rate).round() as usize
    }

    /// Whole cycles of length `cycle` in the signal
    pub fn num_cycles(&self, cycle: Duration) -> usize {
        match self.samples_per(cycle) {
            0 => 0,
            per_cycle => self.len() / per_cycle,
        }
    }

    /// Keep the trailing whole cycles, dropping the partial one at the start
    pub fn truncate(&self, cycle: Duration) -> Signal {
        let keep = self.num_cycles(cycle) * self.samples_per(cycle);
        Signal::new(self.samples[self.len() - keep..].to_vec(), self.sample_rate)
    }

    /// Split into (all cycles but the last, the last cycle)
    pub fn split_last_cycle(&self, cycle: Duration) -> Option<(Signal, Signal)> {
        if self.num_cycles(cycle) < MIN_CYCLES {
            return None;
        }
        let truncated = self.truncate(cycle);
        let boundary = truncated.len() - self.samples_per(cycle);
        let (train, test) = truncated.samples.split_at(boundary);
        Some((
            Signal::new(train.to_vec(), self.sample_rate),
            Signal::new(test.to_vec(), self.sample_rate),
        ))
    }

    /// True if the signal repeats every `cycle`.
    ///
    /// Needs at least two whole cycles. The strongest non-DC component of the
    /// mean-removed spectrum must sit at 1/cycle and stand clearly above the
    /// average spectral amplitude.
    pub fn is_periodic(&self, cycle: Duration) -> bool {
        if self.num_cycles(cycle) < MIN_CYCLES {
            return false;
        }
        let truncated = self.truncate(cycle);
        let n = truncated.len();
        let half = n / 2;
        if half == 0 {
            return false;
        }

        let mean = truncated.mean();
        let centered: Vec<f64> = truncated.samples.iter().map(|v| v - mean).collect();
        let amps = fft::amplitudes(&fft::forward(&centered));

        let Some((k_max, a_max)) = (1..=half)
            .map(|k| (k, amps[k]))
            .max_by_key(|&(_, a)| OrderedFloat(a))
        else {
            return false;
        };
        if a_max <= f64::EPSILON {
            return false;
        }

        let mean_amplitude = amps[1..=half].iter().sum::<f64>() / half as f64;
        let expected = 1.0 / cycle.as_secs_f64();
        let found = fft::frequency(k_max, n, self.sample_rate);

        (found - expected).abs() / expected <= PERIODICITY_FREQUENCY_TOLERANCE
            && a_max >= PERIODICITY_MIN_DOMINANCE * mean_amplitude
    }

    /// First candidate cycle the signal repeats at
    pub fn find_cycle(&self, candidates: &[Duration]) -> Option<Duration> {
        candidates.iter().copied().find(|&cycle| self.is_periodic(cycle))
    }

    pub fn mean(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.len() as f64
    }

    pub fn min(&self) -> f64 {
        self.samples.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.samples.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }
}

// ----------------------------------------------------------------------------
// Preprocessing
// ----------------------------------------------------------------------------

/// Prepare raw samples for analysis:
///
/// 1. discard everything before the last gap longer than an hour,
/// 2. fill gaps that are whole multiples of `step` by linear interpolation,
/// 3. drop leading samples so the length is a whole number of `unit`s.
///
/// Timestamps must be strictly increasing. Gaps that are not multiples of
/// `step` are an error.
pub fn preprocess(samples: &[Sample], step: Duration, unit: Duration) -> DataResult<Vec<Sample>> {
    let step_secs = step.as_secs() as i64;
    let unit_secs = unit.as_secs() as i64;
    if step_secs <= 0 || unit_secs % step_secs != 0 {
        return Err(DataError::InvalidResolution { step_secs, unit_secs });
    }
    if samples.is_empty() {
        return Err(DataError::EmptySeries);
    }

    let mut warm_start = 0;
    for i in 1..samples.len() {
        let gap = samples[i].timestamp.as_secs() - samples[i - 1].timestamp.as_secs();
        if gap <= 0 {
            return Err(DataError::NonMonotonicTimestamps { index: i });
        }
        if gap > COLD_DATA_GAP.as_secs() as i64 {
            warm_start = i;
        }
    }
    let warm = &samples[warm_start..];

    let mut filled = Vec::with_capacity(warm.len());
    filled.push(warm[0]);
    for pair in warm.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let gap = b.timestamp.as_secs() - a.timestamp.as_secs();
        if gap % step_secs != 0 {
            return Err(DataError::UnalignedGap { gap_secs: gap, step_secs });
        }
        let missing = gap / step_secs;
        for j in 1..missing {
            let fraction = j as f64 / missing as f64;
            filled.push(Sample::new(
                a.value + (b.value - a.value) * fraction,
                crate::types::Timestamp::from_secs(a.timestamp.as_secs() + j * step_secs),
            ));
        }
        filled.push(b);
    }

    let per_unit = (unit_secs / step_secs) as usize;
    let keep = filled.len() / per_unit * per_unit;
    if keep == 0 {
        return Err(DataError::InsufficientData {
            needed: per_unit,
            available: filled.len(),
        });
    }
    Ok(filled.split_off(filled.len() - keep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;
    use crate::{DAY, HOUR, WEEK};
    use pretty_assertions::assert_eq;
    use std::f64::consts::PI;

    fn at(value: f64, secs: i64) -> Sample {
        Sample::new(value, Timestamp::from_secs(secs))
    }

    fn periodic(days: usize, step_secs: usize, period_secs: f64) -> Signal {
        let n = days * 86_400 / step_secs;
        let samples = (0..n)
            .map(|i| 10.0 + 5.0 * (2.0 * PI * (i * step_secs) as f64 / period_secs).sin())
            .collect();
        Signal::from_step(samples, Duration::from_secs(step_secs as u64))
    }

    #[test]
    fn test_fill_and_truncate() {
        let raw = vec![at(0.1, 0), at(1.3, 60), at(2.0, 120), at(3.5, 300)];

        let out = preprocess(&raw, Duration::from_secs(60), Duration::from_secs(120)).unwrap();
        let times: Vec<i64> = out.iter().map(|s| s.timestamp.as_secs()).collect();
        assert_eq!(times, vec![0, 60, 120, 180, 240, 300]);
        assert!((out[3].value - 2.5).abs() < 1e-12);
        assert!((out[4].value - 3.0).abs() < 1e-12);

        let out = preprocess(&raw, Duration::from_secs(60), Duration::from_secs(240)).unwrap();
        let times: Vec<i64> = out.iter().map(|s| s.timestamp.as_secs()).collect();
        assert_eq!(times, vec![120, 180, 240, 300]);
    }

    #[test]
    fn test_cold_data_dropped() {
        let raw = vec![at(9.0, 0), at(9.0, 60), at(1.0, 10_000), at(2.0, 10_060)];
        let out = preprocess(&raw, Duration::from_secs(60), Duration::from_secs(120)).unwrap();
        assert_eq!(out, vec![at(1.0, 10_000), at(2.0, 10_060)]);
    }

    #[test]
    fn test_preprocess_errors() {
        let step = Duration::from_secs(60);
        assert_eq!(preprocess(&[], step, HOUR), Err(DataError::EmptySeries));
        assert_eq!(
            preprocess(&[at(1.0, 0), at(1.0, 90)], step, HOUR),
            Err(DataError::UnalignedGap { gap_secs: 90, step_secs: 60 })
        );
        assert_eq!(
            preprocess(&[at(1.0, 60), at(1.0, 60)], step, HOUR),
            Err(DataError::NonMonotonicTimestamps { index: 1 })
        );
        assert!(matches!(
            preprocess(&[at(1.0, 0), at(1.0, 60)], step, HOUR),
            Err(DataError::InsufficientData { needed: 60, available: 2 })
        ));
        assert!(matches!(
            preprocess(&[at(1.0, 0)], Duration::from_secs(7 * 60), HOUR),
            Err(DataError::InvalidResolution { .. })
        ));
    }

    #[test]
    fn test_daily_sine_is_daily() {
        let signal = periodic(15, 60, 86_400.0);
        assert!(!signal.is_periodic(HOUR));
        assert!(signal.is_periodic(DAY));
        // the strongest component of a two-week window is still daily
        assert!(!signal.is_periodic(WEEK));
        assert_eq!(signal.find_cycle(&[HOUR, DAY, WEEK]), Some(DAY));
    }

    #[test]
    fn test_hourly_sine_is_hourly() {
        let signal = periodic(2, 60, 3_600.0);
        assert_eq!(signal.find_cycle(&[HOUR, DAY, WEEK]), Some(HOUR));
    }

    #[test]
    fn test_too_short_or_flat_is_not_periodic() {
        let short = periodic(1, 60, 86_400.0);
        assert!(!short.is_periodic(DAY));

        let flat = Signal::from_step(vec![3.0; 3 * 1440], Duration::from_secs(60));
        assert_eq!(flat.find_cycle(&[HOUR, DAY]), None);
    }

    #[test]
    fn test_noise_is_not_periodic() {
        // xorshift noise, deterministic
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let samples: Vec<f64> = (0..3 * 1440)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state % 1000) as f64 / 100.0
            })
            .collect();
        let noise = Signal::from_step(samples, Duration::from_secs(60));
        assert!(!noise.is_periodic(DAY));
    }

    #[test]
    fn test_split_last_cycle() {
        let samples = (0..250).map(|i| i as f64).collect();
        let signal = Signal::from_step(samples, Duration::from_secs(60));
        let cycle = Duration::from_secs(60 * 100);
        let (train, test) = signal.split_last_cycle(cycle).unwrap();
        assert_eq!(train.len(), 100);
        assert_eq!(test.len(), 100);
        assert_eq!(train.samples[0], 50.0);
        assert_eq!(test.samples[0], 150.0);
        let long_cycle = Duration::from_secs(60 * 200);
        assert!(signal.split_last_cycle(long_cycle).is_none());
    }
}
