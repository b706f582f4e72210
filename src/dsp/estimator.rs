// ============================================================================
// SECTION: WAVEFORM ESTIMATORS
// ============================================================================
// An estimator turns a periodic signal into one predicted cycle. Several are
// configured per query; backtesting picks the one that would have predicted
// the most recent cycle best.
// ============================================================================

use std::fmt::Debug;
use std::time::Duration;

use tracing::trace;

use super::fft::SpectrumFilter;
use super::scoring::prediction_error;
use super::signal::Signal;
use crate::config::EstimatorParams;
use crate::NON_POSITIVE_FLOOR;

/// Predicts the next cycle of a periodic signal
pub trait Estimator: Send + Sync + Debug {
    fn name(&self) -> String;

    /// One cycle of predicted samples, at the signal's sample rate
    fn estimate(&self, signal: &Signal, cycle: Duration) -> Signal;
}

// ----------------------------------------------------------------------------
// Max Value
// ----------------------------------------------------------------------------

/// Per phase, the largest value seen across all cycles
#[derive(Debug, Clone)]
pub struct MaxValueEstimator {
    pub margin_fraction: f64,
}

impl Estimator for MaxValueEstimator {
    fn name(&self) -> String {
        format!("max_value(margin={})", self.margin_fraction)
    }

    fn estimate(&self, signal: &Signal, cycle: Duration) -> Signal {
        let per_cycle = signal.samples_per(cycle);
        let truncated = signal.truncate(cycle);
        if per_cycle == 0 || truncated.is_empty() {
            return Signal::new(Vec::new(), signal.sample_rate);
        }

        let mut peaks = vec![f64::NEG_INFINITY; per_cycle];
        for chunk in truncated.samples.chunks_exact(per_cycle) {
            for (peak, &value) in peaks.iter_mut().zip(chunk) {
                *peak = peak.max(value);
            }
        }
        let scale = 1.0 + self.margin_fraction;
        Signal::new(peaks.into_iter().map(|v| v * scale).collect(), signal.sample_rate)
    }
}

// ----------------------------------------------------------------------------
// FFT
// ----------------------------------------------------------------------------

/// Keeps the strong spectral components of the signal and replays the
/// reconstructed last cycle
#[derive(Debug, Clone)]
pub struct FftEstimator {
    pub margin_fraction: f64,
    pub filter: SpectrumFilter,
}

impl Estimator for FftEstimator {
    fn name(&self) -> String {
        format!(
            "fft(margin={}, threshold={}, items={}..={})",
            self.margin_fraction, self.filter.amplitude_threshold, self.filter.min_items, self.filter.max_items
        )
    }

    fn estimate(&self, signal: &Signal, cycle: Duration) -> Signal {
        let per_cycle = signal.samples_per(cycle);
        let truncated = signal.truncate(cycle);
        if per_cycle == 0 || truncated.is_empty() {
            return Signal::new(Vec::new(), signal.sample_rate);
        }

        let filtered = self.filter.apply(&truncated.samples, truncated.sample_rate);
        let scale = 1.0 + self.margin_fraction;
        let last_cycle = filtered[filtered.len() - per_cycle..]
            .iter()
            .map(|&v| if v <= 0.0 { NON_POSITIVE_FLOOR * scale } else { v * scale })
            .collect();
        Signal::new(last_cycle, signal.sample_rate)
    }
}

/// Build the estimators a query is configured with, in order
pub fn build_estimators(params: &[EstimatorParams]) -> Vec<Box<dyn Estimator>> {
    params
        .iter()
        .map(|p| -> Box<dyn Estimator> {
            match p {
                EstimatorParams::MaxValue { margin_fraction } => Box::new(MaxValueEstimator {
                    margin_fraction: *margin_fraction,
                }),
                EstimatorParams::Fft(fft) => Box::new(FftEstimator {
                    margin_fraction: fft.margin_fraction,
                    filter: SpectrumFilter {
                        amplitude_threshold: fft.low_amplitude_threshold,
                        low_frequency_cutoff: fft.low_frequency_cutoff,
                        min_items: fft.min_items,
                        max_items: fft.max_items,
                    },
                }),
            }
        })
        .collect()
}

// ----------------------------------------------------------------------------
// Backtesting
// ----------------------------------------------------------------------------

/// Winner of a backtest
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub index: usize,
    pub name: String,
    pub error: f64,
}

/// Train every estimator on all cycles but the last, score it against the
/// last, and return the lowest-scoring one. Ties go to the earlier estimator.
/// `None` if the signal has fewer than two cycles or nothing scored.
pub fn select_best(signal: &Signal, cycle: Duration, estimators: &[Box<dyn Estimator>]) -> Option<Selection> {
    let (train, test) = signal.split_last_cycle(cycle)?;

    let mut best: Option<Selection> = None;
    for (index, estimator) in estimators.iter().enumerate() {
        let predicted = estimator.estimate(&train, cycle);
        let error = prediction_error(&test.samples, &predicted.samples);
        trace!(target: "cerebro::dsp", estimator = %estimator.name(), error, "Backtested estimator");

        if !error.is_finite() {
            continue;
        }
        if best.as_ref().map_or(true, |b| error < b.error) {
            best = Some(Selection {
                index,
                name: estimator.name(),
                error,
            });
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FftParams;
    use std::f64::consts::PI;

    const STEP: Duration = Duration::from_secs(60);
    const CYCLE: Duration = Duration::from_secs(60 * 100);

    fn wave(cycles: usize, offset: f64, amplitude: f64) -> Signal {
        let samples = (0..cycles * 100)
            .map(|i| offset + amplitude * (2.0 * PI * i as f64 / 100.0).sin())
            .collect();
        Signal::from_step(samples, STEP)
    }

    fn fft(margin_fraction: f64) -> Box<dyn Estimator> {
        build_estimators(&[EstimatorParams::Fft(FftParams {
            margin_fraction,
            low_amplitude_threshold: 1.0,
            low_frequency_cutoff: 0.0,
            min_items: 1,
            max_items: 10,
        })])
        .remove(0)
    }

    #[test]
    fn test_max_value_takes_per_phase_peak() {
        let mut samples: Vec<f64> = (0..300).map(|i| (i % 100) as f64).collect();
        samples[150] = 1000.0;
        let signal = Signal::from_step(samples, STEP);

        let predicted = MaxValueEstimator { margin_fraction: 0.5 }.estimate(&signal, CYCLE);
        assert_eq!(predicted.len(), 100);
        assert_eq!(predicted.samples[10], 15.0);
        assert_eq!(predicted.samples[50], 1500.0);
    }

    #[test]
    fn test_fft_reproduces_clean_wave() {
        let signal = wave(4, 10.0, 5.0);
        let predicted = fft(0.0).estimate(&signal, CYCLE);
        assert_eq!(predicted.len(), 100);
        for (p, a) in predicted.samples.iter().zip(&signal.samples[300..]) {
            assert!((p - a).abs() < 1e-9);
        }
    }

    #[test]
    fn test_fft_floors_non_positive_values() {
        let signal = wave(3, 0.0, 5.0);
        let predicted = fft(0.0).estimate(&signal, CYCLE);
        assert!(predicted.samples.iter().all(|&v| v > 0.0));
        assert!(predicted.samples.iter().any(|&v| v == NON_POSITIVE_FLOOR));
    }

    #[test]
    fn test_backtest_picks_lowest_error() {
        let signal = wave(5, 10.0, 5.0);
        let estimators = vec![
            Box::new(MaxValueEstimator { margin_fraction: 0.5 }) as Box<dyn Estimator>,
            fft(0.1),
        ];
        let selection = select_best(&signal, CYCLE, &estimators).unwrap();
        assert_eq!(selection.index, 1);
        assert!((selection.error - 0.1).abs() < 1e-6);
        assert!(selection.name.starts_with("fft"));
    }

    #[test]
    fn test_backtest_ties_go_to_first() {
        let signal = wave(3, 10.0, 5.0);
        let estimators: Vec<Box<dyn Estimator>> = vec![
            Box::new(MaxValueEstimator { margin_fraction: 0.2 }),
            Box::new(MaxValueEstimator { margin_fraction: 0.2 }),
        ];
        assert_eq!(select_best(&signal, CYCLE, &estimators).unwrap().index, 0);
    }

    #[test]
    fn test_backtest_needs_two_cycles() {
        let signal = wave(1, 10.0, 5.0);
        let estimators = build_estimators(&[EstimatorParams::MaxValue { margin_fraction: 0.1 }]);
        assert!(select_best(&signal, CYCLE, &estimators).is_none());
        assert!(select_best(&wave(3, 10.0, 5.0), CYCLE, &[]).is_none());
    }
}
