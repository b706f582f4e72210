// ============================================================================
// SECTION: FREQUENCY DOMAIN
// ============================================================================
// Forward/inverse transforms over real signals plus the spectrum filter used
// by the FFT estimator. Amplitudes are single-sided: a sine of amplitude A
// shows up as A in its bin.
// ============================================================================

use std::cmp::Ordering;

use ordered_float::OrderedFloat;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

/// Forward transform of a real signal
pub fn forward(samples: &[f64]) -> Vec<Complex<f64>> {
    let mut buffer: Vec<Complex<f64>> = samples.iter().map(|&v| Complex::new(v, 0.0)).collect();
    if buffer.is_empty() {
        return buffer;
    }
    let mut planner = FftPlanner::<f64>::new();
    planner.plan_fft_forward(buffer.len()).process(&mut buffer);
    buffer
}

/// Inverse transform, keeping the real part
pub fn inverse(spectrum: &[Complex<f64>]) -> Vec<f64> {
    let mut buffer = spectrum.to_vec();
    if buffer.is_empty() {
        return Vec::new();
    }
    let n = buffer.len();
    let mut planner = FftPlanner::<f64>::new();
    planner.plan_fft_inverse(n).process(&mut buffer);
    buffer.iter().map(|c| c.re / n as f64).collect()
}

/// Single-sided amplitudes for bins `0..=n/2`
pub fn amplitudes(spectrum: &[Complex<f64>]) -> Vec<f64> {
    let n = spectrum.len();
    if n == 0 {
        return Vec::new();
    }
    let half = n / 2;
    (0..=half)
        .map(|k| {
            let scale = if k == 0 || (n % 2 == 0 && k == half) { 1.0 } else { 2.0 };
            scale * spectrum[k].norm() / n as f64
        })
        .collect()
}

/// Frequency in Hz of bin `k` of an `n`-point transform
#[inline]
pub fn frequency(k: usize, n: usize, sample_rate: f64) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let k = k.min(n - k.min(n));
    k as f64 * sample_rate / n as f64
}

// ----------------------------------------------------------------------------
// Spectrum Filter
// ----------------------------------------------------------------------------

/// Keeps the strong components of a spectrum and zeroes the rest.
///
/// Components below `low_frequency_cutoff` (the trend and DC) are always
/// kept. Of the others, those with amplitude at or above
/// `amplitude_threshold` are kept, but never fewer than `min_items` nor more
/// than `max_items`, strongest first. Applying the filter twice gives the
/// same signal as applying it once.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumFilter {
    pub amplitude_threshold: f64,
    pub low_frequency_cutoff: f64,
    pub min_items: usize,
    pub max_items: usize,
}

impl SpectrumFilter {
    pub fn apply(&self, samples: &[f64], sample_rate: f64) -> Vec<f64> {
        let n = samples.len();
        if n < 2 {
            return samples.to_vec();
        }

        let mut spectrum = forward(samples);
        let amps = amplitudes(&spectrum);
        let half = n / 2;

        let mut candidates: Vec<usize> = (1..=half)
            .filter(|&k| frequency(k, n, sample_rate) >= self.low_frequency_cutoff)
            .collect();
        candidates.sort_by(|&a, &b| match OrderedFloat(amps[b]).cmp(&OrderedFloat(amps[a])) {
            Ordering::Equal => a.cmp(&b),
            other => other,
        });

        let passing = candidates
            .iter()
            .filter(|&&k| amps[k] >= self.amplitude_threshold)
            .count();
        let keep = passing
            .max(self.min_items)
            .min(self.max_items)
            .min(candidates.len());

        for &k in &candidates[keep..] {
            spectrum[k] = Complex::new(0.0, 0.0);
            spectrum[n - k] = Complex::new(0.0, 0.0);
        }

        inverse(&spectrum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn tone(n: usize, cycles: f64, amplitude: f64) -> Vec<f64> {
        (0..n)
            .map(|i| amplitude * (2.0 * PI * cycles * i as f64 / n as f64).sin())
            .collect()
    }

    fn assert_close(a: &[f64], b: &[f64], tol: f64) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < tol, "{x} vs {y}");
        }
    }

    #[test]
    fn test_round_trip_and_amplitude() {
        let signal: Vec<f64> = tone(256, 8.0, 3.0).iter().map(|v| v + 2.0).collect();
        let spectrum = forward(&signal);
        assert_close(&inverse(&spectrum), &signal, 1e-9);

        let amps = amplitudes(&spectrum);
        assert!((amps[0] - 2.0).abs() < 1e-9);
        assert!((amps[8] - 3.0).abs() < 1e-9);
        assert!(amps[9] < 1e-9);
    }

    #[test]
    fn test_frequency_is_symmetric() {
        assert_eq!(frequency(3, 100, 1.0), 0.03);
        assert_eq!(frequency(97, 100, 1.0), 0.03);
        assert_eq!(frequency(0, 100, 1.0), 0.0);
    }

    #[test]
    fn test_filter_drops_weak_components() {
        let n = 512;
        let strong = tone(n, 4.0, 5.0);
        let weak = tone(n, 40.0, 0.2);
        let mixed: Vec<f64> = strong.iter().zip(&weak).map(|(a, b)| a + b).collect();

        let filter = SpectrumFilter {
            amplitude_threshold: 1.0,
            low_frequency_cutoff: 0.0,
            min_items: 1,
            max_items: 10,
        };
        assert_close(&filter.apply(&mixed, 1.0), &strong, 1e-9);
    }

    #[test]
    fn test_filter_respects_min_and_max_items() {
        let n = 512;
        let signal: Vec<f64> = (1..=6)
            .map(|c| tone(n, (c * 5) as f64, c as f64))
            .fold(vec![0.0; n], |acc, t| acc.iter().zip(&t).map(|(a, b)| a + b).collect());

        let at_most_two = SpectrumFilter {
            amplitude_threshold: 0.5,
            low_frequency_cutoff: 0.0,
            min_items: 1,
            max_items: 2,
        };
        let kept = at_most_two.apply(&signal, 1.0);
        let expected: Vec<f64> = tone(n, 30.0, 6.0)
            .iter()
            .zip(tone(n, 25.0, 5.0))
            .map(|(a, b)| a + b)
            .collect();
        assert_close(&kept, &expected, 1e-9);

        let at_least_one = SpectrumFilter {
            amplitude_threshold: 100.0,
            low_frequency_cutoff: 0.0,
            min_items: 1,
            max_items: 10,
        };
        assert_close(&at_least_one.apply(&signal, 1.0), &tone(n, 30.0, 6.0), 1e-9);
    }

    #[test]
    fn test_filter_keeps_low_frequencies() {
        let n = 256;
        let slow = tone(n, 1.0, 0.1);
        let fast = tone(n, 50.0, 0.1);
        let mixed: Vec<f64> = slow.iter().zip(&fast).map(|(a, b)| a + b).collect();
        let filter = SpectrumFilter {
            amplitude_threshold: 1.0,
            low_frequency_cutoff: 2.0 / n as f64,
            min_items: 0,
            max_items: 10,
        };
        assert_close(&filter.apply(&mixed, 1.0), &slow, 1e-9);
    }

    #[test]
    fn test_filter_is_idempotent() {
        let n = 1024;
        let signal: Vec<f64> = (0..n)
            .map(|i| {
                let x = i as f64 / n as f64;
                10.0 + 4.0 * (2.0 * PI * 7.0 * x).sin()
                    + 2.0 * (2.0 * PI * 21.0 * x).cos()
                    + 0.3 * (2.0 * PI * 90.0 * x).sin()
                    + 0.05 * (2.0 * PI * 200.0 * x).cos()
            })
            .collect();

        for threshold in [1.0, 2.5] {
            let filter = SpectrumFilter {
                amplitude_threshold: threshold,
                low_frequency_cutoff: 0.0,
                min_items: 1,
                max_items: 100,
            };
            let once = filter.apply(&signal, 1.0);
            let twice = filter.apply(&once, 1.0);
            assert_close(&once, &twice, 1e-9);
        }
    }
}
