// ============================================================================
// SECTION: PREDICTION ERROR SCORING
// ============================================================================
// Scores a predicted cycle against the held-out actual cycle. Lower is better.
// Under-prediction is penalized harder than over-prediction.
// ============================================================================

use crate::{MAPE_ZERO_EPSILON, MAX_UNDER_PREDICTION_RATIO};

/// Mean absolute error over the common prefix
pub fn mean_absolute_error(actual: &[f64], predicted: &[f64]) -> f64 {
    let n = actual.len().min(predicted.len());
    if n == 0 {
        return f64::INFINITY;
    }
    actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).abs())
        .sum::<f64>()
        / n as f64
}

/// Asymmetric mean absolute percentage error.
///
/// With `r = (actual - predicted) / |actual|`, over-prediction scores `|r|`
/// and under-prediction scores `-ln(1 - r) / ln(1.25)`, so 20% too low costs
/// as much as 100% too high.
pub fn asymmetric_mape(actual: &[f64], predicted: &[f64]) -> f64 {
    let n = actual.len().min(predicted.len());
    if n == 0 {
        return f64::INFINITY;
    }
    let amplification = 1.25f64.ln();
    actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| {
            let r = (a - p) / a.abs();
            if r <= 0.0 {
                -r
            } else {
                -(1.0 - r.min(MAX_UNDER_PREDICTION_RATIO)).ln() / amplification
            }
        })
        .sum::<f64>()
        / n as f64
}

/// Backtest score: MAPE, or MAE when some actual value is too close to zero
/// for a percentage to mean anything
pub fn prediction_error(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.iter().any(|a| a.abs() < MAPE_ZERO_EPSILON) {
        mean_absolute_error(actual, predicted)
    } else {
        asymmetric_mape(actual, predicted)
    }
}
