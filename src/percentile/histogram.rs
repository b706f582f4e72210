// ============================================================================
// SECTION: DECAYING HISTOGRAM
// ============================================================================
// Weighted value histogram whose sample weights grow exponentially with the
// sample timestamp: a sample one half-life newer counts twice as much. This
// is the same as decaying old samples, but keeps weights stable between
// additions. When the growth exponent gets large the reference time moves
// forward and every stored weight is rescaled.
// ============================================================================

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DataError, DataResult};
use crate::types::Timestamp;
use crate::{MAX_CHECKPOINT_WEIGHT, MAX_DECAY_EXPONENT};

/// Upper bound on bucket count accepted from configuration
const MAX_BUCKETS: usize = 1 << 20;

// ----------------------------------------------------------------------------
// Bucket Layout
// ----------------------------------------------------------------------------

/// How values map to buckets. Values above `max_value` land in the last
/// bucket, values below zero in the first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HistogramLayout {
    /// Buckets of equal size
    Linear { max_value: f64, bucket_size: f64 },
    /// Each bucket `ratio` times larger than the previous one
    Exponential {
        max_value: f64,
        first_bucket_size: f64,
        ratio: f64,
    },
}

impl HistogramLayout {
    pub fn max_value(&self) -> f64 {
        match *self {
            HistogramLayout::Linear { max_value, .. } | HistogramLayout::Exponential { max_value, .. } => max_value,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.max_value() > 0.0) || !self.max_value().is_finite() {
            return Err("max_value must be positive".into());
        }
        match *self {
            HistogramLayout::Linear { bucket_size, .. } => {
                if !(bucket_size > 0.0) {
                    return Err("bucket_size must be positive".into());
                }
            }
            HistogramLayout::Exponential {
                first_bucket_size,
                ratio,
                ..
            } => {
                if !(first_bucket_size > 0.0) {
                    return Err("first_bucket_size must be positive".into());
                }
                if !(ratio > 1.0) || !ratio.is_finite() {
                    return Err("bucket_size_growth_ratio must be greater than 1".into());
                }
            }
        }
        if self.num_buckets() > MAX_BUCKETS {
            return Err(format!("layout needs more than {MAX_BUCKETS} buckets"));
        }
        Ok(())
    }

    pub fn num_buckets(&self) -> usize {
        match *self {
            HistogramLayout::Linear { max_value, bucket_size } => (max_value / bucket_size).ceil() as usize + 1,
            HistogramLayout::Exponential {
                max_value,
                first_bucket_size,
                ratio,
            } => (max_value * (ratio - 1.0) / first_bucket_size + 1.0).log(ratio).ceil() as usize + 1,
        }
    }

    pub fn find_bucket(&self, value: f64) -> usize {
        let last = self.num_buckets() - 1;
        let bucket = match *self {
            HistogramLayout::Linear { bucket_size, .. } => {
                if value <= 0.0 {
                    0
                } else {
                    (value / bucket_size) as usize
                }
            }
            HistogramLayout::Exponential {
                first_bucket_size,
                ratio,
                ..
            } => {
                if value < first_bucket_size {
                    0
                } else {
                    (value * (ratio - 1.0) / first_bucket_size + 1.0).log(ratio) as usize
                }
            }
        };
        bucket.min(last)
    }

    /// Smallest value that falls into `bucket`
    pub fn bucket_start(&self, bucket: usize) -> f64 {
        match *self {
            HistogramLayout::Linear { bucket_size, .. } => bucket as f64 * bucket_size,
            HistogramLayout::Exponential {
                first_bucket_size,
                ratio,
                ..
            } => {
                if bucket == 0 {
                    0.0
                } else {
                    first_bucket_size * (ratio.powi(bucket as i32) - 1.0) / (ratio - 1.0)
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Checkpoint Form
// ----------------------------------------------------------------------------

/// Compact persisted form. Bucket weights are rescaled so the heaviest
/// bucket holds `MAX_CHECKPOINT_WEIGHT`; `total_weight` restores the scale.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistogramCheckpoint {
    pub total_weight: f64,
    pub bucket_weights: BTreeMap<usize, u32>,
    pub reference_timestamp: Timestamp,
}

// ----------------------------------------------------------------------------
// Histogram
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DecayingHistogram {
    layout: HistogramLayout,
    half_life_secs: f64,
    epsilon: f64,
    bucket_weights: Vec<f64>,
    total_weight: f64,
    min_bucket: usize,
    max_bucket: usize,
    reference_time: Timestamp,
}

impl DecayingHistogram {
    pub fn new(layout: HistogramLayout, half_life: Duration, epsilon: f64) -> Self {
        let num_buckets = layout.num_buckets();
        Self {
            layout,
            half_life_secs: half_life.as_secs_f64().max(1.0),
            epsilon,
            bucket_weights: vec![0.0; num_buckets],
            total_weight: 0.0,
            min_bucket: num_buckets - 1,
            max_bucket: 0,
            reference_time: Timestamp::EPOCH,
        }
    }

    pub fn layout(&self) -> &HistogramLayout {
        &self.layout
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn reference_time(&self) -> Timestamp {
        self.reference_time
    }

    pub fn is_empty(&self) -> bool {
        self.bucket_weights[self.min_bucket] < self.epsilon
    }

    /// Add `value` with `weight`, decayed relative to `time`. Non-positive
    /// weights are ignored.
    pub fn add_sample(&mut self, value: f64, weight: f64, time: Timestamp) {
        if !(weight > 0.0) || !value.is_finite() {
            return;
        }
        let weight = weight * self.decay_factor(time);
        let bucket = self.layout.find_bucket(value);
        self.bucket_weights[bucket] += weight;
        self.total_weight += weight;
        if bucket < self.min_bucket && self.bucket_weights[bucket] >= self.epsilon {
            self.min_bucket = bucket;
        }
        if bucket > self.max_bucket && self.bucket_weights[bucket] >= self.epsilon {
            self.max_bucket = bucket;
        }
    }

    /// Value below which `percentile` of the weight lies, reported as the
    /// start of the next bucket. Zero for an empty histogram.
    pub fn percentile(&self, percentile: f64) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let threshold = percentile.clamp(0.0, 1.0) * self.total_weight;
        let mut partial = 0.0;
        let mut bucket = self.min_bucket;
        while bucket < self.max_bucket {
            partial += self.bucket_weights[bucket];
            if partial >= threshold {
                break;
            }
            bucket += 1;
        }
        if bucket < self.bucket_weights.len() - 1 {
            self.layout.bucket_start(bucket + 1)
        } else {
            self.layout.bucket_start(bucket)
        }
    }

    fn decay_factor(&mut self, time: Timestamp) -> f64 {
        let horizon = self.reference_time.as_secs() as f64 + MAX_DECAY_EXPONENT * self.half_life_secs;
        if time.as_secs() as f64 > horizon {
            self.shift_reference_time(time);
        }
        ((time.as_secs() - self.reference_time.as_secs()) as f64 / self.half_life_secs).exp2()
    }

    /// Move the reference to `time` rounded to whole half-lives, rescaling
    /// the stored weights to match
    fn shift_reference_time(&mut self, time: Timestamp) {
        let new_reference = ((time.as_secs() as f64 / self.half_life_secs).round() * self.half_life_secs) as i64;
        let exponent = ((self.reference_time.as_secs() - new_reference) as f64 / self.half_life_secs).round();
        self.scale(exponent.exp2());
        self.reference_time = Timestamp::from_secs(new_reference);
    }

    fn scale(&mut self, factor: f64) {
        for weight in &mut self.bucket_weights[self.min_bucket.min(self.max_bucket)..=self.max_bucket] {
            *weight *= factor;
        }
        self.total_weight *= factor;
        self.update_min_max();
    }

    fn update_min_max(&mut self) {
        let epsilon = self.epsilon;
        let last = self.bucket_weights.len() - 1;
        self.min_bucket = self.bucket_weights.iter().position(|&w| w >= epsilon).unwrap_or(last);
        self.max_bucket = self.bucket_weights.iter().rposition(|&w| w >= epsilon).unwrap_or(0);
    }

    // ------------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------------

    pub fn save_checkpoint(&self) -> HistogramCheckpoint {
        let mut checkpoint = HistogramCheckpoint {
            total_weight: self.total_weight,
            bucket_weights: BTreeMap::new(),
            reference_timestamp: self.reference_time,
        };
        if self.is_empty() {
            return checkpoint;
        }

        let heaviest = self.bucket_weights[self.min_bucket..=self.max_bucket]
            .iter()
            .copied()
            .fold(0.0, f64::max);
        let ratio = MAX_CHECKPOINT_WEIGHT as f64 / heaviest;
        for bucket in self.min_bucket..=self.max_bucket {
            let scaled = (self.bucket_weights[bucket] * ratio).round() as u32;
            if scaled > 0 {
                checkpoint.bucket_weights.insert(bucket, scaled);
            }
        }
        checkpoint
    }

    /// Merge a checkpoint into this histogram. Buckets beyond the layout are
    /// dropped.
    pub fn load_checkpoint(&mut self, checkpoint: &HistogramCheckpoint) -> DataResult<()> {
        if !(checkpoint.total_weight >= 0.0) {
            return Err(DataError::InvalidCheckpoint {
                message: format!("negative total weight {}", checkpoint.total_weight),
            });
        }
        self.reference_time = checkpoint.reference_timestamp;

        let sum: u64 = checkpoint.bucket_weights.values().map(|&w| u64::from(w)).sum();
        if sum == 0 {
            return Ok(());
        }
        let ratio = checkpoint.total_weight / sum as f64;
        let num_buckets = self.bucket_weights.len();
        for (&bucket, &weight) in &checkpoint.bucket_weights {
            if bucket < num_buckets {
                self.bucket_weights[bucket] += f64::from(weight) * ratio;
            }
        }
        self.total_weight += checkpoint.total_weight;
        self.update_min_max();
        Ok(())
    }
}
