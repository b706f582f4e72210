//! # Cerebro Predictor - The Forecasting Core
//!
//! Short-horizon forecasting for the Cerebro autoscaling platform. Given streams
//! of historical and real-time utilization samples, the predictor keeps a live
//! registry of forecasting queries and serves predicted values to the scaling
//! controllers that size workloads and nodes.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          CEREBRO PREDICTOR                               │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  PROVIDER PROXY → QUERY REGISTRY → DSP / PERCENTILE TASKS → SIGNAL STORE │
//! │                         ↑                    ↓                           │
//! │                  CONFIG BROADCASTER     CHECKPOINT STORE                 │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Algorithms
//!
//! - **DSP**: detects hourly/daily/weekly periodicity with an FFT, backtests a
//!   set of waveform estimators and republishes the best one-cycle forecast.
//! - **Percentile**: keeps a time-decayed weighted histogram per series and
//!   reads a percentile off it, inflated by a safety margin.
//!
//! Prediction computation (one background task per query) and prediction
//! retrieval (snapshot reads of the signal store) run concurrently.

#![warn(rust_2018_idioms)]

use std::time::Duration;

pub mod broadcast;
pub mod checkpoint;
pub mod concurrent;
pub mod config;
pub mod dsp;
pub mod error;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod percentile;
pub mod prediction;
pub mod provider;
pub mod registry;
pub mod types;

pub use config::{AlgorithmConfig, ConfigEvent, ConfigRegistry, EngineConfig};
pub use error::{PredictorError, PredictorResult};
pub use manager::{PredictionOutput, PredictionRequest, PredictorManager};
pub use prediction::{DebugSnapshot, Prediction};
pub use provider::{DataProvider, DataProviderProxy, ProviderRole};
pub use types::{AlgorithmType, Label, Labels, MetricQuery, QueryStatus, Sample, TimeSeries, Timestamp};

// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================
// Global constants that define the behavior and limits of the predictor.
// ============================================================================

/// Predictor version - follows semantic versioning
pub const PREDICTOR_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PREDICTOR_NAME: &str = "cerebro-predictor";
pub const PREDICTOR_FULL_NAME: &str = "Cerebro Forecasting Core";

// ----------------------------------------------------------------------------
// Queue Sizes
// ----------------------------------------------------------------------------

/// Capacity of the registry → algorithm lifecycle event queue
pub const QUERY_EVENT_QUEUE_SIZE: usize = 1024;

/// Default capacity of each checkpoint request queue
pub const CHECKPOINT_QUEUE_SIZE: usize = 1024;

/// Default checkpoint writer workers
pub const DEFAULT_CHECKPOINT_WRITERS: usize = 4;

/// Default checkpoint reader workers
pub const DEFAULT_CHECKPOINT_READERS: usize = 2;

// ----------------------------------------------------------------------------
// Timing
// ----------------------------------------------------------------------------

pub const HOUR: Duration = Duration::from_secs(3600);
pub const DAY: Duration = Duration::from_secs(24 * 3600);
pub const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);

/// Candidate cycle lengths tested for periodicity, in priority order
pub const CYCLE_CANDIDATES: [Duration; 3] = [HOUR, DAY, WEEK];

/// Gaps longer than this mark everything before them as cold data
pub const COLD_DATA_GAP: Duration = HOUR;

/// Extra history fetched beyond the configured history length
pub const HISTORY_FETCH_SLACK: Duration = HOUR;

/// Default grace period for stopping all workers (seconds)
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 30;

// ----------------------------------------------------------------------------
// Signal Analysis
// ----------------------------------------------------------------------------

/// Minimum full cycles present before a cycle length is considered
pub const MIN_CYCLES: usize = 2;

/// Relative tolerance between the dominant frequency and 1/cycle
pub const PERIODICITY_FREQUENCY_TOLERANCE: f64 = 1e-3;

/// Dominant amplitude must exceed the mean spectral amplitude by this factor
pub const PERIODICITY_MIN_DOMINANCE: f64 = 4.0;

/// Floor applied to non-positive reconstructed waveform values
pub const NON_POSITIVE_FLOOR: f64 = 1e-5;

/// Actual values closer to zero than this switch scoring from MAPE to MAE
pub const MAPE_ZERO_EPSILON: f64 = 1e-6;

/// Upper bound on the relative under-prediction fed into the log penalty
pub const MAX_UNDER_PREDICTION_RATIO: f64 = 0.999_999;

// ----------------------------------------------------------------------------
// Histogram
// ----------------------------------------------------------------------------

/// Decay exponents above this trigger a reference timestamp shift
pub const MAX_DECAY_EXPONENT: f64 = 100.0;

/// Largest bucket weight written into a checkpoint
pub const MAX_CHECKPOINT_WEIGHT: u32 = 10_000;

/// Current checkpoint record format version
pub const CHECKPOINT_VERSION: &str = "v1";
