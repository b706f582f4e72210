// ============================================================================
// SECTION: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem of the predictor.
// Designed for:
// - Clear error categorization
// - Easy propagation with `?` across subsystem boundaries
// - Recovery strategy hints for the calling controllers
// ============================================================================

use std::path::PathBuf;

use thiserror::Error;

use crate::types::AlgorithmType;

// ----------------------------------------------------------------------------
// Core Predictor Errors
// ----------------------------------------------------------------------------

/// The main error type for the predictor.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum PredictorError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Query Lifecycle Errors ----
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    // ---- Signal Processing Errors ----
    #[error("Data error: {0}")]
    Data(#[from] DataError),

    // ---- Data Provider Errors ----
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // ---- Checkpoint Errors ----
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    // ---- Multi-query Errors ----
    #[error("Partial prediction: {0}")]
    Partial(#[from] PartialPredictionError),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ---- Generic Errors ----
    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Shutdown in progress")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PredictorError {
    pub fn cancelled(operation: impl Into<String>) -> Self {
        PredictorError::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        PredictorError::Internal(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PredictorError::Cancelled { .. } | PredictorError::ShuttingDown)
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            PredictorError::Config(_) => false,
            PredictorError::Query(e) => e.is_recoverable(),
            PredictorError::Data(_) => true,
            PredictorError::Provider(_) => true,
            PredictorError::Checkpoint(e) => e.is_recoverable(),
            PredictorError::Partial(_) => true,
            PredictorError::Io(_) => true,
            PredictorError::Cancelled { .. } => false,
            PredictorError::ShuttingDown => false,
            PredictorError::Internal(_) => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            PredictorError::Config(_) => "config",
            PredictorError::Query(_) => "query",
            PredictorError::Data(_) => "data",
            PredictorError::Provider(_) => "provider",
            PredictorError::Checkpoint(_) => "checkpoint",
            PredictorError::Partial(_) => "partial",
            PredictorError::Io(_) => "io",
            PredictorError::Cancelled { .. } => "cancelled",
            PredictorError::ShuttingDown => "shutdown",
            PredictorError::Internal(_) => "internal",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            PredictorError::Config(_) => RecoveryHint::FixConfiguration,
            PredictorError::Query(QueryError::NotRegistered { .. }) => RecoveryHint::Register,
            PredictorError::Data(_) => RecoveryHint::Skip,
            PredictorError::Cancelled { .. } | PredictorError::ShuttingDown => RecoveryHint::None,
            PredictorError::Internal(_) => RecoveryHint::AlertOperator,
            _ => RecoveryHint::RetryWithBackoff,
        }
    }
}

/// Hints for how a caller can recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Register the query before asking for predictions
    Register,
    /// Fix configuration and restart
    FixConfiguration,
    /// Skip this item and continue
    Skip,
    /// Alert operator for manual intervention
    AlertOperator,
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading, parsing and resolution
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Expected {expected} configuration, found {found}")]
    WrongAlgorithm {
        expected: AlgorithmType,
        found: AlgorithmType,
    },

    #[error("Unknown checkpoint backend '{name}' (registered: {registered})")]
    UnknownBackend { name: String, registered: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        ConfigError::ParseError {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Query Errors
// ----------------------------------------------------------------------------

/// Errors from query registration and lookup
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Metric identifier must not be empty")]
    EmptyIdentifier,

    #[error("Caller must not be empty")]
    EmptyCaller,

    #[error("Query '{identifier}' is not registered")]
    NotRegistered { identifier: String },

    #[error("Invalid time range: start {start} must be before end {end}")]
    InvalidTimeRange { start: i64, end: i64 },

    #[error("Event queue for {algorithm} is closed")]
    EventQueueClosed { algorithm: AlgorithmType },

    #[error("Event queue for {algorithm} is full")]
    EventQueueFull { algorithm: AlgorithmType },
}

impl QueryError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, QueryError::NotRegistered { .. } | QueryError::EventQueueFull { .. })
    }
}

// ----------------------------------------------------------------------------
// Data Errors
// ----------------------------------------------------------------------------

/// Errors from preprocessing and analyzing a single series
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("Series has no samples")]
    EmptySeries,

    #[error("Timestamps are not strictly increasing at index {index}")]
    NonMonotonicTimestamps { index: usize },

    #[error("Gap of {gap_secs}s is not a multiple of the {step_secs}s resolution")]
    UnalignedGap { gap_secs: i64, step_secs: i64 },

    #[error("Resolution of {step_secs}s does not evenly divide {unit_secs}s")]
    InvalidResolution { step_secs: i64, unit_secs: i64 },

    #[error("Not enough data: need {needed} samples, have {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("No periodicity detected")]
    NotPeriodic,

    #[error("No estimator produced a prediction")]
    NoEstimator,

    #[error("Invalid histogram checkpoint: {message}")]
    InvalidCheckpoint { message: String },
}

impl DataError {
    /// Short reason label for the skipped-series counter
    pub fn reason(&self) -> &'static str {
        match self {
            DataError::EmptySeries => "empty",
            DataError::NonMonotonicTimestamps { .. } => "non_monotonic",
            DataError::UnalignedGap { .. } => "unaligned_gap",
            DataError::InvalidResolution { .. } => "invalid_resolution",
            DataError::InsufficientData { .. } => "insufficient_data",
            DataError::NotPeriodic => "not_periodic",
            DataError::NoEstimator => "no_estimator",
            DataError::InvalidCheckpoint { .. } => "invalid_checkpoint",
        }
    }
}

// ----------------------------------------------------------------------------
// Provider Errors
// ----------------------------------------------------------------------------

/// Errors from data providers and the provider proxy
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("No {role} provider bound")]
    NotConfigured { role: String },

    #[error("No {role} sources configured")]
    NoSources { role: String },

    #[error("Source '{source_name}' failed: {message}")]
    SourceFailed { source_name: String, message: String },

    #[error("Invalid response from '{source_name}': {message}")]
    InvalidResponse { source_name: String, message: String },
}

impl ProviderError {
    pub fn source_failed(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::SourceFailed {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn invalid_response(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::InvalidResponse {
            source_name: source_name.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Checkpoint Errors
// ----------------------------------------------------------------------------

/// Errors from the checkpoint store and its backends
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint queues are closed")]
    Closed,

    #[error("Checkpoint workers have not been started")]
    NotStarted,

    #[error("Serialization failed for '{key}': {message}")]
    Serialization { key: String, message: String },

    #[error("Backend IO failed for '{key}': {message}")]
    Backend { key: String, message: String },

    #[error("Checkpoint worker exited before replying")]
    WorkerGone,
}

impl CheckpointError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CheckpointError::Backend { .. } | CheckpointError::NotStarted)
    }

    pub fn backend(key: impl Into<String>, message: impl Into<String>) -> Self {
        CheckpointError::Backend {
            key: key.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Partial Prediction Error
// ----------------------------------------------------------------------------

/// Aggregated per-query failures of a multi-query request.
/// Returned alongside whatever partial results were computed.
#[derive(Error, Debug, Clone, Default, PartialEq)]
#[error("{} of {} queries failed: {}", .failures.len(), .failures.len() + .succeeded, summarize(.failures))]
pub struct PartialPredictionError {
    /// (query key, error message) for each failed query
    pub failures: Vec<(String, String)>,
    pub succeeded: usize,
}

impl PartialPredictionError {
    pub fn push(&mut self, key: impl Into<String>, error: &PredictorError) {
        self.failures.push((key.into(), error.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

fn summarize(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(key, message)| format!("{key}: {message}"))
        .collect::<Vec<_>>()
        .join("; ")
}

// ----------------------------------------------------------------------------
// Result Type Aliases
// ----------------------------------------------------------------------------

pub type PredictorResult<T> = Result<T, PredictorError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type DataResult<T> = Result<T, DataError>;
pub type ProviderResult<T> = Result<T, ProviderError>;
pub type CheckpointResult<T> = Result<T, CheckpointError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err: PredictorError = ConfigError::invalid_value("dsp.sample_interval", "bad").into();
        assert_eq!(err.category(), "config");
        assert!(!err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::FixConfiguration);

        let err: PredictorError = QueryError::NotRegistered {
            identifier: "cpu".into(),
        }
        .into();
        assert!(err.is_recoverable());
        assert_eq!(err.recovery_hint(), RecoveryHint::Register);

        assert!(PredictorError::cancelled("load").is_cancelled());
    }

    #[test]
    fn test_partial_error_display() {
        let mut partial = PartialPredictionError::default();
        partial.succeeded = 2;
        partial.push("cpu", &PredictorError::Data(DataError::NotPeriodic));
        assert!(!partial.is_empty());
        assert_eq!(
            partial.to_string(),
            "1 of 3 queries failed: cpu: Data error: No periodicity detected"
        );
    }
}
