// ============================================================================
// SECTION: CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - TOML file parsing and environment variable overrides
// - Raw, string-valued per-query algorithm specs resolved at registration
// - A config registry that broadcasts per-query changes to the algorithms
// - Sensible defaults for every field
// ============================================================================

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::broadcast::{Broadcaster, Listener};
use crate::error::{ConfigError, ConfigResult};
use crate::percentile::histogram::HistogramLayout;
use crate::types::{AlgorithmType, Labels, LabelsExt, MetricQuery};
use crate::{
    CHECKPOINT_QUEUE_SIZE, DAY, DEFAULT_CHECKPOINT_READERS, DEFAULT_CHECKPOINT_WRITERS, HOUR,
    MIN_CYCLES, SHUTDOWN_GRACE_PERIOD_SECS,
};

// ----------------------------------------------------------------------------
// Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the predictor process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// General process settings
    #[serde(default)]
    pub engine: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Default spec for periodic-signal queries
    #[serde(default)]
    pub dsp: DspSpec,

    /// Default spec for percentile queries
    #[serde(default)]
    pub percentile: PercentileSpec,

    /// Checkpoint store configuration
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// History and realtime data sources
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Queries registered by the `run` command at startup
    #[serde(default)]
    pub queries: Vec<StaticQueryConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine: GeneralConfig::default(),
            logging: LoggingConfig::default(),
            dsp: DspSpec::documented_defaults(),
            percentile: PercentileSpec::documented_defaults(),
            checkpoint: CheckpointConfig::default(),
            providers: ProvidersConfig::default(),
            queries: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CEREBRO_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string
    pub fn from_toml_str(toml_str: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.engine.shutdown_timeout_secs == 0 {
            return Err(ConfigError::invalid_value(
                "engine.shutdown_timeout_secs",
                "must be at least 1 second",
            ));
        }

        // Engine-wide algorithm defaults must resolve cleanly; per-query
        // specs fall back to them at registration time.
        self.dsp_defaults()?;
        self.percentile_defaults()?;

        self.checkpoint.validate()?;
        self.providers.validate()?;

        for (i, query) in self.queries.iter().enumerate() {
            if query.metric_name.trim().is_empty() {
                return Err(ConfigError::invalid_value(
                    format!("queries[{i}].metric_name"),
                    "must not be empty",
                ));
            }
            if query.caller.trim().is_empty() {
                return Err(ConfigError::invalid_value(
                    format!("queries[{i}].caller"),
                    "must not be empty",
                ));
            }
        }

        Ok(())
    }

    /// Resolved engine-wide defaults for periodic-signal queries
    pub fn dsp_defaults(&self) -> ConfigResult<DspParams> {
        self.dsp.resolve_over(&DspParams::default())
    }

    /// Resolved engine-wide defaults for percentile queries
    pub fn percentile_defaults(&self) -> ConfigResult<PercentileParams> {
        self.percentile.resolve_over(&PercentileParams::default())
    }

    /// Render a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// General Configuration
// ----------------------------------------------------------------------------

/// General process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Instance name (for identification in logs)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Graceful shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// How often `run` logs the realtime predictions of static queries
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            report_interval_secs: default_report_interval(),
        }
    }
}

fn default_instance_name() -> String {
    "cerebro-predictor".into()
}

fn default_shutdown_timeout() -> u64 {
    SHUTDOWN_GRACE_PERIOD_SECS
}

fn default_report_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ----------------------------------------------------------------------------
// Checkpoint Configuration
// ----------------------------------------------------------------------------

/// Checkpoint store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Persist percentile histograms across restarts
    #[serde(default)]
    pub enabled: bool,

    /// Backend name in the checkpoint factory registry
    #[serde(default = "default_checkpoint_backend")]
    pub backend: String,

    /// Root directory of the `local` backend
    #[serde(default = "default_checkpoint_directory")]
    pub directory: String,

    #[serde(default = "default_checkpoint_writers")]
    pub writers: usize,

    #[serde(default = "default_checkpoint_readers")]
    pub readers: usize,

    /// Capacity of each request queue
    #[serde(default = "default_checkpoint_queue_size")]
    pub queue_size: usize,

    /// Period of the background checkpoint pass
    #[serde(default = "default_checkpoint_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: default_checkpoint_backend(),
            directory: default_checkpoint_directory(),
            writers: default_checkpoint_writers(),
            readers: default_checkpoint_readers(),
            queue_size: default_checkpoint_queue_size(),
            interval: default_checkpoint_interval(),
        }
    }
}

impl CheckpointConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.writers == 0 || self.readers == 0 {
            return Err(ConfigError::invalid_value(
                "checkpoint.writers/readers",
                "need at least one writer and one reader",
            ));
        }
        if self.queue_size == 0 {
            return Err(ConfigError::invalid_value("checkpoint.queue_size", "must be positive"));
        }
        if self.interval.is_zero() {
            return Err(ConfigError::invalid_value("checkpoint.interval", "must be positive"));
        }
        Ok(())
    }
}

fn default_checkpoint_backend() -> String {
    "local".into()
}

fn default_checkpoint_directory() -> String {
    "/var/lib/cerebro/checkpoints".into()
}

fn default_checkpoint_writers() -> usize {
    DEFAULT_CHECKPOINT_WRITERS
}

fn default_checkpoint_readers() -> usize {
    DEFAULT_CHECKPOINT_READERS
}

fn default_checkpoint_queue_size() -> usize {
    CHECKPOINT_QUEUE_SIZE
}

fn default_checkpoint_interval() -> Duration {
    Duration::from_secs(600)
}

// ----------------------------------------------------------------------------
// Provider Configuration
// ----------------------------------------------------------------------------

/// Data sources bound to the history and realtime proxies, in priority order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub history: Vec<ProviderSourceConfig>,

    #[serde(default)]
    pub realtime: Vec<ProviderSourceConfig>,
}

impl ProvidersConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        for (role, sources) in [("history", &self.history), ("realtime", &self.realtime)] {
            for (i, source) in sources.iter().enumerate() {
                source.validate(&format!("providers.{role}[{i}]"))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// CSV file of `metric,timestamp,value,labels` rows
    File,
    /// Prometheus HTTP API
    Prometheus,
}

/// One named data source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSourceConfig {
    pub name: String,

    pub kind: ProviderKind,

    /// Path of a `file` source
    #[serde(default)]
    pub path: Option<String>,

    /// Base URL of a `prometheus` source
    #[serde(default)]
    pub url: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

impl ProviderSourceConfig {
    fn validate(&self, field: &str) -> ConfigResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid_value(format!("{field}.name"), "must not be empty"));
        }
        match self.kind {
            ProviderKind::File if self.path.is_none() => Err(ConfigError::invalid_value(
                format!("{field}.path"),
                "file sources need a path",
            )),
            ProviderKind::Prometheus if self.url.is_none() => Err(ConfigError::invalid_value(
                format!("{field}.url"),
                "prometheus sources need a url",
            )),
            _ => Ok(()),
        }
    }
}

fn default_provider_timeout() -> u64 {
    30
}

// ----------------------------------------------------------------------------
// Static Query Registrations
// ----------------------------------------------------------------------------

/// A query registered by the `run` command at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticQueryConfig {
    pub metric_name: String,

    #[serde(default)]
    pub expression: Option<String>,

    #[serde(default)]
    pub selector: BTreeMap<String, String>,

    #[serde(default = "default_caller")]
    pub caller: String,

    pub algorithm: AlgorithmType,

    /// Explicit periodic-signal spec; engine defaults when absent
    #[serde(default)]
    pub dsp: Option<DspSpec>,

    /// Explicit percentile spec; engine defaults when absent
    #[serde(default)]
    pub percentile: Option<PercentileSpec>,
}

impl StaticQueryConfig {
    pub fn to_query(&self) -> MetricQuery {
        let mut selector = Labels::new();
        for (key, value) in &self.selector {
            selector.set(key.as_str(), value.as_str());
        }
        MetricQuery {
            metric_name: self.metric_name.clone(),
            expression: self.expression.clone(),
            selector,
        }
    }

    pub fn algorithm_config(&self) -> Option<AlgorithmConfig> {
        match self.algorithm {
            AlgorithmType::Dsp => self.dsp.clone().map(AlgorithmConfig::Dsp),
            AlgorithmType::Percentile => self.percentile.clone().map(AlgorithmConfig::Percentile),
        }
    }
}

fn default_caller() -> String {
    "static".into()
}

// ----------------------------------------------------------------------------
// Raw Algorithm Specs
// ----------------------------------------------------------------------------
// Fields are strings ("1m", "0.15") exactly as a cluster resource carries
// them. `None` means "inherit from the engine default".
// ----------------------------------------------------------------------------

/// Explicit per-query configuration, tagged by algorithm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "lowercase")]
pub enum AlgorithmConfig {
    Dsp(DspSpec),
    Percentile(PercentileSpec),
}

impl AlgorithmConfig {
    pub fn algorithm(&self) -> AlgorithmType {
        match self {
            AlgorithmConfig::Dsp(_) => AlgorithmType::Dsp,
            AlgorithmConfig::Percentile(_) => AlgorithmType::Percentile,
        }
    }
}

/// Raw periodic-signal spec
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DspSpec {
    /// Resolution of the fetched history and the predicted waveform
    pub sample_interval: Option<String>,
    pub history_length: Option<String>,
    pub update_interval: Option<String>,
    pub estimators: Option<EstimatorsSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorsSpec {
    pub max_value: Vec<MaxValueEstimatorSpec>,
    pub fft: Vec<FftEstimatorSpec>,
}

impl EstimatorsSpec {
    fn is_empty(&self) -> bool {
        self.max_value.is_empty() && self.fft.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxValueEstimatorSpec {
    pub margin_fraction: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FftEstimatorSpec {
    pub margin_fraction: Option<String>,
    pub low_amplitude_threshold: Option<String>,
    /// Frequency in Hz below which components are always kept
    pub low_frequency_cutoff: Option<String>,
    pub min_num_of_spectrum_items: Option<usize>,
    pub max_num_of_spectrum_items: Option<usize>,
}

/// Raw percentile spec
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PercentileSpec {
    /// One label-independent histogram for the whole query
    pub aggregated: Option<bool>,
    pub sample_interval: Option<String>,
    pub history_length: Option<String>,
    pub init_from_history: Option<bool>,
    pub min_sample_weight: Option<String>,
    pub target_percentile: Option<String>,
    pub margin_fraction: Option<String>,
    pub target_utilization: Option<String>,
    pub histogram: Option<HistogramSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistogramSpec {
    pub half_life: Option<String>,
    pub max_value: Option<String>,
    /// Linear layout bucket width
    pub bucket_size: Option<String>,
    /// Exponential layout first bucket width
    pub first_bucket_size: Option<String>,
    pub bucket_size_growth_ratio: Option<String>,
    pub epsilon: Option<String>,
}

// ----------------------------------------------------------------------------
// Resolved Parameters
// ----------------------------------------------------------------------------

/// Fully resolved periodic-signal parameters
#[derive(Debug, Clone, PartialEq)]
pub struct DspParams {
    pub sample_interval: Duration,
    pub history_length: Duration,
    pub update_interval: Duration,
    pub estimators: Vec<EstimatorParams>,
}

impl Default for DspParams {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(60),
            history_length: 15 * DAY,
            update_interval: HOUR,
            estimators: vec![
                EstimatorParams::MaxValue {
                    margin_fraction: 0.15,
                },
                EstimatorParams::Fft(FftParams::default()),
            ],
        }
    }
}

impl DspParams {
    pub fn validate(&self) -> ConfigResult<()> {
        let step = self.sample_interval.as_secs();
        if step == 0 || self.sample_interval.subsec_nanos() != 0 {
            return Err(ConfigError::invalid_value(
                "sample_interval",
                "must be a whole number of seconds",
            ));
        }
        if HOUR.as_secs() % step != 0 {
            return Err(ConfigError::invalid_value(
                "sample_interval",
                format!("{step}s does not evenly divide one hour"),
            ));
        }
        if self.history_length < HOUR * MIN_CYCLES as u32 {
            return Err(ConfigError::invalid_value(
                "history_length",
                format!("must cover at least {MIN_CYCLES} hours"),
            ));
        }
        if self.update_interval.is_zero() {
            return Err(ConfigError::invalid_value("update_interval", "must be positive"));
        }
        if self.estimators.is_empty() {
            return Err(ConfigError::invalid_value("estimators", "at least one estimator is required"));
        }
        for estimator in &self.estimators {
            estimator.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EstimatorParams {
    MaxValue { margin_fraction: f64 },
    Fft(FftParams),
}

impl EstimatorParams {
    fn validate(&self) -> ConfigResult<()> {
        match self {
            EstimatorParams::MaxValue { margin_fraction } => check_non_negative("max_value.margin_fraction", *margin_fraction),
            EstimatorParams::Fft(fft) => {
                check_non_negative("fft.margin_fraction", fft.margin_fraction)?;
                check_non_negative("fft.low_amplitude_threshold", fft.low_amplitude_threshold)?;
                check_non_negative("fft.low_frequency_cutoff", fft.low_frequency_cutoff)?;
                if fft.max_items == 0 || fft.min_items > fft.max_items {
                    return Err(ConfigError::invalid_value(
                        "fft.max_num_of_spectrum_items",
                        format!("need 0 < min ({}) <= max ({})", fft.min_items, fft.max_items),
                    ));
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FftParams {
    pub margin_fraction: f64,
    pub low_amplitude_threshold: f64,
    pub low_frequency_cutoff: f64,
    pub min_items: usize,
    pub max_items: usize,
}

impl Default for FftParams {
    fn default() -> Self {
        Self {
            margin_fraction: 0.15,
            low_amplitude_threshold: 1.0,
            low_frequency_cutoff: 1.0 / DAY.as_secs_f64(),
            min_items: 3,
            max_items: 100,
        }
    }
}

/// Fully resolved percentile parameters
#[derive(Debug, Clone, PartialEq)]
pub struct PercentileParams {
    pub aggregated: bool,
    pub sample_interval: Duration,
    pub history_length: Duration,
    pub init_from_history: bool,
    pub min_sample_weight: f64,
    pub target_percentile: f64,
    pub margin_fraction: f64,
    /// Prediction is divided by this; 1.0 disables it
    pub target_utilization: f64,
    pub histogram: HistogramParams,
}

impl Default for PercentileParams {
    fn default() -> Self {
        Self {
            aggregated: false,
            sample_interval: Duration::from_secs(60),
            history_length: DAY,
            init_from_history: false,
            min_sample_weight: 1e-5,
            target_percentile: 0.99,
            margin_fraction: 0.15,
            target_utilization: 1.0,
            histogram: HistogramParams::default(),
        }
    }
}

impl PercentileParams {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.sample_interval.is_zero() {
            return Err(ConfigError::invalid_value("sample_interval", "must be positive"));
        }
        if !(self.target_percentile > 0.0 && self.target_percentile <= 1.0) {
            return Err(ConfigError::invalid_value(
                "target_percentile",
                format!("{} is outside (0, 1]", self.target_percentile),
            ));
        }
        check_non_negative("margin_fraction", self.margin_fraction)?;
        if !(self.min_sample_weight > 0.0) {
            return Err(ConfigError::invalid_value("min_sample_weight", "must be positive"));
        }
        if !(self.target_utilization > 0.0) {
            return Err(ConfigError::invalid_value("target_utilization", "must be positive"));
        }
        self.histogram.validate()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistogramParams {
    pub layout: HistogramLayout,
    pub half_life: Duration,
    /// Buckets lighter than this count as empty
    pub epsilon: f64,
}

impl Default for HistogramParams {
    fn default() -> Self {
        Self {
            layout: HistogramLayout::Linear {
                max_value: 100.0,
                bucket_size: 0.1,
            },
            half_life: DAY,
            epsilon: 1e-10,
        }
    }
}

impl HistogramParams {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.half_life < Duration::from_secs(1) {
            return Err(ConfigError::invalid_value("histogram.half_life", "must be at least 1s"));
        }
        if !(self.epsilon > 0.0) {
            return Err(ConfigError::invalid_value("histogram.epsilon", "must be positive"));
        }
        self.layout
            .validate()
            .map_err(|message| ConfigError::invalid_value("histogram", message))
    }
}

// ----------------------------------------------------------------------------
// Spec Resolution
// ----------------------------------------------------------------------------

impl DspSpec {
    /// Spec with every field spelled out, for generated config files
    pub fn documented_defaults() -> Self {
        Self {
            sample_interval: Some("1m".into()),
            history_length: Some("15d".into()),
            update_interval: Some("1h".into()),
            estimators: Some(EstimatorsSpec {
                max_value: vec![MaxValueEstimatorSpec {
                    margin_fraction: Some("0.15".into()),
                }],
                fft: vec![FftEstimatorSpec {
                    margin_fraction: Some("0.15".into()),
                    low_amplitude_threshold: Some("1.0".into()),
                    low_frequency_cutoff: Some(format!("{}", 1.0 / DAY.as_secs_f64())),
                    min_num_of_spectrum_items: Some(3),
                    max_num_of_spectrum_items: Some(100),
                }],
            }),
        }
    }

    /// Overlay this spec on `base`. Any malformed field fails the whole spec.
    pub fn resolve_over(&self, base: &DspParams) -> ConfigResult<DspParams> {
        let mut params = base.clone();

        if let Some(raw) = &self.sample_interval {
            params.sample_interval = parse_duration_field("sample_interval", raw)?;
        }
        if let Some(raw) = &self.history_length {
            params.history_length = parse_duration_field("history_length", raw)?;
        }
        if let Some(raw) = &self.update_interval {
            params.update_interval = parse_duration_field("update_interval", raw)?;
        }
        if let Some(estimators) = self.estimators.as_ref().filter(|e| !e.is_empty()) {
            params.estimators = resolve_estimators(estimators)?;
        }

        params.validate()?;
        Ok(params)
    }

    /// Resolve, falling back to `base` with a warning on any error
    pub fn resolve_or_default(&self, base: &DspParams, identifier: &str) -> DspParams {
        match self.resolve_over(base) {
            Ok(params) => params,
            Err(e) => {
                warn!(
                    target: "cerebro::config",
                    query = %identifier,
                    error = %e,
                    "Invalid dsp spec, using defaults"
                );
                base.clone()
            }
        }
    }
}

fn resolve_estimators(spec: &EstimatorsSpec) -> ConfigResult<Vec<EstimatorParams>> {
    let mut estimators = Vec::with_capacity(spec.max_value.len() + spec.fft.len());
    let defaults = FftParams::default();

    for max_value in &spec.max_value {
        let margin_fraction = match &max_value.margin_fraction {
            Some(raw) => parse_number_field("max_value.margin_fraction", raw)?,
            None => defaults.margin_fraction,
        };
        estimators.push(EstimatorParams::MaxValue { margin_fraction });
    }

    for fft in &spec.fft {
        let mut params = defaults.clone();
        if let Some(raw) = &fft.margin_fraction {
            params.margin_fraction = parse_number_field("fft.margin_fraction", raw)?;
        }
        if let Some(raw) = &fft.low_amplitude_threshold {
            params.low_amplitude_threshold = parse_number_field("fft.low_amplitude_threshold", raw)?;
        }
        if let Some(raw) = &fft.low_frequency_cutoff {
            params.low_frequency_cutoff = parse_number_field("fft.low_frequency_cutoff", raw)?;
        }
        if let Some(min) = fft.min_num_of_spectrum_items {
            params.min_items = min;
        }
        if let Some(max) = fft.max_num_of_spectrum_items {
            params.max_items = max;
        }
        estimators.push(EstimatorParams::Fft(params));
    }

    Ok(estimators)
}

impl PercentileSpec {
    /// Spec with every field spelled out, for generated config files
    pub fn documented_defaults() -> Self {
        Self {
            aggregated: Some(false),
            sample_interval: Some("1m".into()),
            history_length: Some("1d".into()),
            init_from_history: Some(false),
            min_sample_weight: Some("0.00001".into()),
            target_percentile: Some("0.99".into()),
            margin_fraction: Some("0.15".into()),
            target_utilization: Some("1.0".into()),
            histogram: Some(HistogramSpec {
                half_life: Some("24h".into()),
                max_value: Some("100".into()),
                bucket_size: Some("0.1".into()),
                first_bucket_size: None,
                bucket_size_growth_ratio: None,
                epsilon: Some("1e-10".into()),
            }),
        }
    }

    /// Overlay this spec on `base`. Any malformed field fails the whole spec.
    pub fn resolve_over(&self, base: &PercentileParams) -> ConfigResult<PercentileParams> {
        let mut params = base.clone();

        if let Some(aggregated) = self.aggregated {
            params.aggregated = aggregated;
        }
        if let Some(raw) = &self.sample_interval {
            params.sample_interval = parse_duration_field("sample_interval", raw)?;
        }
        if let Some(raw) = &self.history_length {
            params.history_length = parse_duration_field("history_length", raw)?;
        }
        if let Some(init) = self.init_from_history {
            params.init_from_history = init;
        }
        if let Some(raw) = &self.min_sample_weight {
            params.min_sample_weight = parse_number_field("min_sample_weight", raw)?;
        }
        if let Some(raw) = &self.target_percentile {
            params.target_percentile = parse_number_field("target_percentile", raw)?;
        }
        if let Some(raw) = &self.margin_fraction {
            params.margin_fraction = parse_number_field("margin_fraction", raw)?;
        }
        if let Some(raw) = &self.target_utilization {
            params.target_utilization = parse_number_field("target_utilization", raw)?;
        }
        if let Some(histogram) = &self.histogram {
            params.histogram = histogram.resolve_over(&params.histogram)?;
        }

        params.validate()?;
        Ok(params)
    }

    /// Resolve, falling back to `base` with a warning on any error
    pub fn resolve_or_default(&self, base: &PercentileParams, identifier: &str) -> PercentileParams {
        match self.resolve_over(base) {
            Ok(params) => params,
            Err(e) => {
                warn!(
                    target: "cerebro::config",
                    query = %identifier,
                    error = %e,
                    "Invalid percentile spec, using defaults"
                );
                base.clone()
            }
        }
    }
}

impl HistogramSpec {
    fn resolve_over(&self, base: &HistogramParams) -> ConfigResult<HistogramParams> {
        let mut params = base.clone();

        if let Some(raw) = &self.half_life {
            params.half_life = parse_duration_field("histogram.half_life", raw)?;
        }
        if let Some(raw) = &self.epsilon {
            params.epsilon = parse_number_field("histogram.epsilon", raw)?;
        }

        let max_value = match &self.max_value {
            Some(raw) => parse_number_field("histogram.max_value", raw)?,
            None => base.layout.max_value(),
        };

        params.layout = if self.first_bucket_size.is_some() || self.bucket_size_growth_ratio.is_some() {
            let (base_first, base_ratio) = match base.layout {
                HistogramLayout::Exponential {
                    first_bucket_size,
                    ratio,
                    ..
                } => (first_bucket_size, ratio),
                HistogramLayout::Linear { .. } => (0.01, 1.05),
            };
            let first_bucket_size = match &self.first_bucket_size {
                Some(raw) => parse_number_field("histogram.first_bucket_size", raw)?,
                None => base_first,
            };
            let ratio = match &self.bucket_size_growth_ratio {
                Some(raw) => parse_number_field("histogram.bucket_size_growth_ratio", raw)?,
                None => base_ratio,
            };
            HistogramLayout::Exponential {
                max_value,
                first_bucket_size,
                ratio,
            }
        } else {
            let bucket_size = match (&self.bucket_size, &base.layout) {
                (Some(raw), _) => parse_number_field("histogram.bucket_size", raw)?,
                (None, HistogramLayout::Linear { bucket_size, .. }) => *bucket_size,
                (None, HistogramLayout::Exponential { .. }) => 0.1,
            };
            HistogramLayout::Linear {
                max_value,
                bucket_size,
            }
        };

        Ok(params)
    }
}

// ----------------------------------------------------------------------------
// Field Parsing Helpers
// ----------------------------------------------------------------------------

fn parse_duration_field(field: &str, raw: &str) -> ConfigResult<Duration> {
    let value = humantime::parse_duration(raw.trim())
        .map_err(|e| ConfigError::invalid_value(field, format!("'{raw}': {e}")))?;
    if value.is_zero() {
        return Err(ConfigError::invalid_value(field, "must be positive"));
    }
    Ok(value)
}

fn parse_number_field(field: &str, raw: &str) -> ConfigResult<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ConfigError::invalid_value(field, format!("'{raw}' is not a finite number")))
}

fn check_non_negative(field: &str, value: f64) -> ConfigResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid_value(field, format!("{value} must be >= 0")))
    }
}

// ----------------------------------------------------------------------------
// Config Registry
// ----------------------------------------------------------------------------

/// A change to an explicit per-query configuration
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigEvent {
    /// New explicit config for a query
    Update {
        identifier: String,
        config: AlgorithmConfig,
    },
    /// Explicit config removed; the query falls back to defaults
    Delete {
        algorithm: AlgorithmType,
        identifier: String,
    },
}

impl ConfigEvent {
    pub fn algorithm(&self) -> AlgorithmType {
        match self {
            ConfigEvent::Update { config, .. } => config.algorithm(),
            ConfigEvent::Delete { algorithm, .. } => *algorithm,
        }
    }

    pub fn identifier(&self) -> &str {
        match self {
            ConfigEvent::Update { identifier, .. } | ConfigEvent::Delete { identifier, .. } => identifier,
        }
    }
}

/// Explicit per-query algorithm configs, keyed by (algorithm, query key).
/// Changes made through `update` and `delete` are broadcast to listeners.
pub struct ConfigRegistry {
    explicit: RwLock<HashMap<(AlgorithmType, String), AlgorithmConfig>>,
    events: Broadcaster<ConfigEvent>,
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self {
            explicit: RwLock::new(HashMap::new()),
            events: Broadcaster::new(),
        }
    }

    /// Record the config a query was registered with, without notifying
    pub fn store(&self, identifier: &str, config: AlgorithmConfig) {
        let key = (config.algorithm(), identifier.to_string());
        self.explicit.write().insert(key, config);
    }

    pub fn get(&self, algorithm: AlgorithmType, identifier: &str) -> Option<AlgorithmConfig> {
        self.explicit
            .read()
            .get(&(algorithm, identifier.to_string()))
            .cloned()
    }

    /// Drop a config without notifying (the query itself is gone)
    pub fn forget(&self, algorithm: AlgorithmType, identifier: &str) -> Option<AlgorithmConfig> {
        self.explicit.write().remove(&(algorithm, identifier.to_string()))
    }

    /// Replace a query's config and notify listeners. Returns the number of
    /// listeners the event reached.
    pub fn update(&self, identifier: &str, config: AlgorithmConfig) -> usize {
        let mut explicit = self.explicit.write();
        let key = (config.algorithm(), identifier.to_string());
        if explicit.get(&key) == Some(&config) {
            debug!(target: "cerebro::config", query = %identifier, "Config unchanged");
            return 0;
        }
        explicit.insert(key, config.clone());
        self.events.write(ConfigEvent::Update {
            identifier: identifier.to_string(),
            config,
        })
    }

    /// Remove a query's config and notify listeners if it existed
    pub fn delete(&self, algorithm: AlgorithmType, identifier: &str) -> bool {
        let mut explicit = self.explicit.write();
        if explicit.remove(&(algorithm, identifier.to_string())).is_none() {
            return false;
        }
        self.events.write(ConfigEvent::Delete {
            algorithm,
            identifier: identifier.to_string(),
        });
        true
    }

    /// Subscribe to future config changes
    pub fn listen(&self) -> Listener<ConfigEvent> {
        self.events.listen()
    }

    pub fn len(&self) -> usize {
        self.explicit.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConfigRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigRegistry")
            .field("explicit", &self.len())
            .field("listeners", &self.events.listener_count())
            .finish()
    }
}
