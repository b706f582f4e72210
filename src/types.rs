// ============================================================================
// SECTION: CORE TYPE SYSTEM
// ============================================================================
// The value types flowing between providers, the registry and the algorithms:
// - Second-resolution timestamps on the prediction grid
// - Label sets that identify a single series of a query
// - Metric queries and the keys derived from them
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use xxhash_rust::xxh3::xxh3_128;

// ----------------------------------------------------------------------------
// Timestamp - Unix Seconds
// ----------------------------------------------------------------------------

/// Timestamp in whole seconds since Unix epoch.
/// Prediction grids never go below one-second resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs)
    }

    /// Current wall clock time, truncated to the second
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_secs() as i64)
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0
    }

    /// Duration between two timestamps, zero if `earlier` is later
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_secs(self.0.saturating_sub(earlier.0).max(0) as u64)
    }

    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_secs() as i64))
    }

    #[inline]
    pub fn sub_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_secs() as i64))
    }

    /// Round down to a multiple of `step_secs`
    #[inline]
    pub fn floor_to(&self, step_secs: i64) -> Self {
        if step_secs <= 0 {
            return *self;
        }
        Self(self.0.div_euclid(step_secs) * step_secs)
    }

    /// Convert to chrono DateTime<Utc>
    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.0, 0).unwrap_or_default()
    }

    #[inline]
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp())
    }

    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%dT%H:%M:%SZ"))
    }
}

impl From<i64> for Timestamp {
    #[inline]
    fn from(secs: i64) -> Self {
        Self(secs)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt)
    }
}

// ----------------------------------------------------------------------------
// Samples & Series
// ----------------------------------------------------------------------------

/// A single observed or predicted value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub value: f64,
    pub timestamp: Timestamp,
}

impl Sample {
    #[inline]
    pub fn new(value: f64, timestamp: Timestamp) -> Self {
        Self { value, timestamp }
    }
}

/// One series of a query: its labels plus time-ordered samples
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub labels: Labels,
    pub samples: Vec<Sample>,
}

impl TimeSeries {
    pub fn new(labels: Labels) -> Self {
        Self {
            labels,
            samples: Vec::new(),
        }
    }

    pub fn with_samples(labels: Labels, samples: Vec<Sample>) -> Self {
        Self { labels, samples }
    }

    #[inline]
    pub fn last_sample(&self) -> Option<&Sample> {
        self.samples.last()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Labels - Key-Value Dimensional Data
// ----------------------------------------------------------------------------

/// A single label (key-value pair) of a series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    pub key: CompactString,
    pub value: CompactString,
}

impl Label {
    #[inline]
    pub fn new<K, V>(key: K, value: V) -> Self
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Display for Label {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

impl<K, V> From<(K, V)> for Label
where
    K: Into<CompactString>,
    V: Into<CompactString>,
{
    fn from((key, value): (K, V)) -> Self {
        Self::new(key, value)
    }
}

/// A set of labels with stack allocation for small sets.
pub type Labels = SmallVec<[Label; 8]>;

/// Extension trait for Labels
pub trait LabelsExt {
    /// Get a label value by key
    fn get(&self, key: &str) -> Option<&str>;

    /// Add or update a label
    fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<CompactString>,
        V: Into<CompactString>;

    /// Canonical `k=v,k2=v2` rendering with keys sorted
    fn canonical(&self) -> String;

    /// True if every selector label is present with the same value
    fn matches(&self, selector: &Labels) -> bool;
}

impl LabelsExt for Labels {
    fn get(&self, key: &str) -> Option<&str> {
        self.iter()
            .find(|l| l.key.as_str() == key)
            .map(|l| l.value.as_str())
    }

    fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        let key = key.into();
        let value = value.into();

        if let Some(label) = self.iter_mut().find(|l| l.key == key) {
            label.value = value;
        } else {
            self.push(Label { key, value });
        }
    }

    fn canonical(&self) -> String {
        let mut sorted: SmallVec<[&Label; 8]> = self.iter().collect();
        sorted.sort();
        sorted
            .iter()
            .map(|l| l.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn matches(&self, selector: &Labels) -> bool {
        selector
            .iter()
            .all(|wanted| self.get(&wanted.key) == Some(wanted.value.as_str()))
    }
}

/// Create a Labels collection from key-value pairs
#[macro_export]
macro_rules! labels {
    () => {
        $crate::types::Labels::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {
        $crate::types::Labels::from_vec(vec![
            $($crate::types::Label::new($key, $value)),+
        ])
    };
}

// ----------------------------------------------------------------------------
// Metric Queries
// ----------------------------------------------------------------------------

/// A forecasting query: what metric, optionally an explicit provider
/// expression, and an optional label selector narrowing the series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricQuery {
    pub metric_name: String,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub selector: Labels,
}

impl MetricQuery {
    pub fn new(metric_name: impl Into<String>) -> Self {
        Self {
            metric_name: metric_name.into(),
            expression: None,
            selector: Labels::new(),
        }
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    pub fn with_selector<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        self.selector.set(key, value);
        self
    }

    /// Stable identifier of the query. Two queries with the same metric,
    /// expression and selector (in any label order) share a key.
    pub fn unique_key(&self) -> String {
        let mut key = self.metric_name.clone();
        if let Some(expression) = &self.expression {
            key.push_str("#expr=");
            key.push_str(expression);
        }
        if !self.selector.is_empty() {
            key.push_str("#sel=");
            key.push_str(&self.selector.canonical());
        }
        key
    }

    /// Key of a single series of this query
    pub fn signal_key(&self, labels: &Labels) -> String {
        signal_key(&self.unique_key(), labels)
    }
}

impl Display for MetricQuery {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.unique_key())
    }
}

/// Signal key from an already computed query key
pub fn signal_key(query_key: &str, labels: &Labels) -> String {
    format!("{}|{}", query_key, labels.canonical())
}

/// Hex-encoded 128-bit content hash, used to name persisted records
pub fn content_hash(key: &str) -> String {
    format!("{:032x}", xxh3_128(key.as_bytes()))
}

// ----------------------------------------------------------------------------
// Query Status & Algorithm Type
// ----------------------------------------------------------------------------

/// Lifecycle of a registered query as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    /// Never registered with this algorithm
    Unknown,
    /// Registered, first prediction not computed yet
    NotStarted,
    /// At least one prediction computed
    Ready,
    /// Removed by its last caller
    Deleted,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Unknown => "unknown",
            QueryStatus::NotStarted => "not_started",
            QueryStatus::Ready => "ready",
            QueryStatus::Deleted => "deleted",
        }
    }
}

impl Display for QueryStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported prediction algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmType {
    Dsp,
    Percentile,
}

impl AlgorithmType {
    pub const ALL: [AlgorithmType; 2] = [AlgorithmType::Dsp, AlgorithmType::Percentile];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmType::Dsp => "dsp",
            AlgorithmType::Percentile => "percentile",
        }
    }
}

impl Display for AlgorithmType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlgorithmType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dsp" => Ok(AlgorithmType::Dsp),
            "percentile" => Ok(AlgorithmType::Percentile),
            other => Err(format!("unknown algorithm '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_timestamp_grid() {
        let ts = Timestamp::from_secs(3_725);
        assert_eq!(ts.floor_to(60), Timestamp::from_secs(3_720));
        assert_eq!(Timestamp::from_secs(-30).floor_to(60), Timestamp::from_secs(-60));
        assert_eq!(ts.add_duration(Duration::from_secs(75)).as_secs(), 3_800);
        assert_eq!(ts.duration_since(Timestamp::from_secs(4_000)), Duration::ZERO);
        assert_eq!(Timestamp::EPOCH.to_string(), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_unique_key_ignores_selector_order() {
        let a = MetricQuery::new("cpu_usage")
            .with_selector("namespace", "prod")
            .with_selector("app", "web");
        let b = MetricQuery::new("cpu_usage")
            .with_selector("app", "web")
            .with_selector("namespace", "prod");
        assert_eq!(a.unique_key(), b.unique_key());
        assert_eq!(a.unique_key(), "cpu_usage#sel=app=web,namespace=prod");
        assert_ne!(a.unique_key(), MetricQuery::new("cpu_usage").unique_key());
    }

    #[test]
    fn test_signal_key_and_selector_match() {
        let query = MetricQuery::new("mem").with_expression("sum(mem)");
        let labels = labels!["pod" => "b", "container" => "a"];
        assert_eq!(query.signal_key(&labels), "mem#expr=sum(mem)|container=a,pod=b");

        let selector = labels!["pod" => "b"];
        assert!(labels.matches(&selector));
        assert!(!labels.matches(&labels!["pod" => "c"]));
        assert!(labels.matches(&Labels::new()));
    }

    #[test]
    fn test_content_hash_is_stable_hex() {
        let hash = content_hash("cpu_usage|pod=a");
        assert_eq!(hash.len(), 32);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, content_hash("cpu_usage|pod=a"));
        assert_ne!(hash, content_hash("cpu_usage|pod=b"));
    }

    #[test]
    fn test_algorithm_type_parse() {
        assert_eq!("DSP".parse::<AlgorithmType>(), Ok(AlgorithmType::Dsp));
        assert!("arima".parse::<AlgorithmType>().is_err());
    }
}
