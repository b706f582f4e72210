// ============================================================================
// SECTION: PERCENTILE PREDICTION
// ============================================================================
// Forecasts a series as a high percentile of its recent values. Every
// registered query gets one sampling task that, once per sample interval,
// pulls the latest value of each series and adds it to that series'
// decaying histogram. The prediction is a single scalar:
//
//     percentile(target) * (1 + margin) / target_utilization
//
// Histograms survive restarts through the checkpoint store: restored on
// first sight of a series, saved periodically and once more on stop.
// ============================================================================

pub mod histogram;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::histogram::DecayingHistogram;
use crate::checkpoint::{CheckpointRecord, Checkpointer};
use crate::concurrent::ShardedMap;
use crate::config::{AlgorithmConfig, ConfigRegistry, PercentileParams};
use crate::error::{DataError, DataResult, PredictorResult};
use crate::metrics::PredictorMetrics;
use crate::prediction::{
    cancellable, check_window, dispatch, DebugSnapshot, GenericPrediction, Prediction, QueryWorker, SeriesSnapshot,
};
use crate::provider::ProviderRole;
use crate::types::{signal_key, AlgorithmType, Labels, LabelsExt, MetricQuery, Sample, TimeSeries, Timestamp};
use crate::CHECKPOINT_VERSION;

// ----------------------------------------------------------------------------
// Histogram Signal
// ----------------------------------------------------------------------------

/// Decaying histogram of one series (or of every series of an aggregated
/// query) plus sampling bookkeeping
#[derive(Debug, Clone)]
pub struct HistogramSignal {
    pub labels: Labels,
    pub histogram: DecayingHistogram,
    pub first_sample_time: Option<Timestamp>,
    pub last_sample_time: Option<Timestamp>,
    pub total_samples_count: u64,
    pub sample_interval: Duration,
    /// Newest sample taken from each source series
    source_last_seen: HashMap<String, Timestamp>,
    /// Last sample covered by a restored checkpoint
    restored_until: Option<Timestamp>,
}

impl HistogramSignal {
    pub fn new(labels: Labels, params: &PercentileParams) -> Self {
        Self {
            labels,
            histogram: DecayingHistogram::new(
                params.histogram.layout,
                params.histogram.half_life,
                params.histogram.epsilon,
            ),
            first_sample_time: None,
            last_sample_time: None,
            total_samples_count: 0,
            sample_interval: params.sample_interval,
            source_last_seen: HashMap::new(),
            restored_until: None,
        }
    }

    /// Rebuild a signal from its checkpoint
    pub fn from_record(record: &CheckpointRecord, params: &PercentileParams) -> DataResult<Self> {
        if record.version != CHECKPOINT_VERSION {
            return Err(DataError::InvalidCheckpoint {
                message: format!("unsupported version '{}'", record.version),
            });
        }
        let mut signal = Self::new(record.labels.clone(), params);
        signal.histogram.load_checkpoint(&record.histogram)?;
        signal.first_sample_time = record.first_sample_start;
        signal.last_sample_time = record.last_sample_start;
        signal.total_samples_count = record.total_samples_count;
        signal.restored_until = record.last_sample_start;
        Ok(signal)
    }

    pub fn to_record(&self, identifier: &str) -> CheckpointRecord {
        CheckpointRecord {
            metric_identifier: identifier.to_string(),
            labels: self.labels.clone(),
            histogram: self.histogram.save_checkpoint(),
            first_sample_start: self.first_sample_time,
            last_sample_start: self.last_sample_time,
            sample_interval: self.sample_interval,
            total_samples_count: self.total_samples_count,
            version: CHECKPOINT_VERSION.to_string(),
            last_update_time: Timestamp::now(),
        }
    }

    /// Add a sample from `source`. Samples not newer than the last one taken
    /// from the same source, or covered by a restored checkpoint, are
    /// skipped. Returns true if the sample was added.
    pub fn add_sample(&mut self, source: &str, sample: Sample, min_weight: f64) -> bool {
        if !sample.value.is_finite() {
            return false;
        }
        let floor = self.source_last_seen.get(source).copied().or(self.restored_until);
        if floor.map_or(false, |last| sample.timestamp <= last) {
            return false;
        }

        self.histogram
            .add_sample(sample.value, min_weight.max(sample.value), sample.timestamp);
        self.source_last_seen.insert(source.to_string(), sample.timestamp);
        self.total_samples_count += 1;
        if self.first_sample_time.map_or(true, |first| sample.timestamp < first) {
            self.first_sample_time = Some(sample.timestamp);
        }
        if self.last_sample_time.map_or(true, |last| sample.timestamp > last) {
            self.last_sample_time = Some(sample.timestamp);
        }
        true
    }

    /// Start over with an empty histogram shaped by `params`
    pub fn rebuild(&mut self, params: &PercentileParams) {
        *self = Self::new(std::mem::take(&mut self.labels), params);
    }

    /// Predicted value, or `None` while the histogram is empty
    pub fn estimate(&self, params: &PercentileParams) -> Option<f64> {
        if self.histogram.is_empty() {
            return None;
        }
        let value = self.histogram.percentile(params.target_percentile) * (1.0 + params.margin_fraction);
        Some(value / params.target_utilization)
    }

    fn snapshot(&self, params: &PercentileParams) -> SeriesSnapshot {
        SeriesSnapshot::Histogram {
            labels: self.labels.clone(),
            total_weight: self.histogram.total_weight(),
            total_samples: self.total_samples_count,
            first_sample_time: self.first_sample_time,
            last_sample_time: self.last_sample_time,
            reference_time: self.histogram.reference_time(),
            percentile: params.target_percentile,
            estimate: self.estimate(params).unwrap_or(0.0),
        }
    }
}

type SharedSignal = Arc<Mutex<HistogramSignal>>;

// ----------------------------------------------------------------------------
// Worker
// ----------------------------------------------------------------------------

struct PercentileInner {
    base: GenericPrediction,
    defaults: PercentileParams,
    signals: ShardedMap<String, SharedSignal>,
    /// Query key to the signal keys produced for it
    index: DashMap<String, HashSet<String>>,
    /// Params each running query task was started with
    running: DashMap<String, PercentileParams>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    checkpoint_interval: Duration,
}

impl PercentileInner {
    fn params(&self, key: &str) -> PercentileParams {
        match self.base.config().get(AlgorithmType::Percentile, key) {
            Some(AlgorithmConfig::Percentile(spec)) => spec.resolve_or_default(&self.defaults, key),
            _ => self.defaults.clone(),
        }
    }

    fn signals_of(&self, key: &str) -> Vec<SharedSignal> {
        let signal_keys: Vec<String> = match self.index.get(key) {
            Some(keys) => keys.iter().cloned().collect(),
            None => return Vec::new(),
        };
        let mut signals: Vec<(Labels, SharedSignal)> = signal_keys
            .iter()
            .filter_map(|k| self.signals.load(k))
            .map(|signal| {
                let labels = signal.lock().labels.clone();
                (labels, signal)
            })
            .collect();
        signals.sort_by(|a, b| a.0.cmp(&b.0));
        signals.into_iter().map(|(_, signal)| signal).collect()
    }

    /// The signal stored under `signal_key`, created on first sight from its
    /// checkpoint or empty
    async fn signal_for(
        &self,
        query_key: &str,
        signal_key: &str,
        labels: &Labels,
        params: &PercentileParams,
        ctx: &CancellationToken,
    ) -> SharedSignal {
        if let Some(signal) = self.signals.load(signal_key) {
            return signal;
        }

        let restored = self.restore(signal_key, params, ctx).await;
        let fresh = restored.unwrap_or_else(|| HistogramSignal::new(labels.clone(), params));
        let signal = self
            .signals
            .load_or_store_with(signal_key.to_string(), || Arc::new(Mutex::new(fresh)));
        self.index
            .entry(query_key.to_string())
            .or_default()
            .insert(signal_key.to_string());
        signal
    }

    async fn restore(&self, signal_key: &str, params: &PercentileParams, ctx: &CancellationToken) -> Option<HistogramSignal> {
        let checkpointer = self.checkpointer.as_ref()?;
        match checkpointer.load_metric_model_checkpoint(ctx, signal_key).await {
            Ok(Some(record)) => match HistogramSignal::from_record(&record, params) {
                Ok(signal) => {
                    info!(
                        target: "cerebro::percentile",
                        signal = %signal_key,
                        samples = signal.total_samples_count,
                        "Histogram restored from checkpoint"
                    );
                    Some(signal)
                }
                Err(e) => {
                    warn!(target: "cerebro::percentile", signal = %signal_key, error = %e, "Ignoring checkpoint");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(target: "cerebro::percentile", signal = %signal_key, error = %e, "Checkpoint load failed");
                None
            }
        }
    }

    /// Feed a batch of series into their histograms. Returns samples added.
    async fn ingest(
        &self,
        key: &str,
        series: Vec<TimeSeries>,
        params: &PercentileParams,
        ctx: &CancellationToken,
    ) -> usize {
        let mut added = 0;
        for s in series {
            let target_labels = if params.aggregated { Labels::new() } else { s.labels.clone() };
            let signal_key = signal_key(key, &target_labels);
            let signal = self.signal_for(key, &signal_key, &target_labels, params, ctx).await;

            let source = s.labels.canonical();
            let mut signal = signal.lock();
            for sample in &s.samples {
                if signal.add_sample(&source, *sample, params.min_sample_weight) {
                    added += 1;
                }
            }
        }
        added
    }

    async fn warm_up(&self, query: &MetricQuery, key: &str, params: &PercentileParams, ctx: &CancellationToken) {
        let provider = match self.base.provider(ProviderRole::History) {
            Ok(provider) => provider,
            Err(e) => {
                warn!(target: "cerebro::percentile", query = %key, error = %e, "Skipping warm-up");
                return;
            }
        };
        let end = Timestamp::now();
        let start = end.sub_duration(params.history_length);
        match provider.query_time_series(query, start, end, params.sample_interval).await {
            Ok(series) => {
                let added = self.ingest(key, series, params, ctx).await;
                info!(target: "cerebro::percentile", query = %key, added, "Warmed up from history");
            }
            Err(e) => warn!(target: "cerebro::percentile", query = %key, error = %e, "Warm-up fetch failed"),
        }
    }

    async fn sample(&self, query: &MetricQuery, key: &str, params: &PercentileParams, ctx: &CancellationToken) {
        let provider = match self.base.provider(ProviderRole::Realtime) {
            Ok(provider) => provider,
            Err(e) => {
                warn!(target: "cerebro::percentile", query = %key, error = %e, "No realtime provider");
                return;
            }
        };
        let series = match provider.query_latest_time_series(query).await {
            Ok(series) => series,
            Err(e) => {
                warn!(target: "cerebro::percentile", query = %key, error = %e, "Latest sample fetch failed");
                return;
            }
        };
        if series.is_empty() {
            self.base.metrics().series_skipped(AlgorithmType::Percentile, "empty");
        }

        let added = self.ingest(key, series, params, ctx).await;
        if added > 0 {
            self.base.registry().mark_ready(key);
        }
        self.base.metrics().refresh_completed(AlgorithmType::Percentile);
        debug!(target: "cerebro::percentile", query = %key, added, "Sampled");
    }

    async fn sample_loop(self: Arc<Self>, query: MetricQuery, params: PercentileParams, stop: CancellationToken) {
        let key = query.unique_key();
        if params.init_from_history && cancellable(&stop, self.warm_up(&query, &key, &params, &stop)).await.is_none() {
            return;
        }

        let mut ticker = tokio::time::interval(params.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if cancellable(&stop, ticker.tick()).await.is_none() {
                break;
            }
            if cancellable(&stop, self.sample(&query, &key, &params, &stop)).await.is_none() {
                break;
            }
        }
        debug!(target: "cerebro::percentile", query = %key, "Sample loop exited");
    }

    fn records(&self) -> Vec<CheckpointRecord> {
        let mut records = Vec::with_capacity(self.signals.len());
        self.signals.range(|signal_key, signal| {
            records.push(signal.lock().to_record(signal_key));
            true
        });
        records
    }

    async fn checkpoint_loop(self: Arc<Self>, stop: CancellationToken) {
        let Some(checkpointer) = self.checkpointer.clone() else {
            return;
        };
        let mut ticker = tokio::time::interval(self.checkpoint_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately
        ticker.tick().await;

        loop {
            if cancellable(&stop, ticker.tick()).await.is_none() {
                break;
            }
            let records = self.records();
            let count = records.len();
            for record in records {
                if let Err(e) = checkpointer.async_store_metric_model_checkpoint(&stop, record, None).await {
                    if e.is_cancelled() {
                        return;
                    }
                    warn!(target: "cerebro::percentile", error = %e, "Checkpoint enqueue failed");
                }
            }
            debug!(target: "cerebro::percentile", signals = count, "Checkpoints queued");
        }
    }

    /// Synchronously persist every signal, then flush the store
    async fn checkpoint_all(&self) {
        let Some(checkpointer) = &self.checkpointer else {
            return;
        };
        let ctx = CancellationToken::new();
        let mut stored = 0usize;
        for record in self.records() {
            let identifier = record.metric_identifier.clone();
            match checkpointer.store_metric_model_checkpoint(&ctx, record).await {
                Ok(()) => stored += 1,
                Err(e) => warn!(target: "cerebro::percentile", signal = %identifier, error = %e, "Final checkpoint failed"),
            }
        }
        checkpointer.flush().await;
        info!(target: "cerebro::percentile", stored, "Final checkpoints written");
    }

    /// Remove the signals indexed under a query key
    fn drop_signals(&self, key: &str) -> usize {
        let Some((_, signal_keys)) = self.index.remove(key) else {
            return 0;
        };
        signal_keys
            .iter()
            .filter(|signal_key| self.signals.delete(*signal_key).is_some())
            .count()
    }

    /// Make stored histograms match new params. A change of aggregation
    /// changes the signal keys, so those are dropped instead.
    fn apply_params(&self, key: &str, previous: &PercentileParams, params: &PercentileParams) -> usize {
        if previous.aggregated != params.aggregated {
            return self.drop_signals(key);
        }
        if previous.histogram == params.histogram && previous.sample_interval == params.sample_interval {
            return 0;
        }
        let signals = self.signals_of(key);
        for signal in &signals {
            signal.lock().rebuild(params);
        }
        signals.len()
    }
}

#[async_trait]
impl QueryWorker for PercentileInner {
    fn base(&self) -> &GenericPrediction {
        &self.base
    }

    async fn start_query(self: Arc<Self>, query: MetricQuery, stop: &CancellationToken) {
        let key = query.unique_key();
        let params = self.params(&key);
        info!(
            target: "cerebro::percentile",
            query = %key,
            sample_interval = ?params.sample_interval,
            aggregated = params.aggregated,
            "Starting query"
        );
        self.running.insert(key.clone(), params.clone());
        let worker = Arc::clone(&self);
        self.base
            .spawn_query_task(&key, stop, move |token| worker.sample_loop(query, params, token))
            .await;
    }

    async fn stop_query(&self, query: &MetricQuery) {
        let key = query.unique_key();
        self.base.stop_query_task(&key).await;
        self.running.remove(&key);
        let dropped = self.drop_signals(&key);
        info!(target: "cerebro::percentile", query = %key, dropped, "Query stopped");
    }

    async fn reload_query(self: Arc<Self>, query: MetricQuery, stop: &CancellationToken) {
        let key = query.unique_key();
        self.base.stop_query_task(&key).await;
        let params = self.params(&key);
        if let Some((_, previous)) = self.running.remove(&key) {
            let reset = self.apply_params(&key, &previous, &params);
            if reset > 0 {
                info!(target: "cerebro::percentile", query = %key, reset, "Histograms reset for new config");
            }
        }
        self.start_query(query, stop).await;
    }
}

// ----------------------------------------------------------------------------
// Public Algorithm
// ----------------------------------------------------------------------------

/// Percentile-of-recent-history forecasting over decaying histograms
pub struct PercentilePrediction {
    inner: Arc<PercentileInner>,
}

impl PercentilePrediction {
    pub fn new(
        config: Arc<ConfigRegistry>,
        defaults: PercentileParams,
        metrics: Arc<PredictorMetrics>,
        checkpointer: Option<Arc<dyn Checkpointer>>,
        checkpoint_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PercentileInner {
                base: GenericPrediction::new(AlgorithmType::Percentile, config, metrics),
                defaults,
                signals: ShardedMap::new(),
                index: DashMap::new(),
                running: DashMap::new(),
                checkpointer,
                checkpoint_interval,
            }),
        }
    }

    /// Number of histograms currently held
    pub fn signal_count(&self) -> usize {
        self.inner.signals.len()
    }
}

#[async_trait]
impl Prediction for PercentilePrediction {
    fn name(&self) -> &'static str {
        "percentile"
    }

    fn base(&self) -> &GenericPrediction {
        &self.inner.base
    }

    async fn run(&self, stop: CancellationToken) {
        let checkpoint_stop = stop.child_token();
        let checkpoint_task = self
            .inner
            .checkpointer
            .is_some()
            .then(|| tokio::spawn(Arc::clone(&self.inner).checkpoint_loop(checkpoint_stop.clone())));

        let ran = dispatch(Arc::clone(&self.inner), stop).await;

        checkpoint_stop.cancel();
        if let Some(task) = checkpoint_task {
            let _ = task.await;
        }
        if ran {
            self.inner.checkpoint_all().await;
        }
    }

    async fn query_realtime_predicted_values(&self, query: &MetricQuery) -> PredictorResult<Vec<TimeSeries>> {
        let key = self.inner.base.registered_key(query)?;
        let params = self.inner.params(&key);
        let now = Timestamp::now();
        Ok(self
            .inner
            .signals_of(&key)
            .iter()
            .filter_map(|signal| {
                let signal = signal.lock();
                signal
                    .estimate(&params)
                    .map(|value| TimeSeries::with_samples(signal.labels.clone(), vec![Sample::new(value, now)]))
            })
            .collect())
    }

    async fn query_predicted_time_series(
        &self,
        query: &MetricQuery,
        start: Timestamp,
        end: Timestamp,
    ) -> PredictorResult<Vec<TimeSeries>> {
        check_window(start, end)?;
        let key = self.inner.base.registered_key(query)?;
        let params = self.inner.params(&key);
        let step = params.sample_interval.as_secs().max(1) as usize;

        Ok(self
            .inner
            .signals_of(&key)
            .iter()
            .filter_map(|signal| {
                let signal = signal.lock();
                let value = signal.estimate(&params)?;
                let samples = (start.as_secs()..end.as_secs())
                    .step_by(step)
                    .map(|t| Sample::new(value, Timestamp::from_secs(t)))
                    .collect();
                Some(TimeSeries::with_samples(signal.labels.clone(), samples))
            })
            .collect())
    }

    fn debug_snapshot(&self, query: &MetricQuery) -> Option<DebugSnapshot> {
        let key = query.unique_key();
        if !self.inner.base.registry().is_registered(&key) {
            return None;
        }
        let params = self.inner.params(&key);
        Some(DebugSnapshot {
            algorithm: AlgorithmType::Percentile,
            status: self.inner.base.registry().status(&key),
            series: self
                .inner
                .signals_of(&key)
                .iter()
                .map(|signal| signal.lock().snapshot(&params))
                .collect(),
            query: key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels;
    use crate::percentile::histogram::HistogramLayout;

    fn params() -> PercentileParams {
        let mut params = PercentileParams::default();
        params.histogram.layout = HistogramLayout::Linear {
            max_value: 10.0,
            bucket_size: 1.0,
        };
        params.min_sample_weight = 1.0;
        params
    }

    fn at(value: f64, secs: i64) -> Sample {
        Sample::new(value, Timestamp::from_secs(19_676 * 86_400 + secs))
    }

    #[test]
    fn test_skips_samples_not_newer_than_last() {
        let mut signal = HistogramSignal::new(labels!["pod" => "a"], &params());
        assert!(signal.add_sample("pod=a", at(2.0, 60), 1.0));
        assert!(!signal.add_sample("pod=a", at(3.0, 60), 1.0));
        assert!(!signal.add_sample("pod=a", at(3.0, 0), 1.0));
        assert!(signal.add_sample("pod=b", at(3.0, 60), 1.0));
        assert_eq!(signal.total_samples_count, 2);
        assert_eq!(signal.first_sample_time, Some(at(0.0, 60).timestamp));
    }

    #[test]
    fn test_estimate_applies_margin_and_utilization() {
        let mut params = params();
        params.target_percentile = 1.0;
        params.margin_fraction = 0.5;
        params.target_utilization = 0.5;

        let mut signal = HistogramSignal::new(Labels::new(), &params);
        assert_eq!(signal.estimate(&params), None);
        for (i, value) in [1.5, 2.5, 3.5].iter().enumerate() {
            signal.add_sample("", at(*value, i as i64 * 60), params.min_sample_weight);
        }
        // p100 is the start of the bucket after 3.x
        assert_eq!(signal.estimate(&params), Some(4.0 * 1.5 / 0.5));
    }

    #[test]
    fn test_checkpoint_round_trip_keeps_skip_floor() {
        let params = params();
        let mut signal = HistogramSignal::new(labels!["pod" => "a"], &params);
        for i in 0..10 {
            signal.add_sample("pod=a", at((i % 5) as f64, i * 60), params.min_sample_weight);
        }
        let record = signal.to_record("cpu|pod=a");
        assert_eq!(record.version, CHECKPOINT_VERSION);

        let mut restored = HistogramSignal::from_record(&record, &params).unwrap();
        assert_eq!(restored.labels, signal.labels);
        assert_eq!(restored.total_samples_count, 10);
        assert_eq!(restored.estimate(&params), signal.estimate(&params));
        assert!(!restored.add_sample("pod=a", at(1.0, 9 * 60), params.min_sample_weight));
        assert!(restored.add_sample("pod=a", at(1.0, 10 * 60), params.min_sample_weight));

        let mut stale = record;
        stale.version = "v0".into();
        assert!(HistogramSignal::from_record(&stale, &params).is_err());
    }

    fn prediction(params: PercentileParams) -> PercentilePrediction {
        PercentilePrediction::new(
            Arc::new(ConfigRegistry::new()),
            params,
            Arc::new(PredictorMetrics::new().unwrap()),
            None,
            Duration::from_secs(60),
        )
    }

    fn pod_series(value: f64, secs: i64) -> Vec<TimeSeries> {
        vec![TimeSeries::with_samples(labels!["pod" => "x"], vec![at(value, secs)])]
    }

    #[tokio::test]
    async fn test_drop_leaves_overlapping_selector_alone() {
        let params = params();
        let prediction = prediction(params.clone());
        let inner = &prediction.inner;
        let ctx = CancellationToken::new();
        let narrow = MetricQuery::new("m").with_selector("pod", "a").unique_key();
        let wide = MetricQuery::new("m").with_selector("pod", "a|b").unique_key();
        assert!(wide.starts_with(&format!("{narrow}|")));

        inner.ingest(&narrow, pod_series(2.0, 0), &params, &ctx).await;
        inner.ingest(&wide, pod_series(3.0, 0), &params, &ctx).await;
        assert_eq!(prediction.signal_count(), 2);

        assert_eq!(inner.drop_signals(&narrow), 1);
        assert_eq!(prediction.signal_count(), 1);
        assert!(inner.signals_of(&narrow).is_empty());
        assert_eq!(inner.signals_of(&wide).len(), 1);
        assert_eq!(inner.drop_signals(&narrow), 0);
    }

    #[tokio::test]
    async fn test_new_layout_resets_histograms() {
        let before = params();
        let prediction = prediction(before.clone());
        let inner = &prediction.inner;
        let key = MetricQuery::new("m").unique_key();
        inner
            .ingest(&key, pod_series(3.5, 0), &before, &CancellationToken::new())
            .await;

        let mut margin_only = before.clone();
        margin_only.margin_fraction = 0.5;
        assert_eq!(inner.apply_params(&key, &before, &margin_only), 0);
        assert_eq!(inner.signals_of(&key)[0].lock().total_samples_count, 1);

        let mut after = before.clone();
        after.histogram.layout = HistogramLayout::Linear {
            max_value: 10.0,
            bucket_size: 2.0,
        };
        assert_eq!(inner.apply_params(&key, &before, &after), 1);
        let signal = inner.signals_of(&key)[0].clone();
        {
            let mut signal = signal.lock();
            assert_eq!(signal.total_samples_count, 0);
            assert_eq!(signal.labels, labels!["pod" => "x"]);
            assert_eq!(*signal.histogram.layout(), after.histogram.layout);
            // the same sample is accepted again under the new layout
            assert!(signal.add_sample("pod=x", at(3.5, 0), after.min_sample_weight));
        }

        let mut aggregated = after.clone();
        aggregated.aggregated = true;
        assert_eq!(inner.apply_params(&key, &after, &aggregated), 1);
        assert_eq!(prediction.signal_count(), 0);
    }
}
