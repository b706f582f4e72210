// ============================================================================
// SECTION: DSP PREDICTION
// ============================================================================
// Forecasts periodic series. Every registered query gets one background task
// that, once per update interval:
// - fetches the query's history from the history provider
// - cleans each series and finds its cycle (hour, day or week)
// - backtests the configured estimators on the last cycle
// - stores one predicted cycle per series, replacing the previous one
//
// Readers wrap the stored cycle forward in time to cover any window.
// ============================================================================

pub mod estimator;
pub mod fft;
pub mod scoring;
pub mod signal;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::estimator::{build_estimators, select_best};
use self::signal::{preprocess, Signal};
use crate::concurrent::ShardedMap;
use crate::config::{AlgorithmConfig, ConfigRegistry, DspParams};
use crate::error::{DataError, DataResult, PredictorResult};
use crate::logging::PerfTimer;
use crate::metrics::PredictorMetrics;
use crate::prediction::{
    cancellable, check_window, dispatch, DebugSnapshot, GenericPrediction, Prediction, QueryWorker, SeriesSnapshot,
};
use crate::provider::ProviderRole;
use crate::types::{signal_key, AlgorithmType, Labels, MetricQuery, Sample, TimeSeries, Timestamp};
use crate::{CYCLE_CANDIDATES, HISTORY_FETCH_SLACK, HOUR};

// ----------------------------------------------------------------------------
// Predicted Waveform
// ----------------------------------------------------------------------------

/// One predicted cycle of a series. Sample `i` belongs to
/// `start_time + i * step`, and the cycle repeats indefinitely in both
/// directions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictedWaveform {
    pub labels: Labels,
    pub values: Vec<f64>,
    pub step_secs: i64,
    #[serde(with = "humantime_serde")]
    pub cycle: Duration,
    /// One step after the last observed sample
    pub start_time: Timestamp,
    pub last_update_time: Timestamp,
    pub estimator: String,
    pub backtest_error: f64,
}

impl PredictedWaveform {
    /// End of the first predicted cycle
    pub fn end_time(&self) -> Timestamp {
        Timestamp::from_secs(self.start_time.as_secs() + self.values.len() as i64 * self.step_secs)
    }

    /// Predicted value at grid point `at`, wrapping by whole cycles
    pub fn value_at(&self, at: Timestamp) -> Option<f64> {
        if self.values.is_empty() || self.step_secs <= 0 {
            return None;
        }
        let steps = (at.as_secs() - self.start_time.as_secs()).div_euclid(self.step_secs);
        let index = steps.rem_euclid(self.values.len() as i64) as usize;
        Some(self.values[index])
    }

    /// Predicted samples on the waveform's grid within `[start, end)`
    pub fn sample_window(&self, start: Timestamp, end: Timestamp) -> Vec<Sample> {
        if self.values.is_empty() || self.step_secs <= 0 || start >= end {
            return Vec::new();
        }
        let offset = (start.as_secs() - self.start_time.as_secs()).rem_euclid(self.step_secs);
        let first = if offset == 0 {
            start.as_secs()
        } else {
            start.as_secs() + self.step_secs - offset
        };

        (first..end.as_secs())
            .step_by(self.step_secs as usize)
            .filter_map(|t| {
                let at = Timestamp::from_secs(t);
                self.value_at(at).map(|v| Sample::new(v, at))
            })
            .collect()
    }

    /// Predicted sample for the grid point containing `now`
    pub fn realtime_sample(&self, now: Timestamp) -> Option<Sample> {
        if self.step_secs <= 0 {
            return None;
        }
        let offset = (now.as_secs() - self.start_time.as_secs()).rem_euclid(self.step_secs);
        let at = Timestamp::from_secs(now.as_secs() - offset);
        self.value_at(at).map(|v| Sample::new(v, at))
    }

    fn snapshot(&self) -> SeriesSnapshot {
        let signal = Signal::new(self.values.clone(), 1.0);
        SeriesSnapshot::Waveform {
            labels: self.labels.clone(),
            cycle_secs: self.cycle.as_secs(),
            step_secs: self.step_secs,
            start_time: self.start_time,
            end_time: self.end_time(),
            last_update_time: self.last_update_time,
            estimator: self.estimator.clone(),
            backtest_error: self.backtest_error,
            min: signal.min(),
            max: signal.max(),
        }
    }
}

/// Full analysis of one history series: clean, detect cycle, backtest,
/// predict. CPU bound.
pub fn analyze_series(series: &TimeSeries, params: &DspParams, now: Timestamp) -> DataResult<PredictedWaveform> {
    let step = params.sample_interval;
    let samples = preprocess(&series.samples, step, HOUR)?;
    let last_time = samples.last().map(|s| s.timestamp).ok_or(DataError::EmptySeries)?;

    let signal = Signal::from_step(samples.iter().map(|s| s.value).collect(), step);
    let cycle = signal.find_cycle(&CYCLE_CANDIDATES).ok_or(DataError::NotPeriodic)?;

    let estimators = build_estimators(&params.estimators);
    let selection = select_best(&signal, cycle, &estimators).ok_or(DataError::NoEstimator)?;
    let predicted = estimators[selection.index].estimate(&signal, cycle);
    if predicted.is_empty() {
        return Err(DataError::NoEstimator);
    }

    Ok(PredictedWaveform {
        labels: series.labels.clone(),
        values: predicted.samples,
        step_secs: step.as_secs() as i64,
        cycle,
        start_time: last_time.add_duration(step),
        last_update_time: now,
        estimator: selection.name,
        backtest_error: selection.error,
    })
}

// ----------------------------------------------------------------------------
// Worker
// ----------------------------------------------------------------------------

struct DspInner {
    base: GenericPrediction,
    defaults: DspParams,
    signals: ShardedMap<String, Arc<PredictedWaveform>>,
    /// Query key to the signal keys produced for it
    index: DashMap<String, HashSet<String>>,
}

impl DspInner {
    fn params(&self, key: &str) -> DspParams {
        match self.base.config().get(AlgorithmType::Dsp, key) {
            Some(AlgorithmConfig::Dsp(spec)) => spec.resolve_or_default(&self.defaults, key),
            _ => self.defaults.clone(),
        }
    }

    fn waveforms(&self, key: &str) -> Vec<Arc<PredictedWaveform>> {
        let signal_keys: Vec<String> = match self.index.get(key) {
            Some(keys) => keys.iter().cloned().collect(),
            None => return Vec::new(),
        };
        let mut waveforms: Vec<_> = signal_keys.iter().filter_map(|k| self.signals.load(k)).collect();
        waveforms.sort_by(|a, b| a.labels.cmp(&b.labels));
        waveforms
    }

    async fn refresh_loop(self: Arc<Self>, query: MetricQuery, params: DspParams, stop: CancellationToken) {
        let key = query.unique_key();
        let mut ticker = tokio::time::interval(params.update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if cancellable(&stop, ticker.tick()).await.is_none() {
                break;
            }
            if cancellable(&stop, self.refresh(&query, &key, &params)).await.is_none() {
                break;
            }
        }
        debug!(target: "cerebro::dsp", query = %key, "Refresh loop exited");
    }

    async fn refresh(&self, query: &MetricQuery, key: &str, params: &DspParams) {
        let timer = PerfTimer::with_threshold("dsp_refresh", 30_000);

        let provider = match self.base.provider(ProviderRole::History) {
            Ok(provider) => provider,
            Err(e) => {
                warn!(target: "cerebro::dsp", query = %key, error = %e, "No history provider");
                return;
            }
        };
        let end = Timestamp::now();
        let start = end.sub_duration(params.history_length + HISTORY_FETCH_SLACK);
        let series = match provider.query_time_series(query, start, end, params.sample_interval).await {
            Ok(series) => series,
            Err(e) => {
                warn!(target: "cerebro::dsp", query = %key, error = %e, "History fetch failed");
                return;
            }
        };
        let fetched = series.len();

        let analysis_params = params.clone();
        let analyzed = tokio::task::spawn_blocking(move || {
            series
                .iter()
                .map(|s| (s.labels.clone(), analyze_series(s, &analysis_params, end)))
                .collect::<Vec<_>>()
        })
        .await;
        let analyzed = match analyzed {
            Ok(analyzed) => analyzed,
            Err(e) => {
                error!(target: "cerebro::dsp", query = %key, error = %e, "Analysis task failed");
                return;
            }
        };

        let mut stored = 0usize;
        let mut seen = HashSet::with_capacity(analyzed.len());
        for (labels, result) in analyzed {
            let signal_key = signal_key(key, &labels);
            seen.insert(signal_key.clone());
            match result {
                Ok(waveform) => {
                    debug!(
                        target: "cerebro::dsp",
                        signal = %signal_key,
                        cycle = ?waveform.cycle,
                        estimator = %waveform.estimator,
                        error = waveform.backtest_error,
                        "Waveform updated"
                    );
                    self.signals.store(signal_key.clone(), Arc::new(waveform));
                    self.index.entry(key.to_string()).or_default().insert(signal_key);
                    stored += 1;
                }
                Err(e) => {
                    warn!(target: "cerebro::dsp", signal = %signal_key, error = %e, "Series skipped");
                    self.base.metrics().series_skipped(AlgorithmType::Dsp, e.reason());
                }
            }
        }

        let pruned = self.prune_signals(key, &seen);
        if self.index.get(key).map_or(false, |keys| !keys.is_empty()) {
            self.base.registry().mark_ready(key);
        }
        self.base.metrics().refresh_completed(AlgorithmType::Dsp);
        info!(
            target: "cerebro::dsp",
            query = %key,
            fetched,
            stored,
            pruned,
            elapsed_ms = timer.stop(),
            "Refresh completed"
        );
    }

    /// Drop waveforms of series missing from the latest fetch
    fn prune_signals(&self, key: &str, seen: &HashSet<String>) -> usize {
        let stale: Vec<String> = match self.index.get_mut(key) {
            Some(mut signal_keys) => {
                let stale = signal_keys.iter().filter(|k| !seen.contains(*k)).cloned().collect();
                signal_keys.retain(|k| seen.contains(k));
                stale
            }
            None => return 0,
        };
        for signal_key in &stale {
            debug!(target: "cerebro::dsp", signal = %signal_key, "Series gone from history");
            self.signals.delete(signal_key);
        }
        stale.len()
    }

    /// Remove the waveforms indexed under a query key
    fn drop_signals(&self, key: &str) -> usize {
        let Some((_, signal_keys)) = self.index.remove(key) else {
            return 0;
        };
        signal_keys
            .iter()
            .filter(|signal_key| self.signals.delete(*signal_key).is_some())
            .count()
    }
}

#[async_trait]
impl QueryWorker for DspInner {
    fn base(&self) -> &GenericPrediction {
        &self.base
    }

    async fn start_query(self: Arc<Self>, query: MetricQuery, stop: &CancellationToken) {
        let key = query.unique_key();
        let params = self.params(&key);
        info!(
            target: "cerebro::dsp",
            query = %key,
            update_interval = ?params.update_interval,
            history_length = ?params.history_length,
            "Starting query"
        );
        let worker = Arc::clone(&self);
        self.base
            .spawn_query_task(&key, stop, move |token| worker.refresh_loop(query, params, token))
            .await;
    }

    async fn stop_query(&self, query: &MetricQuery) {
        let key = query.unique_key();
        self.base.stop_query_task(&key).await;
        let dropped = self.drop_signals(&key);
        info!(target: "cerebro::dsp", query = %key, dropped, "Query stopped");
    }
}

// ----------------------------------------------------------------------------
// Public Algorithm
// ----------------------------------------------------------------------------

/// Periodic-signal forecasting via spectral analysis and backtested
/// estimator selection
pub struct DspPrediction {
    inner: Arc<DspInner>,
}

impl DspPrediction {
    pub fn new(config: Arc<ConfigRegistry>, defaults: DspParams, metrics: Arc<PredictorMetrics>) -> Self {
        Self {
            inner: Arc::new(DspInner {
                base: GenericPrediction::new(AlgorithmType::Dsp, config, metrics),
                defaults,
                signals: ShardedMap::new(),
                index: DashMap::new(),
            }),
        }
    }

    /// Stored waveforms of a query, ordered by labels
    pub fn waveforms(&self, query: &MetricQuery) -> Vec<Arc<PredictedWaveform>> {
        self.inner.waveforms(&query.unique_key())
    }
}

#[async_trait]
impl Prediction for DspPrediction {
    fn name(&self) -> &'static str {
        "dsp"
    }

    fn base(&self) -> &GenericPrediction {
        &self.inner.base
    }

    async fn run(&self, stop: CancellationToken) {
        dispatch(Arc::clone(&self.inner), stop).await;
    }

    async fn query_realtime_predicted_values(&self, query: &MetricQuery) -> PredictorResult<Vec<TimeSeries>> {
        let key = self.inner.base.registered_key(query)?;
        let now = Timestamp::now();
        Ok(self
            .inner
            .waveforms(&key)
            .iter()
            .filter_map(|w| {
                w.realtime_sample(now)
                    .map(|sample| TimeSeries::with_samples(w.labels.clone(), vec![sample]))
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
        Ok(self
            .inner
            .waveforms(&key)
            .iter()
            .map(|w| TimeSeries::with_samples(w.labels.clone(), w.sample_window(start, end)))
            .filter(|series| !series.is_empty())
            .collect())
    }

    fn debug_snapshot(&self, query: &MetricQuery) -> Option<DebugSnapshot> {
        let key = query.unique_key();
        if !self.inner.base.registry().is_registered(&key) {
            return None;
        }
        Some(DebugSnapshot {
            algorithm: AlgorithmType::Dsp,
            status: self.inner.base.registry().status(&key),
            series: self.inner.waveforms(&key).iter().map(|w| w.snapshot()).collect(),
            query: key,
        })
    }
}
