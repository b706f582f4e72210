// ============================================================================
// SECTION: PREDICTION CONTRACT
// ============================================================================
// The interface every forecasting algorithm exposes to the manager and its
// callers, plus the machinery the algorithms share:
// - `GenericPrediction`: registry, provider bindings, per-query task table
// - `QueryWorker` + `dispatch`: the event loop turning registry and config
//   events into per-query background tasks
// ============================================================================

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AlgorithmConfig, ConfigRegistry};
use crate::error::{PredictorResult, ProviderError, QueryError};
use crate::metrics::PredictorMetrics;
use crate::provider::{DataProvider, ProviderBindings, ProviderRole};
use crate::registry::{QueryEvent, QueryRegistry};
use crate::types::{AlgorithmType, Labels, MetricQuery, QueryStatus, TimeSeries, Timestamp};
use crate::QUERY_EVENT_QUEUE_SIZE;

// ----------------------------------------------------------------------------
// Prediction Trait
// ----------------------------------------------------------------------------

/// A forecasting algorithm.
#[async_trait]
pub trait Prediction: Send + Sync {
    /// Human-readable algorithm name
    fn name(&self) -> &'static str;

    /// Shared registry/provider/task state
    fn base(&self) -> &GenericPrediction;

    /// Process registry and config events until `stop` is cancelled, then
    /// stop every query task.
    async fn run(&self, stop: CancellationToken);

    /// Predicted value of every series of `query` at the current instant
    async fn query_realtime_predicted_values(&self, query: &MetricQuery) -> PredictorResult<Vec<TimeSeries>>;

    /// Predicted samples of every series of `query` in `[start, end)`
    async fn query_predicted_time_series(
        &self,
        query: &MetricQuery,
        start: Timestamp,
        end: Timestamp,
    ) -> PredictorResult<Vec<TimeSeries>>;

    /// Internal state of a query for troubleshooting
    fn debug_snapshot(&self, query: &MetricQuery) -> Option<DebugSnapshot>;

    fn algorithm(&self) -> AlgorithmType {
        self.base().algorithm()
    }

    fn with_providers(&self, providers: ProviderBindings) {
        self.base().set_providers(providers);
    }

    async fn with_query(
        &self,
        query: &MetricQuery,
        caller: &str,
        config: Option<AlgorithmConfig>,
    ) -> PredictorResult<()> {
        self.base().registry().with_query(query, caller, config).await
    }

    async fn delete_query(&self, query: &MetricQuery, caller: &str) -> PredictorResult<()> {
        self.base().registry().delete_query(query, caller).await
    }

    fn query_status(&self, query: &MetricQuery) -> QueryStatus {
        self.base().registry().status(&query.unique_key())
    }
}

// ----------------------------------------------------------------------------
// Debug Snapshots
// ----------------------------------------------------------------------------

/// Troubleshooting view of one query
#[derive(Debug, Clone, Serialize)]
pub struct DebugSnapshot {
    pub algorithm: AlgorithmType,
    pub query: String,
    pub status: QueryStatus,
    pub series: Vec<SeriesSnapshot>,
}

/// Troubleshooting view of one stored signal
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SeriesSnapshot {
    Waveform {
        labels: Labels,
        cycle_secs: u64,
        step_secs: i64,
        start_time: Timestamp,
        end_time: Timestamp,
        last_update_time: Timestamp,
        estimator: String,
        backtest_error: f64,
        min: f64,
        max: f64,
    },
    Histogram {
        labels: Labels,
        total_weight: f64,
        total_samples: u64,
        first_sample_time: Option<Timestamp>,
        last_sample_time: Option<Timestamp>,
        reference_time: Timestamp,
        percentile: f64,
        estimate: f64,
    },
}

// ----------------------------------------------------------------------------
// Generic Prediction Base
// ----------------------------------------------------------------------------

struct QueryTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// State shared by every algorithm: its query registry, provider bindings
/// and the table of per-query background tasks.
pub struct GenericPrediction {
    algorithm: AlgorithmType,
    registry: QueryRegistry,
    events: Mutex<Option<flume::Receiver<QueryEvent>>>,
    providers: RwLock<ProviderBindings>,
    config: Arc<ConfigRegistry>,
    metrics: Arc<PredictorMetrics>,
    tasks: DashMap<String, QueryTask>,
}

impl GenericPrediction {
    pub fn new(algorithm: AlgorithmType, config: Arc<ConfigRegistry>, metrics: Arc<PredictorMetrics>) -> Self {
        let (registry, events) = QueryRegistry::new(
            algorithm,
            Arc::clone(&config),
            Arc::clone(&metrics),
            QUERY_EVENT_QUEUE_SIZE,
        );
        Self {
            algorithm,
            registry,
            events: Mutex::new(Some(events)),
            providers: RwLock::new(ProviderBindings::new()),
            config,
            metrics,
            tasks: DashMap::new(),
        }
    }

    pub fn algorithm(&self) -> AlgorithmType {
        self.algorithm
    }

    pub fn registry(&self) -> &QueryRegistry {
        &self.registry
    }

    pub fn config(&self) -> &Arc<ConfigRegistry> {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<PredictorMetrics> {
        &self.metrics
    }

    pub fn set_providers(&self, providers: ProviderBindings) {
        let roles: Vec<_> = providers.keys().map(|r| r.as_str()).collect();
        debug!(target: "cerebro::manager", algorithm = %self.algorithm, roles = ?roles, "Providers bound");
        *self.providers.write() = providers;
    }

    pub fn provider(&self, role: ProviderRole) -> Result<Arc<dyn DataProvider>, ProviderError> {
        self.providers
            .read()
            .get(&role)
            .cloned()
            .ok_or_else(|| ProviderError::NotConfigured {
                role: role.to_string(),
            })
    }

    /// The event receiver; only the first caller gets it
    fn take_events(&self) -> Option<flume::Receiver<QueryEvent>> {
        self.events.lock().take()
    }

    /// Key of a live query, or `NotRegistered`
    pub fn registered_key(&self, query: &MetricQuery) -> PredictorResult<String> {
        let key = query.unique_key();
        if self.registry.is_registered(&key) {
            Ok(key)
        } else {
            Err(QueryError::NotRegistered { identifier: key }.into())
        }
    }

    /// Spawn the background task of a query under a child of `parent`.
    /// A task already running for the key is stopped first.
    pub async fn spawn_query_task<F, Fut>(&self, key: &str, parent: &CancellationToken, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop_query_task(key).await;

        let token = parent.child_token();
        let handle = tokio::spawn(task(token.clone()));
        self.tasks.insert(key.to_string(), QueryTask { token, handle });
        debug!(target: "cerebro::manager", algorithm = %self.algorithm, query = %key, "Query task started");
    }

    /// Cancel a query's task and wait for it to exit. Returns false if no
    /// task was running.
    pub async fn stop_query_task(&self, key: &str) -> bool {
        let Some((_, task)) = self.tasks.remove(key) else {
            return false;
        };
        task.token.cancel();
        if let Err(e) = task.handle.await {
            if e.is_panic() {
                error!(target: "cerebro::manager", query = %key, error = %e, "Query task panicked");
            }
        }
        debug!(target: "cerebro::manager", algorithm = %self.algorithm, query = %key, "Query task stopped");
        true
    }

    pub async fn stop_all_tasks(&self) {
        let keys: Vec<String> = self.tasks.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            self.stop_query_task(&key).await;
        }
    }

    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }
}

impl std::fmt::Debug for GenericPrediction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericPrediction")
            .field("algorithm", &self.algorithm)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

/// Run `fut` unless `token` is cancelled first
pub async fn cancellable<F: Future>(token: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        out = fut => Some(out),
    }
}

/// Reject empty or inverted windows
pub fn check_window(start: Timestamp, end: Timestamp) -> PredictorResult<()> {
    if start >= end {
        return Err(QueryError::InvalidTimeRange {
            start: start.as_secs(),
            end: end.as_secs(),
        }
        .into());
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Event Dispatch
// ----------------------------------------------------------------------------

/// Algorithm-specific reaction to query lifecycle events
#[async_trait]
pub trait QueryWorker: Send + Sync + 'static {
    fn base(&self) -> &GenericPrediction;

    /// (Re)start the background task of a query
    async fn start_query(self: Arc<Self>, query: MetricQuery, stop: &CancellationToken);

    /// Stop a query's task and drop its stored signals
    async fn stop_query(&self, query: &MetricQuery);

    /// Apply a changed config to a live query
    async fn reload_query(self: Arc<Self>, query: MetricQuery, stop: &CancellationToken) {
        self.start_query(query, stop).await;
    }
}

/// Drive a worker from its registry and config events until `stop`.
/// Returns false without doing anything if the worker already ran.
pub async fn dispatch<W: QueryWorker>(worker: Arc<W>, stop: CancellationToken) -> bool {
    let algorithm = worker.base().algorithm();
    let Some(events) = worker.base().take_events() else {
        warn!(target: "cerebro::manager", algorithm = %algorithm, "Algorithm is already running");
        return false;
    };
    let config_events = worker.base().config().listen();

    info!(target: "cerebro::manager", algorithm = %algorithm, "Algorithm started");

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            event = events.recv_async() => match event {
                Ok(QueryEvent::Added { query }) => {
                    Arc::clone(&worker).start_query(query, &stop).await;
                }
                Ok(QueryEvent::Deleted { query }) => {
                    worker.stop_query(&query).await;
                }
                Err(_) => break,
            },
            Some(event) = config_events.recv() => {
                if event.algorithm() != algorithm {
                    continue;
                }
                if let Some(query) = worker.base().registry().query(event.identifier()) {
                    info!(
                        target: "cerebro::manager",
                        algorithm = %algorithm,
                        query = %event.identifier(),
                        "Config changed, restarting query"
                    );
                    Arc::clone(&worker).reload_query(query, &stop).await;
                }
            }
        }
    }

    worker.base().stop_all_tasks().await;
    info!(target: "cerebro::manager", algorithm = %algorithm, "Algorithm stopped");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn base() -> GenericPrediction {
        GenericPrediction::new(
            AlgorithmType::Dsp,
            Arc::new(ConfigRegistry::new()),
            Arc::new(PredictorMetrics::new().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_respawn_stops_previous_task() {
        let base = base();
        let stop = CancellationToken::new();
        let exits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let exits = Arc::clone(&exits);
            base.spawn_query_task("cpu", &stop, |token| async move {
                token.cancelled().await;
                exits.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }
        assert_eq!(base.running_tasks(), 1);
        assert_eq!(exits.load(Ordering::SeqCst), 2);

        stop.cancel();
        base.stop_all_tasks().await;
        assert_eq!(exits.load(Ordering::SeqCst), 3);
        assert_eq!(base.running_tasks(), 0);
    }

    #[tokio::test]
    async fn test_cancellable_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let out = cancellable(&token, tokio::time::sleep(Duration::from_secs(60))).await;
        assert!(out.is_none());

        let live = CancellationToken::new();
        assert_eq!(cancellable(&live, async { 7 }).await, Some(7));
    }

    /// Records the keys it is asked to start
    struct Recorder {
        base: GenericPrediction,
        starts: Mutex<Vec<String>>,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl QueryWorker for Recorder {
        fn base(&self) -> &GenericPrediction {
            &self.base
        }

        async fn start_query(self: Arc<Self>, query: MetricQuery, _stop: &CancellationToken) {
            self.starts.lock().push(query.unique_key());
        }

        async fn stop_query(&self, _query: &MetricQuery) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "condition never held");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_config_change_restarts_only_live_queries() {
        use crate::config::{DspSpec, PercentileSpec};

        let config = Arc::new(ConfigRegistry::new());
        let worker = Arc::new(Recorder {
            base: GenericPrediction::new(
                AlgorithmType::Dsp,
                Arc::clone(&config),
                Arc::new(PredictorMetrics::new().unwrap()),
            ),
            starts: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        });
        let stop = CancellationToken::new();
        let running = tokio::spawn(dispatch(Arc::clone(&worker), stop.clone()));

        let query = MetricQuery::new("cpu");
        worker.base.registry().with_query(&query, "hpa", None).await.unwrap();
        wait_for(|| worker.starts.lock().len() == 1).await;

        let spec = AlgorithmConfig::Dsp(DspSpec {
            update_interval: Some("5m".into()),
            ..Default::default()
        });
        config.update("mem", spec.clone());
        config.update("cpu", AlgorithmConfig::Percentile(PercentileSpec::default()));
        config.update("cpu", spec);
        wait_for(|| worker.starts.lock().len() == 2).await;
        assert_eq!(*worker.starts.lock(), vec!["cpu".to_string(), "cpu".to_string()]);

        worker.base.registry().delete_query(&query, "hpa").await.unwrap();
        wait_for(|| worker.stops.load(Ordering::SeqCst) == 1).await;

        stop.cancel();
        assert!(running.await.unwrap());
        assert_eq!(worker.starts.lock().len(), 2);
    }

    #[test]
    fn test_missing_provider_and_window() {
        let base = base();
        assert!(matches!(
            base.provider(ProviderRole::History),
            Err(ProviderError::NotConfigured { .. })
        ));
        assert!(check_window(Timestamp::from_secs(10), Timestamp::from_secs(10)).is_err());
        assert!(check_window(Timestamp::from_secs(10), Timestamp::from_secs(11)).is_ok());
        assert!(base.registered_key(&MetricQuery::new("cpu")).is_err());
    }
}
