// ============================================================================
// SECTION: PREDICTOR MANAGER
// ============================================================================
// Owns everything a running predictor needs and wires it together:
// - the config registry shared by both algorithms
// - history and realtime provider proxies bound into each algorithm
// - the DSP and percentile algorithms and their dispatch tasks
// - the optional checkpoint store
//
// Shutdown order: stop the algorithms (percentile writes its final
// checkpoints), then stop and flush the checkpoint store.
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::{new_checkpointer, CheckpointManager, Checkpointer};
use crate::config::{ConfigRegistry, EngineConfig, ProvidersConfig, StaticQueryConfig};
use crate::dsp::DspPrediction;
use crate::error::{PartialPredictionError, PredictorResult};
use crate::metrics::PredictorMetrics;
use crate::percentile::PercentilePrediction;
use crate::prediction::Prediction;
use crate::provider::{DataProvider, DataProviderProxy, ProviderBindings, ProviderRole};
use crate::types::{AlgorithmType, MetricQuery, TimeSeries, Timestamp};

/// One query of a batch prediction request
#[derive(Debug, Clone)]
pub struct PredictionRequest {
    pub algorithm: AlgorithmType,
    pub query: MetricQuery,
}

impl PredictionRequest {
    pub fn new(algorithm: AlgorithmType, query: MetricQuery) -> Self {
        Self { algorithm, query }
    }
}

/// Predicted series of one successful request
#[derive(Debug, Clone, Serialize)]
pub struct PredictionOutput {
    pub query_key: String,
    pub algorithm: AlgorithmType,
    pub series: Vec<TimeSeries>,
}

pub struct PredictorManager {
    config: Arc<ConfigRegistry>,
    history: Arc<DataProviderProxy>,
    realtime: Arc<DataProviderProxy>,
    dsp: Arc<DspPrediction>,
    percentile: Arc<PercentilePrediction>,
    checkpointer: Option<Arc<CheckpointManager>>,
    metrics: Arc<PredictorMetrics>,
    stop: CancellationToken,
    checkpoint_stop: CancellationToken,
    handles: TokioMutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: Duration,
    started: AtomicBool,
}

impl PredictorManager {
    /// Build a manager from configuration. Providers listed in the config
    /// are installed; more can be added through `history()`/`realtime()`.
    pub fn new(config: &EngineConfig) -> PredictorResult<Self> {
        config.validate()?;

        let metrics = Arc::new(PredictorMetrics::new()?);
        let registry = Arc::new(ConfigRegistry::new());
        let checkpointer = if config.checkpoint.enabled {
            Some(new_checkpointer(&config.checkpoint, Some(Arc::clone(&metrics)))?)
        } else {
            None
        };

        let dsp = Arc::new(DspPrediction::new(
            Arc::clone(&registry),
            config.dsp_defaults()?,
            Arc::clone(&metrics),
        ));
        let percentile = Arc::new(PercentilePrediction::new(
            Arc::clone(&registry),
            config.percentile_defaults()?,
            Arc::clone(&metrics),
            checkpointer.clone().map(|c| c as Arc<dyn Checkpointer>),
            config.checkpoint.interval,
        ));

        let history = Arc::new(DataProviderProxy::new(ProviderRole::History));
        let realtime = Arc::new(DataProviderProxy::new(ProviderRole::Realtime));
        let mut bindings = ProviderBindings::new();
        bindings.insert(ProviderRole::History, Arc::clone(&history) as Arc<dyn DataProvider>);
        bindings.insert(ProviderRole::Realtime, Arc::clone(&realtime) as Arc<dyn DataProvider>);
        dsp.with_providers(bindings.clone());
        percentile.with_providers(bindings);

        let manager = Self {
            config: registry,
            history,
            realtime,
            dsp,
            percentile,
            checkpointer,
            metrics,
            stop: CancellationToken::new(),
            checkpoint_stop: CancellationToken::new(),
            handles: TokioMutex::new(Vec::new()),
            shutdown_timeout: Duration::from_secs(config.engine.shutdown_timeout_secs),
            started: AtomicBool::new(false),
        };
        manager.install_providers(&config.providers)?;
        Ok(manager)
    }

    /// Add every configured source to the proxies
    pub fn install_providers(&self, providers: &ProvidersConfig) -> PredictorResult<()> {
        self.history.install(&providers.history)?;
        self.realtime.install(&providers.realtime)?;
        Ok(())
    }

    pub fn history(&self) -> &Arc<DataProviderProxy> {
        &self.history
    }

    pub fn realtime(&self) -> &Arc<DataProviderProxy> {
        &self.realtime
    }

    pub fn config_registry(&self) -> &Arc<ConfigRegistry> {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<PredictorMetrics> {
        &self.metrics
    }

    pub fn dsp(&self) -> &Arc<DspPrediction> {
        &self.dsp
    }

    pub fn percentile(&self) -> &Arc<PercentilePrediction> {
        &self.percentile
    }

    pub fn predictor(&self, algorithm: AlgorithmType) -> Arc<dyn Prediction> {
        match algorithm {
            AlgorithmType::Dsp => Arc::clone(&self.dsp) as Arc<dyn Prediction>,
            AlgorithmType::Percentile => Arc::clone(&self.percentile) as Arc<dyn Prediction>,
        }
    }

    /// Start the checkpoint store and both algorithms. Returns immediately.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!(target: "cerebro::manager", "Predictor manager already started");
            return;
        }
        if let Some(checkpointer) = &self.checkpointer {
            checkpointer.start(self.checkpoint_stop.clone()).await;
        }

        let mut handles = self.handles.lock().await;
        for algorithm in AlgorithmType::ALL {
            let predictor = self.predictor(algorithm);
            let stop = self.stop.clone();
            handles.push(tokio::spawn(async move { predictor.run(stop).await }));
        }
        info!(
            target: "cerebro::manager",
            history_sources = ?self.history.source_names(),
            realtime_sources = ?self.realtime.source_names(),
            checkpoints = self.checkpointer.is_some(),
            "Predictor manager started"
        );
    }

    /// Stop the algorithms, waiting up to the shutdown timeout, then flush
    /// the checkpoint store
    pub async fn stop(&self) {
        self.stop.cancel();

        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        let joined = tokio::time::timeout(self.shutdown_timeout, futures::future::join_all(handles)).await;
        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(target: "cerebro::manager", error = %e, "Algorithm task failed");
                    }
                }
            }
            Err(_) => warn!(
                target: "cerebro::manager",
                timeout = ?self.shutdown_timeout,
                "Algorithms did not stop in time"
            ),
        }

        self.checkpoint_stop.cancel();
        if let Some(checkpointer) = &self.checkpointer {
            checkpointer.flush().await;
        }
        info!(target: "cerebro::manager", "Predictor manager stopped");
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Register every statically configured query
    pub async fn register_static_queries(&self, queries: &[StaticQueryConfig]) -> PredictorResult<usize> {
        for query in queries {
            self.predictor(query.algorithm)
                .with_query(&query.to_query(), &query.caller, query.algorithm_config())
                .await?;
        }
        Ok(queries.len())
    }

    /// Predict several queries over `[start, end)`. Failures do not abort
    /// the batch: successful outputs are returned together with an error
    /// listing the failed queries.
    pub async fn predict_many(
        &self,
        requests: &[PredictionRequest],
        start: Timestamp,
        end: Timestamp,
    ) -> (Vec<PredictionOutput>, Option<PartialPredictionError>) {
        let predictions = requests.iter().map(|request| async move {
            let predictor = self.predictor(request.algorithm);
            let result = predictor.query_predicted_time_series(&request.query, start, end).await;
            (request, result)
        });

        let mut outputs = Vec::with_capacity(requests.len());
        let mut failures = PartialPredictionError::default();
        for (request, result) in futures::future::join_all(predictions).await {
            let query_key = request.query.unique_key();
            match result {
                Ok(series) => outputs.push(PredictionOutput {
                    query_key,
                    algorithm: request.algorithm,
                    series,
                }),
                Err(e) => failures.push(query_key, &e),
            }
        }
        failures.succeeded = outputs.len();

        if failures.is_empty() {
            (outputs, None)
        } else {
            warn!(target: "cerebro::manager", error = %failures, "Partial prediction");
            (outputs, Some(failures))
        }
    }
}

impl std::fmt::Debug for PredictorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictorManager")
            .field("history", &self.history.source_names())
            .field("realtime", &self.realtime.source_names())
            .field("checkpointer", &self.checkpointer)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PredictorError, QueryError};

    #[tokio::test]
    async fn test_predict_many_reports_partial_failures() {
        let manager = PredictorManager::new(&EngineConfig::default()).unwrap();
        let registered = MetricQuery::new("cpu");
        manager
            .predictor(AlgorithmType::Percentile)
            .with_query(&registered, "test", None)
            .await
            .unwrap();

        let requests = vec![
            PredictionRequest::new(AlgorithmType::Percentile, registered.clone()),
            PredictionRequest::new(AlgorithmType::Dsp, MetricQuery::new("unknown")),
        ];
        let (outputs, failures) = manager
            .predict_many(&requests, Timestamp::from_secs(0), Timestamp::from_secs(600))
            .await;

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].query_key, registered.unique_key());
        assert!(outputs[0].series.is_empty());

        let failures = failures.unwrap();
        assert_eq!(failures.succeeded, 1);
        assert_eq!(failures.failures.len(), 1);
        assert_eq!(failures.failures[0].0, "unknown");
        let expected = PredictorError::from(QueryError::NotRegistered {
            identifier: "unknown".into(),
        });
        assert_eq!(failures.failures[0].1, expected.to_string());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let manager = PredictorManager::new(&EngineConfig::default()).unwrap();
        manager.start().await;
        manager.start().await;
        manager.stop().await;
        assert!(manager.is_stopping());
        assert_eq!(manager.dsp().base().running_tasks(), 0);
    }
}
