// ============================================================================
// SECTION: QUERY REGISTRY
// ============================================================================
// Tracks which callers hold which metric queries for one algorithm.
// - A query is live while at least one caller holds it
// - The first caller emits `Added`, the last one leaving emits `Deleted`
// - Events are queued in registration order on a bounded channel; a full
//   queue fails the call instead of waiting on the consumer
// - Per-query status (NotStarted → Ready → Deleted) and the query map are
//   readable without the caller lock
// ============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use flume::TrySendError;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{AlgorithmConfig, ConfigRegistry};
use crate::error::{ConfigError, PredictorResult, QueryError};
use crate::metrics::PredictorMetrics;
use crate::types::{AlgorithmType, MetricQuery, QueryStatus};

/// Lifecycle notification delivered to the owning algorithm
#[derive(Debug, Clone, PartialEq)]
pub enum QueryEvent {
    Added { query: MetricQuery },
    Deleted { query: MetricQuery },
}

impl QueryEvent {
    pub fn query(&self) -> &MetricQuery {
        match self {
            QueryEvent::Added { query } | QueryEvent::Deleted { query } => query,
        }
    }
}

/// Caller-counted query registry for one algorithm
pub struct QueryRegistry {
    algorithm: AlgorithmType,
    /// query key → callers holding it. Events are enqueued while this is
    /// held so they leave in the order the state changed; nothing awaits
    /// under it.
    callers: Mutex<HashMap<String, HashSet<String>>>,
    /// query key → the query itself
    queries: DashMap<String, MetricQuery>,
    events: flume::Sender<QueryEvent>,
    statuses: DashMap<String, QueryStatus>,
    config: Arc<ConfigRegistry>,
    metrics: Arc<PredictorMetrics>,
}

impl QueryRegistry {
    /// Create a registry and the receiving end of its event queue
    pub fn new(
        algorithm: AlgorithmType,
        config: Arc<ConfigRegistry>,
        metrics: Arc<PredictorMetrics>,
        queue_size: usize,
    ) -> (Self, flume::Receiver<QueryEvent>) {
        let (tx, rx) = flume::bounded(queue_size.max(1));
        let registry = Self {
            algorithm,
            callers: Mutex::new(HashMap::new()),
            queries: DashMap::new(),
            events: tx,
            statuses: DashMap::new(),
            config,
            metrics,
        };
        (registry, rx)
    }

    pub fn algorithm(&self) -> AlgorithmType {
        self.algorithm
    }

    /// Register `query` on behalf of `caller`. Idempotent per caller. Only
    /// the first caller's config is recorded; later callers share it.
    pub async fn with_query(
        &self,
        query: &MetricQuery,
        caller: &str,
        config: Option<AlgorithmConfig>,
    ) -> PredictorResult<()> {
        validate(query, caller)?;

        let config = match config {
            Some(config) if config.algorithm() != self.algorithm => {
                let error = ConfigError::WrongAlgorithm {
                    expected: self.algorithm,
                    found: config.algorithm(),
                };
                warn!(
                    target: "cerebro::registry",
                    query = %query,
                    error = %error,
                    "Ignoring explicit config, using defaults"
                );
                None
            }
            other => other,
        };

        let key = query.unique_key();
        let mut callers = self.callers.lock();

        if let Some(holders) = callers.get_mut(&key) {
            if holders.insert(caller.to_string()) {
                debug!(
                    target: "cerebro::registry",
                    query = %key,
                    caller = %caller,
                    callers = holders.len(),
                    "Caller joined existing query"
                );
            } else {
                debug!(target: "cerebro::registry", query = %key, caller = %caller, "Caller already registered");
            }
            return Ok(());
        }

        // The worker reads the query and its config when it handles `Added`,
        // so both are in place before the event leaves.
        self.queries.insert(key.clone(), query.clone());
        if let Some(config) = &config {
            self.config.store(&key, config.clone());
        }
        let previous_status = self.statuses.insert(key.clone(), QueryStatus::NotStarted);

        if let Err(e) = self.events.try_send(QueryEvent::Added { query: query.clone() }) {
            self.queries.remove(&key);
            if config.is_some() {
                self.config.forget(self.algorithm, &key);
            }
            match previous_status {
                Some(status) => {
                    self.statuses.insert(key.clone(), status);
                }
                None => {
                    self.statuses.remove(&key);
                }
            }
            return Err(self.enqueue_error(&key, e).into());
        }

        callers.insert(key.clone(), HashSet::from([caller.to_string()]));
        self.metrics.query_registered(self.algorithm);

        info!(
            target: "cerebro::registry",
            algorithm = %self.algorithm,
            query = %key,
            caller = %caller,
            "Query registered"
        );
        Ok(())
    }

    /// Release `caller`'s hold on `query`. The query is deleted once no
    /// caller holds it. Unknown callers are a no-op.
    pub async fn delete_query(&self, query: &MetricQuery, caller: &str) -> PredictorResult<()> {
        validate(query, caller)?;

        let key = query.unique_key();
        let mut callers = self.callers.lock();

        let Some(holders) = callers.get_mut(&key) else {
            debug!(target: "cerebro::registry", query = %key, "Delete for unregistered query");
            return Ok(());
        };
        if !holders.remove(caller) {
            return Ok(());
        }
        if !holders.is_empty() {
            debug!(
                target: "cerebro::registry",
                query = %key,
                caller = %caller,
                remaining = holders.len(),
                "Caller left shared query"
            );
            return Ok(());
        }

        let registered = self
            .queries
            .get(&key)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| query.clone());
        if let Err(e) = self.events.try_send(QueryEvent::Deleted { query: registered }) {
            holders.insert(caller.to_string());
            return Err(self.enqueue_error(&key, e).into());
        }

        callers.remove(&key);
        self.queries.remove(&key);
        self.statuses.insert(key.clone(), QueryStatus::Deleted);
        self.config.forget(self.algorithm, &key);
        self.metrics.query_deleted(self.algorithm);

        info!(
            target: "cerebro::registry",
            algorithm = %self.algorithm,
            query = %key,
            caller = %caller,
            "Query deleted"
        );
        Ok(())
    }

    fn enqueue_error(&self, key: &str, error: TrySendError<QueryEvent>) -> QueryError {
        match error {
            TrySendError::Full(_) => {
                warn!(
                    target: "cerebro::registry",
                    algorithm = %self.algorithm,
                    query = %key,
                    "Event queue full, registration change rejected"
                );
                QueryError::EventQueueFull {
                    algorithm: self.algorithm,
                }
            }
            TrySendError::Disconnected(_) => QueryError::EventQueueClosed {
                algorithm: self.algorithm,
            },
        }
    }

    /// Status of a query key; `Unknown` if never registered
    pub fn status(&self, key: &str) -> QueryStatus {
        self.statuses
            .get(key)
            .map(|s| *s)
            .unwrap_or(QueryStatus::Unknown)
    }

    /// NotStarted → Ready. Has no effect on deleted queries.
    pub fn mark_ready(&self, key: &str) {
        if let Some(mut status) = self.statuses.get_mut(key) {
            if *status == QueryStatus::NotStarted {
                *status = QueryStatus::Ready;
                debug!(target: "cerebro::registry", query = %key, "Query ready");
            }
        }
    }

    pub fn is_registered(&self, key: &str) -> bool {
        matches!(self.status(key), QueryStatus::NotStarted | QueryStatus::Ready)
    }

    /// The registered query for a key
    pub fn query(&self, key: &str) -> Option<MetricQuery> {
        self.queries.get(key).map(|entry| entry.value().clone())
    }

    pub fn registered_queries(&self) -> Vec<MetricQuery> {
        self.queries.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn callers(&self, key: &str) -> Vec<String> {
        let mut callers: Vec<String> = self
            .callers
            .lock()
            .get(key)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default();
        callers.sort();
        callers
    }
}

fn validate(query: &MetricQuery, caller: &str) -> Result<(), QueryError> {
    if query.metric_name.trim().is_empty() {
        return Err(QueryError::EmptyIdentifier);
    }
    if caller.trim().is_empty() {
        return Err(QueryError::EmptyCaller);
    }
    Ok(())
}

impl std::fmt::Debug for QueryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRegistry")
            .field("algorithm", &self.algorithm)
            .field("statuses", &self.statuses.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DspSpec, PercentileSpec};
    use crate::error::PredictorError;
    use pretty_assertions::assert_eq;

    fn registry() -> (QueryRegistry, flume::Receiver<QueryEvent>, Arc<ConfigRegistry>) {
        let config = Arc::new(ConfigRegistry::new());
        let metrics = Arc::new(PredictorMetrics::new().unwrap());
        let (registry, rx) = QueryRegistry::new(AlgorithmType::Dsp, Arc::clone(&config), metrics, 16);
        (registry, rx, config)
    }

    #[tokio::test]
    async fn test_first_caller_adds_last_caller_deletes() {
        let (registry, rx, _) = registry();
        let query = MetricQuery::new("cpu");

        registry.with_query(&query, "hpa", None).await.unwrap();
        registry.with_query(&query, "hpa", None).await.unwrap();
        registry.with_query(&query, "vpa", None).await.unwrap();
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.try_recv().unwrap(), QueryEvent::Added { query: query.clone() });
        assert_eq!(registry.callers("cpu"), vec!["hpa", "vpa"]);

        registry.delete_query(&query, "hpa").await.unwrap();
        assert!(rx.is_empty());
        assert_eq!(registry.status("cpu"), QueryStatus::NotStarted);

        registry.delete_query(&query, "vpa").await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), QueryEvent::Deleted { query: query.clone() });
        assert_eq!(registry.status("cpu"), QueryStatus::Deleted);

        // Deleting again is a no-op
        registry.delete_query(&query, "vpa").await.unwrap();
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn test_empty_identifiers_rejected() {
        let (registry, _rx, _) = registry();
        let err = registry
            .with_query(&MetricQuery::new(""), "hpa", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PredictorError::Query(QueryError::EmptyIdentifier)));
        let err = registry
            .with_query(&MetricQuery::new("cpu"), "", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PredictorError::Query(QueryError::EmptyCaller)));
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let (registry, _rx, _) = registry();
        let query = MetricQuery::new("mem");
        assert_eq!(registry.status("mem"), QueryStatus::Unknown);

        registry.with_query(&query, "hpa", None).await.unwrap();
        assert_eq!(registry.status("mem"), QueryStatus::NotStarted);
        registry.mark_ready("mem");
        assert_eq!(registry.status("mem"), QueryStatus::Ready);

        registry.delete_query(&query, "hpa").await.unwrap();
        registry.mark_ready("mem");
        assert_eq!(registry.status("mem"), QueryStatus::Deleted);
        assert!(!registry.is_registered("mem"));

        registry.with_query(&query, "hpa", None).await.unwrap();
        assert_eq!(registry.status("mem"), QueryStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_first_callers_config_is_kept() {
        let (registry, _rx, config) = registry();
        let query = MetricQuery::new("cpu");
        let first = AlgorithmConfig::Dsp(DspSpec {
            update_interval: Some("5m".into()),
            ..Default::default()
        });
        let second = AlgorithmConfig::Dsp(DspSpec {
            update_interval: Some("10m".into()),
            ..Default::default()
        });

        registry.with_query(&query, "a", Some(first.clone())).await.unwrap();
        registry.with_query(&query, "b", Some(second)).await.unwrap();
        assert_eq!(config.get(AlgorithmType::Dsp, "cpu"), Some(first));

        registry.delete_query(&query, "a").await.unwrap();
        registry.delete_query(&query, "b").await.unwrap();
        assert!(config.get(AlgorithmType::Dsp, "cpu").is_none());
    }

    #[tokio::test]
    async fn test_wrong_algorithm_config_ignored() {
        let (registry, _rx, config) = registry();
        registry
            .with_query(
                &MetricQuery::new("cpu"),
                "a",
                Some(AlgorithmConfig::Percentile(PercentileSpec::default())),
            )
            .await
            .unwrap();
        assert!(config.is_empty());
    }

    #[tokio::test]
    async fn test_events_keep_registration_order() {
        let (registry, rx, _) = registry();
        let registry = Arc::new(registry);
        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let query = MetricQuery::new(format!("q{i}"));
                registry.with_query(&query, "c", None).await.unwrap();
                registry.delete_query(&query, "c").await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut added = HashSet::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                QueryEvent::Added { query } => assert!(added.insert(query.metric_name)),
                QueryEvent::Deleted { query } => assert!(added.remove(&query.metric_name)),
            }
        }
        assert!(added.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_blocking() {
        let config = Arc::new(ConfigRegistry::new());
        let metrics = Arc::new(PredictorMetrics::new().unwrap());
        let (registry, rx) = QueryRegistry::new(AlgorithmType::Dsp, Arc::clone(&config), metrics, 2);
        let first = MetricQuery::new("q0");
        registry.with_query(&first, "hpa", None).await.unwrap();
        registry.with_query(&MetricQuery::new("q1"), "hpa", None).await.unwrap();

        let overflow = MetricQuery::new("q2");
        let spec = AlgorithmConfig::Dsp(DspSpec {
            update_interval: Some("5m".into()),
            ..Default::default()
        });
        let err = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            registry.with_query(&overflow, "hpa", Some(spec)),
        )
        .await
        .expect("registration waited on a full queue")
        .unwrap_err();
        assert!(matches!(err, PredictorError::Query(QueryError::EventQueueFull { .. })));
        assert!(err.is_recoverable());
        assert_eq!(registry.status("q2"), QueryStatus::Unknown);
        assert!(registry.query("q2").is_none());
        assert!(registry.callers("q2").is_empty());
        assert!(config.get(AlgorithmType::Dsp, "q2").is_none());

        // Lookups stay available while the queue is full
        assert_eq!(registry.query("q0"), Some(first.clone()));
        assert_eq!(registry.registered_queries().len(), 2);

        // A delete that cannot be queued leaves the caller in place
        let err = registry.delete_query(&first, "hpa").await.unwrap_err();
        assert!(matches!(err, PredictorError::Query(QueryError::EventQueueFull { .. })));
        assert_eq!(registry.callers("q0"), vec!["hpa"]);
        assert!(registry.is_registered("q0"));

        assert_eq!(rx.try_recv().unwrap(), QueryEvent::Added { query: first.clone() });
        registry.with_query(&overflow, "hpa", None).await.unwrap();
        assert_eq!(registry.status("q2"), QueryStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_closed_queue_rolls_back_registration() {
        let (registry, rx, _) = registry();
        drop(rx);
        let err = registry
            .with_query(&MetricQuery::new("cpu"), "hpa", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PredictorError::Query(QueryError::EventQueueClosed { .. })));
        assert_eq!(registry.status("cpu"), QueryStatus::Unknown);
        assert!(registry.callers("cpu").is_empty());
    }
}
