// ============================================================================
// SECTION: CHECKPOINT STORE
// ============================================================================
// Persists percentile histograms so a restarted predictor keeps its history.
//
// - `CheckpointBackend`: blocking key/record storage (`local`, `memory`)
// - `Checkpointer`: the async contract the percentile algorithm uses
// - `CheckpointManager`: bounded request queues drained by a fixed pool of
//   reader and writer workers; `flush` closes the queues and waits for them
//
// Backends are created by name through a process-wide factory registry.
// ============================================================================

pub mod local;
pub mod memory;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CheckpointConfig;
use crate::error::{CheckpointError, CheckpointResult, ConfigError, PredictorError, PredictorResult};
use crate::metrics::PredictorMetrics;
use crate::percentile::histogram::HistogramCheckpoint;
use crate::prediction::cancellable;
use crate::types::{Labels, Timestamp};

// ----------------------------------------------------------------------------
// Records & Backends
// ----------------------------------------------------------------------------

/// Persisted state of one percentile signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Signal key the record belongs to
    pub metric_identifier: String,
    pub labels: Labels,
    pub histogram: HistogramCheckpoint,
    pub first_sample_start: Option<Timestamp>,
    pub last_sample_start: Option<Timestamp>,
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    pub total_samples_count: u64,
    pub version: String,
    pub last_update_time: Timestamp,
}

/// Blocking storage of records by identifier. Called from worker threads.
pub trait CheckpointBackend: Send + Sync {
    fn name(&self) -> &str;

    fn save(&self, record: &CheckpointRecord) -> CheckpointResult<()>;

    /// `None` if nothing was stored under `identifier`
    fn load(&self, identifier: &str) -> CheckpointResult<Option<CheckpointRecord>>;
}

/// Builds a backend from configuration
pub type BackendFactory = fn(&CheckpointConfig) -> CheckpointResult<Arc<dyn CheckpointBackend>>;

static BACKENDS: Lazy<RwLock<HashMap<String, BackendFactory>>> = Lazy::new(|| {
    let mut factories: HashMap<String, BackendFactory> = HashMap::new();
    factories.insert("local".to_string(), local::factory);
    factories.insert("memory".to_string(), memory::factory);
    RwLock::new(factories)
});

/// Register (or replace) a backend factory under `name`
pub fn register_backend(name: impl Into<String>, factory: BackendFactory) {
    let name = name.into();
    debug!(target: "cerebro::checkpoint", backend = %name, "Checkpoint backend registered");
    BACKENDS.write().insert(name, factory);
}

pub fn registered_backends() -> Vec<String> {
    let mut names: Vec<String> = BACKENDS.read().keys().cloned().collect();
    names.sort();
    names
}

/// Create the backend named in `config`
pub fn build_backend(config: &CheckpointConfig) -> PredictorResult<Arc<dyn CheckpointBackend>> {
    let factory = BACKENDS.read().get(&config.backend).copied();
    match factory {
        Some(factory) => Ok(factory(config)?),
        None => Err(ConfigError::UnknownBackend {
            name: config.backend.clone(),
            registered: registered_backends().join(", "),
        }
        .into()),
    }
}

/// Build a checkpoint manager over the configured backend
pub fn new_checkpointer(
    config: &CheckpointConfig,
    metrics: Option<Arc<PredictorMetrics>>,
) -> PredictorResult<Arc<CheckpointManager>> {
    config.validate()?;
    let backend = build_backend(config)?;
    info!(
        target: "cerebro::checkpoint",
        backend = backend.name(),
        writers = config.writers,
        readers = config.readers,
        "Checkpoint store created"
    );
    Ok(Arc::new(CheckpointManager::new(
        backend,
        config.writers,
        config.readers,
        config.queue_size,
        metrics,
    )))
}

// ----------------------------------------------------------------------------
// Checkpointer Contract
// ----------------------------------------------------------------------------

/// Checkpoint operations as seen by an algorithm. Every blocking call
/// returns `Cancelled` promptly once `ctx` is cancelled.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Start the workers. They run until `stop` is cancelled or `flush`.
    async fn start(&self, stop: CancellationToken);

    /// Write a record and wait for the result
    async fn store_metric_model_checkpoint(&self, ctx: &CancellationToken, record: CheckpointRecord) -> PredictorResult<()>;

    /// Queue a record for writing. A write failure is sent to `errors` if
    /// given, logged otherwise.
    async fn async_store_metric_model_checkpoint(
        &self,
        ctx: &CancellationToken,
        record: CheckpointRecord,
        errors: Option<flume::Sender<PredictorError>>,
    ) -> PredictorResult<()>;

    async fn load_metric_model_checkpoint(
        &self,
        ctx: &CancellationToken,
        identifier: &str,
    ) -> PredictorResult<Option<CheckpointRecord>>;

    /// Close the request queues and wait until queued work is done.
    /// Calling it again is a no-op.
    async fn flush(&self);
}

// ----------------------------------------------------------------------------
// Checkpoint Manager
// ----------------------------------------------------------------------------

struct StoreRequest {
    record: CheckpointRecord,
    errors: Option<flume::Sender<PredictorError>>,
}

struct LoadRequest {
    identifier: String,
    reply: oneshot::Sender<CheckpointResult<Option<CheckpointRecord>>>,
}

struct ManagerInner {
    backend: Arc<dyn CheckpointBackend>,
    store_tx: Mutex<Option<flume::Sender<StoreRequest>>>,
    load_tx: Mutex<Option<flume::Sender<LoadRequest>>>,
    store_rx: flume::Receiver<StoreRequest>,
    load_rx: flume::Receiver<LoadRequest>,
    workers: TokioMutex<Vec<JoinHandle<()>>>,
    writers: usize,
    readers: usize,
    started: AtomicBool,
    /// Cancelled once a flush has joined every worker
    drained: CancellationToken,
    metrics: Option<Arc<PredictorMetrics>>,
}

impl ManagerInner {
    fn record_op(&self, op: &str, ok: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.checkpoint_op(op, ok);
        }
    }

    async fn save(&self, record: CheckpointRecord) -> CheckpointResult<()> {
        let backend = Arc::clone(&self.backend);
        let key = record.metric_identifier.clone();
        let result = tokio::task::spawn_blocking(move || backend.save(&record))
            .await
            .unwrap_or_else(|e| Err(CheckpointError::backend(key, e.to_string())));
        self.record_op("store", result.is_ok());
        result
    }

    async fn load(&self, identifier: String) -> CheckpointResult<Option<CheckpointRecord>> {
        let backend = Arc::clone(&self.backend);
        let key = identifier.clone();
        let result = tokio::task::spawn_blocking(move || backend.load(&identifier))
            .await
            .unwrap_or_else(|e| Err(CheckpointError::backend(key, e.to_string())));
        self.record_op("load", result.is_ok());
        result
    }

    async fn run_writer(self: Arc<Self>, id: usize) {
        while let Ok(request) = self.store_rx.recv_async().await {
            let key = request.record.metric_identifier.clone();
            if let Err(e) = self.save(request.record).await {
                match request.errors {
                    Some(errors) => {
                        let _ = errors.send_async(e.into()).await;
                    }
                    None => warn!(target: "cerebro::checkpoint", signal = %key, error = %e, "Async checkpoint store failed"),
                }
            }
        }
        debug!(target: "cerebro::checkpoint", worker = id, "Checkpoint writer exited");
    }

    async fn run_reader(self: Arc<Self>, id: usize) {
        while let Ok(request) = self.load_rx.recv_async().await {
            let result = self.load(request.identifier).await;
            // the caller may have given up waiting
            let _ = request.reply.send(result);
        }
        debug!(target: "cerebro::checkpoint", worker = id, "Checkpoint reader exited");
    }

    async fn flush(&self) {
        let store_tx = self.store_tx.lock().take();
        let load_tx = self.load_tx.lock().take();
        if store_tx.is_none() && load_tx.is_none() {
            debug!(target: "cerebro::checkpoint", "Checkpoint queues already closed");
            self.drained.cancelled().await;
            return;
        }
        drop(store_tx);
        drop(load_tx);

        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        if workers.is_empty() && !self.store_rx.is_empty() {
            warn!(
                target: "cerebro::checkpoint",
                pending = self.store_rx.len(),
                "Checkpoint store flushed before start; queued writes dropped"
            );
        }
        for worker in workers {
            if let Err(e) = worker.await {
                error!(target: "cerebro::checkpoint", error = %e, "Checkpoint worker failed");
            }
        }
        self.drained.cancel();
        info!(target: "cerebro::checkpoint", "Checkpoint store flushed");
    }
}

/// Queue-backed `Checkpointer` over any backend
pub struct CheckpointManager {
    inner: Arc<ManagerInner>,
}

impl CheckpointManager {
    pub fn new(
        backend: Arc<dyn CheckpointBackend>,
        writers: usize,
        readers: usize,
        queue_size: usize,
        metrics: Option<Arc<PredictorMetrics>>,
    ) -> Self {
        let (store_tx, store_rx) = flume::bounded(queue_size.max(1));
        let (load_tx, load_rx) = flume::bounded(queue_size.max(1));
        Self {
            inner: Arc::new(ManagerInner {
                backend,
                store_tx: Mutex::new(Some(store_tx)),
                load_tx: Mutex::new(Some(load_tx)),
                store_rx,
                load_rx,
                workers: TokioMutex::new(Vec::new()),
                writers: writers.max(1),
                readers: readers.max(1),
                started: AtomicBool::new(false),
                drained: CancellationToken::new(),
                metrics,
            }),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.inner.backend.name()
    }

    /// Writes waiting in the queue
    pub fn pending_stores(&self) -> usize {
        self.inner.store_rx.len()
    }

    fn store_sender(&self) -> CheckpointResult<flume::Sender<StoreRequest>> {
        self.inner.store_tx.lock().clone().ok_or(CheckpointError::Closed)
    }

    fn load_sender(&self) -> CheckpointResult<flume::Sender<LoadRequest>> {
        self.inner.load_tx.lock().clone().ok_or(CheckpointError::Closed)
    }
}

impl fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("backend", &self.inner.backend.name())
            .field("writers", &self.inner.writers)
            .field("readers", &self.inner.readers)
            .field("pending_stores", &self.inner.store_rx.len())
            .finish()
    }
}

#[async_trait]
impl Checkpointer for CheckpointManager {
    async fn start(&self, stop: CancellationToken) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!(target: "cerebro::checkpoint", "Checkpoint store already started");
            return;
        }

        let mut workers = self.inner.workers.lock().await;
        for id in 0..self.inner.writers {
            workers.push(tokio::spawn(Arc::clone(&self.inner).run_writer(id)));
        }
        for id in 0..self.inner.readers {
            workers.push(tokio::spawn(Arc::clone(&self.inner).run_reader(id)));
        }
        drop(workers);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            stop.cancelled().await;
            inner.flush().await;
        });

        info!(
            target: "cerebro::checkpoint",
            writers = self.inner.writers,
            readers = self.inner.readers,
            "Checkpoint workers started"
        );
    }

    async fn store_metric_model_checkpoint(&self, ctx: &CancellationToken, record: CheckpointRecord) -> PredictorResult<()> {
        match cancellable(ctx, self.inner.save(record)).await {
            Some(result) => Ok(result?),
            None => Err(PredictorError::cancelled("checkpoint store")),
        }
    }

    async fn async_store_metric_model_checkpoint(
        &self,
        ctx: &CancellationToken,
        record: CheckpointRecord,
        errors: Option<flume::Sender<PredictorError>>,
    ) -> PredictorResult<()> {
        let sender = self.store_sender()?;
        let request = StoreRequest { record, errors };
        match cancellable(ctx, sender.send_async(request)).await {
            Some(Ok(())) => Ok(()),
            Some(Err(_)) => Err(CheckpointError::Closed.into()),
            None => Err(PredictorError::cancelled("checkpoint enqueue")),
        }
    }

    async fn load_metric_model_checkpoint(
        &self,
        ctx: &CancellationToken,
        identifier: &str,
    ) -> PredictorResult<Option<CheckpointRecord>> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(CheckpointError::NotStarted.into());
        }
        let sender = self.load_sender()?;
        let (reply, answer) = oneshot::channel();
        let request = LoadRequest {
            identifier: identifier.to_string(),
            reply,
        };

        match cancellable(ctx, sender.send_async(request)).await {
            Some(Ok(())) => {}
            Some(Err(_)) => return Err(CheckpointError::Closed.into()),
            None => return Err(PredictorError::cancelled("checkpoint load")),
        }
        drop(sender);

        match cancellable(ctx, answer).await {
            Some(Ok(result)) => Ok(result?),
            Some(Err(_)) => Err(CheckpointError::WorkerGone.into()),
            None => Err(PredictorError::cancelled("checkpoint load")),
        }
    }

    async fn flush(&self) {
        self.inner.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    pub(crate) fn record(identifier: &str) -> CheckpointRecord {
        CheckpointRecord {
            metric_identifier: identifier.to_string(),
            labels: labels!["pod" => "web-0"],
            histogram: HistogramCheckpoint {
                total_weight: 12.5,
                bucket_weights: BTreeMap::from([(3, 10_000), (7, 2_500)]),
                reference_timestamp: Timestamp::from_secs(1_700_006_400),
            },
            first_sample_start: Some(Timestamp::from_secs(1_700_000_000)),
            last_sample_start: Some(Timestamp::from_secs(1_700_003_600)),
            sample_interval: Duration::from_secs(60),
            total_samples_count: 61,
            version: crate::CHECKPOINT_VERSION.to_string(),
            last_update_time: Timestamp::from_secs(1_700_003_660),
        }
    }

    fn manager() -> (CheckpointManager, Arc<memory::MemoryBackend>) {
        let backend = Arc::new(memory::MemoryBackend::new());
        let manager = CheckpointManager::new(backend.clone(), 2, 2, 16, None);
        (manager, backend)
    }

    #[tokio::test]
    async fn test_store_then_load() {
        let (manager, _) = manager();
        let ctx = CancellationToken::new();
        manager.start(ctx.clone()).await;

        manager
            .store_metric_model_checkpoint(&ctx, record("cpu|pod=web-0"))
            .await
            .unwrap();
        let loaded = manager.load_metric_model_checkpoint(&ctx, "cpu|pod=web-0").await.unwrap();
        assert_eq!(loaded, Some(record("cpu|pod=web-0")));
        assert_eq!(manager.load_metric_model_checkpoint(&ctx, "mem|").await.unwrap(), None);
        manager.flush().await;
    }

    #[tokio::test]
    async fn test_flush_drains_async_stores() {
        let (manager, backend) = manager();
        let ctx = CancellationToken::new();
        manager.start(ctx.clone()).await;

        for i in 0..50 {
            manager
                .async_store_metric_model_checkpoint(&ctx, record(&format!("q{i}|")), None)
                .await
                .unwrap();
        }
        manager.flush().await;
        assert_eq!(backend.len(), 50);

        // closed queues reject new work, and a second flush is harmless
        assert!(matches!(
            manager.async_store_metric_model_checkpoint(&ctx, record("late|"), None).await,
            Err(PredictorError::Checkpoint(CheckpointError::Closed))
        ));
        manager.flush().await;
    }

    #[tokio::test]
    async fn test_concurrent_flush_with_stores_in_flight() {
        let (manager, backend) = manager();
        let manager = Arc::new(manager);
        let ctx = CancellationToken::new();
        manager.start(ctx.clone()).await;

        let mut producers = Vec::new();
        for p in 0..4 {
            let manager = Arc::clone(&manager);
            let ctx = ctx.clone();
            producers.push(tokio::spawn(async move {
                let mut accepted = 0usize;
                for i in 0..100 {
                    let result = manager
                        .async_store_metric_model_checkpoint(&ctx, record(&format!("p{p}-{i}|")), None)
                        .await;
                    if result.is_ok() {
                        accepted += 1;
                    }
                }
                accepted
            }));
        }
        let flushers: Vec<_> = (0..3)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.flush().await })
            })
            .collect();

        let mut accepted = 0;
        for producer in producers {
            accepted += producer.await.unwrap();
        }
        for flusher in flushers {
            flusher.await.unwrap();
        }
        manager.flush().await;
        assert_eq!(backend.len(), accepted);
    }

    #[tokio::test]
    async fn test_async_store_failure_reaches_error_channel() {
        let manager = CheckpointManager::new(Arc::new(memory::FailingBackend), 1, 1, 4, None);
        let ctx = CancellationToken::new();
        manager.start(ctx.clone()).await;

        let (errors_tx, errors_rx) = flume::unbounded();
        manager
            .async_store_metric_model_checkpoint(&ctx, record("cpu|"), Some(errors_tx))
            .await
            .unwrap();
        let error = errors_rx.recv_async().await.unwrap();
        assert!(matches!(error, PredictorError::Checkpoint(CheckpointError::Backend { .. })));
        manager.flush().await;
    }

    #[tokio::test]
    async fn test_cancelled_context_and_lifecycle_errors() {
        let (manager, _) = manager();
        let ctx = CancellationToken::new();
        assert!(matches!(
            manager.load_metric_model_checkpoint(&ctx, "cpu|").await,
            Err(PredictorError::Checkpoint(CheckpointError::NotStarted))
        ));

        manager.start(ctx.clone()).await;
        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = manager
            .store_metric_model_checkpoint(&cancelled, record("cpu|"))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        // stopping the store flushes it
        ctx.cancel();
        let mut closed = false;
        for _ in 0..100 {
            if manager.load_metric_model_checkpoint(&CancellationToken::new(), "cpu|").await.is_err() {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(closed);
    }

    #[test]
    fn test_factory_registry() {
        let mut config = CheckpointConfig {
            backend: "memory".into(),
            ..Default::default()
        };
        assert_eq!(build_backend(&config).unwrap().name(), "memory");

        config.backend = "nope".into();
        let err = build_backend(&config).err().unwrap();
        assert!(err.to_string().contains("nope"));

        fn custom(_: &CheckpointConfig) -> CheckpointResult<Arc<dyn CheckpointBackend>> {
            Ok(Arc::new(memory::MemoryBackend::new()))
        }
        register_backend("custom-test", custom);
        assert!(registered_backends().contains(&"custom-test".to_string()));
        assert!(registered_backends().contains(&"local".to_string()));
    }
}
