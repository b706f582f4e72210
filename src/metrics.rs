// ============================================================================
// SECTION: SELF-MONITORING METRICS
// ============================================================================
// Prometheus counters and gauges describing the predictor itself. Each
// instance owns a private registry so several managers (and tests) can live
// in one process.
// ============================================================================

use prometheus::{
    Encoder, IntCounterVec, IntGaugeVec, Opts, Registry as PrometheusRegistry, TextEncoder,
};

use crate::error::{PredictorError, PredictorResult};
use crate::types::AlgorithmType;

pub struct PredictorMetrics {
    registry: PrometheusRegistry,
    registered_queries: IntGaugeVec,
    refresh_cycles: IntCounterVec,
    skipped_series: IntCounterVec,
    checkpoint_ops: IntCounterVec,
}

impl PredictorMetrics {
    pub fn new() -> PredictorResult<Self> {
        let registry = PrometheusRegistry::new_custom(Some("cerebro_predictor".into()), None)
            .map_err(metrics_error)?;

        let registered_queries = IntGaugeVec::new(
            Opts::new("registered_queries", "Queries currently registered"),
            &["algorithm"],
        )
        .map_err(metrics_error)?;
        let refresh_cycles = IntCounterVec::new(
            Opts::new("refresh_cycles_total", "Completed prediction refresh cycles"),
            &["algorithm"],
        )
        .map_err(metrics_error)?;
        let skipped_series = IntCounterVec::new(
            Opts::new("skipped_series_total", "Series skipped during a refresh"),
            &["algorithm", "reason"],
        )
        .map_err(metrics_error)?;
        let checkpoint_ops = IntCounterVec::new(
            Opts::new("checkpoint_operations_total", "Checkpoint store and load operations"),
            &["op", "outcome"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(registered_queries.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(refresh_cycles.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(skipped_series.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(checkpoint_ops.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            registered_queries,
            refresh_cycles,
            skipped_series,
            checkpoint_ops,
        })
    }

    pub fn query_registered(&self, algorithm: AlgorithmType) {
        self.registered_queries
            .with_label_values(&[algorithm.as_str()])
            .inc();
    }

    pub fn query_deleted(&self, algorithm: AlgorithmType) {
        self.registered_queries
            .with_label_values(&[algorithm.as_str()])
            .dec();
    }

    pub fn registered(&self, algorithm: AlgorithmType) -> i64 {
        self.registered_queries
            .with_label_values(&[algorithm.as_str()])
            .get()
    }

    pub fn refresh_completed(&self, algorithm: AlgorithmType) {
        self.refresh_cycles
            .with_label_values(&[algorithm.as_str()])
            .inc();
    }

    pub fn refreshes(&self, algorithm: AlgorithmType) -> u64 {
        self.refresh_cycles
            .with_label_values(&[algorithm.as_str()])
            .get()
    }

    pub fn series_skipped(&self, algorithm: AlgorithmType, reason: &str) {
        self.skipped_series
            .with_label_values(&[algorithm.as_str(), reason])
            .inc();
    }

    pub fn checkpoint_op(&self, op: &str, ok: bool) {
        self.checkpoint_ops
            .with_label_values(&[op, if ok { "ok" } else { "error" }])
            .inc();
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn encode_text(&self) -> String {
        let mut buffer = Vec::new();
        if TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl std::fmt::Debug for PredictorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictorMetrics").finish_non_exhaustive()
    }
}

fn metrics_error(e: prometheus::Error) -> PredictorError {
    PredictorError::internal(format!("metrics registration failed: {e}"))
}
