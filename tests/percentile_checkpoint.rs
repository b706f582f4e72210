//! Percentile histograms survive a restart through the local checkpoint
//! backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cerebro_predictor::error::ProviderResult;
use cerebro_predictor::prediction::SeriesSnapshot;
use cerebro_predictor::{
    labels, AlgorithmType, DataProvider, EngineConfig, MetricQuery, PredictorManager, QueryStatus, Sample,
    TimeSeries, Timestamp,
};

/// Always reports the same sample
struct FixedSample {
    value: f64,
    timestamp: Timestamp,
}

#[async_trait]
impl DataProvider for FixedSample {
    async fn query_time_series(
        &self,
        _query: &MetricQuery,
        _start: Timestamp,
        _end: Timestamp,
        _step: Duration,
    ) -> ProviderResult<Vec<TimeSeries>> {
        Ok(Vec::new())
    }

    async fn query_latest_time_series(&self, _query: &MetricQuery) -> ProviderResult<Vec<TimeSeries>> {
        Ok(vec![TimeSeries::with_samples(
            labels!["pod" => "db-0"],
            vec![Sample::new(self.value, self.timestamp)],
        )])
    }
}

fn config(directory: &std::path::Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.engine.shutdown_timeout_secs = 10;
    config.checkpoint.enabled = true;
    config.checkpoint.backend = "local".into();
    config.checkpoint.directory = directory.to_string_lossy().into_owned();
    config
}

fn histogram_of(manager: &PredictorManager, query: &MetricQuery) -> Option<(u64, f64)> {
    let snapshot = manager.predictor(AlgorithmType::Percentile).debug_snapshot(query)?;
    snapshot.series.into_iter().find_map(|series| match series {
        SeriesSnapshot::Histogram {
            total_samples, estimate, ..
        } => Some((total_samples, estimate)),
        _ => None,
    })
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_histogram_restored_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(FixedSample {
        value: 8.0,
        timestamp: Timestamp::now(),
    });
    let query = MetricQuery::new("memory_working_set");

    let first = PredictorManager::new(&config(dir.path())).unwrap();
    first.realtime().add_source("fixed", provider.clone());
    first.start().await;
    let percentile = first.predictor(AlgorithmType::Percentile);
    percentile.with_query(&query, "vpa", None).await.unwrap();
    wait_for(|| percentile.query_status(&query) == QueryStatus::Ready).await;

    let (samples, estimate) = histogram_of(&first, &query).unwrap();
    assert_eq!(samples, 1);
    assert!(estimate > 8.0);
    let realtime = percentile.query_realtime_predicted_values(&query).await.unwrap();
    assert_eq!(realtime.len(), 1);
    assert_eq!(realtime[0].samples[0].value, estimate);
    first.stop().await;

    let files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().map_or(false, |ext| ext == "json"))
        .collect();
    assert_eq!(files.len(), 1);

    // Same sample again: restored, but not counted twice.
    let second = PredictorManager::new(&config(dir.path())).unwrap();
    second.realtime().add_source("fixed", provider);
    second.start().await;
    second
        .predictor(AlgorithmType::Percentile)
        .with_query(&query, "vpa", None)
        .await
        .unwrap();
    wait_for(|| histogram_of(&second, &query).is_some()).await;

    assert_eq!(histogram_of(&second, &query), Some((1, estimate)));
    second.stop().await;
}

#[tokio::test]
async fn test_unknown_backend_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.checkpoint.backend = "s3".into();
    let err = PredictorManager::new(&config).unwrap_err();
    assert!(err.to_string().contains("s3"), "{err}");
}
