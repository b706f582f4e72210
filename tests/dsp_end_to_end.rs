//! Periodic-signal prediction driven through the manager with a synthetic
//! daily workload.

use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cerebro_predictor::error::ProviderResult;
use cerebro_predictor::{
    labels, AlgorithmType, DataProvider, EngineConfig, MetricQuery, PredictionRequest, PredictorManager,
    QueryStatus, Sample, TimeSeries, Timestamp,
};

fn daily_load(t: i64) -> f64 {
    10.0 + 5.0 * (2.0 * PI * t as f64 / 86_400.0).sin()
}

struct DailyWorkload;

#[async_trait]
impl DataProvider for DailyWorkload {
    async fn query_time_series(
        &self,
        _query: &MetricQuery,
        start: Timestamp,
        end: Timestamp,
        step: Duration,
    ) -> ProviderResult<Vec<TimeSeries>> {
        let step = step.as_secs() as i64;
        let first = (start.as_secs() + step - 1).div_euclid(step) * step;
        let samples = (first..=end.as_secs())
            .step_by(step as usize)
            .map(|t| Sample::new(daily_load(t), Timestamp::from_secs(t)))
            .collect();
        Ok(vec![TimeSeries::with_samples(labels!["pod" => "web-0"], samples)])
    }

    async fn query_latest_time_series(&self, _query: &MetricQuery) -> ProviderResult<Vec<TimeSeries>> {
        let now = Timestamp::now();
        Ok(vec![TimeSeries::with_samples(
            labels!["pod" => "web-0"],
            vec![Sample::new(daily_load(now.as_secs()), now)],
        )])
    }
}

async fn wait_until_ready(manager: &PredictorManager, query: &MetricQuery) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    let predictor = manager.predictor(AlgorithmType::Dsp);
    while predictor.query_status(query) != QueryStatus::Ready {
        assert!(tokio::time::Instant::now() < deadline, "query never became ready");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_daily_workload_is_forecast_one_day_ahead() {
    let manager = PredictorManager::new(&EngineConfig::default()).unwrap();
    manager.history().add_source("synthetic", Arc::new(DailyWorkload));
    manager.realtime().add_source("synthetic", Arc::new(DailyWorkload));
    manager.start().await;

    let query = MetricQuery::new("container_cpu_usage");
    manager
        .predictor(AlgorithmType::Dsp)
        .with_query(&query, "hpa", None)
        .await
        .unwrap();
    wait_until_ready(&manager, &query).await;

    let start = Timestamp::now();
    let end = start.add_duration(Duration::from_secs(86_400));
    let (outputs, failures) = manager
        .predict_many(&[PredictionRequest::new(AlgorithmType::Dsp, query.clone())], start, end)
        .await;
    assert!(failures.is_none());
    assert_eq!(outputs.len(), 1);

    let series = &outputs[0].series;
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].labels, labels!["pod" => "web-0"]);
    assert_eq!(series[0].samples.len(), 1440);
    for sample in &series[0].samples {
        assert!(sample.timestamp >= start && sample.timestamp < end);
        let actual = daily_load(sample.timestamp.as_secs());
        assert!(sample.value >= actual * 0.95, "{} < {}", sample.value, actual);
        assert!(sample.value <= actual * 1.35, "{} > {}", sample.value, actual);
    }

    let realtime = manager
        .predictor(AlgorithmType::Dsp)
        .query_realtime_predicted_values(&query)
        .await
        .unwrap();
    assert_eq!(realtime.len(), 1);
    assert_eq!(realtime[0].samples.len(), 1);

    let snapshot = manager.predictor(AlgorithmType::Dsp).debug_snapshot(&query).unwrap();
    assert_eq!(snapshot.status, QueryStatus::Ready);
    assert_eq!(snapshot.series.len(), 1);

    manager.stop().await;
}

#[tokio::test]
async fn test_window_must_be_ordered() {
    let manager = PredictorManager::new(&EngineConfig::default()).unwrap();
    let query = MetricQuery::new("container_cpu_usage");
    let dsp = manager.predictor(AlgorithmType::Dsp);
    dsp.with_query(&query, "hpa", None).await.unwrap();

    let t = Timestamp::from_secs(1_700_000_000);
    assert!(dsp.query_predicted_time_series(&query, t, t).await.is_err());
}
