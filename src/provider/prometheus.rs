// ============================================================================
// SECTION: PROMETHEUS DATA PROVIDER
// ============================================================================
// Queries a Prometheus-compatible HTTP API. History comes from
// `/api/v1/query_range`, realtime values from `/api/v1/query`.
// ============================================================================

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use tracing::debug;

use super::DataProvider;
use crate::error::{ProviderError, ProviderResult};
use crate::types::{Label, Labels, MetricQuery, Sample, TimeSeries, Timestamp};

pub struct PrometheusProvider {
    name: String,
    base_url: String,
    client: HttpClient,
}

impl PrometheusProvider {
    pub fn new(name: impl Into<String>, base_url: &str, timeout: Duration) -> ProviderResult<Self> {
        let name = name.into();
        let client = HttpClient::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| ProviderError::source_failed(name.clone(), e.to_string()))?;

        Ok(Self {
            name,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> ProviderResult<Vec<TimeSeries>> {
        let url = format!("{}{}", self.base_url, path);
        debug!(target: "cerebro::provider", source = %self.name, url = %url, "Querying prometheus");

        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|e| ProviderError::source_failed(self.name.clone(), e.to_string()))?;
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::source_failed(self.name.clone(), e.to_string()))?;

        parse_response(&self.name, &body)
    }
}

/// PromQL for a query: the explicit expression, or `metric{k="v",...}`
pub fn render_promql(query: &MetricQuery) -> String {
    if let Some(expression) = &query.expression {
        return expression.clone();
    }
    if query.selector.is_empty() {
        return query.metric_name.clone();
    }
    let matchers = query
        .selector
        .iter()
        .map(|l| format!("{}=\"{}\"", l.key, l.value.replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",");
    format!("{}{{{}}}", query.metric_name, matchers)
}

#[async_trait]
impl DataProvider for PrometheusProvider {
    async fn query_time_series(
        &self,
        query: &MetricQuery,
        start: Timestamp,
        end: Timestamp,
        step: Duration,
    ) -> ProviderResult<Vec<TimeSeries>> {
        let params = [
            ("query", render_promql(query)),
            ("start", start.as_secs().to_string()),
            ("end", end.as_secs().to_string()),
            ("step", format!("{}s", step.as_secs().max(1))),
        ];
        self.get("/api/v1/query_range", &params).await
    }

    async fn query_latest_time_series(&self, query: &MetricQuery) -> ProviderResult<Vec<TimeSeries>> {
        let params = [("query", render_promql(query))];
        self.get("/api/v1/query", &params).await
    }
}

// ----------------------------------------------------------------------------
// Response Format
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: Option<PromData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Vec<PromSeries>,
}

#[derive(Debug, Deserialize)]
struct PromSeries {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    /// Matrix results
    #[serde(default)]
    values: Vec<(f64, String)>,
    /// Vector results
    #[serde(default)]
    value: Option<(f64, String)>,
}

/// Decode a Prometheus API response body into series
pub fn parse_response(source: &str, body: &str) -> ProviderResult<Vec<TimeSeries>> {
    let response: PromResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::invalid_response(source, e.to_string()))?;

    if response.status != "success" {
        return Err(ProviderError::source_failed(
            source,
            response.error.unwrap_or_else(|| response.status.clone()),
        ));
    }
    let data = response
        .data
        .ok_or_else(|| ProviderError::invalid_response(source, "missing data"))?;
    if data.result_type != "matrix" && data.result_type != "vector" {
        return Err(ProviderError::invalid_response(
            source,
            format!("unsupported result type '{}'", data.result_type),
        ));
    }

    let mut out = Vec::with_capacity(data.result.len());
    for series in data.result {
        let labels: Labels = series
            .metric
            .into_iter()
            .filter(|(k, _)| k != "__name__")
            .map(|(k, v)| Label::new(k, v))
            .collect();

        let mut samples = Vec::with_capacity(series.values.len() + 1);
        for (ts, raw) in series.values.into_iter().chain(series.value) {
            let value: f64 = raw
                .parse()
                .map_err(|_| ProviderError::invalid_response(source, format!("bad sample value '{raw}'")))?;
            if value.is_finite() {
                samples.push(Sample::new(value, Timestamp::from_secs(ts.floor() as i64)));
            }
        }
        if !samples.is_empty() {
            out.push(TimeSeries::with_samples(labels, samples));
        }
    }
    Ok(out)
}
