// ============================================================================
// SECTION: FILE DATA PROVIDER
// ============================================================================
// Serves samples from a CSV file of `metric,timestamp,value,labels` rows,
// with labels written as `k=v;k2=v2`. Used for offline runs and replays.
// ============================================================================

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::DataProvider;
use crate::error::{ProviderError, ProviderResult};
use crate::types::{Label, Labels, LabelsExt, MetricQuery, Sample, TimeSeries, Timestamp};

/// In-memory series loaded from a CSV file
#[derive(Debug, Clone, Default)]
pub struct FileProvider {
    name: String,
    /// (metric, canonical labels) → series, samples sorted by time
    series: BTreeMap<(String, String), TimeSeries>,
}

impl FileProvider {
    pub fn load(path: impl AsRef<Path>) -> ProviderResult<Self> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProviderError::source_failed(name.clone(), e.to_string()))?;
        let provider = Self::parse(name, &text)?;
        info!(
            target: "cerebro::provider",
            source = %provider.name,
            series = provider.series.len(),
            "File source loaded"
        );
        Ok(provider)
    }

    /// Parse CSV text. Blank lines and lines starting with `#` are skipped.
    pub fn parse(name: impl Into<String>, text: &str) -> ProviderResult<Self> {
        let mut provider = Self {
            name: name.into(),
            series: BTreeMap::new(),
        };

        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (metric, sample, labels) = parse_row(line).map_err(|message| {
                ProviderError::invalid_response(provider.name.clone(), format!("line {}: {message}", line_no + 1))
            })?;
            provider.push(metric, labels, sample);
        }

        for series in provider.series.values_mut() {
            series.samples.sort_by_key(|s| s.timestamp);
            series.samples.dedup_by_key(|s| s.timestamp);
        }
        Ok(provider)
    }

    fn push(&mut self, metric: &str, labels: Labels, sample: Sample) {
        self.series
            .entry((metric.to_string(), labels.canonical()))
            .or_insert_with(|| TimeSeries::new(labels))
            .samples
            .push(sample);
    }

    fn matching<'a>(&'a self, query: &'a MetricQuery) -> impl Iterator<Item = &'a TimeSeries> + 'a {
        self.series
            .iter()
            .filter(move |((metric, _), series)| {
                metric == &query.metric_name && series.labels.matches(&query.selector)
            })
            .map(|(_, series)| series)
    }
}

fn parse_row(line: &str) -> Result<(&str, Sample, Labels), String> {
    let mut fields = line.splitn(4, ',');
    let metric = fields
        .next()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .ok_or("missing metric name")?;
    let timestamp = fields
        .next()
        .ok_or("missing timestamp")?
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("bad timestamp: {e}"))?;
    let value = fields
        .next()
        .ok_or("missing value")?
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("bad value: {e}"))?;

    let mut labels = Labels::new();
    if let Some(raw) = fields.next() {
        for pair in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("bad label '{pair}'"))?;
            labels.push(Label::new(key.trim(), value.trim()));
        }
    }

    Ok((metric, Sample::new(value, Timestamp::from_secs(timestamp)), labels))
}

#[async_trait]
impl DataProvider for FileProvider {
    async fn query_time_series(
        &self,
        query: &MetricQuery,
        start: Timestamp,
        end: Timestamp,
        _step: Duration,
    ) -> ProviderResult<Vec<TimeSeries>> {
        Ok(self
            .matching(query)
            .map(|series| {
                let samples = series
                    .samples
                    .iter()
                    .filter(|s| s.timestamp >= start && s.timestamp <= end)
                    .copied()
                    .collect();
                TimeSeries::with_samples(series.labels.clone(), samples)
            })
            .filter(|series| !series.is_empty())
            .collect())
    }

    async fn query_latest_time_series(&self, query: &MetricQuery) -> ProviderResult<Vec<TimeSeries>> {
        Ok(self
            .matching(query)
            .filter_map(|series| {
                series
                    .last_sample()
                    .map(|last| TimeSeries::with_samples(series.labels.clone(), vec![*last]))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CSV: &str = "\
# metric,timestamp,value,labels
cpu,120,0.5,pod=a;ns=prod
cpu,60,0.4,ns=prod;pod=a
cpu,60,2.0,pod=b;ns=dev
mem,60,100
";

    #[tokio::test]
    async fn test_range_and_selector() {
        let provider = FileProvider::parse("inline", CSV).unwrap();
        let query = MetricQuery::new("cpu").with_selector("ns", "prod");
        let series = provider
            .query_time_series(&query, Timestamp::from_secs(0), Timestamp::from_secs(600), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(series.len(), 1);
        let timestamps: Vec<i64> = series[0].samples.iter().map(|s| s.timestamp.as_secs()).collect();
        assert_eq!(timestamps, vec![60, 120]);

        let all = provider
            .query_latest_time_series(&MetricQuery::new("cpu"))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let unlabeled = provider
            .query_latest_time_series(&MetricQuery::new("mem"))
            .await
            .unwrap();
        assert_eq!(unlabeled[0].samples[0].value, 100.0);
        assert!(unlabeled[0].labels.is_empty());
    }

    #[test]
    fn test_bad_rows_are_reported_with_line() {
        let err = FileProvider::parse("inline", "cpu,abc,1\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
        let err = FileProvider::parse("inline", "cpu,1,1\ncpu,2,1,pod\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_load_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CSV.as_bytes()).unwrap();
        let provider = FileProvider::load(file.path()).unwrap();
        assert_eq!(provider.series.len(), 3);
        assert!(FileProvider::load("/nonexistent/cerebro.csv").is_err());
    }
}
