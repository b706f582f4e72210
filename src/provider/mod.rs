// ============================================================================
// SECTION: DATA PROVIDERS
// ============================================================================
// Sources of historical and realtime samples. Algorithms talk to a
// `DataProviderProxy` per role, which forwards to an ordered list of named
// sources and answers with the first successful non-empty result.
// ============================================================================

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ProviderKind, ProviderSourceConfig};
use crate::error::{ConfigError, PredictorResult, ProviderError, ProviderResult};
use crate::types::{MetricQuery, TimeSeries, Timestamp};

pub mod file;
#[cfg(feature = "prometheus-provider")]
pub mod prometheus;

pub use file::FileProvider;
#[cfg(feature = "prometheus-provider")]
pub use prometheus::PrometheusProvider;

// ----------------------------------------------------------------------------
// Provider Trait
// ----------------------------------------------------------------------------

/// A source of metric samples.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// All series of `query` with samples in `[start, end]` at `step` resolution
    async fn query_time_series(
        &self,
        query: &MetricQuery,
        start: Timestamp,
        end: Timestamp,
        step: Duration,
    ) -> ProviderResult<Vec<TimeSeries>>;

    /// The most recent sample of every series of `query`
    async fn query_latest_time_series(&self, query: &MetricQuery) -> ProviderResult<Vec<TimeSeries>>;
}

/// Which data an algorithm reads from a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderRole {
    History,
    Realtime,
}

impl ProviderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderRole::History => "history",
            ProviderRole::Realtime => "realtime",
        }
    }
}

impl fmt::Display for ProviderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Providers handed to an algorithm, by role
pub type ProviderBindings = HashMap<ProviderRole, Arc<dyn DataProvider>>;

// ----------------------------------------------------------------------------
// Provider Proxy
// ----------------------------------------------------------------------------

#[derive(Clone)]
struct NamedSource {
    name: String,
    provider: Arc<dyn DataProvider>,
}

/// Ordered set of named sources for one role. The source list is swapped
/// atomically, so in-flight queries keep the list they started with.
pub struct DataProviderProxy {
    role: ProviderRole,
    sources: ArcSwap<Vec<NamedSource>>,
}

impl DataProviderProxy {
    pub fn new(role: ProviderRole) -> Self {
        Self {
            role,
            sources: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn role(&self) -> ProviderRole {
        self.role
    }

    /// Add a source at the lowest priority. A source with the same name is
    /// replaced in place.
    pub fn add_source(&self, name: impl Into<String>, provider: Arc<dyn DataProvider>) {
        let name = name.into();
        self.sources.rcu(|current| {
            let mut next = Vec::clone(current);
            let source = NamedSource {
                name: name.clone(),
                provider: Arc::clone(&provider),
            };
            match next.iter_mut().find(|s| s.name == name) {
                Some(existing) => *existing = source,
                None => next.push(source),
            }
            next
        });
        info!(
            target: "cerebro::provider",
            role = %self.role,
            source = %name,
            "Data source added"
        );
    }

    /// Remove a source by name. Returns false if it was not present.
    pub fn remove_source(&self, name: &str) -> bool {
        let previous = self.sources.rcu(|current| {
            current
                .iter()
                .filter(|s| s.name != name)
                .cloned()
                .collect::<Vec<_>>()
        });
        let removed = previous.iter().any(|s| s.name == name);
        if removed {
            info!(target: "cerebro::provider", role = %self.role, source = %name, "Data source removed");
        }
        removed
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.load().iter().map(|s| s.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.load().is_empty()
    }

    /// Install every source of a config section, in order
    pub fn install(&self, sources: &[ProviderSourceConfig]) -> PredictorResult<()> {
        for source in sources {
            self.add_source(source.name.clone(), build_source(source)?);
        }
        Ok(())
    }

    fn snapshot(&self) -> ProviderResult<Arc<Vec<NamedSource>>> {
        let sources = self.sources.load_full();
        if sources.is_empty() {
            return Err(ProviderError::NoSources {
                role: self.role.to_string(),
            });
        }
        Ok(sources)
    }
}

/// Outcome folding shared by both proxy queries: first non-empty answer
/// wins, all-empty is an empty answer, all-failed is the last error.
struct FirstAnswer {
    any_ok: bool,
    last_error: Option<ProviderError>,
}

impl FirstAnswer {
    fn new() -> Self {
        Self {
            any_ok: false,
            last_error: None,
        }
    }

    fn offer(&mut self, role: ProviderRole, source: &str, result: ProviderResult<Vec<TimeSeries>>) -> Option<Vec<TimeSeries>> {
        match result {
            Ok(series) if !series.is_empty() => Some(series),
            Ok(_) => {
                debug!(target: "cerebro::provider", role = %role, source = %source, "Source returned no series");
                self.any_ok = true;
                None
            }
            Err(e) => {
                warn!(target: "cerebro::provider", role = %role, source = %source, error = %e, "Source failed");
                self.last_error = Some(e);
                None
            }
        }
    }

    fn finish(self) -> ProviderResult<Vec<TimeSeries>> {
        match (self.any_ok, self.last_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl DataProvider for DataProviderProxy {
    async fn query_time_series(
        &self,
        query: &MetricQuery,
        start: Timestamp,
        end: Timestamp,
        step: Duration,
    ) -> ProviderResult<Vec<TimeSeries>> {
        let sources = self.snapshot()?;
        let mut answer = FirstAnswer::new();
        for source in sources.iter() {
            let result = source.provider.query_time_series(query, start, end, step).await;
            if let Some(series) = answer.offer(self.role, &source.name, result) {
                return Ok(series);
            }
        }
        answer.finish()
    }

    async fn query_latest_time_series(&self, query: &MetricQuery) -> ProviderResult<Vec<TimeSeries>> {
        let sources = self.snapshot()?;
        let mut answer = FirstAnswer::new();
        for source in sources.iter() {
            let result = source.provider.query_latest_time_series(query).await;
            if let Some(series) = answer.offer(self.role, &source.name, result) {
                return Ok(series);
            }
        }
        answer.finish()
    }
}

impl fmt::Debug for DataProviderProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataProviderProxy")
            .field("role", &self.role)
            .field("sources", &self.source_names())
            .finish()
    }
}

/// Build a concrete source from its config entry
pub fn build_source(config: &ProviderSourceConfig) -> PredictorResult<Arc<dyn DataProvider>> {
    match config.kind {
        ProviderKind::File => {
            let path = config.path.as_deref().ok_or_else(|| {
                ConfigError::invalid_value(format!("{}.path", config.name), "file sources need a path")
            })?;
            Ok(Arc::new(FileProvider::load(path)?))
        }
        #[cfg(feature = "prometheus-provider")]
        ProviderKind::Prometheus => {
            let url = config.url.as_deref().ok_or_else(|| {
                ConfigError::invalid_value(format!("{}.url", config.name), "prometheus sources need a url")
            })?;
            Ok(Arc::new(PrometheusProvider::new(
                config.name.clone(),
                url,
                Duration::from_secs(config.timeout_secs),
            )?))
        }
        #[cfg(not(feature = "prometheus-provider"))]
        ProviderKind::Prometheus => Err(ConfigError::invalid_value(
            format!("{}.kind", config.name),
            "built without the prometheus-provider feature",
        )
        .into()),
    }
}
