//! In-process checkpoint backend. State lives as long as the process.

use std::sync::Arc;

use dashmap::DashMap;

use super::{CheckpointBackend, CheckpointRecord};
use crate::config::CheckpointConfig;
use crate::error::CheckpointResult;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: DashMap<String, CheckpointRecord>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl CheckpointBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn save(&self, record: &CheckpointRecord) -> CheckpointResult<()> {
        self.records.insert(record.metric_identifier.clone(), record.clone());
        Ok(())
    }

    fn load(&self, identifier: &str) -> CheckpointResult<Option<CheckpointRecord>> {
        Ok(self.records.get(identifier).map(|r| r.value().clone()))
    }
}

pub(crate) fn factory(_: &CheckpointConfig) -> CheckpointResult<Arc<dyn CheckpointBackend>> {
    Ok(Arc::new(MemoryBackend::new()))
}

/// Backend whose every operation fails
#[cfg(test)]
pub(crate) struct FailingBackend;

#[cfg(test)]
impl CheckpointBackend for FailingBackend {
    fn name(&self) -> &str {
        "failing"
    }

    fn save(&self, record: &CheckpointRecord) -> CheckpointResult<()> {
        Err(crate::error::CheckpointError::backend(&record.metric_identifier, "disk on fire"))
    }

    fn load(&self, identifier: &str) -> CheckpointResult<Option<CheckpointRecord>> {
        Err(crate::error::CheckpointError::backend(identifier, "disk on fire"))
    }
}
