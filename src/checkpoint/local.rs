// ============================================================================
// SECTION: LOCAL FILESYSTEM BACKEND
// ============================================================================
// One JSON file per identifier, named by the hex content hash of the
// identifier. No index: a missing file means no checkpoint. Writes go to a
// temporary file that is then renamed over the target.
// ============================================================================

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{trace, warn};

use super::{CheckpointBackend, CheckpointRecord};
use crate::config::CheckpointConfig;
use crate::error::{CheckpointError, CheckpointResult};
use crate::types::content_hash;

#[derive(Debug)]
pub struct LocalBackend {
    directory: PathBuf,
    temp_counter: AtomicU64,
}

impl LocalBackend {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            temp_counter: AtomicU64::new(0),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path_for(&self, identifier: &str) -> PathBuf {
        self.directory.join(format!("{}.json", content_hash(identifier)))
    }
}

impl CheckpointBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn save(&self, record: &CheckpointRecord) -> CheckpointResult<()> {
        let key = &record.metric_identifier;
        let body = serde_json::to_vec_pretty(record).map_err(|e| CheckpointError::Serialization {
            key: key.clone(),
            message: e.to_string(),
        })?;

        fs::create_dir_all(&self.directory).map_err(|e| CheckpointError::backend(key, e.to_string()))?;
        let target = self.path_for(key);
        let temp = target.with_extension(format!("{}.tmp", self.temp_counter.fetch_add(1, Ordering::Relaxed)));

        fs::write(&temp, &body).map_err(|e| CheckpointError::backend(key, e.to_string()))?;
        if let Err(e) = fs::rename(&temp, &target) {
            let _ = fs::remove_file(&temp);
            return Err(CheckpointError::backend(key, e.to_string()));
        }
        trace!(target: "cerebro::checkpoint", signal = %key, path = %target.display(), "Checkpoint written");
        Ok(())
    }

    fn load(&self, identifier: &str) -> CheckpointResult<Option<CheckpointRecord>> {
        let path = self.path_for(identifier);
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CheckpointError::backend(identifier, e.to_string())),
        };
        let record: CheckpointRecord = serde_json::from_slice(&body).map_err(|e| CheckpointError::Serialization {
            key: identifier.to_string(),
            message: e.to_string(),
        })?;

        if record.metric_identifier != identifier {
            warn!(
                target: "cerebro::checkpoint",
                expected = %identifier,
                found = %record.metric_identifier,
                "Checkpoint file belongs to another identifier"
            );
            return Ok(None);
        }
        Ok(Some(record))
    }
}

pub(crate) fn factory(config: &CheckpointConfig) -> CheckpointResult<Arc<dyn CheckpointBackend>> {
    Ok(Arc::new(LocalBackend::new(&config.directory)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::tests::record;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_round_trip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().join("nested"));

        assert_eq!(backend.load("cpu|pod=web-0").unwrap(), None);
        backend.save(&record("cpu|pod=web-0")).unwrap();
        assert_eq!(backend.load("cpu|pod=web-0").unwrap(), Some(record("cpu|pod=web-0")));

        let path = backend.path_for("cpu|pod=web-0");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, format!("{}.json", content_hash("cpu|pod=web-0")));

        let mut updated = record("cpu|pod=web-0");
        updated.total_samples_count = 99;
        backend.save(&updated).unwrap();
        assert_eq!(backend.load("cpu|pod=web-0").unwrap().unwrap().total_samples_count, 99);

        let leftovers = fs::read_dir(backend.directory())
            .unwrap()
            .filter(|entry| entry.as_ref().unwrap().path().extension().map_or(false, |ext| ext == "tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        fs::write(backend.path_for("cpu|"), b"{not json").unwrap();
        assert!(matches!(
            backend.load("cpu|"),
            Err(CheckpointError::Serialization { .. })
        ));
    }
}
