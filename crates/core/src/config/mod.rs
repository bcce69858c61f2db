use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::export::ExportSettings;
use crate::preview::PreviewSettings;
use crate::sanitize::RESERVED_NAMESPACE;
use crate::Result;

/// Top-level configuration structure for a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub engine: EngineConfig,
    /// Custom properties whose key starts with this prefix survive export.
    pub reserved_namespace: String,
    pub export: ExportSettings,
    pub preview: PreviewSettings,
    /// Scratch directory for engine scripts and documents. A fresh temporary
    /// directory is used when unset.
    pub work_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            reserved_namespace: RESERVED_NAMESPACE.to_string(),
            export: ExportSettings::default(),
            preview: PreviewSettings::default(),
            work_dir: None,
        }
    }
}

impl PipelineConfig {
    /// Reads a JSON configuration file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let config = serde_json::from_slice(&bytes)?;
        tracing::debug!(path = %path.display(), "loaded pipeline configuration");
        Ok(config)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.engine.timeout()
    }
}

/// Configuration specific to the external engine invocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound for a single engine call. `None` waits indefinitely.
    pub timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_secs: Some(600),
        }
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"engine": {"timeout_secs": 30}}"#).unwrap();

        let config = PipelineConfig::load(&path).unwrap();

        assert_eq!(config.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.reserved_namespace, RESERVED_NAMESPACE);
        assert_eq!(config.export, ExportSettings::default());
    }

    #[test]
    fn zero_timeout_means_no_limit() {
        let engine = EngineConfig {
            timeout_secs: Some(0),
        };
        assert_eq!(engine.timeout(), None);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(PipelineConfig::load(&path).is_err());
    }
}
