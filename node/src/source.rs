use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::debug;
use trustmesh_consensus::StateSource;
use trustmesh_types::StateMetrics;

/// Reads the local metrics from a JSON object such as
/// `{"coherence": 0.8, "entropy": 0.2}`. Missing fields are zero.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StateSource for JsonFileSource {
    fn current_metrics(&self) -> Result<Option<StateMetrics>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no metrics file yet");
                return Ok(None);
            }
            Err(err) => return Err(err).with_context(|| format!("reading {}", self.path.display())),
        };
        let metrics: StateMetrics = serde_json::from_str(&raw)
            .with_context(|| format!("parsing metrics from {}", self.path.display()))?;
        Ok(Some(metrics))
    }
}
