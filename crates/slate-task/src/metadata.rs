//! Run provenance. Every step appends what it did and the summary numbers;
//! the manifest is written even when a run fails partway.

use crate::config::SCHEMA_VERSION;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub schema_version: u32,
    pub task: String,
    pub input_file: String,
    pub started_unix: f64,
    pub steps: BTreeMap<String, serde_json::Value>,
}

impl RunMetadata {
    pub fn new(task: &str, input_file: &str) -> Self {
        let started_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            schema_version: SCHEMA_VERSION,
            task: task.to_string(),
            input_file: input_file.to_string(),
            started_unix,
            steps: BTreeMap::new(),
        }
    }

    /// Record one step under `step_<name>`, replacing any earlier record.
    pub fn record_step(&mut self, name: &str, value: serde_json::Value) {
        self.steps.insert(format!("step_{name}"), value);
    }

    pub fn write_manifest(&self, dir: &Path, base: &str) -> Result<PathBuf> {
        let path = dir.join(format!("{base}_run_manifest.json"));
        let file = fs::File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, self)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}

pub fn read_manifest(path: &Path) -> Result<RunMetadata> {
    let file =
        fs::File::open(path).with_context(|| format!("opening manifest {}", path.display()))?;
    let metadata = serde_json::from_reader::<_, RunMetadata>(file)
        .with_context(|| format!("parsing manifest {}", path.display()))?;
    Ok(metadata)
}
