//! Orchestration: load the input recording, run the configured step
//! sequence, persist the run manifest.

use crate::config::{TaskConfig, TaskKind};
use crate::context::{StepError, StepOutcome, TaskContext};
use crate::metadata::RunMetadata;
use anyhow::{bail, Context, Result};
use log::{error, info};
use serde_json::json;
use slate_lib::io::{load_edf_recording, load_matrix_recording, read_recording};
use slate_lib::Recording;
use std::fs;
use std::path::{Path, PathBuf};

type StepFn = fn(&mut Task) -> Result<StepOutcome, StepError>;

pub struct Task {
    pub(crate) config: TaskConfig,
    pub(crate) context: TaskContext,
    pub(crate) metadata: RunMetadata,
    pub(crate) base: String,
    pub(crate) derivatives_dir: PathBuf,
}

impl Task {
    pub fn new(config: TaskConfig, input: &Path) -> Result<Self> {
        Self::new_with_rate(config, input, None)
    }

    /// `sfreq` is only consulted for bare matrix inputs; EDF and container
    /// inputs carry their own sampling rate.
    pub fn new_with_rate(config: TaskConfig, input: &Path, sfreq: Option<f64>) -> Result<Self> {
        config.validate()?;
        let recording = load_recording(input, sfreq)
            .with_context(|| format!("failed to load {}", input.display()))?;
        info!(
            "loaded {} channels at {} Hz ({:.1} s) from {}",
            recording.n_channels(),
            recording.fs,
            recording.duration(),
            input.display()
        );
        let base = input
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_string)
            .with_context(|| format!("input path {} has no file stem", input.display()))?;
        let derivatives_dir = config.output.derivatives_dir.clone();
        fs::create_dir_all(&derivatives_dir)
            .with_context(|| format!("failed to create {}", derivatives_dir.display()))?;
        let metadata = RunMetadata::new(config.task.as_str(), &input.display().to_string());
        Ok(Self {
            config,
            context: TaskContext::with_raw(recording),
            metadata,
            base,
            derivatives_dir,
        })
    }

    /// Run the task's step sequence. The manifest is written even when a
    /// step fails; the first step error is then propagated.
    pub fn run(&mut self) -> Result<()> {
        let outcome = self.run_steps();
        let manifest = self
            .metadata
            .write_manifest(&self.derivatives_dir, &self.base);
        match (outcome, manifest) {
            (Ok(()), Ok(path)) => {
                info!("run complete, manifest at {}", path.display());
                Ok(())
            }
            (Ok(()), Err(err)) => Err(err),
            (Err(step_err), manifest_result) => {
                if let Err(err) = manifest_result {
                    error!("could not write the run manifest: {err:#}");
                }
                Err(step_err)
            }
        }
    }

    fn run_steps(&mut self) -> Result<()> {
        for (name, step) in sequence(self.config.task) {
            match step(self) {
                Ok(StepOutcome::Completed) => {}
                Ok(StepOutcome::Skipped) => {
                    self.metadata.record_step(name, json!({ "skipped": true }));
                }
                Err(step_err) => {
                    let err = anyhow::Error::new(step_err);
                    error!("step {name} failed: {err:#}");
                    self.metadata
                        .record_step(name, json!({ "error": format!("{err:#}") }));
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn derivatives_dir(&self) -> &Path {
        &self.derivatives_dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.derivatives_dir
            .join(format!("{}_run_manifest.json", self.base))
    }

    /// Per-step artifact directory, created on first use.
    pub(crate) fn step_dir(&self, step: &'static str) -> Result<PathBuf, StepError> {
        let dir = self.derivatives_dir.join(step);
        fs::create_dir_all(&dir).map_err(|err| {
            StepError::failed(
                step,
                anyhow::Error::new(err).context(format!("failed to create {}", dir.display())),
            )
        })?;
        Ok(dir)
    }

    pub(crate) fn artifact_path(&self, dir: &Path, suffix: &str) -> PathBuf {
        dir.join(format!("{}_{}", self.base, suffix))
    }
}

fn sequence(kind: TaskKind) -> Vec<(&'static str, StepFn)> {
    let steps: Vec<(&'static str, StepFn)> = match kind {
        TaskKind::RestingSourcePsd => vec![
            ("line_noise", Task::apply_line_noise),
            ("wavelet_threshold", Task::apply_wavelet_threshold),
            ("epoching", Task::create_epochs),
            ("reject_epochs", Task::apply_reject_epochs),
            ("source_localization", Task::apply_source_localization),
            ("source_psd", Task::apply_source_psd),
            ("aperiodic_fit", Task::apply_aperiodic_fit),
            ("periodic_fit", Task::apply_periodic_fit),
        ],
        TaskKind::SourceAnalysis => vec![
            ("source_localization", Task::apply_source_localization),
            ("source_psd", Task::apply_source_psd),
            ("connectivity", Task::apply_connectivity),
        ],
        TaskKind::LineNoiseCheck => vec![
            ("line_noise", Task::apply_line_noise),
            ("epoching", Task::create_epochs),
            ("reject_epochs", Task::apply_reject_epochs),
        ],
    };
    steps
}

/// Load an input recording by extension: EDF carries its own metadata, a
/// TSV with a JSON sidecar is a signal container, anything else is a bare
/// numeric matrix needing an explicit sampling rate.
pub fn load_recording(path: &Path, sfreq: Option<f64>) -> Result<Recording> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "edf" => load_edf_recording(path),
        "tsv" if path.with_extension("json").is_file() => {
            let (recording, _) = read_recording(path)?;
            Ok(recording)
        }
        "tsv" | "csv" | "txt" => {
            let fs = sfreq.context("matrix input needs a sampling rate, pass --sfreq")?;
            load_matrix_recording(path, fs)
        }
        other => bail!(
            "unsupported input extension {other:?} for {}",
            path.display()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LineNoiseParams, StepConfig};
    use crate::metadata::read_manifest;
    use slate_lib::io::{write_recording, ContainerKind};

    fn sine(fs: f64, freq: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / fs).sin())
            .collect()
    }

    fn write_input(dir: &Path, n_channels: usize) -> PathBuf {
        let fs = 256.0;
        let n = 256 * 4;
        let recording = Recording {
            fs,
            channels: (0..n_channels).map(|i| format!("ch{:02}", i + 1)).collect(),
            data: (0..n_channels)
                .map(|i| sine(fs, 10.0 + i as f64, n))
                .collect(),
        };
        let path = dir.join("subject01.tsv");
        write_recording(&recording, &path, ContainerKind::Raw, None).unwrap();
        path
    }

    fn check_config(derivatives: &Path) -> TaskConfig {
        let mut config = crate::presets::default_config(TaskKind::LineNoiseCheck);
        config.output.derivatives_dir = derivatives.to_path_buf();
        config
    }

    #[test]
    fn all_disabled_steps_are_listed_as_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), 2);
        let mut config = check_config(&dir.path().join("derivatives"));
        config.steps = Default::default();
        let mut task = Task::new(config, &input).unwrap();
        task.run().unwrap();
        let manifest = read_manifest(&task.manifest_path()).unwrap();
        for step in ["line_noise", "epoching", "reject_epochs"] {
            let entry = manifest
                .steps
                .get(&format!("step_{step}"))
                .unwrap_or_else(|| panic!("no manifest entry for {step}"));
            assert_eq!(entry["skipped"], json!(true));
        }
    }

    #[test]
    fn manifest_survives_a_failing_step() {
        let dir = tempfile::tempdir().unwrap();
        // One channel is not enough for spatial line removal.
        let input = write_input(dir.path(), 1);
        let mut config = check_config(&dir.path().join("derivatives"));
        config.steps = Default::default();
        config.steps.line_noise = StepConfig::Enabled(LineNoiseParams::default());
        let mut task = Task::new(config, &input).unwrap();
        let err = task.run().unwrap_err();
        assert!(format!("{err:#}").contains("line_noise"));
        let manifest = read_manifest(&task.manifest_path()).unwrap();
        let entry = manifest.steps.get("step_line_noise").unwrap();
        assert!(entry["error"].as_str().unwrap().contains("channel"));
    }

    #[test]
    fn matrix_input_without_a_rate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.csv");
        std::fs::write(&path, "0.1,0.2\n0.3,0.4\n").unwrap();
        let err = load_recording(&path, None).unwrap_err();
        assert!(format!("{err:#}").contains("--sfreq"));
    }

    #[test]
    fn container_input_carries_its_own_rate() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), 2);
        let recording = load_recording(&input, None).unwrap();
        assert_eq!(recording.fs, 256.0);
        assert_eq!(recording.n_channels(), 2);
    }
}
