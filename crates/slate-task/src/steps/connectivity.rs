//! Sensorimotor connectivity matrices and graph metrics from the
//! continuous source estimate.

use crate::config::StepConfig;
use crate::context::{StepError, StepOutcome};
use crate::task::Task;
use anyhow::{Context, Result};
use log::{error, info, warn};
use nalgebra::DMatrix;
use serde_json::json;
use slate_lib::connectivity::{connectivity_matrix, graph_metrics, sample_epochs, GraphMetrics};
use slate_lib::io::{Column, Frame};
use slate_lib::{default_bands, Recording};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

const STEP: &str = "connectivity";

impl Task {
    pub(crate) fn apply_connectivity(&mut self) -> Result<StepOutcome, StepError> {
        let params = match &self.config.steps.connectivity {
            StepConfig::Disabled => {
                info!("connectivity step is disabled");
                return Ok(StepOutcome::Skipped);
            }
            StepConfig::Enabled(params) => params.clone(),
        };
        let source = self.context.connectivity_input(STEP)?;
        let mut data = Vec::with_capacity(params.rois.len());
        for name in &params.rois {
            match source.recording.channel(name) {
                Some(signal) => data.push(signal.to_vec()),
                None => {
                    return Err(StepError::invalid(
                        STEP,
                        format!("ROI {name} is not in the source estimate"),
                    ))
                }
            }
        }
        let rois = Recording {
            fs: source.recording.fs,
            channels: params.rois.clone(),
            data,
        };
        let epochs = sample_epochs(&rois, params.epoch_length, params.n_epochs, params.seed)
            .map_err(|err| StepError::failed(STEP, err))?;
        let n_used = epochs.n_epochs();
        if n_used < params.n_epochs {
            warn!(
                "only {} of {} requested epochs fit the recording",
                n_used, params.n_epochs
            );
        }
        info!(
            "connectivity over {} ROIs, {} epochs of {} s, {} methods",
            rois.n_channels(),
            n_used,
            params.epoch_length,
            params.methods.len()
        );

        let bands = default_bands();
        let dir = self.step_dir(STEP)?;
        let mut log_lines = vec![stamp(format!(
            "selected {} ROIs, sampled {} epochs of {} s",
            rois.n_channels(),
            n_used,
            params.epoch_length
        ))];
        let mut summary = SummaryRows::default();
        let mut metric_rows = MetricRows::default();
        let mut n_skipped = 0usize;
        for &method in &params.methods {
            for band in &bands {
                let label = format!("{} {}", method.as_str(), band.name);
                let matrix = match connectivity_matrix(&epochs, method, (band.lo, band.hi)) {
                    Ok(matrix) => matrix,
                    Err(err) => {
                        error!("{label} failed: {err:#}");
                        log_lines.push(stamp(format!("{label} skipped: {err:#}")));
                        n_skipped += 1;
                        continue;
                    }
                };
                let matrix_csv = self.artifact_path(
                    &dir,
                    &format!("{}_{}_matrix.csv", method.as_str(), band.name),
                );
                write_matrix(&matrix_csv, &rois.channels, &matrix)
                    .map_err(|err| StepError::failed(STEP, err))?;
                summary.extend(&self.base, method.as_str(), &band.name, &rois.channels, &matrix);
                match graph_metrics(&matrix) {
                    Ok(metrics) => {
                        metric_rows.push(&self.base, method.as_str(), &band.name, &metrics)
                    }
                    Err(err) => {
                        warn!("graph metrics for {label} failed: {err:#}");
                        log_lines.push(stamp(format!("{label} graph metrics failed: {err:#}")));
                        metric_rows.push_nan(&self.base, method.as_str(), &band.name);
                    }
                }
                log_lines.push(stamp(format!("{label} done")));
            }
        }

        let summary_csv = self.artifact_path(&dir, "connectivity_summary.csv");
        summary
            .into_frame()
            .and_then(|frame| {
                frame
                    .write_csv(&summary_csv)
                    .with_context(|| format!("failed to write {}", summary_csv.display()))
            })
            .map_err(|err| StepError::failed(STEP, err))?;
        let metrics_csv = self.artifact_path(&dir, "graph_metrics.csv");
        metric_rows
            .into_frame()
            .and_then(|frame| {
                frame
                    .write_csv(&metrics_csv)
                    .with_context(|| format!("failed to write {}", metrics_csv.display()))
            })
            .map_err(|err| StepError::failed(STEP, err))?;
        let log_path = self.artifact_path(&dir, "connectivity_log.txt");
        std::fs::write(&log_path, log_lines.join("\n") + "\n")
            .with_context(|| format!("failed to write {}", log_path.display()))
            .map_err(|err| StepError::failed(STEP, err))?;

        let n = rois.n_channels();
        self.metadata.record_step(
            STEP,
            json!({
                "n_pairs": n * (n - 1) / 2,
                "methods": params.methods.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
                "bands": bands.iter().map(|b| b.name.clone()).collect::<Vec<_>>(),
                "n_epochs_used": n_used,
                "n_skipped": n_skipped,
            }),
        );
        Ok(StepOutcome::Completed)
    }
}

fn stamp(message: String) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    format!("[{now:.3}] {message}")
}

/// ROI-labelled square matrix: a `roi` column plus one column per ROI.
fn write_matrix(path: &Path, rois: &[String], matrix: &DMatrix<f64>) -> Result<()> {
    let mut frame = Frame::new();
    frame.push("roi", Column::Str(rois.to_vec()))?;
    for (j, roi) in rois.iter().enumerate() {
        let column = (0..rois.len()).map(|i| matrix[(i, j)]).collect();
        frame.push(roi.clone(), Column::Float(column))?;
    }
    frame
        .write_csv(path)
        .with_context(|| format!("failed to write {}", path.display()))
}

#[derive(Default)]
struct SummaryRows {
    subject: Vec<String>,
    method: Vec<String>,
    band: Vec<String>,
    roi1: Vec<String>,
    roi2: Vec<String>,
    connectivity: Vec<f64>,
}

impl SummaryRows {
    /// Lower triangle only; the matrices are symmetric with a zero diagonal.
    fn extend(
        &mut self,
        subject: &str,
        method: &str,
        band: &str,
        rois: &[String],
        matrix: &DMatrix<f64>,
    ) {
        for i in 0..rois.len() {
            for j in 0..i {
                self.subject.push(subject.to_string());
                self.method.push(method.to_string());
                self.band.push(band.to_string());
                self.roi1.push(rois[i].clone());
                self.roi2.push(rois[j].clone());
                self.connectivity.push(matrix[(i, j)]);
            }
        }
    }

    fn into_frame(self) -> Result<Frame> {
        let mut frame = Frame::new();
        frame.push("subject", Column::Str(self.subject))?;
        frame.push("method", Column::Str(self.method))?;
        frame.push("band", Column::Str(self.band))?;
        frame.push("roi1", Column::Str(self.roi1))?;
        frame.push("roi2", Column::Str(self.roi2))?;
        frame.push("connectivity", Column::Float(self.connectivity))?;
        Ok(frame)
    }
}

#[derive(Default)]
struct MetricRows {
    subject: Vec<String>,
    method: Vec<String>,
    band: Vec<String>,
    values: Vec<[f64; 7]>,
}

impl MetricRows {
    fn push(&mut self, subject: &str, method: &str, band: &str, metrics: &GraphMetrics) {
        self.subject.push(subject.to_string());
        self.method.push(method.to_string());
        self.band.push(band.to_string());
        self.values.push([
            metrics.clustering,
            metrics.global_efficiency,
            metrics.char_path_length,
            metrics.modularity,
            metrics.strength,
            metrics.assortativity,
            metrics.small_worldness,
        ]);
    }

    fn push_nan(&mut self, subject: &str, method: &str, band: &str) {
        self.subject.push(subject.to_string());
        self.method.push(method.to_string());
        self.band.push(band.to_string());
        self.values.push([f64::NAN; 7]);
    }

    fn into_frame(self) -> Result<Frame> {
        const NAMES: [&str; 7] = [
            "clustering",
            "global_efficiency",
            "char_path_length",
            "modularity",
            "strength",
            "assortativity",
            "small_worldness",
        ];
        let mut frame = Frame::new();
        frame.push("subject", Column::Str(self.subject))?;
        frame.push("method", Column::Str(self.method))?;
        frame.push("band", Column::Str(self.band))?;
        for (k, name) in NAMES.iter().enumerate() {
            let column = self.values.iter().map(|row| row[k]).collect();
            frame.push(*name, Column::Float(column))?;
        }
        Ok(frame)
    }
}
