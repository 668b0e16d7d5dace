//! Welch spectra of the region time courses.

use crate::config::StepConfig;
use crate::context::{RoiPsd, SourceInput, StepError, StepOutcome};
use crate::report::render_page;
use crate::task::Task;
use anyhow::{Context, Result};
use log::info;
use serde_json::json;
use slate_lib::io::{Column, Frame};
use slate_lib::plot::{band_power_figure, psd_figure, psd_overlay_figure, Figure};
use slate_lib::sourcespace::sensorimotor_rois;
use slate_lib::spectral::{
    band_power, welch_psd_epochs, welch_psd_matrix, Psd, WelchOptions,
};
use slate_lib::{default_bands, FrequencyBand};
use std::path::Path;

const STEP: &str = "source_psd";

impl Task {
    pub(crate) fn apply_source_psd(&mut self) -> Result<StepOutcome, StepError> {
        let params = match &self.config.steps.source_psd {
            StepConfig::Disabled => {
                info!("source_psd step is disabled");
                return Ok(StepOutcome::Skipped);
            }
            StepConfig::Enabled(params) => params.clone(),
        };
        let opts = WelchOptions {
            segment_s: params.segment_duration,
            overlap: params.segment_overlap,
        };
        let (rois, freqs, rows) = match self.context.source_input(STEP)? {
            SourceInput::Epochs(roi) => {
                let (freqs, rows) = welch_psd_epochs(&roi.epochs, &opts)
                    .map_err(|err| StepError::failed(STEP, err))?;
                (roi.epochs.channels.clone(), freqs, rows)
            }
            SourceInput::Raw(roi) => {
                let (freqs, rows) = welch_psd_matrix(&roi.recording, &opts)
                    .map_err(|err| StepError::failed(STEP, err))?;
                (roi.recording.channels.clone(), freqs, rows)
            }
        };
        let keep: Vec<usize> = freqs
            .iter()
            .enumerate()
            .filter(|(_, &f)| f >= params.fmin && f <= params.fmax)
            .map(|(i, _)| i)
            .collect();
        if keep.is_empty() {
            return Err(StepError::invalid(
                STEP,
                format!(
                    "no frequency bins inside {}-{} Hz at this segment length",
                    params.fmin, params.fmax
                ),
            ));
        }
        let freqs: Vec<f64> = keep.iter().map(|&i| freqs[i]).collect();
        let rows: Vec<Vec<f64>> = rows
            .iter()
            .map(|row| keep.iter().map(|&i| row[i]).collect())
            .collect();
        info!(
            "spectra for {} regions, {} bins in {}-{} Hz",
            rois.len(),
            freqs.len(),
            params.fmin,
            params.fmax
        );

        let bands = default_bands();
        let dir = self.step_dir(STEP)?;
        let parquet = self.artifact_path(&dir, "roi_psd.parquet");
        long_psd_frame(&rois, &freqs, &rows)
            .and_then(|frame| {
                frame
                    .write_parquet(&parquet)
                    .with_context(|| format!("failed to write {}", parquet.display()))
            })
            .map_err(|err| StepError::failed(STEP, err))?;
        let bands_csv = self.artifact_path(&dir, "band_powers.csv");
        band_power_frame(&rois, &freqs, &rows, &bands)
            .and_then(|frame| {
                frame
                    .write_csv(&bands_csv)
                    .with_context(|| format!("failed to write {}", bands_csv.display()))
            })
            .map_err(|err| StepError::failed(STEP, err))?;
        let overview = self.artifact_path(&dir, "psd_overview.png");
        write_overview(&overview, &rois, &freqs, &rows, &bands)
            .map_err(|err| StepError::failed(STEP, err))?;

        self.metadata.record_step(
            STEP,
            json!({
                "n_rois": rois.len(),
                "n_freqs": freqs.len(),
                "fmin": params.fmin,
                "fmax": params.fmax,
                "segment_duration": params.segment_duration,
                "segment_overlap": params.segment_overlap,
                "bands": bands.iter().map(|b| b.name.clone()).collect::<Vec<_>>(),
            }),
        );
        self.context.roi_psd = Some(RoiPsd {
            freqs,
            rois,
            psd: rows,
        });
        Ok(StepOutcome::Completed)
    }
}

/// Long-format table: one row per region and frequency bin.
fn long_psd_frame(rois: &[String], freqs: &[f64], rows: &[Vec<f64>]) -> Result<Frame> {
    let mut roi_col = Vec::with_capacity(rois.len() * freqs.len());
    let mut freq_col = Vec::with_capacity(rois.len() * freqs.len());
    let mut psd_col = Vec::with_capacity(rois.len() * freqs.len());
    for (roi, row) in rois.iter().zip(rows) {
        for (&freq, &power) in freqs.iter().zip(row) {
            roi_col.push(roi.clone());
            freq_col.push(freq);
            psd_col.push(power);
        }
    }
    let mut frame = Frame::new();
    frame.push("roi", Column::Str(roi_col))?;
    frame.push("freq_hz", Column::Float(freq_col))?;
    frame.push("psd_uv2_per_hz", Column::Float(psd_col))?;
    Ok(frame)
}

/// Wide table: one row per region, one column per frequency band.
fn band_power_frame(
    rois: &[String],
    freqs: &[f64],
    rows: &[Vec<f64>],
    bands: &[FrequencyBand],
) -> Result<Frame> {
    let mut frame = Frame::new();
    frame.push("roi", Column::Str(rois.to_vec()))?;
    for band in bands {
        let powers = rows
            .iter()
            .map(|row| {
                band_power(
                    &Psd {
                        freqs: freqs.to_vec(),
                        power: row.clone(),
                    },
                    band.lo,
                    band.hi,
                )
            })
            .collect();
        frame.push(band.name.clone(), Column::Float(powers))?;
    }
    Ok(frame)
}

fn write_overview(
    path: &Path,
    rois: &[String],
    freqs: &[f64],
    rows: &[Vec<f64>],
    bands: &[FrequencyBand],
) -> Result<()> {
    let psd_of = |row: &[f64]| Psd {
        freqs: freqs.to_vec(),
        power: row.to_vec(),
    };
    let all: Vec<(String, Psd)> = rois
        .iter()
        .zip(rows)
        .map(|(roi, row)| (roi.clone(), psd_of(row)))
        .collect();
    let n = rows.len().max(1) as f64;
    let mean = Psd {
        freqs: freqs.to_vec(),
        power: (0..freqs.len())
            .map(|i| rows.iter().map(|row| row[i]).sum::<f64>() / n)
            .collect(),
    };
    let band_bars: Vec<(String, f64)> = bands
        .iter()
        .map(|band| (band.name.clone(), band_power(&mean, band.lo, band.hi)))
        .collect();
    let selected_names = sensorimotor_rois();
    let selected: Vec<(String, Psd)> = all
        .iter()
        .filter(|(roi, _)| selected_names.contains(roi))
        .cloned()
        .collect();
    let panels: Vec<Figure> = vec![
        psd_overlay_figure("all regions", &all),
        psd_figure("grand average", "mean", &mean),
        band_power_figure("band powers (grand average)", &band_bars),
        psd_overlay_figure("sensorimotor regions", &selected),
    ];
    render_page(path, &panels).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskKind;
    use crate::context::{RoiRecording, TaskContext};
    use crate::metadata::RunMetadata;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use slate_lib::sourcespace::RegionInfo;
    use slate_lib::Recording;
    use std::f64::consts::PI;

    fn roi_recording() -> RoiRecording {
        let fs = 100.0;
        let n = 100 * 60;
        let names = [
            "precentral-lh",
            "precentral-rh",
            "bankssts-lh",
            "bankssts-rh",
        ];
        let mut rng = StdRng::seed_from_u64(3);
        let data = (0..names.len())
            .map(|_| {
                (0..n)
                    .map(|i| {
                        let t = i as f64 / fs;
                        3.0 * (2.0 * PI * 10.0 * t).sin() + rng.gen_range(-0.5..0.5)
                    })
                    .collect()
            })
            .collect();
        let regions = names
            .iter()
            .map(|full| {
                let (base, hemisphere) = full.rsplit_once('-').unwrap();
                RegionInfo {
                    name: base.to_string(),
                    hemisphere: hemisphere.to_string(),
                    n_vertices: 5,
                }
            })
            .collect();
        RoiRecording {
            recording: Recording {
                fs,
                channels: names.iter().map(|s| s.to_string()).collect(),
                data,
            },
            regions,
        }
    }

    fn task_with(context: TaskContext, dir: &std::path::Path) -> Task {
        let mut config = crate::presets::default_config(TaskKind::SourceAnalysis);
        config.output.derivatives_dir = dir.to_path_buf();
        Task {
            config,
            context,
            metadata: RunMetadata::new("source_analysis", "test"),
            base: "subject01".to_string(),
            derivatives_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn writes_tables_and_sets_the_roi_spectra() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = TaskContext::default();
        context.source_raw = Some(roi_recording());
        let mut task = task_with(context, dir.path());
        assert_eq!(task.apply_source_psd().unwrap(), StepOutcome::Completed);

        let roi_psd = task.context.roi_psd.as_ref().unwrap();
        assert_eq!(roi_psd.rois.len(), 4);
        assert!(roi_psd.freqs.iter().all(|&f| (0.5..=45.0).contains(&f)));

        let step_dir = dir.path().join("source_psd");
        let frame = Frame::read_parquet(&step_dir.join("subject01_roi_psd.parquet")).unwrap();
        assert_eq!(frame.n_rows(), 4 * roi_psd.freqs.len());

        let bands = Frame::read_csv(&step_dir.join("subject01_band_powers.csv")).unwrap();
        assert_eq!(bands.n_rows(), 4);
        let alpha = match bands.column("alpha").unwrap() {
            Column::Float(values) => values.clone(),
            other => panic!("alpha column is {other:?}"),
        };
        let delta = match bands.column("delta").unwrap() {
            Column::Float(values) => values.clone(),
            other => panic!("delta column is {other:?}"),
        };
        // The 10 Hz oscillation dominates the alpha band.
        assert!(alpha[0] > delta[0]);
        assert!(step_dir.join("subject01_psd_overview.png").is_file());
    }

    #[test]
    fn missing_source_estimate_is_a_prerequisite_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = task_with(TaskContext::default(), dir.path());
        let err = task.apply_source_psd().unwrap_err();
        assert!(err.to_string().contains("source_localization"));
    }
}
