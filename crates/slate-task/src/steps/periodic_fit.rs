//! Band-limited oscillatory peaks on top of the aperiodic background.

use crate::config::StepConfig;
use crate::context::{StepError, StepOutcome};
use crate::task::Task;
use anyhow::{Context, Result};
use log::info;
use serde_json::json;
use slate_lib::io::{Column, Frame};
use slate_lib::specfit::{band_peak, fit_vertices, FitSettings, VertexFit};
use slate_lib::{default_bands, FrequencyBand};
use std::collections::BTreeMap;

const STEP: &str = "periodic_fit";

impl Task {
    pub(crate) fn apply_periodic_fit(&mut self) -> Result<StepOutcome, StepError> {
        let params = match &self.config.steps.periodic_fit {
            StepConfig::Disabled => {
                info!("periodic_fit step is disabled");
                return Ok(StepOutcome::Skipped);
            }
            StepConfig::Enabled(params) => params.clone(),
        };
        let roi_psd = self.context.psd_input(STEP)?;
        let keep: Vec<usize> = roi_psd
            .freqs
            .iter()
            .enumerate()
            .filter(|(_, &f)| f >= params.fmin && f <= params.fmax)
            .map(|(i, _)| i)
            .collect();
        if keep.is_empty() {
            return Err(StepError::invalid(
                STEP,
                format!("no spectral bins inside {}-{} Hz", params.fmin, params.fmax),
            ));
        }
        let freqs: Vec<f64> = keep.iter().map(|&i| roi_psd.freqs[i]).collect();
        let psds: Vec<Vec<f64>> = roi_psd
            .psd
            .iter()
            .map(|row| keep.iter().map(|&i| row[i]).collect())
            .collect();
        let rois = roi_psd.rois.clone();

        let mut settings = FitSettings::periodic();
        settings.peak_width_limits = params.peak_width_limits;
        settings.max_n_peaks = params.max_n_peaks;
        info!(
            "extracting band peaks for {} regions in {}-{} Hz",
            rois.len(),
            params.fmin,
            params.fmax
        );
        let fits = fit_vertices(
            &freqs,
            &psds,
            &settings,
            None,
            params.n_jobs,
            params.batch_size,
        )
        .map_err(|err| StepError::failed(STEP, err))?;

        let bands = default_bands();
        let frame = peaks_frame(&rois, &fits, &bands).map_err(|err| StepError::failed(STEP, err))?;
        let dir = self.step_dir(STEP)?;
        let parquet = self.artifact_path(&dir, "periodic_peaks.parquet");
        frame
            .write_parquet(&parquet)
            .with_context(|| format!("failed to write {}", parquet.display()))
            .map_err(|err| StepError::failed(STEP, err))?;
        let csv = self.artifact_path(&dir, "periodic_summary.csv");
        frame
            .write_csv(&csv)
            .with_context(|| format!("failed to write {}", csv.display()))
            .map_err(|err| StepError::failed(STEP, err))?;

        let mut peak_counts: BTreeMap<String, usize> = BTreeMap::new();
        for band in &bands {
            let count = fits
                .iter()
                .filter(|fit| band_peak(&fit.peaks, band.lo, band.hi).is_some())
                .count();
            peak_counts.insert(band.name.clone(), count);
        }
        info!("peaks per band: {:?}", peak_counts);
        self.metadata.record_step(
            STEP,
            json!({
                "n_rois": rois.len(),
                "fmin": params.fmin,
                "fmax": params.fmax,
                "peak_counts": peak_counts,
            }),
        );
        Ok(StepOutcome::Completed)
    }
}

/// One row per region and band; peak parameters are NaN when the band has
/// no detected peak.
fn peaks_frame(rois: &[String], fits: &[VertexFit], bands: &[FrequencyBand]) -> Result<Frame> {
    let n = rois.len() * bands.len();
    let mut roi_col = Vec::with_capacity(n);
    let mut band_col = Vec::with_capacity(n);
    let mut status_col = Vec::with_capacity(n);
    let mut center_col = Vec::with_capacity(n);
    let mut power_col = Vec::with_capacity(n);
    let mut width_col = Vec::with_capacity(n);
    for (roi, fit) in rois.iter().zip(fits) {
        for band in bands {
            let peak = band_peak(&fit.peaks, band.lo, band.hi);
            roi_col.push(roi.clone());
            band_col.push(band.name.clone());
            status_col.push(fit.status.as_str().to_string());
            center_col.push(peak.map_or(f64::NAN, |p| p.center_frequency));
            power_col.push(peak.map_or(f64::NAN, |p| p.power));
            width_col.push(peak.map_or(f64::NAN, |p| p.bandwidth));
        }
    }
    let mut frame = Frame::new();
    frame.push("roi", Column::Str(roi_col))?;
    frame.push("band", Column::Str(band_col))?;
    frame.push("status", Column::Str(status_col))?;
    frame.push("center_frequency", Column::Float(center_col))?;
    frame.push("power", Column::Float(power_col))?;
    frame.push("bandwidth", Column::Float(width_col))?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskKind;
    use crate::context::{RoiPsd, TaskContext};
    use crate::metadata::RunMetadata;
    use std::path::Path;

    /// 1/f background with a clear alpha bump at 10 Hz.
    fn alpha_psd() -> (Vec<f64>, Vec<f64>) {
        let freqs: Vec<f64> = (4..=180).map(|i| i as f64 * 0.25).collect();
        let power = freqs
            .iter()
            .map(|f| {
                let background = -f.log10();
                let bump = 1.2 * (-((f - 10.0) * (f - 10.0)) / (2.0 * 1.5 * 1.5)).exp();
                10f64.powf(background + bump)
            })
            .collect();
        (freqs, power)
    }

    fn task_with(context: TaskContext, dir: &Path) -> Task {
        let mut config = crate::presets::default_config(TaskKind::RestingSourcePsd);
        config.output.derivatives_dir = dir.to_path_buf();
        Task {
            config,
            context,
            metadata: RunMetadata::new("resting_source_psd", "test"),
            base: "subject01".to_string(),
            derivatives_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn finds_the_alpha_peak_and_leaves_other_bands_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (freqs, power) = alpha_psd();
        let mut context = TaskContext::default();
        context.roi_psd = Some(RoiPsd {
            freqs,
            rois: vec!["precentral-lh".into(), "precentral-rh".into()],
            psd: vec![power.clone(), power],
        });
        let mut task = task_with(context, dir.path());
        assert_eq!(task.apply_periodic_fit().unwrap(), StepOutcome::Completed);

        let entry = &task.metadata.steps["step_periodic_fit"];
        assert_eq!(entry["peak_counts"]["alpha"], json!(2));
        assert_eq!(entry["peak_counts"]["gamma"], json!(0));

        let csv = dir
            .path()
            .join("periodic_fit/subject01_periodic_summary.csv");
        let frame = Frame::read_csv(&csv).unwrap();
        assert_eq!(frame.n_rows(), 2 * 5);
        let bands = match frame.column("band").unwrap() {
            Column::Str(values) => values.clone(),
            other => panic!("band column is {other:?}"),
        };
        let centers = match frame.column("center_frequency").unwrap() {
            Column::Float(values) => values.clone(),
            other => panic!("center column is {other:?}"),
        };
        for (band, center) in bands.iter().zip(&centers) {
            if band == "alpha" {
                assert!((center - 10.0).abs() < 1.0, "alpha center {center}");
            }
            if band == "gamma" {
                assert!(center.is_nan());
            }
        }
    }
}
