//! Aperiodic (1/f) model fits of the region spectra.

use crate::config::StepConfig;
use crate::context::{StepError, StepOutcome};
use crate::task::Task;
use anyhow::{Context, Result};
use log::info;
use serde_json::json;
use slate_lib::io::{Column, Frame};
use slate_lib::specfit::{fit_vertices, FitSettings, VertexFit};
use std::collections::BTreeMap;

const STEP: &str = "aperiodic_fit";

impl Task {
    pub(crate) fn apply_aperiodic_fit(&mut self) -> Result<StepOutcome, StepError> {
        let params = match &self.config.steps.aperiodic_fit {
            StepConfig::Disabled => {
                info!("aperiodic_fit step is disabled");
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

        let mut primary = FitSettings::aperiodic_primary();
        primary.peak_width_limits = params.peak_width_limits;
        primary.max_n_peaks = params.max_n_peaks;
        let mut fallback = FitSettings::aperiodic_fallback();
        fallback.peak_width_limits = params.peak_width_limits;
        info!(
            "fitting {} region spectra in {}-{} Hz (knee model, fixed fallback)",
            rois.len(),
            params.fmin,
            params.fmax
        );
        let fits = fit_vertices(
            &freqs,
            &psds,
            &primary,
            Some(&fallback),
            params.n_jobs,
            params.batch_size,
        )
        .map_err(|err| StepError::failed(STEP, err))?;

        let frame = fits_frame(&rois, &fits).map_err(|err| StepError::failed(STEP, err))?;
        let dir = self.step_dir(STEP)?;
        let parquet = self.artifact_path(&dir, "aperiodic_fits.parquet");
        frame
            .write_parquet(&parquet)
            .with_context(|| format!("failed to write {}", parquet.display()))
            .map_err(|err| StepError::failed(STEP, err))?;
        let csv = self.artifact_path(&dir, "aperiodic_summary.csv");
        frame
            .write_csv(&csv)
            .with_context(|| format!("failed to write {}", csv.display()))
            .map_err(|err| StepError::failed(STEP, err))?;

        let mut status_counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for fit in &fits {
            *status_counts.entry(fit.status.as_str()).or_insert(0) += 1;
        }
        let exponents: Vec<f64> = fits
            .iter()
            .filter_map(|fit| fit.aperiodic.as_ref())
            .map(|ap| ap.exponent)
            .collect();
        let mean_exponent = if exponents.is_empty() {
            f64::NAN
        } else {
            exponents.iter().sum::<f64>() / exponents.len() as f64
        };
        info!(
            "aperiodic fits done: {:?}, mean exponent {:.2}",
            status_counts, mean_exponent
        );
        self.metadata.record_step(
            STEP,
            json!({
                "n_rois": rois.len(),
                "fmin": params.fmin,
                "fmax": params.fmax,
                "status_counts": status_counts,
                "mean_exponent": mean_exponent,
            }),
        );
        Ok(StepOutcome::Completed)
    }
}

/// One row per region; aperiodic parameters are NaN when the fit failed.
fn fits_frame(rois: &[String], fits: &[VertexFit]) -> Result<Frame> {
    let pick = |f: &dyn Fn(&slate_lib::specfit::AperiodicFit) -> f64| -> Vec<f64> {
        fits.iter()
            .map(|fit| fit.aperiodic.as_ref().map(f).unwrap_or(f64::NAN))
            .collect()
    };
    let mut frame = Frame::new();
    frame.push("roi", Column::Str(rois.to_vec()))?;
    frame.push(
        "status",
        Column::Str(fits.iter().map(|f| f.status.as_str().to_string()).collect()),
    )?;
    frame.push("offset", Column::Float(pick(&|ap| ap.offset)))?;
    frame.push(
        "knee",
        Column::Float(pick(&|ap| ap.knee.unwrap_or(f64::NAN))),
    )?;
    frame.push("exponent", Column::Float(pick(&|ap| ap.exponent)))?;
    frame.push("r_squared", Column::Float(pick(&|ap| ap.r_squared)))?;
    frame.push("error", Column::Float(pick(&|ap| ap.error)))?;
    Ok(frame)
}
