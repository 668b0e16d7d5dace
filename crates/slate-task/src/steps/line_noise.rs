//! Spatial line-noise removal on the continuous recording.

use crate::config::StepConfig;
use crate::context::{StepError, StepOutcome};
use crate::report::render_figure;
use crate::task::Task;
use anyhow::Context;
use log::{info, warn};
use serde_json::json;
use slate_lib::linenoise::{dss_line_iter, validate_line_removal};
use slate_lib::plot::psd_overlay_figure;
use slate_lib::spectral::{welch_psd_matrix, Psd, WelchOptions};
use slate_lib::Recording;

const STEP: &str = "line_noise";

impl Task {
    pub(crate) fn apply_line_noise(&mut self) -> Result<StepOutcome, StepError> {
        let params = match &self.config.steps.line_noise {
            StepConfig::Disabled => {
                info!("line_noise step is disabled");
                return Ok(StepOutcome::Skipped);
            }
            StepConfig::Enabled(params) => params.clone(),
        };
        let raw = self
            .context
            .raw
            .as_ref()
            .ok_or(StepError::MissingPrerequisite {
                step: STEP,
                what: "no continuous recording loaded",
            })?;
        if raw.n_channels() < 2 {
            return Err(StepError::invalid(
                STEP,
                format!(
                    "spatial filtering needs at least 2 channels, got {}",
                    raw.n_channels()
                ),
            ));
        }
        let nyquist = raw.fs / 2.0;
        if params.fline >= nyquist {
            return Err(StepError::invalid(
                STEP,
                format!(
                    "fline {} Hz is not below the Nyquist frequency {} Hz",
                    params.fline, nyquist
                ),
            ));
        }
        info!(
            "removing {} Hz line noise (nkeep {}, max_iter {})",
            params.fline, params.nkeep, params.max_iter
        );

        let (cleaned, iterations) =
            dss_line_iter(raw, params.fline, params.nkeep, params.max_iter)
                .map_err(|err| StepError::failed(STEP, err))?;
        let report = validate_line_removal(raw, &cleaned, params.fline)
            .map_err(|err| StepError::failed(STEP, err))?;
        if report.success {
            info!(
                "line power dropped {:.1} dB after {} iteration(s)",
                report.reduction_db, iterations
            );
        } else {
            warn!(
                "line power only dropped {:.1} dB (below the 10 dB target)",
                report.reduction_db
            );
        }

        let dir = self.step_dir(STEP)?;
        let png = self.artifact_path(&dir, "linenoise_psd.png");
        let fmax = (params.fline * 2.0).min(nyquist);
        let figure = psd_overlay_figure(
            &format!("{} Hz line removal", params.fline),
            &[
                ("before".to_string(), grand_average_psd(raw, fmax)?),
                ("after".to_string(), grand_average_psd(&cleaned, fmax)?),
            ],
        );
        render_figure(&png, &figure)
            .with_context(|| format!("failed to write {}", png.display()))
            .map_err(|err| StepError::failed(STEP, err))?;

        self.metadata.record_step(
            STEP,
            json!({
                "fline": params.fline,
                "nkeep": params.nkeep,
                "iterations": iterations,
                "power_before_db": report.power_before_db,
                "power_after_db": report.power_after_db,
                "reduction_db": report.reduction_db,
                "success": report.success,
            }),
        );
        self.context.raw = Some(cleaned);
        Ok(StepOutcome::Completed)
    }
}

fn grand_average_psd(rec: &Recording, fmax: f64) -> Result<Psd, StepError> {
    let (freqs, rows) = welch_psd_matrix(rec, &WelchOptions::default())
        .map_err(|err| StepError::failed(STEP, err))?;
    let n = rows.len().max(1) as f64;
    let power = (0..freqs.len())
        .map(|i| rows.iter().map(|row| row[i]).sum::<f64>() / n)
        .collect();
    Ok(Psd { freqs, power }.crop(0.0, fmax))
}
