//! Cross-validated epoch rejection with channel interpolation.

use crate::config::StepConfig;
use crate::context::{StepError, StepOutcome};
use crate::report::{render_figure, render_page};
use crate::task::Task;
use anyhow::{Context, Result};
use log::{info, warn};
use serde_json::json;
use slate_lib::plot::{band_power_figure, heatmap_figure, psd_overlay_figure};
use slate_lib::reject::{clean_epochs, RejectParams, RejectResult, LABEL_GOOD};
use slate_lib::spectral::{welch_psd_epochs, Psd, WelchOptions};
use slate_lib::Epochs;

const STEP: &str = "reject_epochs";

impl Task {
    pub(crate) fn apply_reject_epochs(&mut self) -> Result<StepOutcome, StepError> {
        let params = match &self.config.steps.reject_epochs {
            StepConfig::Disabled => {
                info!("reject_epochs step is disabled");
                return Ok(StepOutcome::Skipped);
            }
            StepConfig::Enabled(params) => params.clone(),
        };
        let reject_params = RejectParams {
            n_interpolate: params.n_interpolate.clone(),
            consensus: params.consensus.clone(),
            ..RejectParams::default()
        };
        let epochs = self
            .context
            .epochs
            .as_ref()
            .ok_or(StepError::MissingPrerequisite {
                step: STEP,
                what: "no epochs; run epoching first",
            })?;
        let before = epochs.n_epochs();
        info!(
            "searching {} x {} rejection parameter grid over {} epochs",
            params.n_interpolate.len(),
            params.consensus.len(),
            before
        );
        let result = clean_epochs(epochs, &reject_params)
            .map_err(|err| StepError::failed(STEP, err))?;
        let after = result.epochs.n_epochs();
        let rejection_percent = (before - after) as f64 / before as f64 * 100.0;
        let interpolated = result.log.interpolated_per_channel();
        let interpolated_channels: Vec<&str> = epochs
            .channels
            .iter()
            .zip(&interpolated)
            .filter(|(_, &count)| count > 0)
            .map(|(name, _)| name.as_str())
            .collect();
        info!(
            "kept {after}/{before} epochs ({rejection_percent:.1}% rejected), \
             best n_interpolate {} consensus {}",
            result.n_interpolate, result.consensus
        );

        // Report pages are best-effort; the cleaned data stands on its own.
        if let Err(err) = self.write_reject_reports(epochs, &result) {
            warn!("rejection report failed: {err:#}");
        }

        self.metadata.record_step(
            STEP,
            json!({
                "epochs_before": before,
                "epochs_after": after,
                "rejection_percent": rejection_percent,
                "n_interpolate": result.n_interpolate,
                "consensus": result.consensus,
                "interpolated_channels": interpolated_channels,
            }),
        );
        self.context.epochs = Some(result.epochs);
        Ok(StepOutcome::Completed)
    }

    fn write_reject_reports(&self, before: &Epochs, result: &RejectResult) -> Result<()> {
        let dir = self.step_dir(STEP).map_err(anyhow::Error::new)?;
        let fmax = 45.0_f64.min(before.fs / 2.0);

        let stats = band_power_figure(
            "epoch counts",
            &[
                ("before".to_string(), before.n_epochs() as f64),
                ("after".to_string(), result.epochs.n_epochs() as f64),
                ("rejected".to_string(), result.log.n_rejected() as f64),
            ],
        );
        let spectra = psd_overlay_figure(
            "grand-average PSD",
            &[
                ("before".to_string(), grand_average(before, fmax)?),
                ("after".to_string(), grand_average(&result.epochs, fmax)?),
            ],
        );
        let overview = self.artifact_path(&dir, "reject_overview.png");
        render_page(&overview, &[stats, spectra])
            .with_context(|| format!("failed to write {}", overview.display()))?;

        let labels = &result.log.labels;
        let pattern = heatmap_figure(
            "rejection pattern (0 good, 1 interpolated, 2 rejected)",
            before.channels.clone(),
            (1..=labels.len()).map(|e| e.to_string()).collect(),
            labels
                .iter()
                .map(|row| row.iter().map(|&l| l as f64).collect())
                .collect(),
        );
        let bad_counts: Vec<(String, f64)> = labels
            .iter()
            .enumerate()
            .map(|(e, row)| {
                let bad = row.iter().filter(|&&l| l != LABEL_GOOD).count();
                ((e + 1).to_string(), bad as f64)
            })
            .collect();
        let per_epoch = band_power_figure("bad channels per epoch", &bad_counts);
        let pattern_png = self.artifact_path(&dir, "reject_pattern.png");
        render_page(&pattern_png, &[pattern, per_epoch])
            .with_context(|| format!("failed to write {}", pattern_png.display()))?;

        let per_channel: Vec<(String, f64)> = before
            .channels
            .iter()
            .zip(result.log.interpolated_per_channel())
            .map(|(name, count)| (name.clone(), count as f64))
            .collect();
        let channels_png = self.artifact_path(&dir, "reject_channels.png");
        render_figure(
            &channels_png,
            &band_power_figure("interpolations per channel", &per_channel),
        )
        .with_context(|| format!("failed to write {}", channels_png.display()))?;
        Ok(())
    }
}

fn grand_average(epochs: &Epochs, fmax: f64) -> Result<Psd> {
    let (freqs, rows) = welch_psd_epochs(epochs, &WelchOptions::default())?;
    let n = rows.len().max(1) as f64;
    let power = (0..freqs.len())
        .map(|i| rows.iter().map(|row| row[i]).sum::<f64>() / n)
        .collect();
    Ok(Psd { freqs, power }.crop(0.0, fmax))
}
