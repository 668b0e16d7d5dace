//! Wavelet threshold denoising of whichever signal currently leads
//! (epochs when present, else the continuous recording).

use crate::config::{StepConfig, WaveletParams};
use crate::context::{DenoiseTarget, StepError, StepOutcome};
use crate::report::render_page;
use crate::task::Task;
use anyhow::{Context, Result};
use log::info;
use serde_json::json;
use slate_lib::plot::{band_power_figure, psd_overlay_figure, Figure};
use slate_lib::spectral::{welch_psd_epochs, welch_psd_matrix, Psd, WelchOptions};
use slate_lib::wavelet::{
    denoise_channel, denoise_channel_erp, denoise_metrics, DenoiseMetrics, DenoiseSettings,
};
use slate_lib::{Epochs, Recording};

const STEP: &str = "wavelet_threshold";

impl Task {
    pub(crate) fn apply_wavelet_threshold(&mut self) -> Result<StepOutcome, StepError> {
        let params = match &self.config.steps.wavelet_threshold {
            StepConfig::Disabled => {
                info!("wavelet_threshold step is disabled");
                return Ok(StepOutcome::Skipped);
            }
            StepConfig::Enabled(params) => params.clone(),
        };
        let settings = DenoiseSettings {
            wavelet: params.wavelet.clone(),
            level: params.level.resolve(),
            mode: params.mode,
            threshold_scale: params.threshold_scale,
        };
        info!(
            "denoising with {} (mode {:?}, scale {}{})",
            params.wavelet,
            params.mode,
            params.threshold_scale,
            match params.erp_bandpass {
                Some((lo, hi)) => format!(", ERP band {lo}-{hi} Hz"),
                None => String::new(),
            }
        );
        let dir = self.step_dir(STEP)?;
        let png = self.artifact_path(&dir, "wavelet_report.png");

        let summary = {
            let target = self.context.denoise_target(STEP)?;
            match target {
                DenoiseTarget::Epochs(epochs) => denoise_epochs(epochs, &settings, &params),
                DenoiseTarget::Raw(raw) => denoise_raw(raw, &settings, &params),
            }
            .map_err(|err| StepError::failed(STEP, err))?
        };

        let overlay = psd_overlay_figure(
            "wavelet denoising",
            &[
                ("before".to_string(), summary.before),
                ("after".to_string(), summary.after),
            ],
        );
        let metrics_panel = metrics_figure(&summary.metrics);
        render_page(&png, &[overlay, metrics_panel])
            .with_context(|| format!("failed to write {}", png.display()))
            .map_err(|err| StepError::failed(STEP, err))?;

        self.metadata.record_step(
            STEP,
            json!({
                "wavelet": params.wavelet,
                "mode": params.mode,
                "threshold_scale": params.threshold_scale,
                "erp_bandpass": params.erp_bandpass,
                "n_signals": summary.n_signals,
                "mean_abs_diff_uv": summary.metrics.mean_abs_diff_uv,
                "ptp_reduction_percent": summary.metrics.ptp_reduction_percent,
            }),
        );
        Ok(StepOutcome::Completed)
    }
}

struct DenoiseSummary {
    metrics: DenoiseMetrics,
    before: Psd,
    after: Psd,
    n_signals: usize,
}

fn denoise_signal(
    signal: &[f64],
    fs: f64,
    settings: &DenoiseSettings,
    params: &WaveletParams,
) -> Result<Vec<f64>> {
    match params.erp_bandpass {
        Some(band) => denoise_channel_erp(signal, fs, settings, band),
        None => denoise_channel(signal, settings),
    }
}

fn denoise_raw(
    raw: &mut Recording,
    settings: &DenoiseSettings,
    params: &WaveletParams,
) -> Result<DenoiseSummary> {
    let before_data = raw.data.clone();
    for signal in raw.data.iter_mut() {
        *signal = denoise_signal(signal, raw.fs, settings, params)?;
    }
    let before_rec = Recording {
        fs: raw.fs,
        channels: raw.channels.clone(),
        data: before_data,
    };
    Ok(DenoiseSummary {
        metrics: denoise_metrics(&before_rec.data, &raw.data),
        before: grand_average(welch_psd_matrix(&before_rec, &WelchOptions::default())?)
            .crop(0.0, params.psd_fmax),
        after: grand_average(welch_psd_matrix(raw, &WelchOptions::default())?)
            .crop(0.0, params.psd_fmax),
        n_signals: raw.n_channels(),
    })
}

fn denoise_epochs(
    epochs: &mut Epochs,
    settings: &DenoiseSettings,
    params: &WaveletParams,
) -> Result<DenoiseSummary> {
    let before_data = epochs.data.clone();
    for epoch in epochs.data.iter_mut() {
        for signal in epoch.iter_mut() {
            *signal = denoise_signal(signal, epochs.fs, settings, params)?;
        }
    }
    let before = Epochs {
        fs: epochs.fs,
        channels: epochs.channels.clone(),
        data: before_data,
    };
    let flat = |data: &Vec<Vec<Vec<f64>>>| -> Vec<Vec<f64>> {
        data.iter().flatten().cloned().collect()
    };
    let n_signals = epochs.n_epochs() * epochs.n_channels();
    Ok(DenoiseSummary {
        metrics: denoise_metrics(&flat(&before.data), &flat(&epochs.data)),
        before: grand_average(welch_psd_epochs(&before, &WelchOptions::default())?)
            .crop(0.0, params.psd_fmax),
        after: grand_average(welch_psd_epochs(epochs, &WelchOptions::default())?)
            .crop(0.0, params.psd_fmax),
        n_signals,
    })
}

fn grand_average((freqs, rows): (Vec<f64>, Vec<Vec<f64>>)) -> Psd {
    let n = rows.len().max(1) as f64;
    let power = (0..freqs.len())
        .map(|i| rows.iter().map(|row| row[i]).sum::<f64>() / n)
        .collect();
    Psd { freqs, power }
}

fn metrics_figure(metrics: &DenoiseMetrics) -> Figure {
    band_power_figure(
        "denoising effect",
        &[
            (
                "mean |diff| (\u{b5}V)".to_string(),
                metrics.mean_abs_diff_uv,
            ),
            (
                "p-p reduction (%)".to_string(),
                metrics.ptp_reduction_percent,
            ),
        ],
    )
}
