//! Spectral parameterization into aperiodic and periodic components.
//!
//! Spectra are modeled in log10 power over linear frequency. The aperiodic
//! component is `offset - exponent * log10(f)` in fixed mode or
//! `offset - log10(knee + f^exponent)` in knee mode; periodic components are
//! Gaussians extracted iteratively from the flattened spectrum.

use anyhow::{bail, Result};
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AperiodicMode {
    Fixed,
    Knee,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitSettings {
    pub peak_width_limits: (f64, f64),
    pub max_n_peaks: usize,
    pub min_peak_height: f64,
    pub peak_threshold: f64,
    pub aperiodic_mode: AperiodicMode,
}

impl FitSettings {
    pub fn aperiodic_primary() -> Self {
        Self {
            peak_width_limits: (1.0, 8.0),
            max_n_peaks: 6,
            min_peak_height: 0.0,
            peak_threshold: 2.0,
            aperiodic_mode: AperiodicMode::Knee,
        }
    }

    /// More constrained settings for spectra the primary fit cannot handle.
    pub fn aperiodic_fallback() -> Self {
        Self {
            peak_width_limits: (1.0, 8.0),
            max_n_peaks: 3,
            min_peak_height: 0.1,
            peak_threshold: 2.5,
            aperiodic_mode: AperiodicMode::Fixed,
        }
    }

    pub fn periodic() -> Self {
        Self {
            peak_width_limits: (1.0, 12.0),
            max_n_peaks: 6,
            min_peak_height: 0.0,
            peak_threshold: 2.0,
            aperiodic_mode: AperiodicMode::Fixed,
        }
    }

    fn validate(&self) -> Result<()> {
        let (lo, hi) = self.peak_width_limits;
        if !(lo > 0.0 && hi > lo) {
            bail!("peak_width_limits must satisfy 0 < lo < hi, got ({lo}, {hi})");
        }
        if self.peak_threshold <= 0.0 {
            bail!("peak_threshold must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    Success,
    NanParams,
    InvalidParams,
    InvalidExponent,
    FittingFailed,
}

impl FitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FitStatus::Success => "SUCCESS",
            FitStatus::NanParams => "NAN_PARAMS",
            FitStatus::InvalidParams => "INVALID_PARAMS",
            FitStatus::InvalidExponent => "INVALID_EXPONENT",
            FitStatus::FittingFailed => "FITTING_FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AperiodicFit {
    pub offset: f64,
    /// None in fixed mode
    pub knee: Option<f64>,
    pub exponent: f64,
    pub r_squared: f64,
    pub error: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Peak {
    pub center_frequency: f64,
    pub power: f64,
    pub bandwidth: f64,
}

#[derive(Debug, Clone)]
pub struct SpectrumFit {
    pub status: FitStatus,
    pub aperiodic: Option<AperiodicFit>,
    pub peaks: Vec<Peak>,
}

impl SpectrumFit {
    fn failed(status: FitStatus) -> Self {
        Self {
            status,
            aperiodic: None,
            peaks: Vec::new(),
        }
    }
}

/// One spectrum's outcome within a batch run.
#[derive(Debug, Clone)]
pub struct VertexFit {
    pub index: usize,
    pub status: FitStatus,
    pub aperiodic: Option<AperiodicFit>,
    pub peaks: Vec<Peak>,
}

/// Fit a single power spectrum. Shape problems are hard errors; data-driven
/// failures come back as a non-Success status.
pub fn fit_spectrum(freqs: &[f64], psd: &[f64], settings: &FitSettings) -> Result<SpectrumFit> {
    settings.validate()?;
    if freqs.len() != psd.len() {
        bail!(
            "frequency axis has {} points but the spectrum has {}",
            freqs.len(),
            psd.len()
        );
    }
    if freqs.len() < 8 {
        bail!("at least 8 spectral points are required, got {}", freqs.len());
    }
    if freqs.iter().any(|f| *f <= 0.0) {
        bail!("frequencies must be positive for log-space fitting");
    }
    if psd.iter().any(|p| !p.is_finite() || *p <= 0.0) {
        return Ok(SpectrumFit::failed(FitStatus::FittingFailed));
    }

    let log_psd: Vec<f64> = psd.iter().map(|p| p.log10()).collect();
    let initial = fit_aperiodic_robust(freqs, &log_psd, settings.aperiodic_mode);

    let mut flat: Vec<f64> = log_psd
        .iter()
        .enumerate()
        .map(|(i, y)| y - initial.model(freqs[i]))
        .collect();
    let peaks = extract_peaks(freqs, &mut flat, settings);

    // Refit the aperiodic component with the peaks removed.
    let without_peaks: Vec<f64> = log_psd
        .iter()
        .enumerate()
        .map(|(i, y)| y - gaussian_sum(freqs[i], &peaks))
        .collect();
    let aperiodic = fit_aperiodic(freqs, &without_peaks, settings.aperiodic_mode, None);

    let model: Vec<f64> = freqs
        .iter()
        .map(|&f| aperiodic.model(f) + gaussian_sum(f, &peaks))
        .collect();
    let (r_squared, error) = goodness(&log_psd, &model);

    let fit = AperiodicFit {
        offset: aperiodic.offset,
        knee: aperiodic.knee,
        exponent: aperiodic.exponent,
        r_squared,
        error,
    };
    let status = classify(&fit, settings.aperiodic_mode);
    if status != FitStatus::Success {
        return Ok(SpectrumFit::failed(status));
    }
    Ok(SpectrumFit {
        status,
        aperiodic: Some(fit),
        peaks: peaks
            .iter()
            .map(|g| Peak {
                center_frequency: g.center,
                power: g.height,
                bandwidth: 2.0 * g.std,
            })
            .collect(),
    })
}

/// Primary settings first; any non-Success outcome gets one retry with the
/// fallback before the failure is recorded.
pub fn fit_with_fallback(
    freqs: &[f64],
    psd: &[f64],
    primary: &FitSettings,
    fallback: Option<&FitSettings>,
) -> Result<SpectrumFit> {
    let first = fit_spectrum(freqs, psd, primary)?;
    if first.status == FitStatus::Success {
        return Ok(first);
    }
    match fallback {
        Some(settings) => fit_spectrum(freqs, psd, settings),
        None => Ok(first),
    }
}

/// Batch driver over per-vertex spectra with a bounded worker pool.
pub fn fit_vertices(
    freqs: &[f64],
    psds: &[Vec<f64>],
    primary: &FitSettings,
    fallback: Option<&FitSettings>,
    n_jobs: usize,
    batch_size: usize,
) -> Result<Vec<VertexFit>> {
    if batch_size == 0 {
        bail!("batch_size must be positive");
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(n_jobs.max(1))
        .build()?;

    let n_batches = psds.len().div_ceil(batch_size);
    let mut out = Vec::with_capacity(psds.len());
    for (batch_idx, batch) in psds.chunks(batch_size).enumerate() {
        debug!(
            "fitting batch {}/{} ({} spectra)",
            batch_idx + 1,
            n_batches,
            batch.len()
        );
        let offset = batch_idx * batch_size;
        let fits: Result<Vec<VertexFit>> = pool.install(|| {
            batch
                .par_iter()
                .enumerate()
                .map(|(i, psd)| {
                    let fit = fit_with_fallback(freqs, psd, primary, fallback)?;
                    Ok(VertexFit {
                        index: offset + i,
                        status: fit.status,
                        aperiodic: fit.aperiodic,
                        peaks: fit.peaks,
                    })
                })
                .collect()
        });
        out.extend(fits?);
    }
    Ok(out)
}

/// Strongest peak whose center lies inside `[lo, hi]`.
pub fn band_peak(peaks: &[Peak], lo: f64, hi: f64) -> Option<Peak> {
    peaks
        .iter()
        .filter(|p| p.center_frequency >= lo && p.center_frequency <= hi)
        .max_by(|a, b| {
            a.power
                .partial_cmp(&b.power)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .copied()
}

pub fn success_rate(fits: &[VertexFit]) -> f64 {
    if fits.is_empty() {
        return 0.0;
    }
    let ok = fits.iter().filter(|f| f.status == FitStatus::Success).count();
    ok as f64 / fits.len() as f64 * 100.0
}

#[derive(Debug, Clone, Copy)]
struct AperiodicParams {
    offset: f64,
    knee: Option<f64>,
    exponent: f64,
}

impl AperiodicParams {
    fn model(&self, f: f64) -> f64 {
        match self.knee {
            Some(knee) => self.offset - (knee + f.powf(self.exponent)).log10(),
            None => self.offset - self.exponent * f.log10(),
        }
    }
}

/// Two-pass fit: an initial fit over all points, then a refit restricted to
/// the points at or below the initial model, which keeps narrowband peaks
/// from dragging the aperiodic component up.
fn fit_aperiodic_robust(freqs: &[f64], log_psd: &[f64], mode: AperiodicMode) -> AperiodicParams {
    let initial = fit_aperiodic(freqs, log_psd, mode, None);
    let mask: Vec<usize> = (0..freqs.len())
        .filter(|&i| log_psd[i] - initial.model(freqs[i]) <= 0.0)
        .collect();
    if mask.len() < 4 {
        return initial;
    }
    fit_aperiodic(freqs, log_psd, mode, Some(&mask))
}

fn fit_aperiodic(
    freqs: &[f64],
    log_psd: &[f64],
    mode: AperiodicMode,
    mask: Option<&[usize]>,
) -> AperiodicParams {
    let indices: Vec<usize> = match mask {
        Some(m) => m.to_vec(),
        None => (0..freqs.len()).collect(),
    };
    match mode {
        AperiodicMode::Fixed => fit_fixed(freqs, log_psd, &indices),
        AperiodicMode::Knee => fit_knee(freqs, log_psd, &indices),
    }
}

/// Closed-form linear regression of log power on log frequency.
fn fit_fixed(freqs: &[f64], log_psd: &[f64], indices: &[usize]) -> AperiodicParams {
    let n = indices.len() as f64;
    let mut mx = 0.0;
    let mut my = 0.0;
    for &i in indices {
        mx += freqs[i].log10();
        my += log_psd[i];
    }
    mx /= n;
    my /= n;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for &i in indices {
        let dx = freqs[i].log10() - mx;
        sxy += dx * (log_psd[i] - my);
        sxx += dx * dx;
    }
    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    AperiodicParams {
        offset: my - slope * mx,
        knee: None,
        exponent: -slope,
    }
}

/// Coarse-to-fine grid over (knee, exponent); the offset is closed-form for
/// every candidate pair.
fn fit_knee(freqs: &[f64], log_psd: &[f64], indices: &[usize]) -> AperiodicParams {
    let mut best = (f64::INFINITY, 0.0_f64, 1.0_f64, 2.0_f64);

    let mut search = |knee_log10: &[f64], exponents: &[f64], best: &mut (f64, f64, f64, f64)| {
        for &exponent in exponents {
            let powered: Vec<f64> = indices.iter().map(|&i| freqs[i].powf(exponent)).collect();
            for &kl in knee_log10 {
                let knee = 10f64.powf(kl);
                let mut offset = 0.0;
                for (j, &i) in indices.iter().enumerate() {
                    offset += log_psd[i] + (knee + powered[j]).log10();
                }
                offset /= indices.len() as f64;
                let mut sse = 0.0;
                for (j, &i) in indices.iter().enumerate() {
                    let r = log_psd[i] - (offset - (knee + powered[j]).log10());
                    sse += r * r;
                }
                if sse < best.0 {
                    *best = (sse, offset, knee, exponent);
                }
            }
        }
    };

    let coarse_knee: Vec<f64> = linspace(-2.0, 7.0, 46);
    let coarse_exp: Vec<f64> = linspace(0.1, 8.0, 40);
    search(&coarse_knee, &coarse_exp, &mut best);

    for span in [0.2, 0.02] {
        let knee_center = best.2.log10();
        let exp_center = best.3;
        let knee_grid = linspace(knee_center - span, knee_center + span, 21);
        let exp_grid = linspace((exp_center - span).max(0.01), exp_center + span, 21);
        search(&knee_grid, &exp_grid, &mut best);
    }

    AperiodicParams {
        offset: best.1,
        knee: Some(best.2),
        exponent: best.3,
    }
}

fn linspace(lo: f64, hi: f64, n: usize) -> Vec<f64> {
    let step = (hi - lo) / (n - 1) as f64;
    (0..n).map(|i| lo + step * i as f64).collect()
}

#[derive(Debug, Clone, Copy)]
struct Gaussian {
    center: f64,
    height: f64,
    std: f64,
}

fn gaussian_sum(f: f64, peaks: &[Gaussian]) -> f64 {
    peaks
        .iter()
        .map(|g| g.height * (-((f - g.center).powi(2)) / (2.0 * g.std * g.std)).exp())
        .sum()
}

/// Iterative peak extraction on the flattened spectrum. The highest residual
/// point seeds a Gaussian whose width comes from the half-height crossings;
/// each accepted peak is subtracted before the next search.
fn extract_peaks(freqs: &[f64], flat: &mut [f64], settings: &FitSettings) -> Vec<Gaussian> {
    let df = if freqs.len() > 1 {
        freqs[1] - freqs[0]
    } else {
        1.0
    };
    let std_limits = (
        settings.peak_width_limits.0 / 2.0,
        settings.peak_width_limits.1 / 2.0,
    );
    let fmin = freqs[0];
    let fmax = freqs[freqs.len() - 1];

    let mut peaks = Vec::new();
    while peaks.len() < settings.max_n_peaks {
        let (max_ind, max_height) = match flat
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        {
            Some((i, &h)) => (i, h),
            None => break,
        };
        // The second bound stops the search on numerically flat residuals.
        if max_height <= settings.peak_threshold * std_dev(flat) || max_height < 1e-9 {
            break;
        }
        if max_height <= settings.min_peak_height {
            break;
        }

        let half = max_height / 2.0;
        let left = (0..max_ind).rev().find(|&i| flat[i] <= half);
        let right = (max_ind + 1..flat.len()).find(|&i| flat[i] <= half);
        let guess_std = match (left, right) {
            (None, None) => (std_limits.0 + std_limits.1) / 2.0,
            (l, r) => {
                let dl = l.map(|i| max_ind - i);
                let dr = r.map(|i| i - max_ind);
                let short = match (dl, dr) {
                    (Some(a), Some(b)) => a.min(b),
                    (Some(a), None) => a,
                    (None, Some(b)) => b,
                    (None, None) => unreachable!(),
                };
                let fwhm = 2.0 * short as f64 * df;
                fwhm / (2.0 * (2.0 * 2.0_f64.ln()).sqrt())
            }
        }
        .clamp(std_limits.0, std_limits.1);

        let peak = Gaussian {
            center: freqs[max_ind],
            height: max_height,
            std: guess_std,
        };
        for (i, v) in flat.iter_mut().enumerate() {
            *v -= peak.height
                * (-((freqs[i] - peak.center).powi(2)) / (2.0 * peak.std * peak.std)).exp();
        }
        // Peaks hugging the spectrum edge are half-height estimates at best.
        if peak.center >= fmin + peak.std && peak.center <= fmax - peak.std {
            peaks.push(peak);
        }
    }
    peaks.retain(|p| p.height >= settings.min_peak_height);
    peaks
}

fn std_dev(x: &[f64]) -> f64 {
    let n = x.len() as f64;
    let mean = x.iter().sum::<f64>() / n;
    (x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

fn goodness(log_psd: &[f64], model: &[f64]) -> (f64, f64) {
    let n = log_psd.len() as f64;
    let mean = log_psd.iter().sum::<f64>() / n;
    let ss_tot: f64 = log_psd.iter().map(|y| (y - mean).powi(2)).sum();
    let ss_res: f64 = log_psd
        .iter()
        .zip(model)
        .map(|(y, m)| (y - m).powi(2))
        .sum();
    let r_squared = if ss_tot > 0.0 {
        1.0 - ss_res / ss_tot
    } else {
        f64::NAN
    };
    let rmse = (ss_res / n).sqrt();
    (r_squared, rmse)
}

fn classify(fit: &AperiodicFit, mode: AperiodicMode) -> FitStatus {
    let finite = fit.offset.is_finite()
        && fit.exponent.is_finite()
        && fit.r_squared.is_finite()
        && fit.error.is_finite()
        && fit.knee.map_or(true, |k| k.is_finite());
    if !finite {
        return FitStatus::NanParams;
    }
    if mode == AperiodicMode::Knee && fit.knee.map_or(true, |k| k <= 0.0) {
        return FitStatus::InvalidParams;
    }
    if !(fit.r_squared > 0.0 && fit.r_squared <= 1.0) || fit.error < 0.0 {
        return FitStatus::InvalidParams;
    }
    if !(fit.exponent > 0.0 && fit.exponent <= 10.0) {
        return FitStatus::InvalidExponent;
    }
    FitStatus::Success
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f64, expected: f64, rel_tol: f64) {
        let tol = expected.abs().max(1e-12) * rel_tol;
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual} (tol {tol})"
        );
    }

    fn freq_axis() -> Vec<f64> {
        // 1 to 45 Hz at the 0.25 Hz spacing of a 4 s Welch window
        (0..177).map(|i| 1.0 + 0.25 * i as f64).collect()
    }

    fn fixed_spectrum(freqs: &[f64], offset: f64, exponent: f64) -> Vec<f64> {
        freqs
            .iter()
            .map(|f| 10f64.powf(offset - exponent * f.log10()))
            .collect()
    }

    fn knee_spectrum(freqs: &[f64], offset: f64, knee: f64, exponent: f64) -> Vec<f64> {
        freqs
            .iter()
            .map(|f| 10f64.powf(offset - (knee + f.powf(exponent)).log10()))
            .collect()
    }

    fn add_gaussian(freqs: &[f64], psd: &mut [f64], center: f64, height: f64, std: f64) {
        for (f, p) in freqs.iter().zip(psd.iter_mut()) {
            let g = height * (-((f - center).powi(2)) / (2.0 * std * std)).exp();
            *p *= 10f64.powf(g);
        }
    }

    #[test]
    fn fixed_fit_recovers_parameters() {
        let freqs = freq_axis();
        let psd = fixed_spectrum(&freqs, 1.5, 1.8);
        let fit = fit_spectrum(&freqs, &psd, &FitSettings::aperiodic_fallback()).unwrap();
        assert_eq!(fit.status, FitStatus::Success);
        let ap = fit.aperiodic.unwrap();
        assert_close(ap.exponent, 1.8, 0.01);
        assert_close(ap.offset, 1.5, 0.01);
        assert!(ap.knee.is_none());
        assert!(ap.r_squared > 0.99);
    }

    #[test]
    fn knee_fit_recovers_parameters() {
        let freqs = freq_axis();
        let psd = knee_spectrum(&freqs, 2.0, 100.0, 2.2);
        let fit = fit_spectrum(&freqs, &psd, &FitSettings::aperiodic_primary()).unwrap();
        assert_eq!(fit.status, FitStatus::Success);
        let ap = fit.aperiodic.unwrap();
        assert_close(ap.exponent, 2.2, 0.05);
        assert_close(ap.knee.unwrap(), 100.0, 0.15);
        assert!(ap.r_squared > 0.99);
    }

    #[test]
    fn alpha_peak_is_extracted() {
        let freqs = freq_axis();
        let mut psd = fixed_spectrum(&freqs, 1.0, 1.5);
        add_gaussian(&freqs, &mut psd, 10.0, 0.8, 1.2);
        let fit = fit_spectrum(&freqs, &psd, &FitSettings::periodic()).unwrap();
        assert_eq!(fit.status, FitStatus::Success);
        let alpha = band_peak(&fit.peaks, 8.0, 13.0).expect("no alpha peak found");
        assert!((alpha.center_frequency - 10.0).abs() <= 0.5);
        assert!((alpha.power - 0.8).abs() < 0.2);
        assert!(alpha.bandwidth > 1.0 && alpha.bandwidth < 5.0);
        assert!(band_peak(&fit.peaks, 30.0, 45.0).is_none());
    }

    #[test]
    fn rising_spectrum_reports_invalid_exponent() {
        let freqs = freq_axis();
        // Power increasing with frequency has a negative 1/f exponent.
        let psd = fixed_spectrum(&freqs, 1.0, -2.0);
        let fit = fit_spectrum(&freqs, &psd, &FitSettings::aperiodic_fallback()).unwrap();
        assert_eq!(fit.status, FitStatus::InvalidExponent);
        assert!(fit.aperiodic.is_none());
        assert!(fit.peaks.is_empty());
    }

    #[test]
    fn nonpositive_power_fails_without_panicking() {
        let freqs = freq_axis();
        let mut psd = fixed_spectrum(&freqs, 1.0, 2.0);
        psd[40] = 0.0;
        let fit = fit_spectrum(&freqs, &psd, &FitSettings::aperiodic_fallback()).unwrap();
        assert_eq!(fit.status, FitStatus::FittingFailed);
    }

    #[test]
    fn fallback_rescues_a_failing_primary() {
        let freqs = freq_axis();
        let psd = fixed_spectrum(&freqs, 1.2, 2.0);
        // A pure fixed-law spectrum drives the knee fit toward zero knee,
        // which the classifier may reject; the fixed fallback must succeed.
        let fit = fit_with_fallback(
            &freqs,
            &psd,
            &FitSettings::aperiodic_primary(),
            Some(&FitSettings::aperiodic_fallback()),
        )
        .unwrap();
        assert_eq!(fit.status, FitStatus::Success);
    }

    #[test]
    fn batch_driver_preserves_order() {
        let freqs = freq_axis();
        let psds: Vec<Vec<f64>> = (0..7)
            .map(|i| fixed_spectrum(&freqs, 1.0, 1.0 + 0.2 * i as f64))
            .collect();
        let fits = fit_vertices(
            &freqs,
            &psds,
            &FitSettings::aperiodic_fallback(),
            None,
            2,
            3,
        )
        .unwrap();
        assert_eq!(fits.len(), 7);
        for (i, fit) in fits.iter().enumerate() {
            assert_eq!(fit.index, i);
            assert_eq!(fit.status, FitStatus::Success);
            let expected = 1.0 + 0.2 * i as f64;
            assert_close(fit.aperiodic.unwrap().exponent, expected, 0.01);
        }
        assert_close(success_rate(&fits), 100.0, 1e-9);
    }

    #[test]
    fn shape_mismatch_is_a_hard_error() {
        let freqs = freq_axis();
        let psd = vec![1.0; 10];
        assert!(fit_spectrum(&freqs, &psd, &FitSettings::periodic()).is_err());
    }
}
