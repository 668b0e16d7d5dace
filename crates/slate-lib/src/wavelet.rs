//! Periodized discrete wavelet transform and threshold denoising.
//!
//! Detail coefficients are shrunk with the universal threshold
//! `scale * sigma * sqrt(2 ln n)` where sigma is the finest-level median
//! absolute deviation estimate; the approximation band is left untouched.

use crate::filter::bandpass;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Orthogonal wavelet filter bank.
#[derive(Debug, Clone)]
pub struct Wavelet {
    pub name: &'static str,
    dec_lo: Vec<f64>,
    dec_hi: Vec<f64>,
}

const HAAR: [f64; 2] = [std::f64::consts::FRAC_1_SQRT_2, std::f64::consts::FRAC_1_SQRT_2];

const DB2: [f64; 4] = [
    -0.12940952255092145,
    0.22414386804185735,
    0.8365163037378079,
    0.48296291314469025,
];

const DB4: [f64; 8] = [
    -0.010597401784997278,
    0.032883011666982945,
    0.030841381835986965,
    -0.18703481171888114,
    -0.02798376941698385,
    0.6308807679295904,
    0.7148465705525415,
    0.23037781330885523,
];

const SYM4: [f64; 8] = [
    -0.07576571478927333,
    -0.02963552764599851,
    0.49761866763201545,
    0.8037387518059161,
    0.29785779560527736,
    -0.09921954357684722,
    -0.012603967262037833,
    0.0322231006040427,
];

const SYM8: [f64; 16] = [
    -0.0033824159510061256,
    -0.0005421323317911481,
    0.03169508781149298,
    0.007607487324917605,
    -0.1432942383508097,
    -0.061273359067658524,
    0.4813596512583722,
    0.7771857517005235,
    0.3644418948353314,
    -0.051945838107709037,
    -0.027219029917056003,
    0.049137179673607506,
    0.0038087520138906151,
    -0.01495225833704823,
    -0.0003029205147213668,
    0.0018899503327594609,
];

impl Wavelet {
    pub fn by_name(name: &str) -> Result<Wavelet> {
        let (canonical, dec_lo): (&'static str, &[f64]) = match name {
            "haar" => ("haar", &HAAR),
            "db2" => ("db2", &DB2),
            "db4" => ("db4", &DB4),
            "sym4" => ("sym4", &SYM4),
            "sym8" => ("sym8", &SYM8),
            other => bail!(
                "unknown wavelet {other:?}; available: haar, db2, db4, sym4, sym8"
            ),
        };
        let len = dec_lo.len();
        let dec_hi: Vec<f64> = (0..len)
            .map(|k| {
                let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
                sign * dec_lo[len - 1 - k]
            })
            .collect();
        Ok(Wavelet {
            name: canonical,
            dec_lo: dec_lo.to_vec(),
            dec_hi,
        })
    }

    pub fn filter_len(&self) -> usize {
        self.dec_lo.len()
    }
}

/// Deepest useful level for a signal of `n` samples.
pub fn max_level(n: usize, filter_len: usize) -> usize {
    if filter_len < 2 || n < filter_len {
        return 0;
    }
    ((n as f64) / (filter_len as f64 - 1.0)).log2().floor() as usize
}

/// Multi-level decomposition. `details[0]` is the finest level.
#[derive(Debug, Clone)]
pub struct Decomposition {
    pub approx: Vec<f64>,
    pub details: Vec<Vec<f64>>,
    /// Input length at each level, for undoing the odd-length pad
    lengths: Vec<usize>,
}

pub fn wavedec(signal: &[f64], wavelet: &Wavelet, level: usize) -> Result<Decomposition> {
    if signal.is_empty() {
        bail!("cannot decompose an empty signal");
    }
    let cap = max_level(signal.len(), wavelet.filter_len());
    if level == 0 || level > cap {
        bail!(
            "decomposition level {level} out of range; max for {} samples with {} is {cap}",
            signal.len(),
            wavelet.name
        );
    }
    let mut approx = signal.to_vec();
    let mut details = Vec::with_capacity(level);
    let mut lengths = Vec::with_capacity(level);
    for _ in 0..level {
        lengths.push(approx.len());
        let (a, d) = dwt_step(&approx, wavelet);
        details.push(d);
        approx = a;
    }
    Ok(Decomposition {
        approx,
        details,
        lengths,
    })
}

pub fn waverec(dec: &Decomposition, wavelet: &Wavelet) -> Vec<f64> {
    let mut approx = dec.approx.clone();
    // details are finest-first; rebuild from the coarsest level up.
    for (detail, &target_len) in dec.details.iter().rev().zip(dec.lengths.iter().rev()) {
        approx = idwt_step(&approx, detail, wavelet, target_len);
    }
    approx
}

/// One periodized analysis step. Odd inputs repeat their last sample.
fn dwt_step(x: &[f64], w: &Wavelet) -> (Vec<f64>, Vec<f64>) {
    let mut input = x.to_vec();
    if input.len() % 2 == 1 {
        input.push(*input.last().unwrap());
    }
    let n = input.len();
    let half = n / 2;
    let taps = w.filter_len();
    let mut approx = vec![0.0; half];
    let mut detail = vec![0.0; half];
    for i in 0..half {
        let mut a = 0.0;
        let mut d = 0.0;
        for k in 0..taps {
            let v = input[(2 * i + k) % n];
            a += w.dec_lo[k] * v;
            d += w.dec_hi[k] * v;
        }
        approx[i] = a;
        detail[i] = d;
    }
    (approx, detail)
}

/// One periodized synthesis step; the analysis operator is orthogonal, so
/// synthesis is its transpose.
fn idwt_step(approx: &[f64], detail: &[f64], w: &Wavelet, target_len: usize) -> Vec<f64> {
    let half = approx.len();
    let n = half * 2;
    let taps = w.filter_len();
    let mut out = vec![0.0; n];
    for i in 0..half {
        for k in 0..taps {
            let j = (2 * i + k) % n;
            out[j] += w.dec_lo[k] * approx[i] + w.dec_hi[k] * detail[i];
        }
    }
    out.truncate(target_len);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdMode {
    Soft,
    Hard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenoiseSettings {
    pub wavelet: String,
    /// None selects the deepest level the signal supports
    pub level: Option<usize>,
    pub mode: ThresholdMode,
    pub threshold_scale: f64,
}

impl Default for DenoiseSettings {
    fn default() -> Self {
        Self {
            wavelet: "sym4".to_string(),
            level: None,
            mode: ThresholdMode::Soft,
            threshold_scale: 1.0,
        }
    }
}

/// Universal-threshold wavelet denoising of one channel.
pub fn denoise_channel(signal: &[f64], settings: &DenoiseSettings) -> Result<Vec<f64>> {
    if settings.threshold_scale <= 0.0 {
        bail!(
            "threshold_scale must be positive, got {}",
            settings.threshold_scale
        );
    }
    let wavelet = Wavelet::by_name(&settings.wavelet)?;
    let cap = max_level(signal.len(), wavelet.filter_len());
    if cap == 0 {
        bail!(
            "signal of {} samples is too short for wavelet {}",
            signal.len(),
            wavelet.name
        );
    }
    let level = match settings.level {
        Some(l) => {
            if l > cap {
                bail!("level {l} exceeds the maximum {cap} for this signal");
            }
            l
        }
        None => cap,
    };
    let mut dec = wavedec(signal, &wavelet, level)?;

    let finest = dec
        .details
        .first()
        .map(|d| d.as_slice())
        .unwrap_or(&[]);
    let sigma = median_abs(finest) / 0.6745;
    let thr = settings.threshold_scale * sigma * (2.0 * (signal.len() as f64).ln()).sqrt();
    for detail in dec.details.iter_mut() {
        for c in detail.iter_mut() {
            *c = match settings.mode {
                ThresholdMode::Soft => c.signum() * (c.abs() - thr).max(0.0),
                ThresholdMode::Hard => {
                    if c.abs() > thr {
                        *c
                    } else {
                        0.0
                    }
                }
            };
        }
    }
    Ok(waverec(&dec, &wavelet))
}

/// ERP variant: only the band-limited part of the removed component is
/// subtracted, so evoked energy outside the band is untouched.
pub fn denoise_channel_erp(
    signal: &[f64],
    fs: f64,
    settings: &DenoiseSettings,
    band: (f64, f64),
) -> Result<Vec<f64>> {
    let denoised = denoise_channel(signal, settings)?;
    let artifact: Vec<f64> = signal
        .iter()
        .zip(&denoised)
        .map(|(x, y)| x - y)
        .collect();
    let limited = bandpass(&artifact, fs, band.0, band.1)?;
    Ok(signal.iter().zip(&limited).map(|(x, a)| x - a).collect())
}

/// Denoising effect summary across channels, in input units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DenoiseMetrics {
    pub mean_abs_diff_uv: f64,
    pub ptp_reduction_percent: f64,
}

pub fn denoise_metrics(before: &[Vec<f64>], after: &[Vec<f64>]) -> DenoiseMetrics {
    let mut abs_diff = 0.0;
    let mut count = 0usize;
    let mut ptp_reduction = 0.0;
    let mut channels = 0usize;
    for (b, a) in before.iter().zip(after) {
        for (x, y) in b.iter().zip(a) {
            abs_diff += (x - y).abs();
            count += 1;
        }
        let ptp_b = peak_to_peak(b);
        let ptp_a = peak_to_peak(a);
        if ptp_b > 0.0 {
            ptp_reduction += (ptp_b - ptp_a) / ptp_b * 100.0;
            channels += 1;
        }
    }
    DenoiseMetrics {
        mean_abs_diff_uv: if count > 0 { abs_diff / count as f64 } else { 0.0 },
        ptp_reduction_percent: if channels > 0 {
            ptp_reduction / channels as f64
        } else {
            0.0
        },
    }
}

fn peak_to_peak(x: &[f64]) -> f64 {
    let mut min = f64::MAX;
    let mut max = f64::MIN;
    for &v in x {
        min = min.min(v);
        max = max.max(v);
    }
    if min > max {
        0.0
    } else {
        max - min
    }
}

fn median_abs(x: &[f64]) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    let mut mags: Vec<f64> = x.iter().map(|v| v.abs()).collect();
    mags.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = mags.len() / 2;
    if mags.len() % 2 == 0 {
        (mags[mid - 1] + mags[mid]) / 2.0
    } else {
        mags[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::f64::consts::PI;

    fn noisy_sine(n: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| (2.0 * PI * 0.01 * i as f64).sin() * 20.0 + rng.gen_range(-1.0..1.0))
            .collect()
    }

    fn clean_sine(n: usize) -> Vec<f64> {
        (0..n).map(|i| (2.0 * PI * 0.01 * i as f64).sin() * 20.0).collect()
    }

    fn rmse(a: &[f64], b: &[f64]) -> f64 {
        let sum: f64 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum();
        (sum / a.len() as f64).sqrt()
    }

    #[test]
    fn decomposition_round_trips() {
        for name in ["haar", "db2", "db4", "sym4", "sym8"] {
            let wavelet = Wavelet::by_name(name).unwrap();
            let x = noisy_sine(512, 3);
            let dec = wavedec(&x, &wavelet, 3).unwrap();
            let back = waverec(&dec, &wavelet);
            assert_eq!(back.len(), x.len());
            for (a, b) in x.iter().zip(&back) {
                assert!((a - b).abs() < 1e-8, "{name}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn odd_length_round_trips() {
        let wavelet = Wavelet::by_name("sym4").unwrap();
        let x = noisy_sine(501, 4);
        let dec = wavedec(&x, &wavelet, 2).unwrap();
        let back = waverec(&dec, &wavelet);
        assert_eq!(back.len(), 501);
        for (a, b) in x.iter().zip(&back) {
            assert!((a - b).abs() < 1e-8);
        }
    }

    #[test]
    fn max_level_matches_filter_length() {
        assert_eq!(max_level(1000, 8), 7);
        assert_eq!(max_level(16, 2), 4);
        assert_eq!(max_level(4, 8), 0);
    }

    #[test]
    fn denoising_suppresses_background_noise() {
        let n = 1024;
        let reference = clean_sine(n);
        let mut rng = StdRng::seed_from_u64(5);
        let noisy: Vec<f64> = reference
            .iter()
            .map(|v| v + rng.gen_range(-4.0..4.0))
            .collect();
        let settings = DenoiseSettings {
            mode: ThresholdMode::Hard,
            ..DenoiseSettings::default()
        };
        let denoised = denoise_channel(&noisy, &settings).unwrap();
        let before = rmse(&noisy, &reference);
        let after = rmse(&denoised, &reference);
        assert!(after < before * 0.5, "rmse {after} vs {before}");

        let metrics = denoise_metrics(&[noisy.clone()], &[denoised.clone()]);
        assert!(metrics.mean_abs_diff_uv > 0.0);
        assert!(metrics.ptp_reduction_percent > 0.0);
    }

    #[test]
    fn soft_mode_also_reduces_noise() {
        let n = 1024;
        let reference = clean_sine(n);
        let mut rng = StdRng::seed_from_u64(9);
        let noisy: Vec<f64> = reference
            .iter()
            .map(|v| v + rng.gen_range(-4.0..4.0))
            .collect();
        let denoised = denoise_channel(&noisy, &DenoiseSettings::default()).unwrap();
        assert!(rmse(&denoised, &reference) < rmse(&noisy, &reference) * 0.8);
    }

    #[test]
    fn hard_mode_keeps_large_coefficients() {
        let x = noisy_sine(512, 6);
        let soft = denoise_channel(
            &x,
            &DenoiseSettings {
                mode: ThresholdMode::Soft,
                ..DenoiseSettings::default()
            },
        )
        .unwrap();
        let hard = denoise_channel(
            &x,
            &DenoiseSettings {
                mode: ThresholdMode::Hard,
                ..DenoiseSettings::default()
            },
        )
        .unwrap();
        let energy = |v: &[f64]| v.iter().map(|x| x * x).sum::<f64>();
        assert!(energy(&hard) >= energy(&soft));
    }

    #[test]
    fn erp_mode_preserves_out_of_band_content() {
        let fs = 250.0;
        let n = 2048;
        // 40 Hz content sits outside the 1-30 Hz correction band.
        let x: Vec<f64> = (0..n)
            .map(|i| {
                let t = i as f64 / fs;
                10.0 * (2.0 * PI * 40.0 * t).sin()
            })
            .collect();
        let settings = DenoiseSettings {
            threshold_scale: 0.1,
            ..DenoiseSettings::default()
        };
        let erp = denoise_channel_erp(&x, fs, &settings, (1.0, 30.0)).unwrap();
        let rms = |v: &[f64]| (v.iter().map(|x| x * x).sum::<f64>() / v.len() as f64).sqrt();
        let core_in = rms(&x[512..1536]);
        let core_out = rms(&erp[512..1536]);
        assert!((core_in - core_out).abs() / core_in < 0.05);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let x = noisy_sine(512, 7);
        assert!(Wavelet::by_name("sym99").is_err());
        let bad_scale = DenoiseSettings {
            threshold_scale: 0.0,
            ..DenoiseSettings::default()
        };
        assert!(denoise_channel(&x, &bad_scale).is_err());
        let deep = DenoiseSettings {
            level: Some(40),
            ..DenoiseSettings::default()
        };
        assert!(denoise_channel(&x, &deep).is_err());
    }
}
