//! DSS-based power line removal.
//!
//! Splits each channel into a smoothed part (one line period moving average,
//! which nulls the line frequency and its harmonics) and a residual, finds
//! the spatial components of the residual that carry line power via a biased
//! covariance eigendecomposition, projects the strongest components out, and
//! recombines. See de Cheveigne (2020), NeuroImage 207:116356.

use crate::signal::Recording;
use crate::spectral::{welch_psd_matrix, WelchOptions};
use anyhow::{anyhow, bail, Result};
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};

/// Mean channel power around the line frequency, and its ratio to background.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LineNoiseStats {
    /// 10*log10 of mean density in `fline +/- bandwidth/2`
    pub power_db: f64,
    /// Line band power over background power (background excludes fline +/- 5 Hz)
    pub snr: f64,
}

/// Before/after comparison for a line removal pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LineRemovalReport {
    pub power_before_db: f64,
    pub power_after_db: f64,
    pub reduction_db: f64,
    pub snr_before: f64,
    pub snr_after: f64,
    /// At least 10 dB of line power removed
    pub success: bool,
    pub fline: f64,
}

pub fn line_noise_power(rec: &Recording, fline: f64, bandwidth: f64) -> Result<LineNoiseStats> {
    let opts = WelchOptions {
        segment_s: 4.0,
        overlap: 0.5,
    };
    let (freqs, rows) = welch_psd_matrix(rec, &opts)?;
    let n_ch = rows.len() as f64;
    let mean: Vec<f64> = (0..freqs.len())
        .map(|k| rows.iter().map(|r| r[k]).sum::<f64>() / n_ch)
        .collect();

    let half = bandwidth / 2.0;
    let mut line_sum = 0.0;
    let mut line_n = 0usize;
    let mut bg_sum = 0.0;
    let mut bg_n = 0usize;
    for (f, p) in freqs.iter().zip(&mean) {
        if (*f - fline).abs() <= half {
            line_sum += p;
            line_n += 1;
        }
        if *f < fline - 5.0 || *f > fline + 5.0 {
            bg_sum += p;
            bg_n += 1;
        }
    }
    if line_n == 0 {
        bail!("no PSD bins fall in the {fline} +/- {half} Hz line band");
    }
    let line_power = line_sum / line_n as f64;
    let background = if bg_n > 0 { bg_sum / bg_n as f64 } else { 0.0 };
    Ok(LineNoiseStats {
        power_db: 10.0 * line_power.log10(),
        snr: if background > 0.0 {
            line_power / background
        } else {
            0.0
        },
    })
}

/// Measures line power on both recordings and flags success at 10 dB reduction.
pub fn validate_line_removal(
    before: &Recording,
    after: &Recording,
    fline: f64,
) -> Result<LineRemovalReport> {
    let pre = line_noise_power(before, fline, 2.0)?;
    let post = line_noise_power(after, fline, 2.0)?;
    let reduction_db = pre.power_db - post.power_db;
    Ok(LineRemovalReport {
        power_before_db: pre.power_db,
        power_after_db: post.power_db,
        reduction_db,
        snr_before: pre.snr,
        snr_after: post.snr,
        success: reduction_db >= 10.0,
        fline,
    })
}

/// Single-pass DSS line removal.
pub fn dss_line(rec: &Recording, fline: f64, nkeep: usize) -> Result<Recording> {
    rec.validate()?;
    let n_ch = rec.n_channels();
    let n = rec.n_samples();
    if n_ch < 2 {
        bail!(
            "line removal requires at least 2 channels, got {n_ch}; \
             the spatial filter exploits cross-channel structure"
        );
    }
    if fline >= rec.fs / 2.0 {
        bail!(
            "line frequency {fline} Hz must be below Nyquist ({} Hz)",
            rec.fs / 2.0
        );
    }
    if nkeep == 0 || nkeep >= n_ch {
        bail!("nkeep must be in 1..{n_ch}, got {nkeep}");
    }
    let period = (rec.fs / fline).round().max(2.0) as usize;
    if n < 4 * period {
        bail!("recording too short for line removal: {n} samples");
    }

    // Smooth part nulls fline and harmonics; residual carries the line.
    let smooth: Vec<Vec<f64>> = rec.data.iter().map(|ch| moving_average(ch, period)).collect();
    let resid = DMatrix::from_fn(n, n_ch, |i, j| rec.data[j][i] - smooth[j][i]);
    let combed = comb_filter(&resid, rec.fs, fline);

    let c0 = cov(&resid);
    let c1 = cov(&combed);
    let todss = dss_rotation(&c0, &c1)?;
    let k = nkeep.min(todss.ncols());

    let sources = &resid * &todss;
    let mixing = todss
        .clone()
        .pseudo_inverse(1e-12)
        .map_err(|e| anyhow!("DSS unmixing is singular: {e}"))?;
    let artifact = sources.columns(0, k) * mixing.rows(0, k);
    let clean = &resid - &artifact;

    let data: Vec<Vec<f64>> = (0..n_ch)
        .map(|j| (0..n).map(|i| smooth[j][i] + clean[(i, j)]).collect())
        .collect();
    Ok(Recording {
        fs: rec.fs,
        channels: rec.channels.clone(),
        data,
    })
}

/// Repeats single passes until line power improves by less than 1 dB.
/// Returns the cleaned recording and the number of passes used.
pub fn dss_line_iter(
    rec: &Recording,
    fline: f64,
    nkeep: usize,
    max_iter: usize,
) -> Result<(Recording, usize)> {
    if max_iter == 0 {
        bail!("max_iter must be at least 1");
    }
    let mut current = rec.clone();
    let mut last_db = line_noise_power(&current, fline, 2.0)?.power_db;
    let mut iterations = 0;
    while iterations < max_iter {
        let next = dss_line(&current, fline, nkeep)?;
        let db = line_noise_power(&next, fline, 2.0)?.power_db;
        iterations += 1;
        current = next;
        if last_db - db < 1.0 {
            break;
        }
        last_db = db;
    }
    Ok((current, iterations))
}

/// Centered moving average, edges shortened to the available samples.
fn moving_average(x: &[f64], window: usize) -> Vec<f64> {
    let n = x.len();
    let mut prefix = Vec::with_capacity(n + 1);
    prefix.push(0.0);
    for &v in x {
        prefix.push(prefix.last().unwrap() + v);
    }
    let before = window / 2;
    let after = window - before;
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(before);
            let hi = (i + after).min(n);
            (prefix[hi] - prefix[lo]) / (hi - lo) as f64
        })
        .collect()
}

/// Keeps only FFT bins within one bin of each line harmonic.
fn comb_filter(resid: &DMatrix<f64>, fs: f64, fline: f64) -> DMatrix<f64> {
    let n = resid.nrows();
    let n_ch = resid.ncols();
    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(n);
    let ifft = planner.plan_fft_inverse(n);

    let mut keep = vec![false; n];
    let mut harm = 1;
    loop {
        let f = fline * harm as f64;
        if f >= fs / 2.0 {
            break;
        }
        let center = (f * n as f64 / fs).round() as usize;
        for bin in center.saturating_sub(1)..=(center + 1).min(n / 2) {
            if bin > 0 {
                keep[bin] = true;
                keep[n - bin] = true;
            }
        }
        harm += 1;
    }

    let mut out = DMatrix::zeros(n, n_ch);
    for j in 0..n_ch {
        let mut buf: Vec<Complex<f64>> =
            (0..n).map(|i| Complex::new(resid[(i, j)], 0.0)).collect();
        fft.process(&mut buf);
        for (bin, v) in buf.iter_mut().enumerate() {
            if !keep[bin] {
                *v = Complex::new(0.0, 0.0);
            }
        }
        ifft.process(&mut buf);
        let inv = 1.0 / n as f64;
        for i in 0..n {
            out[(i, j)] = buf[i].re * inv;
        }
    }
    out
}

fn cov(x: &DMatrix<f64>) -> DMatrix<f64> {
    let n = x.nrows() as f64;
    (x.transpose() * x) / n
}

/// DSS rotation: whiten by the residual covariance, then rotate to the
/// eigenbasis of the whitened biased covariance. Columns are ordered by
/// decreasing line power ratio.
fn dss_rotation(c0: &DMatrix<f64>, c1: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    let eig0 = SymmetricEigen::new(c0.clone());
    let max_ev = eig0.eigenvalues.iter().cloned().fold(f64::MIN, f64::max);
    if !(max_ev > 0.0) {
        bail!("residual covariance has no positive eigenvalues");
    }
    let mut kept: Vec<(f64, DVector<f64>)> = Vec::new();
    for (idx, &ev) in eig0.eigenvalues.iter().enumerate() {
        if ev > 1e-12 * max_ev {
            kept.push((ev, eig0.eigenvectors.column(idx).into_owned()));
        }
    }
    if kept.is_empty() {
        bail!("residual covariance is numerically zero");
    }
    let whiten_cols: Vec<DVector<f64>> = kept
        .iter()
        .map(|(ev, v)| v / ev.sqrt())
        .collect();
    let whitener = DMatrix::from_columns(&whiten_cols);

    let c1w = whitener.transpose() * c1 * &whitener;
    let sym = SymmetricEigen::new((&c1w + c1w.transpose()) * 0.5);
    let mut order: Vec<usize> = (0..sym.eigenvalues.len()).collect();
    order.sort_by(|&a, &b| {
        sym.eigenvalues[b]
            .partial_cmp(&sym.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let rot_cols: Vec<DVector<f64>> = order
        .iter()
        .map(|&i| sym.eigenvectors.column(i).into_owned())
        .collect();
    let rotation = DMatrix::from_columns(&rot_cols);
    Ok(whitener * rotation)
}
