use crate::signal::{Epochs, FrequencyBand, Recording};
use anyhow::{bail, Result};
use realfft::RealFftPlanner;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// One-sided power spectral density, density scaling (uV^2/Hz for uV input).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Psd {
    pub freqs: Vec<f64>,
    pub power: Vec<f64>,
}

impl Psd {
    pub fn freq_step(&self) -> f64 {
        if self.freqs.len() > 1 {
            self.freqs[1] - self.freqs[0]
        } else {
            0.0
        }
    }

    /// Restricts the spectrum to `[fmin, fmax]` inclusive.
    pub fn crop(&self, fmin: f64, fmax: f64) -> Psd {
        let mut freqs = Vec::new();
        let mut power = Vec::new();
        for (f, p) in self.freqs.iter().zip(&self.power) {
            if *f >= fmin && *f <= fmax {
                freqs.push(*f);
                power.push(*p);
            }
        }
        Psd { freqs, power }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WelchOptions {
    /// Segment length in seconds
    pub segment_s: f64,
    /// Overlap fraction in [0, 1)
    pub overlap: f64,
}

impl Default for WelchOptions {
    fn default() -> Self {
        Self {
            segment_s: 4.0,
            overlap: 0.5,
        }
    }
}

/// Welch PSD of one channel: hann window, averaged overlapping segments,
/// one-sided with DC and Nyquist not doubled.
pub fn welch_psd(signal: &[f64], fs: f64, opts: &WelchOptions) -> Result<Psd> {
    if signal.is_empty() {
        bail!("cannot compute a PSD of an empty signal");
    }
    if fs <= 0.0 {
        bail!("sampling frequency must be positive, got {fs}");
    }
    if !(0.0..1.0).contains(&opts.overlap) {
        bail!("overlap fraction must be in [0, 1), got {}", opts.overlap);
    }
    let n = signal.len();
    let window = ((opts.segment_s * fs).round() as usize).clamp(4, n);
    let step = ((window as f64) * (1.0 - opts.overlap)).round().max(1.0) as usize;
    let window_func = hann(window);
    let win_power: f64 = window_func.iter().map(|w| w * w).sum();
    let scale = 1.0 / (fs * win_power);

    let mut planner = RealFftPlanner::<f64>::new();
    let r2c = planner.plan_fft_forward(window);
    let mut freqs = Vec::new();
    let mut powers = Vec::new();
    let mut pos = 0;
    let mut segments = 0;
    while pos + window <= n {
        let mut frame: Vec<f64> = signal[pos..pos + window]
            .iter()
            .zip(window_func.iter())
            .map(|(x, w)| x * w)
            .collect();
        let mut spectrum = r2c.make_output_vec();
        r2c.process(&mut frame, &mut spectrum).unwrap();
        for (k, val) in spectrum.iter().enumerate() {
            if segments == 0 {
                freqs.push(k as f64 * fs / window as f64);
                powers.push(0.0);
            }
            let power = if k == 0 || (window % 2 == 0 && k == window / 2) {
                val.norm_sqr()
            } else {
                2.0 * val.norm_sqr()
            } * scale;
            powers[k] += power;
        }
        segments += 1;
        pos += step;
    }
    if segments > 0 {
        for p in powers.iter_mut() {
            *p /= segments as f64;
        }
    }
    Ok(Psd { freqs, power: powers })
}

/// Per-channel Welch PSD of a recording. All channels share the frequency axis.
pub fn welch_psd_matrix(rec: &Recording, opts: &WelchOptions) -> Result<(Vec<f64>, Vec<Vec<f64>>)> {
    rec.validate()?;
    let mut freqs = Vec::new();
    let mut rows = Vec::with_capacity(rec.n_channels());
    for ch in &rec.data {
        let psd = welch_psd(ch, rec.fs, opts)?;
        if freqs.is_empty() {
            freqs = psd.freqs;
        }
        rows.push(psd.power);
    }
    Ok((freqs, rows))
}

/// Per-channel PSD averaged across epochs.
pub fn welch_psd_epochs(epochs: &Epochs, opts: &WelchOptions) -> Result<(Vec<f64>, Vec<Vec<f64>>)> {
    if epochs.n_epochs() == 0 {
        bail!("cannot compute a PSD of an empty epoch set");
    }
    let mut freqs: Vec<f64> = Vec::new();
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for epoch in &epochs.data {
        for (ch_idx, ch) in epoch.iter().enumerate() {
            let psd = welch_psd(ch, epochs.fs, opts)?;
            if freqs.is_empty() {
                freqs = psd.freqs.clone();
            }
            if rows.len() <= ch_idx {
                rows.push(vec![0.0; psd.power.len()]);
            }
            for (acc, p) in rows[ch_idx].iter_mut().zip(&psd.power) {
                *acc += p;
            }
        }
    }
    let n = epochs.n_epochs() as f64;
    for row in rows.iter_mut() {
        for p in row.iter_mut() {
            *p /= n;
        }
    }
    Ok((freqs, rows))
}

/// Integrated density over `[lo, hi)`, rectangle rule.
pub fn band_power(psd: &Psd, lo: f64, hi: f64) -> f64 {
    let df = psd.freq_step();
    psd.freqs
        .iter()
        .zip(&psd.power)
        .filter(|(f, _)| **f >= lo && **f < hi)
        .map(|(_, p)| *p)
        .sum::<f64>()
        * df
}

/// Band powers for every band in `bands`, in order.
pub fn band_powers(psd: &Psd, bands: &[FrequencyBand]) -> Vec<f64> {
    bands.iter().map(|b| band_power(psd, b.lo, b.hi)).collect()
}

fn hann(size: usize) -> Vec<f64> {
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / (size as f64)).cos()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::default_bands;

    fn sine(freq: f64, fs: f64, seconds: f64, amp: f64) -> Vec<f64> {
        let n = (fs * seconds) as usize;
        (0..n)
            .map(|i| amp * (2.0 * PI * freq * i as f64 / fs).sin())
            .collect()
    }

    fn assert_close(actual: f64, expected: f64, rel_tol: f64) {
        let tol = expected.abs().max(1e-12) * rel_tol;
        let diff = (actual - expected).abs();
        assert!(
            diff <= tol,
            "expected {expected}, got {actual} (diff {diff} > tol {tol})"
        );
    }

    #[test]
    fn sine_peak_lands_on_its_frequency() {
        let fs = 250.0;
        let signal = sine(10.0, fs, 20.0, 30.0);
        let psd = welch_psd(&signal, fs, &WelchOptions::default()).unwrap();
        let peak = psd
            .power
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert_close(psd.freqs[peak], 10.0, 1e-6);
    }

    #[test]
    fn density_integral_recovers_sine_variance() {
        // A sine of amplitude a has variance a^2/2.
        let fs = 250.0;
        let amp = 20.0;
        let signal = sine(10.0, fs, 30.0, amp);
        let psd = welch_psd(&signal, fs, &WelchOptions::default()).unwrap();
        let total = band_power(&psd, 0.0, fs / 2.0);
        assert_close(total, amp * amp / 2.0, 0.05);
    }

    #[test]
    fn alpha_sine_concentrates_in_alpha_band() {
        let fs = 250.0;
        let signal = sine(10.0, fs, 20.0, 10.0);
        let psd = welch_psd(&signal, fs, &WelchOptions::default()).unwrap();
        let bands = default_bands();
        let powers = band_powers(&psd, &bands);
        let alpha = powers[2];
        let rest: f64 = powers[0] + powers[1] + powers[3] + powers[4];
        assert!(alpha > 100.0 * rest.max(1e-12));
    }

    #[test]
    fn short_signal_uses_single_window() {
        let fs = 100.0;
        let signal = sine(5.0, fs, 1.0, 1.0);
        let psd = welch_psd(&signal, fs, &WelchOptions::default()).unwrap();
        assert_eq!(psd.freqs.len(), signal.len() / 2 + 1);
    }

    #[test]
    fn crop_bounds_are_inclusive() {
        let fs = 100.0;
        let signal = sine(5.0, fs, 8.0, 1.0);
        let psd = welch_psd(&signal, fs, &WelchOptions::default()).unwrap();
        let cropped = psd.crop(0.5, 45.0);
        assert!(cropped.freqs.first().unwrap() >= &0.5);
        assert!(cropped.freqs.last().unwrap() <= &45.0);
        assert_eq!(cropped.freqs.len(), cropped.power.len());
    }

    #[test]
    fn empty_signal_is_an_error() {
        assert!(welch_psd(&[], 100.0, &WelchOptions::default()).is_err());
    }
}
