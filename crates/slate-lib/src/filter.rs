//! Zero-phase FIR band-pass filtering and analytic envelopes.
//!
//! The band-pass is a Hamming windowed-sinc design applied by FFT
//! convolution; zero phase comes from shifting the output left by the
//! group delay, with reflect-limited padding to suppress edge transients.

use anyhow::{bail, Result};
use rustfft::{num_complex::Complex, FftPlanner};
use std::f64::consts::PI;

/// Designs an odd-length Hamming windowed-sinc band-pass.
///
/// The gain is normalized to 1 at the geometric band center.
pub fn design_bandpass(fs: f64, lo: f64, hi: f64) -> Result<Vec<f64>> {
    design_bandpass_limited(fs, lo, hi, usize::MAX)
}

/// Band-pass design with the kernel capped at `max_taps`, widening the
/// transition band when a short signal cannot carry the full-length kernel.
pub fn design_bandpass_limited(fs: f64, lo: f64, hi: f64, max_taps: usize) -> Result<Vec<f64>> {
    if !(lo > 0.0 && lo < hi && hi < fs / 2.0) {
        bail!("band edges must satisfy 0 < lo < hi < fs/2, got {lo}..{hi} at {fs} Hz");
    }
    // Transition width tied to the lower edge, bounded to keep taps sane.
    let trans = (lo * 0.25).clamp(0.5, 2.0);
    let mut n_taps = (3.3 * fs / trans).ceil() as usize;
    if n_taps > max_taps {
        n_taps = max_taps;
    }
    if n_taps % 2 == 0 {
        n_taps -= 1;
    }
    if n_taps < 9 {
        bail!("signal too short for a {lo}..{hi} Hz band-pass at {fs} Hz");
    }
    let mid = (n_taps - 1) as f64 / 2.0;
    let w1 = 2.0 * PI * lo / fs;
    let w2 = 2.0 * PI * hi / fs;
    let mut h = Vec::with_capacity(n_taps);
    for i in 0..n_taps {
        let m = i as f64 - mid;
        let ideal = if m == 0.0 {
            (w2 - w1) / PI
        } else {
            ((w2 * m).sin() - (w1 * m).sin()) / (PI * m)
        };
        let window = 0.54 - 0.46 * (2.0 * PI * i as f64 / (n_taps - 1) as f64).cos();
        h.push(ideal * window);
    }
    // Unity gain at the geometric center of the pass band.
    let fc = (lo * hi).sqrt();
    let mut re = 0.0;
    let mut im = 0.0;
    for (i, tap) in h.iter().enumerate() {
        let phase = -2.0 * PI * fc * i as f64 / fs;
        re += tap * phase.cos();
        im += tap * phase.sin();
    }
    let gain = (re * re + im * im).sqrt();
    if gain > 0.0 {
        for tap in h.iter_mut() {
            *tap /= gain;
        }
    }
    Ok(h)
}

/// Applies a band-pass filter with zero phase; output length equals input length.
pub fn bandpass(signal: &[f64], fs: f64, lo: f64, hi: f64) -> Result<Vec<f64>> {
    let h = design_bandpass_limited(fs, lo, hi, signal.len())?;
    filter_zero_phase(signal, &h)
}

/// Zero-phase FIR application by single-block FFT convolution.
pub fn filter_zero_phase(signal: &[f64], h: &[f64]) -> Result<Vec<f64>> {
    if signal.is_empty() {
        return Ok(Vec::new());
    }
    if h.len() % 2 == 0 {
        bail!("zero-phase filtering needs an odd-length kernel, got {}", h.len());
    }
    let n = signal.len();
    let shift = (h.len() - 1) / 2;
    let n_edge = h.len() - 1;
    let padded = reflect_limited_pad(signal, n_edge);
    let n_fft = (padded.len() + h.len() - 1).next_power_of_two();

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(n_fft);
    let ifft = planner.plan_fft_inverse(n_fft);

    let mut x: Vec<Complex<f64>> = padded
        .iter()
        .map(|&v| Complex::new(v, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(n_fft)
        .collect();
    let mut k: Vec<Complex<f64>> = h
        .iter()
        .map(|&v| Complex::new(v, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(n_fft)
        .collect();
    fft.process(&mut x);
    fft.process(&mut k);
    for (a, b) in x.iter_mut().zip(&k) {
        *a *= *b;
    }
    ifft.process(&mut x);
    let inv = 1.0 / n_fft as f64;

    // Convolution output index = padding offset + zero-phase shift.
    let offset = n_edge + shift;
    Ok((0..n).map(|i| x[offset + i].re * inv).collect())
}

/// Magnitude of the analytic signal (Hilbert envelope).
pub fn analytic_envelope(signal: &[f64]) -> Vec<f64> {
    let n = signal.len();
    if n == 0 {
        return Vec::new();
    }
    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(n);
    let ifft = planner.plan_fft_inverse(n);
    let mut buf: Vec<Complex<f64>> = signal.iter().map(|&v| Complex::new(v, 0.0)).collect();
    fft.process(&mut buf);
    // Analytic spectrum: keep DC (and Nyquist for even n), double positives,
    // zero negatives.
    let half = n / 2;
    for (k, v) in buf.iter_mut().enumerate() {
        if k == 0 || (n % 2 == 0 && k == half) {
            continue;
        } else if k < half || (n % 2 == 1 && k <= half) {
            *v *= 2.0;
        } else {
            *v = Complex::new(0.0, 0.0);
        }
    }
    ifft.process(&mut buf);
    let inv = 1.0 / n as f64;
    buf.iter().map(|c| (c * inv).norm()).collect()
}

/// Reflect-limited padding on both sides: `pad[i] = 2*x[0] - x[k]` mirrored
/// around the first/last sample, clipped to the signal length.
fn reflect_limited_pad(x: &[f64], pad: usize) -> Vec<f64> {
    let n = x.len();
    let eff = pad.min(n - 1);
    let mut out = Vec::with_capacity(n + 2 * pad);
    for _ in eff..pad {
        out.push(0.0);
    }
    for i in (1..=eff).rev() {
        out.push(2.0 * x[0] - x[i]);
    }
    out.extend_from_slice(x);
    for i in 1..=eff {
        out.push(2.0 * x[n - 1] - x[n - 1 - i]);
    }
    for _ in eff..pad {
        out.push(0.0);
    }
    out
}
