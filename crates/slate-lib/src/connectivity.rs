//! Functional connectivity between region time courses and graph metrics
//! over the resulting weight matrices.
//!
//! Spectral methods (coherence, PLV, PLI, wPLI) aggregate per-epoch
//! cross-spectra; amplitude envelope correlation filters to the band, takes
//! the Hilbert envelope per epoch, and averages the Pearson correlations.

use crate::filter::{analytic_envelope, bandpass};
use crate::signal::{Epochs, Recording};
use anyhow::{bail, Result};
use nalgebra::DMatrix;
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnMethod {
    Wpli,
    Plv,
    Coh,
    Pli,
    Aec,
}

impl ConnMethod {
    pub fn all() -> [ConnMethod; 5] {
        [
            ConnMethod::Wpli,
            ConnMethod::Plv,
            ConnMethod::Coh,
            ConnMethod::Pli,
            ConnMethod::Aec,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnMethod::Wpli => "wpli",
            ConnMethod::Plv => "plv",
            ConnMethod::Coh => "coh",
            ConnMethod::Pli => "pli",
            ConnMethod::Aec => "aec",
        }
    }
}

impl std::str::FromStr for ConnMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "wpli" => Ok(ConnMethod::Wpli),
            "plv" => Ok(ConnMethod::Plv),
            "coh" => Ok(ConnMethod::Coh),
            "pli" => Ok(ConnMethod::Pli),
            "aec" => Ok(ConnMethod::Aec),
            other => bail!("unknown connectivity method {other:?}"),
        }
    }
}

/// Draw `n_epochs` non-overlapping windows at random positions. Fewer slots
/// than requested is not an error; the caller sees how many were used.
pub fn sample_epochs(
    rec: &Recording,
    epoch_length_s: f64,
    n_epochs: usize,
    seed: Option<u64>,
) -> Result<Epochs> {
    if epoch_length_s <= 0.0 {
        bail!("epoch length must be positive, got {epoch_length_s}");
    }
    if n_epochs == 0 {
        bail!("at least one epoch is required");
    }
    let samples_per = (epoch_length_s * rec.fs).round() as usize;
    if samples_per == 0 || samples_per > rec.n_samples() {
        bail!(
            "epoch of {epoch_length_s} s does not fit into {} samples at {} Hz",
            rec.n_samples(),
            rec.fs
        );
    }
    let slots = rec.n_samples() / samples_per;
    let take = n_epochs.min(slots);
    if take < n_epochs {
        log::warn!("requested {n_epochs} epochs but only {slots} fit; using {take}");
    }

    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };
    let mut starts: Vec<usize> = (0..slots).map(|i| i * samples_per).collect();
    starts.shuffle(&mut rng);
    starts.truncate(take);

    let data = starts
        .iter()
        .map(|&start| {
            rec.data
                .iter()
                .map(|ch| ch[start..start + samples_per].to_vec())
                .collect()
        })
        .collect();
    Ok(Epochs {
        fs: rec.fs,
        channels: rec.channels.clone(),
        data,
    })
}

/// Symmetric connectivity matrix for one method in one band, diagonal zero.
pub fn connectivity_matrix(
    epochs: &Epochs,
    method: ConnMethod,
    band: (f64, f64),
) -> Result<DMatrix<f64>> {
    let (lo, hi) = band;
    if !(lo > 0.0 && hi > lo) {
        bail!("band must satisfy 0 < lo < hi, got ({lo}, {hi})");
    }
    if epochs.n_epochs() == 0 {
        bail!("connectivity requires at least one epoch");
    }
    if epochs.n_channels() < 2 {
        bail!("connectivity requires at least two signals");
    }
    if hi >= epochs.fs / 2.0 {
        bail!("band upper edge {hi} Hz is at or above Nyquist ({} Hz)", epochs.fs / 2.0);
    }
    match method {
        ConnMethod::Aec => envelope_correlation(epochs, band),
        _ => spectral_connectivity(epochs, method, band),
    }
}

fn spectral_connectivity(
    epochs: &Epochs,
    method: ConnMethod,
    band: (f64, f64),
) -> Result<DMatrix<f64>> {
    let n_ch = epochs.n_channels();
    let n_samples = epochs.n_samples();
    let n_epochs = epochs.n_epochs();
    let df = epochs.fs / n_samples as f64;
    let bins: Vec<usize> = (0..n_samples / 2 + 1)
        .filter(|&k| {
            let f = k as f64 * df;
            f >= band.0 && f <= band.1
        })
        .collect();
    if bins.is_empty() {
        bail!(
            "no spectral bins inside ({}, {}) Hz at {df:.3} Hz resolution",
            band.0,
            band.1
        );
    }

    // One windowed FFT per channel per epoch.
    let window: Vec<f64> = (0..n_samples)
        .map(|i| {
            let x = std::f64::consts::PI * i as f64 / n_samples as f64;
            x.sin() * x.sin()
        })
        .collect();
    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n_samples);
    let mut spectra = vec![vec![Vec::new(); n_ch]; n_epochs];
    for (e, epoch) in epochs.data.iter().enumerate() {
        for (c, channel) in epoch.iter().enumerate() {
            let mut buf: Vec<Complex<f64>> = channel
                .iter()
                .zip(&window)
                .map(|(v, w)| Complex::new(v * w, 0.0))
                .collect();
            fft.process(&mut buf);
            spectra[e][c] = bins.iter().map(|&k| buf[k]).collect();
        }
    }

    let mut out = DMatrix::zeros(n_ch, n_ch);
    for i in 0..n_ch {
        for j in i + 1..n_ch {
            let mut band_value = 0.0;
            for (b, _) in bins.iter().enumerate() {
                let mut sxy = Complex::new(0.0, 0.0);
                let mut sxx = 0.0;
                let mut syy = 0.0;
                let mut phasor = Complex::new(0.0, 0.0);
                let mut sign_im = 0.0;
                let mut im = 0.0;
                let mut abs_im = 0.0;
                for e in 0..n_epochs {
                    let x = spectra[e][i][b];
                    let y = spectra[e][j][b];
                    let cross = x * y.conj();
                    sxy += cross;
                    sxx += x.norm_sqr();
                    syy += y.norm_sqr();
                    let norm = cross.norm();
                    if norm > 0.0 {
                        phasor += cross / norm;
                    }
                    sign_im += cross.im.signum();
                    im += cross.im;
                    abs_im += cross.im.abs();
                }
                let n = n_epochs as f64;
                band_value += match method {
                    ConnMethod::Coh => {
                        let denom = (sxx * syy).sqrt();
                        if denom > 0.0 {
                            sxy.norm() / denom
                        } else {
                            0.0
                        }
                    }
                    ConnMethod::Plv => phasor.norm() / n,
                    ConnMethod::Pli => (sign_im / n).abs(),
                    ConnMethod::Wpli => {
                        if abs_im > 0.0 {
                            im.abs() / abs_im
                        } else {
                            0.0
                        }
                    }
                    ConnMethod::Aec => unreachable!(),
                };
            }
            let value = band_value / bins.len() as f64;
            out[(i, j)] = value;
            out[(j, i)] = value;
        }
    }
    Ok(out)
}

/// Band-filter, Hilbert envelope, Pearson correlation; per-epoch matrices
/// are averaged. Correlations keep their sign.
fn envelope_correlation(epochs: &Epochs, band: (f64, f64)) -> Result<DMatrix<f64>> {
    let n_ch = epochs.n_channels();
    let mut sum = DMatrix::zeros(n_ch, n_ch);
    for epoch in &epochs.data {
        let envelopes: Result<Vec<Vec<f64>>> = epoch
            .iter()
            .map(|channel| {
                let filtered = bandpass(channel, epochs.fs, band.0, band.1)?;
                Ok(analytic_envelope(&filtered))
            })
            .collect();
        let envelopes = envelopes?;
        for i in 0..n_ch {
            for j in 0..n_ch {
                if i != j {
                    sum[(i, j)] += pearson(&envelopes[i], &envelopes[j]);
                }
            }
        }
    }
    Ok(sum / epochs.n_epochs() as f64)
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    let ma = a.iter().sum::<f64>() / n;
    let mb = b.iter().sum::<f64>() / n;
    let mut sab = 0.0;
    let mut saa = 0.0;
    let mut sbb = 0.0;
    for (x, y) in a.iter().zip(b) {
        sab += (x - ma) * (y - mb);
        saa += (x - ma).powi(2);
        sbb += (y - mb).powi(2);
    }
    let denom = (saa * sbb).sqrt();
    if denom > 0.0 {
        sab / denom
    } else {
        0.0
    }
}

/// Network summary of one weight matrix.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GraphMetrics {
    pub clustering: f64,
    pub global_efficiency: f64,
    pub char_path_length: f64,
    pub modularity: f64,
    pub strength: f64,
    /// NaN when all node strengths are equal
    pub assortativity: f64,
    pub small_worldness: f64,
}

pub fn graph_metrics(matrix: &DMatrix<f64>) -> Result<GraphMetrics> {
    let n = matrix.nrows();
    if n < 3 || matrix.ncols() != n {
        bail!("graph metrics need a square matrix of at least 3 nodes");
    }
    if matrix.iter().any(|v| v.is_nan()) {
        bail!("connectivity matrix contains NaN values");
    }
    // Metrics assume nonnegative weights; signed matrices lose the sign here.
    let w = matrix.map(|v| v.abs());

    let dist = shortest_distances(&w);
    let clustering = mean_clustering(&w);
    let global_efficiency = global_efficiency(&dist);
    let char_path_length = char_path_length(&dist);
    let modularity = greedy_modularity(&w);
    let strength = {
        let sums: Vec<f64> = (0..n).map(|i| w.row(i).sum()).collect();
        sums.iter().sum::<f64>() / n as f64
    };
    let assortativity = weighted_assortativity(&w);
    let small_worldness = if char_path_length > 0.0 {
        clustering * char_path_length
    } else {
        0.0
    };

    Ok(GraphMetrics {
        clustering,
        global_efficiency,
        char_path_length,
        modularity,
        strength,
        assortativity,
        small_worldness,
    })
}

/// Weighted clustering coefficient averaged over nodes: cube roots of weights
/// around each triangle, normalized by the possible pair count.
fn mean_clustering(w: &DMatrix<f64>) -> f64 {
    let n = w.nrows();
    let mut total = 0.0;
    for i in 0..n {
        let degree = (0..n).filter(|&j| j != i && w[(i, j)] > 0.0).count();
        if degree < 2 {
            continue;
        }
        let mut cyc = 0.0;
        for j in 0..n {
            for h in 0..n {
                if j != i && h != i && j != h {
                    cyc += (w[(i, j)] * w[(i, h)] * w[(j, h)]).cbrt();
                }
            }
        }
        total += cyc / (degree * (degree - 1)) as f64;
    }
    total / n as f64
}

/// All-pairs shortest path lengths with edge lengths `1/w`, Floyd-Warshall.
/// Disconnected pairs stay at infinity.
fn shortest_distances(w: &DMatrix<f64>) -> DMatrix<f64> {
    let n = w.nrows();
    let mut dist = DMatrix::from_fn(n, n, |i, j| {
        if i == j {
            0.0
        } else if w[(i, j)] > 0.0 {
            1.0 / w[(i, j)]
        } else {
            f64::INFINITY
        }
    });
    for k in 0..n {
        for i in 0..n {
            for j in 0..n {
                let through = dist[(i, k)] + dist[(k, j)];
                if through < dist[(i, j)] {
                    dist[(i, j)] = through;
                }
            }
        }
    }
    dist
}

/// Mean inverse shortest path length over all ordered node pairs.
fn global_efficiency(dist: &DMatrix<f64>) -> f64 {
    let n = dist.nrows();
    let mut sum = 0.0;
    for i in 0..n {
        for j in 0..n {
            if i != j && dist[(i, j)].is_finite() && dist[(i, j)] > 0.0 {
                sum += 1.0 / dist[(i, j)];
            }
        }
    }
    sum / (n * (n - 1)) as f64
}

/// Mean shortest path length over the reachable pairs only.
fn char_path_length(dist: &DMatrix<f64>) -> f64 {
    let n = dist.nrows();
    let mut sum = 0.0;
    let mut count = 0usize;
    for i in 0..n {
        for j in 0..n {
            if i != j && dist[(i, j)].is_finite() {
                sum += dist[(i, j)];
                count += 1;
            }
        }
    }
    if count > 0 {
        sum / count as f64
    } else {
        0.0
    }
}

/// Agglomerative community detection: merge the community pair with the best
/// modularity gain until no merge helps, then report the final modularity.
fn greedy_modularity(w: &DMatrix<f64>) -> f64 {
    let n = w.nrows();
    let two_m: f64 = w.iter().sum();
    if two_m <= 0.0 {
        return 0.0;
    }
    let mut community: Vec<usize> = (0..n).collect();

    loop {
        let q_now = modularity_of(w, &community, two_m);
        let mut best: Option<(f64, usize, usize)> = None;
        let labels: Vec<usize> = {
            let mut l = community.clone();
            l.sort_unstable();
            l.dedup();
            l
        };
        for (a_idx, &a) in labels.iter().enumerate() {
            for &b in &labels[a_idx + 1..] {
                let merged: Vec<usize> = community
                    .iter()
                    .map(|&c| if c == b { a } else { c })
                    .collect();
                let gain = modularity_of(w, &merged, two_m) - q_now;
                if gain > 1e-12 && best.map_or(true, |(g, _, _)| gain > g) {
                    best = Some((gain, a, b));
                }
            }
        }
        match best {
            Some((_, a, b)) => {
                for c in community.iter_mut() {
                    if *c == b {
                        *c = a;
                    }
                }
            }
            None => return q_now,
        }
    }
}

fn modularity_of(w: &DMatrix<f64>, community: &[usize], two_m: f64) -> f64 {
    let n = w.nrows();
    let strengths: Vec<f64> = (0..n).map(|i| w.row(i).sum()).collect();
    let mut q = 0.0;
    for i in 0..n {
        for j in 0..n {
            if community[i] == community[j] {
                q += w[(i, j)] - strengths[i] * strengths[j] / two_m;
            }
        }
    }
    q / two_m
}

/// Pearson correlation of endpoint strengths over weighted edges.
fn weighted_assortativity(w: &DMatrix<f64>) -> f64 {
    let n = w.nrows();
    let strengths: Vec<f64> = (0..n).map(|i| w.row(i).sum()).collect();
    let mut sw = 0.0;
    let mut sj = 0.0;
    let mut sk = 0.0;
    let mut sjk = 0.0;
    let mut sj2 = 0.0;
    let mut sk2 = 0.0;
    for i in 0..n {
        for j in 0..n {
            let weight = w[(i, j)];
            if i == j || weight <= 0.0 {
                continue;
            }
            sw += weight;
            sj += weight * strengths[i];
            sk += weight * strengths[j];
            sjk += weight * strengths[i] * strengths[j];
            sj2 += weight * strengths[i] * strengths[i];
            sk2 += weight * strengths[j] * strengths[j];
        }
    }
    if sw <= 0.0 {
        return f64::NAN;
    }
    let cov = sjk / sw - (sj / sw) * (sk / sw);
    let var_j = sj2 / sw - (sj / sw).powi(2);
    let var_k = sk2 / sw - (sk / sw).powi(2);
    let denom = (var_j * var_k).sqrt();
    if denom > 0.0 {
        cov / denom
    } else {
        f64::NAN
    }
}
