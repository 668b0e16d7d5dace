//! Cross-validated epoch rejection and channel repair.
//!
//! Per-channel peak-to-peak thresholds are chosen by K-fold cross-validation
//! over a quantile grid, then `(n_interpolate, consensus)` is picked from the
//! candidate lists by the same loss. Channels over threshold are repaired by
//! correlation-weighted averages of the good channels; epochs with too many
//! bad channels are dropped.

use crate::signal::Epochs;
use anyhow::{bail, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub const LABEL_GOOD: u8 = 0;
pub const LABEL_INTERPOLATED: u8 = 1;
pub const LABEL_REJECTED: u8 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectParams {
    pub n_interpolate: Vec<usize>,
    pub consensus: Vec<f64>,
    pub n_folds: usize,
    pub threshold_grid: usize,
}

impl Default for RejectParams {
    fn default() -> Self {
        Self {
            n_interpolate: vec![1, 4, 8],
            consensus: vec![0.1, 0.25, 0.5, 0.75, 0.9],
            n_folds: 5,
            threshold_grid: 20,
        }
    }
}

/// Epoch by channel status matrix plus the surviving epoch indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectionLog {
    pub labels: Vec<Vec<u8>>,
    pub kept: Vec<usize>,
}

impl RejectionLog {
    pub fn n_rejected(&self) -> usize {
        self.labels.len() - self.kept.len()
    }

    pub fn interpolated_per_channel(&self) -> Vec<usize> {
        let n_ch = self.labels.first().map_or(0, |row| row.len());
        let mut counts = vec![0usize; n_ch];
        for row in &self.labels {
            for (c, &label) in row.iter().enumerate() {
                if label == LABEL_INTERPOLATED {
                    counts[c] += 1;
                }
            }
        }
        counts
    }
}

#[derive(Debug, Clone)]
pub struct RejectResult {
    pub epochs: Epochs,
    pub log: RejectionLog,
    pub thresholds: Vec<f64>,
    pub n_interpolate: usize,
    pub consensus: f64,
}

pub fn clean_epochs(epochs: &Epochs, params: &RejectParams) -> Result<RejectResult> {
    let n_epochs = epochs.n_epochs();
    let n_ch = epochs.n_channels();
    if n_epochs == 0 || n_ch == 0 {
        bail!("cannot reject over empty epochs");
    }
    if params.n_folds < 2 {
        bail!("n_folds must be at least 2, got {}", params.n_folds);
    }
    if params.n_folds > n_epochs {
        bail!(
            "n_folds {} exceeds the {} available epochs",
            params.n_folds,
            n_epochs
        );
    }
    if params.threshold_grid < 2 {
        bail!("threshold_grid must be at least 2");
    }
    if params.n_interpolate.is_empty() || params.consensus.is_empty() {
        bail!("n_interpolate and consensus candidate lists must be non-empty");
    }
    for &rho in &params.consensus {
        if !(0.0..=1.0).contains(&rho) {
            bail!("consensus values must lie in [0, 1], got {rho}");
        }
    }
    for &k in &params.n_interpolate {
        if k >= n_ch {
            bail!("n_interpolate candidate {k} must be below the channel count {n_ch}");
        }
    }

    // n_epochs x n_ch peak-to-peak amplitudes drive everything below.
    let ptp: Vec<Vec<f64>> = (0..n_epochs)
        .map(|e| (0..n_ch).map(|c| peak_to_peak(&epochs.data[e][c])).collect())
        .collect();

    let folds = contiguous_folds(n_epochs, params.n_folds);
    let thresholds: Vec<f64> = (0..n_ch)
        .into_par_iter()
        .map(|c| channel_threshold(epochs, &ptp, c, &folds, params.threshold_grid))
        .collect();

    let correlations = channel_correlations(epochs);

    let (n_interpolate, consensus) = select_augmentation(
        epochs,
        &ptp,
        &thresholds,
        &folds,
        &params.n_interpolate,
        &params.consensus,
        &correlations,
    );

    let mut labels = vec![vec![LABEL_GOOD; n_ch]; n_epochs];
    let mut kept = Vec::with_capacity(n_epochs);
    let mut cleaned = Vec::with_capacity(n_epochs);
    for e in 0..n_epochs {
        let mut bad: Vec<usize> = (0..n_ch).filter(|&c| ptp[e][c] > thresholds[c]).collect();
        let frac = bad.len() as f64 / n_ch as f64;
        if frac > consensus {
            for &c in &bad {
                labels[e][c] = LABEL_REJECTED;
            }
            continue;
        }
        // Worst channels first when more are bad than we may repair.
        bad.sort_by(|&a, &b| {
            ptp[e][b]
                .partial_cmp(&ptp[e][a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let repair: Vec<usize> = bad.iter().copied().take(n_interpolate).collect();
        let mut epoch = epochs.data[e].clone();
        for &c in &repair {
            epoch[c] = interpolate_channel(&epochs.data[e], c, &repair, &correlations);
            labels[e][c] = LABEL_INTERPOLATED;
        }
        kept.push(e);
        cleaned.push(epoch);
    }

    Ok(RejectResult {
        epochs: Epochs {
            fs: epochs.fs,
            channels: epochs.channels.clone(),
            data: cleaned,
        },
        log: RejectionLog { labels, kept },
        thresholds,
        n_interpolate,
        consensus,
    })
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

fn contiguous_folds(n: usize, k: usize) -> Vec<Vec<usize>> {
    let mut folds = Vec::with_capacity(k);
    let base = n / k;
    let extra = n % k;
    let mut start = 0;
    for f in 0..k {
        let len = base + usize::from(f < extra);
        folds.push((start..start + len).collect());
        start += len;
    }
    folds
}

/// Candidate thresholds are quantiles of the observed peak-to-peak values;
/// the winner minimizes the summed RMSE between the mean of surviving
/// training epochs and the per-sample median of validation epochs.
fn channel_threshold(
    epochs: &Epochs,
    ptp: &[Vec<f64>],
    channel: usize,
    folds: &[Vec<usize>],
    grid: usize,
) -> f64 {
    let n_epochs = epochs.n_epochs();
    let values: Vec<f64> = (0..n_epochs).map(|e| ptp[e][channel]).collect();
    let candidates = quantile_grid(&values, grid);

    let mut best = (f64::INFINITY, *candidates.last().unwrap());
    for &thr in &candidates {
        let mut loss = 0.0;
        for fold in folds {
            let valid_median = sample_median(epochs, channel, fold);
            let train: Vec<usize> = (0..n_epochs)
                .filter(|e| !fold.contains(e) && values[*e] <= thr)
                .collect();
            if train.is_empty() {
                loss = f64::INFINITY;
                break;
            }
            let mean = sample_mean(epochs, channel, &train);
            loss += rmse(&mean, &valid_median);
        }
        if loss < best.0 {
            best = (loss, thr);
        }
    }
    best.1
}

fn quantile_grid(values: &[f64], grid: usize) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    (0..grid)
        .map(|i| {
            let q = i as f64 / (grid - 1) as f64;
            let pos = q * (sorted.len() - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            sorted[lo] * (1.0 - frac) + sorted[hi] * frac
        })
        .collect()
}

fn sample_mean(epochs: &Epochs, channel: usize, indices: &[usize]) -> Vec<f64> {
    let n_samples = epochs.n_samples();
    let mut mean = vec![0.0; n_samples];
    for &e in indices {
        for (m, v) in mean.iter_mut().zip(&epochs.data[e][channel]) {
            *m += v;
        }
    }
    let scale = 1.0 / indices.len() as f64;
    for m in mean.iter_mut() {
        *m *= scale;
    }
    mean
}

fn sample_median(epochs: &Epochs, channel: usize, indices: &[usize]) -> Vec<f64> {
    let n_samples = epochs.n_samples();
    let mut median = vec![0.0; n_samples];
    let mut column = Vec::with_capacity(indices.len());
    for (s, out) in median.iter_mut().enumerate() {
        column.clear();
        for &e in indices {
            column.push(epochs.data[e][channel][s]);
        }
        column.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = column.len() / 2;
        *out = if column.len() % 2 == 0 {
            (column[mid - 1] + column[mid]) / 2.0
        } else {
            column[mid]
        };
    }
    median
}

fn rmse(a: &[f64], b: &[f64]) -> f64 {
    let sum: f64 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum();
    (sum / a.len() as f64).sqrt()
}

fn select_augmentation(
    epochs: &Epochs,
    ptp: &[Vec<f64>],
    thresholds: &[f64],
    folds: &[Vec<usize>],
    n_interpolate: &[usize],
    consensus: &[f64],
    correlations: &[Vec<f64>],
) -> (usize, f64) {
    let n_ch = epochs.n_channels();
    let pairs: Vec<(usize, f64)> = n_interpolate
        .iter()
        .flat_map(|&k| consensus.iter().map(move |&rho| (k, rho)))
        .collect();

    let scored: Vec<(f64, (usize, f64))> = pairs
        .par_iter()
        .map(|&(k, rho)| {
            let mut loss = 0.0;
            for fold in folds {
                let mut kept_mean = vec![vec![0.0; epochs.n_samples()]; n_ch];
                let mut kept_count = 0usize;
                for e in 0..epochs.n_epochs() {
                    if fold.contains(&e) {
                        continue;
                    }
                    let mut bad: Vec<usize> =
                        (0..n_ch).filter(|&c| ptp[e][c] > thresholds[c]).collect();
                    if bad.len() as f64 / n_ch as f64 > rho {
                        continue;
                    }
                    bad.sort_by(|&a, &b| {
                        ptp[e][b]
                            .partial_cmp(&ptp[e][a])
                            .unwrap_or(std::cmp::Ordering::Equal)
                    });
                    let repair: Vec<usize> = bad.into_iter().take(k).collect();
                    kept_count += 1;
                    for c in 0..n_ch {
                        let series;
                        let source: &[f64] = if repair.contains(&c) {
                            series =
                                interpolate_channel(&epochs.data[e], c, &repair, correlations);
                            &series
                        } else {
                            &epochs.data[e][c]
                        };
                        for (m, v) in kept_mean[c].iter_mut().zip(source) {
                            *m += v;
                        }
                    }
                }
                if kept_count == 0 {
                    loss = f64::INFINITY;
                    break;
                }
                let scale = 1.0 / kept_count as f64;
                for c in 0..n_ch {
                    for m in kept_mean[c].iter_mut() {
                        *m *= scale;
                    }
                    let valid_median = sample_median(epochs, c, fold);
                    loss += rmse(&kept_mean[c], &valid_median);
                }
            }
            (loss, (k, rho))
        })
        .collect();

    scored
        .into_iter()
        .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(_, pair)| pair)
        .unwrap_or((n_interpolate[0], consensus[0]))
}

/// Channel-by-channel Pearson correlation over the concatenated epochs.
fn channel_correlations(epochs: &Epochs) -> Vec<Vec<f64>> {
    let n_ch = epochs.n_channels();
    let n_total = epochs.n_epochs() * epochs.n_samples();
    let mut means = vec![0.0; n_ch];
    for epoch in &epochs.data {
        for (c, channel) in epoch.iter().enumerate() {
            means[c] += channel.iter().sum::<f64>();
        }
    }
    for m in means.iter_mut() {
        *m /= n_total as f64;
    }

    let mut cov = vec![vec![0.0; n_ch]; n_ch];
    for epoch in &epochs.data {
        for i in 0..n_ch {
            for j in i..n_ch {
                let mut acc = 0.0;
                for (a, b) in epoch[i].iter().zip(&epoch[j]) {
                    acc += (a - means[i]) * (b - means[j]);
                }
                cov[i][j] += acc;
            }
        }
    }
    let mut corr = vec![vec![0.0; n_ch]; n_ch];
    for i in 0..n_ch {
        for j in i..n_ch {
            let denom = (cov[i][i] * cov[j][j]).sqrt();
            let r = if denom > 0.0 { cov[i][j] / denom } else { 0.0 };
            corr[i][j] = r;
            corr[j][i] = r;
        }
    }
    corr
}

/// Replace one channel with the correlation-weighted average of the channels
/// not under repair. Falls back to equal weights when nothing correlates.
fn interpolate_channel(
    epoch: &[Vec<f64>],
    channel: usize,
    repair: &[usize],
    correlations: &[Vec<f64>],
) -> Vec<f64> {
    let n_ch = epoch.len();
    let n_samples = epoch[channel].len();
    let donors: Vec<usize> = (0..n_ch)
        .filter(|c| *c != channel && !repair.contains(c))
        .collect();
    if donors.is_empty() {
        return epoch[channel].clone();
    }
    let mut weights: Vec<f64> = donors
        .iter()
        .map(|&d| correlations[channel][d].max(0.0))
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        weights = vec![1.0 / donors.len() as f64; donors.len()];
    } else {
        for w in weights.iter_mut() {
            *w /= total;
        }
    }
    let mut out = vec![0.0; n_samples];
    for (&d, &w) in donors.iter().zip(&weights) {
        for (o, v) in out.iter_mut().zip(&epoch[d]) {
            *o += w * v;
        }
    }
    out
}
