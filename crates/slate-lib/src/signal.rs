use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Multichannel recording with a uniform sampling rate.
///
/// Channel-major layout; amplitudes are microvolts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    /// Uniform sampling frequency in Hz
    pub fs: f64,
    /// Channel names, one per row of `data`
    pub channels: Vec<String>,
    /// Samples per channel
    pub data: Vec<Vec<f64>>,
}

impl Recording {
    pub fn n_channels(&self) -> usize {
        self.data.len()
    }

    pub fn n_samples(&self) -> usize {
        self.data.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn duration(&self) -> f64 {
        self.n_samples() as f64 / self.fs
    }

    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| c == name)
    }

    pub fn channel(&self, name: &str) -> Option<&[f64]> {
        self.channel_index(name).map(|i| self.data[i].as_slice())
    }

    /// Checks the container shape once, at the point of construction or load.
    pub fn validate(&self) -> Result<()> {
        if self.fs <= 0.0 {
            bail!("sampling frequency must be positive, got {}", self.fs);
        }
        if self.channels.len() != self.data.len() {
            bail!(
                "channel name count ({}) does not match data rows ({})",
                self.channels.len(),
                self.data.len()
            );
        }
        let n = self.n_samples();
        if let Some(bad) = self.data.iter().position(|c| c.len() != n) {
            bail!(
                "channel {} has {} samples, expected {}",
                self.channels[bad],
                self.data[bad].len(),
                n
            );
        }
        Ok(())
    }
}

/// Fixed-shape epochs cut from a recording. Epoch-major layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epochs {
    pub fs: f64,
    pub channels: Vec<String>,
    /// `data[epoch][channel][sample]`
    pub data: Vec<Vec<Vec<f64>>>,
}

impl Epochs {
    pub fn n_epochs(&self) -> usize {
        self.data.len()
    }

    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn n_samples(&self) -> usize {
        self.data
            .first()
            .and_then(|e| e.first())
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub fn epoch_duration(&self) -> f64 {
        self.n_samples() as f64 / self.fs
    }

    /// Cuts regular fixed-length windows. The trailing partial window is dropped.
    pub fn from_recording(rec: &Recording, length_s: f64, overlap_s: f64) -> Result<Epochs> {
        rec.validate()?;
        if length_s <= 0.0 {
            bail!("epoch length must be positive, got {length_s}");
        }
        if overlap_s < 0.0 || overlap_s >= length_s {
            bail!("overlap must be in [0, length), got {overlap_s} for length {length_s}");
        }
        let len = (length_s * rec.fs).round() as usize;
        let step = ((length_s - overlap_s) * rec.fs).round().max(1.0) as usize;
        let n = rec.n_samples();
        if len == 0 || len > n {
            bail!(
                "epoch of {length_s} s needs {len} samples but the recording has {n}"
            );
        }
        let mut data = Vec::new();
        let mut start = 0;
        while start + len <= n {
            let epoch: Vec<Vec<f64>> = rec
                .data
                .iter()
                .map(|ch| ch[start..start + len].to_vec())
                .collect();
            data.push(epoch);
            start += step;
        }
        Ok(Epochs {
            fs: rec.fs,
            channels: rec.channels.clone(),
            data,
        })
    }

    /// Flattens epochs back into a continuous recording by concatenation.
    pub fn to_recording(&self) -> Recording {
        let n_ch = self.n_channels();
        let mut data = vec![Vec::with_capacity(self.n_epochs() * self.n_samples()); n_ch];
        for epoch in &self.data {
            for (ch, samples) in epoch.iter().enumerate() {
                data[ch].extend_from_slice(samples);
            }
        }
        Recording {
            fs: self.fs,
            channels: self.channels.clone(),
            data,
        }
    }
}

/// Named frequency band in Hz, half-open `[lo, hi)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrequencyBand {
    pub name: String,
    pub lo: f64,
    pub hi: f64,
}

impl FrequencyBand {
    pub fn new(name: &str, lo: f64, hi: f64) -> Self {
        Self {
            name: name.to_string(),
            lo,
            hi,
        }
    }

    pub fn contains(&self, freq: f64) -> bool {
        freq >= self.lo && freq < self.hi
    }
}

/// The canonical EEG band set used across the analysis steps.
pub fn default_bands() -> Vec<FrequencyBand> {
    vec![
        FrequencyBand::new("delta", 1.0, 4.0),
        FrequencyBand::new("theta", 4.0, 8.0),
        FrequencyBand::new("alpha", 8.0, 13.0),
        FrequencyBand::new("beta", 13.0, 30.0),
        FrequencyBand::new("gamma", 30.0, 45.0),
    ]
}
