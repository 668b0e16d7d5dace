//! Re-loadable signal container used at the external localization boundary.
//!
//! A recording is stored as `<base>.tsv` (a `time_s` column plus one column
//! per channel) with a `<base>.json` sidecar describing the sampling rate,
//! channel names, and what kind of signal the columns hold.

use crate::signal::Recording;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// What the channel columns of a container hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    /// Sensor-space channels.
    Raw,
    /// Region time courses from source localization.
    Rois,
}

/// Sidecar metadata stored next to the TSV.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerMeta {
    pub fs: f64,
    pub channels: Vec<String>,
    pub kind: ContainerKind,
    /// File name of the region info table, when one accompanies ROI data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_table: Option<String>,
}

fn sidecar_path(tsv_path: &Path) -> PathBuf {
    tsv_path.with_extension("json")
}

/// Write `recording` as TSV plus JSON sidecar. The sidecar lands next to
/// `tsv_path` with the extension swapped to `.json`.
pub fn write_recording(
    recording: &Recording,
    tsv_path: &Path,
    kind: ContainerKind,
    region_table: Option<String>,
) -> Result<()> {
    recording.validate()?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(tsv_path)
        .with_context(|| format!("failed to create {}", tsv_path.display()))?;
    let mut header = Vec::with_capacity(recording.n_channels() + 1);
    header.push("time_s".to_string());
    header.extend(recording.channels.iter().cloned());
    writer.write_record(&header)?;
    let mut record = Vec::with_capacity(header.len());
    for sample in 0..recording.n_samples() {
        record.clear();
        record.push(format!("{:?}", sample as f64 / recording.fs));
        for channel in &recording.data {
            record.push(format!("{:?}", channel[sample]));
        }
        writer.write_record(&record)?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", tsv_path.display()))?;

    let meta = ContainerMeta {
        fs: recording.fs,
        channels: recording.channels.clone(),
        kind,
        region_table,
    };
    let sidecar = sidecar_path(tsv_path);
    let file = File::create(&sidecar)
        .with_context(|| format!("failed to create {}", sidecar.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &meta)
        .with_context(|| format!("failed to write {}", sidecar.display()))?;
    Ok(())
}

/// Read a TSV container and its sidecar back into a `Recording`.
pub fn read_recording(tsv_path: &Path) -> Result<(Recording, ContainerMeta)> {
    let sidecar = sidecar_path(tsv_path);
    let file = File::open(&sidecar)
        .with_context(|| format!("failed to open {}", sidecar.display()))?;
    let meta: ContainerMeta = serde_json::from_reader(file)
        .with_context(|| format!("failed to parse {}", sidecar.display()))?;
    if meta.fs <= 0.0 {
        bail!("{} declares a non-positive sampling rate", sidecar.display());
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(tsv_path)
        .with_context(|| format!("failed to open {}", tsv_path.display()))?;
    let headers = reader.headers()?.clone();
    if headers.get(0) != Some("time_s") {
        bail!(
            "{} does not look like a signal container: first column is {:?}, expected \"time_s\"",
            tsv_path.display(),
            headers.get(0).unwrap_or("")
        );
    }
    let file_channels: Vec<String> = headers.iter().skip(1).map(|h| h.to_string()).collect();
    if file_channels != meta.channels {
        bail!(
            "channel names in {} do not match the sidecar ({} vs {} channels)",
            tsv_path.display(),
            file_channels.len(),
            meta.channels.len()
        );
    }

    let mut data: Vec<Vec<f64>> = vec![Vec::new(); file_channels.len()];
    for (row, result) in reader.records().enumerate() {
        let record = result.context("reading container record")?;
        if record.len() != file_channels.len() + 1 {
            bail!(
                "row {} has {} fields, expected {}",
                row + 1,
                record.len(),
                file_channels.len() + 1
            );
        }
        for (slot, value) in data.iter_mut().zip(record.iter().skip(1)) {
            let parsed: f64 = value
                .trim()
                .parse()
                .with_context(|| format!("row {}: {:?} is not a number", row + 1, value))?;
            slot.push(parsed);
        }
    }

    let recording = Recording {
        fs: meta.fs,
        channels: meta.channels.clone(),
        data,
    };
    recording.validate()?;
    Ok((recording, meta))
}
