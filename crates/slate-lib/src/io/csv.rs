//! Plain numeric matrix ingestion for CSV/TSV exports that carry no
//! metadata. The sampling rate comes from the caller (`--sfreq` on the
//! command line).

use crate::signal::Recording;
use anyhow::{bail, Context, Result};
use std::path::Path;

/// Load a numeric matrix (rows are samples, columns are channels) into a
/// `Recording`. A leading row that does not parse as numbers is taken as
/// channel names; otherwise channels are named `ch01`, `ch02`, ...
pub fn load_matrix_recording(path: &Path, fs: f64) -> Result<Recording> {
    if fs <= 0.0 {
        bail!("sampling frequency must be positive, got {fs}");
    }
    let delimiter = match path.extension().and_then(|e| e.to_str()) {
        Some("tsv") => b'\t',
        _ => b',',
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let mut channels: Option<Vec<String>> = None;
    let mut data: Vec<Vec<f64>> = Vec::new();
    for (row, result) in reader.records().enumerate() {
        let record = result.context("reading matrix record")?;
        let parsed: Option<Vec<f64>> = record
            .iter()
            .map(|value| value.trim().parse::<f64>().ok())
            .collect();
        match parsed {
            Some(values) if row == 0 => {
                channels = Some(
                    (1..=values.len())
                        .map(|index| format!("ch{index:02}"))
                        .collect(),
                );
                data = vec![Vec::new(); values.len()];
                for (slot, value) in data.iter_mut().zip(values) {
                    slot.push(value);
                }
            }
            Some(values) => {
                if values.len() != data.len() {
                    bail!(
                        "row {} has {} columns, expected {}",
                        row + 1,
                        values.len(),
                        data.len()
                    );
                }
                for (slot, value) in data.iter_mut().zip(values) {
                    slot.push(value);
                }
            }
            None if row == 0 => {
                channels = Some(record.iter().map(|name| name.trim().to_string()).collect());
                data = vec![Vec::new(); record.len()];
            }
            None => {
                bail!("row {} contains non-numeric values", row + 1);
            }
        }
    }
    let channels = channels.ok_or_else(|| {
        anyhow::anyhow!("{} is empty, nothing to load", path.display())
    })?;
    if data.iter().all(|channel| channel.is_empty()) {
        bail!("{} has a header but no samples", path.display());
    }

    let recording = Recording { fs, channels, data };
    recording.validate()?;
    Ok(recording)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headerless_matrix_gets_generated_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.csv");
        std::fs::write(&path, "1.0,2.0\n3.0,4.0\n5.0,6.0\n").unwrap();
        let recording = load_matrix_recording(&path, 100.0).unwrap();
        assert_eq!(recording.channels, vec!["ch01", "ch02"]);
        assert_eq!(recording.data[0], vec![1.0, 3.0, 5.0]);
        assert_eq!(recording.data[1], vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn header_row_names_the_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.tsv");
        std::fs::write(&path, "Cz\tPz\n1.5\t-1.5\n2.5\t-2.5\n").unwrap();
        let recording = load_matrix_recording(&path, 250.0).unwrap();
        assert_eq!(recording.channels, vec!["Cz", "Pz"]);
        assert_eq!(recording.fs, 250.0);
        assert_eq!(recording.n_samples(), 2);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragged.csv");
        std::fs::write(&path, "1.0,2.0\n3.0\n").unwrap();
        assert!(load_matrix_recording(&path, 100.0).is_err());
    }

    #[test]
    fn non_positive_rate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.csv");
        std::fs::write(&path, "1.0\n").unwrap();
        assert!(load_matrix_recording(&path, 0.0).is_err());
    }
}
