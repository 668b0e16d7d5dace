//! EDF ingestion. Loads every signal channel of a file into a `Recording`,
//! converting physical units to microvolts.

use crate::signal::Recording;
use anyhow::{anyhow, bail, Result};
use edf_reader::file_reader::SyncFileReader;
use edf_reader::sync_reader::SyncEDFReader;
use log::warn;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Helper implementing the EDF reader trait for on-disk files.
struct DiskFileReader {
    path: PathBuf,
}

impl DiskFileReader {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl SyncFileReader for DiskFileReader {
    fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, std::io::Error> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Scale from the channel's physical dimension to microvolts. Unknown units
/// pass through unscaled with a warning.
fn unit_to_microvolts(dimension: &str, label: &str) -> f64 {
    match dimension.trim().to_ascii_lowercase().as_str() {
        "uv" | "\u{b5}v" => 1.0,
        "mv" => 1e3,
        "v" => 1e6,
        "" => 1.0,
        other => {
            warn!("channel {label}: unknown physical dimension {other:?}, assuming microvolts");
            1.0
        }
    }
}

/// Load all signal channels of an EDF file into a `Recording` in microvolts.
///
/// Annotation channels are skipped, as are channels whose sampling rate
/// differs from the first signal channel (a mixed-rate container cannot be
/// represented).
pub fn load_edf_recording(path: &Path) -> Result<Recording> {
    let reader = SyncEDFReader::init_with_file_reader(DiskFileReader::new(path))?;
    let header = &reader.edf_header;
    if header.channels.is_empty() {
        bail!("{} contains no channels", path.display());
    }
    let total_duration = header.block_duration * header.number_of_blocks;
    let matrix = reader.read_data_window(0, total_duration)?;

    let mut fs = None;
    let mut channels = Vec::new();
    let mut data = Vec::new();
    for (index, chan) in header.channels.iter().enumerate() {
        let label = chan.label.trim().to_string();
        if label.to_ascii_lowercase().contains("annotation") {
            continue;
        }
        let chan_fs =
            chan.number_of_samples_in_data_record as f64 * 1000.0 / header.block_duration as f64;
        match fs {
            None => fs = Some(chan_fs),
            Some(expected) if (chan_fs - expected).abs() > f64::EPSILON => {
                warn!(
                    "channel {label} samples at {chan_fs} Hz, not {expected} Hz; skipping it"
                );
                continue;
            }
            Some(_) => {}
        }
        let samples = matrix
            .get(index)
            .ok_or_else(|| anyhow!("missing data for channel {label}"))?;
        let scale = unit_to_microvolts(&chan.physical_dimension, &label);
        data.push(samples.iter().map(|value| *value as f64 * scale).collect());
        channels.push(label);
    }
    let fs = fs.ok_or_else(|| {
        anyhow!(
            "{} contains only annotation channels, nothing to load",
            path.display()
        )
    })?;

    let recording = Recording { fs, channels, data };
    recording.validate()?;
    Ok(recording)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(text: &str, width: usize) -> Vec<u8> {
        let mut field = text.as_bytes().to_vec();
        assert!(field.len() <= width, "{text:?} wider than {width}");
        field.resize(width, b' ');
        field
    }

    /// Build a minimal two-channel EDF file. Physical and digital ranges are
    /// identical so sample values pass through unscaled.
    fn write_edf(path: &Path, records: &[[Vec<i16>; 2]], samples_per_record: usize) {
        let ns = 2usize;
        let mut bytes = Vec::new();
        bytes.extend(fixed("0", 8));
        bytes.extend(fixed("test patient", 80));
        bytes.extend(fixed("test recording", 80));
        bytes.extend(fixed("01.01.24", 8));
        bytes.extend(fixed("12.00.00", 8));
        bytes.extend(fixed(&(256 + ns * 256).to_string(), 8));
        bytes.extend(fixed("", 44));
        bytes.extend(fixed(&records.len().to_string(), 8));
        bytes.extend(fixed("1", 8));
        bytes.extend(fixed(&ns.to_string(), 4));
        for label in ["E1", "E2"] {
            bytes.extend(fixed(label, 16));
        }
        for _ in 0..ns {
            bytes.extend(fixed("AgAgCl electrode", 80));
        }
        for _ in 0..ns {
            bytes.extend(fixed("uV", 8));
        }
        for _ in 0..ns {
            bytes.extend(fixed("-32768", 8));
        }
        for _ in 0..ns {
            bytes.extend(fixed("32767", 8));
        }
        for _ in 0..ns {
            bytes.extend(fixed("-32768", 8));
        }
        for _ in 0..ns {
            bytes.extend(fixed("32767", 8));
        }
        for _ in 0..ns {
            bytes.extend(fixed("", 80));
        }
        for _ in 0..ns {
            bytes.extend(fixed(&samples_per_record.to_string(), 8));
        }
        for _ in 0..ns {
            bytes.extend(fixed("", 32));
        }
        for record in records {
            for channel in record {
                assert_eq!(channel.len(), samples_per_record);
                for sample in channel {
                    bytes.extend(sample.to_le_bytes());
                }
            }
        }
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn loads_both_channels_in_microvolts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toy.edf");
        write_edf(
            &path,
            &[
                [vec![0, 10, -10, 20], vec![5, 5, 5, 5]],
                [vec![30, -30, 0, 1], vec![-5, -5, -5, -5]],
            ],
            4,
        );

        let recording = load_edf_recording(&path).unwrap();
        assert_eq!(recording.channels, vec!["E1", "E2"]);
        assert_eq!(recording.fs, 4.0);
        assert_eq!(recording.n_samples(), 8);
        assert_eq!(recording.data[0][1], 10.0);
        assert_eq!(recording.data[0][4], 30.0);
        assert_eq!(recording.data[1][7], -5.0);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_edf_recording(&dir.path().join("absent.edf")).is_err());
    }
}
