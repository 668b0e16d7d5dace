//! Source-space boundary. The inverse solution itself runs in an external
//! tool; this module owns the atlas bookkeeping and the narrow adapter that
//! marshals a recording through temp files and back.

use crate::io::container::{self, ContainerKind};
use crate::io::tabular::{Column, Frame};
use crate::signal::{Epochs, Recording};
use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Number of cortical regions in the Desikan-Killiany atlas.
pub const DK_REGION_COUNT: usize = 68;

/// File stem used for the input container handed to the external tool.
const INPUT_STEM: &str = "input_raw";

const DK_BASE_NAMES: [&str; 34] = [
    "bankssts",
    "caudalanteriorcingulate",
    "caudalmiddlefrontal",
    "cuneus",
    "entorhinal",
    "frontalpole",
    "fusiform",
    "inferiorparietal",
    "inferiortemporal",
    "insula",
    "isthmuscingulate",
    "lateraloccipital",
    "lateralorbitofrontal",
    "lingual",
    "medialorbitofrontal",
    "middletemporal",
    "paracentral",
    "parahippocampal",
    "parsopercularis",
    "parsorbitalis",
    "parstriangularis",
    "pericalcarine",
    "postcentral",
    "posteriorcingulate",
    "precentral",
    "precuneus",
    "rostralanteriorcingulate",
    "rostralmiddlefrontal",
    "superiorfrontal",
    "superiorparietal",
    "superiortemporal",
    "supramarginal",
    "temporalpole",
    "transversetemporal",
];

/// The 68 Desikan-Killiany region names, `<name>-lh` / `<name>-rh`
/// interleaved in alphabetical base-name order.
pub fn dk_region_names() -> Vec<String> {
    let mut names = Vec::with_capacity(DK_REGION_COUNT);
    for base in DK_BASE_NAMES {
        names.push(format!("{base}-lh"));
        names.push(format!("{base}-rh"));
    }
    names
}

/// The sensorimotor subset used by the connectivity pipeline.
pub fn sensorimotor_rois() -> Vec<String> {
    ["precentral", "postcentral", "paracentral", "caudalmiddlefrontal"]
        .iter()
        .flat_map(|base| [format!("{base}-lh"), format!("{base}-rh")])
        .collect()
}

/// One atlas region as reported by the localization tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub name: String,
    pub hemisphere: String,
    pub n_vertices: usize,
}

impl RegionInfo {
    pub fn full_name(&self) -> String {
        format!("{}-{}", self.name, self.hemisphere)
    }
}

/// Parameters forwarded to the localization tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalizeOptions {
    pub montage: String,
    pub lambda2: f64,
    pub n_jobs: usize,
}

impl Default for LocalizeOptions {
    fn default() -> Self {
        Self {
            montage: "GSN-HydroCel-129".into(),
            lambda2: 1.0 / 9.0,
            n_jobs: 1,
        }
    }
}

impl LocalizeOptions {
    pub fn validate(&self) -> Result<()> {
        if self.montage.trim().is_empty() {
            bail!("montage name must not be empty");
        }
        if self.lambda2 <= 0.0 {
            bail!("lambda2 must be positive, got {}", self.lambda2);
        }
        if self.n_jobs == 0 {
            bail!("n_jobs must be at least 1");
        }
        Ok(())
    }
}

/// Region time courses plus the atlas rows describing them.
#[derive(Debug, Clone)]
pub struct SourceResult {
    pub rois: Recording,
    pub regions: Vec<RegionInfo>,
}

/// Epoched region time courses.
#[derive(Debug, Clone)]
pub struct SourceEpochsResult {
    pub rois: Epochs,
    pub regions: Vec<RegionInfo>,
}

/// Anything that can turn sensor data into region time courses.
pub trait SourceBackend {
    fn localize(&self, recording: &Recording, options: &LocalizeOptions) -> Result<SourceResult>;

    /// Localize epoched data by concatenating the epochs, localizing once,
    /// and re-slicing at the original epoch boundaries.
    fn localize_epochs(
        &self,
        epochs: &Epochs,
        options: &LocalizeOptions,
    ) -> Result<SourceEpochsResult> {
        let n_samples = epochs.n_samples();
        if n_samples == 0 || epochs.n_epochs() == 0 {
            bail!("cannot localize empty epochs");
        }
        let concatenated = epochs.to_recording();
        let SourceResult { rois, regions } = self.localize(&concatenated, options)?;
        if rois.n_samples() != concatenated.n_samples() {
            bail!(
                "localization returned {} samples, expected {}",
                rois.n_samples(),
                concatenated.n_samples()
            );
        }
        let mut data = Vec::with_capacity(epochs.n_epochs());
        for epoch in 0..epochs.n_epochs() {
            let start = epoch * n_samples;
            let slice: Vec<Vec<f64>> = rois
                .data
                .iter()
                .map(|channel| channel[start..start + n_samples].to_vec())
                .collect();
            data.push(slice);
        }
        Ok(SourceEpochsResult {
            rois: Epochs {
                fs: epochs.fs,
                channels: rois.channels.clone(),
                data,
            },
            regions,
        })
    }
}

/// Adapter around a localization executable. All temp-file marshaling for
/// the process boundary lives here.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    pub program: PathBuf,
}

impl CommandBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl SourceBackend for CommandBackend {
    fn localize(&self, recording: &Recording, options: &LocalizeOptions) -> Result<SourceResult> {
        options.validate()?;
        recording.validate()?;
        let scratch = tempfile::tempdir().context("creating scratch directory")?;
        let input = scratch.path().join(format!("{INPUT_STEM}.tsv"));
        container::write_recording(recording, &input, ContainerKind::Raw, None)?;
        let output_dir = scratch.path().join("out");
        std::fs::create_dir(&output_dir)
            .with_context(|| format!("failed to create {}", output_dir.display()))?;

        debug!(
            "invoking {} on {} channels ({:.1} s)",
            self.program.display(),
            recording.n_channels(),
            recording.duration()
        );
        let output = Command::new(&self.program)
            .arg("--input")
            .arg(&input)
            .arg("--output-dir")
            .arg(&output_dir)
            .arg("--montage")
            .arg(&options.montage)
            .arg("--lambda2")
            .arg(options.lambda2.to_string())
            .arg("--n-jobs")
            .arg(options.n_jobs.to_string())
            .output()
            .with_context(|| {
                format!(
                    "failed to launch localization tool {}",
                    self.program.display()
                )
            })?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            );
        }

        let roi_tsv = output_dir.join(format!("{INPUT_STEM}_dk_regions.tsv"));
        let info_csv = output_dir.join(format!("{INPUT_STEM}_region_info.csv"));
        for expected in [&roi_tsv, &info_csv] {
            if !expected.exists() {
                bail!(
                    "{} exited cleanly but did not produce {}; stderr: {}",
                    self.program.display(),
                    expected.display(),
                    stderr.trim()
                );
            }
        }
        let (rois, _meta) = container::read_recording(&roi_tsv)?;
        let regions = read_region_info(&info_csv)?;
        if regions.len() != DK_REGION_COUNT {
            bail!(
                "{} returned {} regions, expected {DK_REGION_COUNT}",
                self.program.display(),
                regions.len()
            );
        }
        let expected: Vec<String> = regions.iter().map(|r| r.full_name()).collect();
        if rois.channels != expected {
            bail!("region table does not match the ROI container channels");
        }
        info!(
            "source localization produced {} region time courses",
            regions.len()
        );
        Ok(SourceResult { rois, regions })
    }
}

/// Read a `<stem>_region_info.csv` table into region rows.
pub fn read_region_info(path: &Path) -> Result<Vec<RegionInfo>> {
    let frame = Frame::read_csv(path)?;
    let names = match frame.column("name") {
        Some(Column::Str(values)) => values,
        _ => bail!("{} is missing a \"name\" column", path.display()),
    };
    let hemispheres = match frame.column("hemisphere") {
        Some(Column::Str(values)) => values,
        _ => bail!("{} is missing a \"hemisphere\" column", path.display()),
    };
    let vertices = match frame.column("n_vertices") {
        Some(Column::Int(values)) => values,
        _ => bail!("{} is missing an \"n_vertices\" column", path.display()),
    };
    names
        .iter()
        .zip(hemispheres)
        .zip(vertices)
        .map(|((name, hemisphere), &n_vertices)| {
            if n_vertices < 0 {
                bail!("region {name}-{hemisphere} reports a negative vertex count");
            }
            Ok(RegionInfo {
                name: name.clone(),
                hemisphere: hemisphere.clone(),
                n_vertices: n_vertices as usize,
            })
        })
        .collect()
}

/// Build the region info table for persistence.
pub fn region_info_frame(regions: &[RegionInfo]) -> Result<Frame> {
    let mut frame = Frame::new();
    frame.push(
        "name",
        Column::Str(regions.iter().map(|r| r.name.clone()).collect()),
    )?;
    frame.push(
        "hemisphere",
        Column::Str(regions.iter().map(|r| r.hemisphere.clone()).collect()),
    )?;
    frame.push(
        "n_vertices",
        Column::Int(regions.iter().map(|r| r.n_vertices as i64).collect()),
    )?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atlas_has_68_interleaved_regions() {
        let names = dk_region_names();
        assert_eq!(names.len(), DK_REGION_COUNT);
        assert_eq!(names[0], "bankssts-lh");
        assert_eq!(names[1], "bankssts-rh");
        assert!(names.contains(&"precentral-lh".to_string()));
        assert!(names.contains(&"transversetemporal-rh".to_string()));
        let unique: std::collections::BTreeSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn sensorimotor_subset_is_in_the_atlas() {
        let atlas = dk_region_names();
        let subset = sensorimotor_rois();
        assert_eq!(subset.len(), 8);
        for roi in &subset {
            assert!(atlas.contains(roi), "{roi} not in atlas");
        }
    }

    #[test]
    fn region_info_survives_a_csv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region_info.csv");
        let regions: Vec<RegionInfo> = dk_region_names()
            .iter()
            .enumerate()
            .map(|(index, full)| {
                let (name, hemisphere) = full.rsplit_once('-').unwrap();
                RegionInfo {
                    name: name.to_string(),
                    hemisphere: hemisphere.to_string(),
                    n_vertices: 100 + index,
                }
            })
            .collect();
        region_info_frame(&regions).unwrap().write_csv(&path).unwrap();
        let reloaded = read_region_info(&path).unwrap();
        assert_eq!(reloaded, regions);
    }

    #[test]
    fn options_are_validated() {
        assert!(LocalizeOptions::default().validate().is_ok());
        let mut options = LocalizeOptions::default();
        options.lambda2 = 0.0;
        assert!(options.validate().is_err());
        let mut options = LocalizeOptions::default();
        options.montage = "  ".into();
        assert!(options.validate().is_err());
    }

    struct DoublingBackend;

    impl SourceBackend for DoublingBackend {
        fn localize(
            &self,
            recording: &Recording,
            _options: &LocalizeOptions,
        ) -> Result<SourceResult> {
            let regions: Vec<RegionInfo> = recording
                .channels
                .iter()
                .map(|name| RegionInfo {
                    name: name.clone(),
                    hemisphere: "lh".into(),
                    n_vertices: 1,
                })
                .collect();
            let rois = Recording {
                fs: recording.fs,
                channels: regions.iter().map(|r| r.full_name()).collect(),
                data: recording
                    .data
                    .iter()
                    .map(|channel| channel.iter().map(|v| v * 2.0).collect())
                    .collect(),
            };
            Ok(SourceResult { rois, regions })
        }
    }

    #[test]
    fn epochs_are_resliced_at_their_boundaries() {
        let epochs = Epochs {
            fs: 2.0,
            channels: vec!["a".into()],
            data: vec![
                vec![vec![1.0, 2.0, 3.0]],
                vec![vec![4.0, 5.0, 6.0]],
            ],
        };
        let result = DoublingBackend
            .localize_epochs(&epochs, &LocalizeOptions::default())
            .unwrap();
        assert_eq!(result.rois.n_epochs(), 2);
        assert_eq!(result.rois.n_samples(), 3);
        assert_eq!(result.rois.data[0][0], vec![2.0, 4.0, 6.0]);
        assert_eq!(result.rois.data[1][0], vec![8.0, 10.0, 12.0]);
        assert_eq!(result.regions.len(), 1);
    }

    #[cfg(unix)]
    mod command_backend {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn write_tool(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake_localizer.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        fn sensor_recording() -> Recording {
            Recording {
                fs: 100.0,
                channels: vec!["E1".into(), "E2".into()],
                data: vec![vec![0.0; 20], vec![1.0; 20]],
            }
        }

        /// Stage a valid pair of tool outputs that a fake tool can copy into
        /// its `--output-dir`.
        fn stage_outputs(dir: &Path, n_regions: usize) {
            let names: Vec<String> = dk_region_names().into_iter().take(n_regions).collect();
            let rois = Recording {
                fs: 100.0,
                channels: names.clone(),
                data: (0..n_regions).map(|index| vec![index as f64; 20]).collect(),
            };
            container::write_recording(
                &rois,
                &dir.join("input_raw_dk_regions.tsv"),
                ContainerKind::Rois,
                Some("input_raw_region_info.csv".into()),
            )
            .unwrap();
            let regions: Vec<RegionInfo> = names
                .iter()
                .map(|full| {
                    let (name, hemisphere) = full.rsplit_once('-').unwrap();
                    RegionInfo {
                        name: name.to_string(),
                        hemisphere: hemisphere.to_string(),
                        n_vertices: 10,
                    }
                })
                .collect();
            region_info_frame(&regions)
                .unwrap()
                .write_csv(&dir.join("input_raw_region_info.csv"))
                .unwrap();
        }

        fn copying_tool(dir: &Path, staged: &Path) -> PathBuf {
            let body = format!(
                r#"out=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "--output-dir" ]; then out="$arg"; fi
  prev="$arg"
done
cp {staged}/input_raw_dk_regions.tsv "$out/"
cp {staged}/input_raw_dk_regions.json "$out/"
cp {staged}/input_raw_region_info.csv "$out/""#,
                staged = staged.display()
            );
            write_tool(dir, &body)
        }

        #[test]
        fn happy_path_parses_the_tool_outputs() {
            let dir = tempfile::tempdir().unwrap();
            stage_outputs(dir.path(), DK_REGION_COUNT);
            let tool = copying_tool(dir.path(), dir.path());

            let backend = CommandBackend::new(&tool);
            let result = backend
                .localize(&sensor_recording(), &LocalizeOptions::default())
                .unwrap();
            assert_eq!(result.regions.len(), DK_REGION_COUNT);
            assert_eq!(result.rois.channels, dk_region_names());
            assert_eq!(result.rois.data[3], vec![3.0; 20]);
        }

        #[test]
        fn nonzero_exit_carries_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let tool = write_tool(dir.path(), "echo 'no forward model' >&2\nexit 3");
            let err = CommandBackend::new(&tool)
                .localize(&sensor_recording(), &LocalizeOptions::default())
                .unwrap_err()
                .to_string();
            assert!(err.contains("no forward model"), "{err}");
        }

        #[test]
        fn missing_outputs_are_an_error() {
            let dir = tempfile::tempdir().unwrap();
            let tool = write_tool(dir.path(), "exit 0");
            let err = CommandBackend::new(&tool)
                .localize(&sensor_recording(), &LocalizeOptions::default())
                .unwrap_err()
                .to_string();
            assert!(err.contains("did not produce"), "{err}");
        }

        #[test]
        fn wrong_region_count_is_rejected() {
            let dir = tempfile::tempdir().unwrap();
            stage_outputs(dir.path(), 2);
            let tool = copying_tool(dir.path(), dir.path());
            let err = CommandBackend::new(&tool)
                .localize(&sensor_recording(), &LocalizeOptions::default())
                .unwrap_err()
                .to_string();
            assert!(err.contains("68"), "{err}");
        }

        #[test]
        fn missing_program_is_an_error() {
            let backend = CommandBackend::new("/nonexistent/localizer");
            assert!(backend
                .localize(&sensor_recording(), &LocalizeOptions::default())
                .is_err());
        }
    }
}
