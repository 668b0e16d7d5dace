//! Project sensor data onto the 68 Desikan-Killiany regions through the
//! external localization tool.

use crate::config::{SourceLocalizationParams, StepConfig};
use crate::context::{RoiEpochs, RoiRecording, SensorInput, StepError, StepOutcome};
use crate::task::Task;
use anyhow::Context;
use log::info;
use serde_json::json;
use slate_lib::io::{write_recording, ContainerKind};
use slate_lib::sourcespace::{
    region_info_frame, CommandBackend, LocalizeOptions, SourceBackend,
};

const STEP: &str = "source_localization";

enum Localized {
    Raw(RoiRecording),
    Epochs(RoiEpochs),
}

impl Task {
    pub(crate) fn apply_source_localization(&mut self) -> Result<StepOutcome, StepError> {
        let params = match &self.config.steps.source_localization {
            StepConfig::Disabled => {
                info!("source_localization step is disabled");
                return Ok(StepOutcome::Skipped);
            }
            StepConfig::Enabled(params) => params.clone(),
        };
        let backend = CommandBackend::new(params.program.clone());
        self.localize_with(&backend, &params)
    }

    fn localize_with(
        &mut self,
        backend: &dyn SourceBackend,
        params: &SourceLocalizationParams,
    ) -> Result<StepOutcome, StepError> {
        let options = LocalizeOptions {
            montage: self.config.montage.clone(),
            lambda2: params.lambda2,
            n_jobs: params.n_jobs,
        };
        info!(
            "localizing with {} (montage {}, lambda2 {:.4})",
            params.program.display(),
            options.montage,
            options.lambda2
        );
        let localized = match self.context.sensor_input(STEP)? {
            SensorInput::Epochs(epochs) => {
                let result = backend
                    .localize_epochs(epochs, &options)
                    .map_err(|err| StepError::failed(STEP, err))?;
                Localized::Epochs(RoiEpochs {
                    epochs: result.rois,
                    regions: result.regions,
                })
            }
            SensorInput::Raw(raw) => {
                let result = backend
                    .localize(raw, &options)
                    .map_err(|err| StepError::failed(STEP, err))?;
                Localized::Raw(RoiRecording {
                    recording: result.rois,
                    regions: result.regions,
                })
            }
        };

        let dir = self.step_dir(STEP)?;
        let regions_tsv = self.artifact_path(&dir, "dk_regions.tsv");
        let info_csv = self.artifact_path(&dir, "region_info.csv");
        let info_name = info_csv
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        let (continuous, regions) = match &localized {
            Localized::Raw(roi) => (roi.recording.clone(), &roi.regions),
            Localized::Epochs(roi) => (roi.epochs.to_recording(), &roi.regions),
        };
        write_recording(&continuous, &regions_tsv, ContainerKind::Rois, info_name)
            .map_err(|err| StepError::failed(STEP, err))?;
        region_info_frame(regions)
            .and_then(|frame| {
                frame
                    .write_csv(&info_csv)
                    .with_context(|| format!("failed to write {}", info_csv.display()))
            })
            .map_err(|err| StepError::failed(STEP, err))?;
        info!(
            "stored {} region time courses in {}",
            regions.len(),
            regions_tsv.display()
        );

        self.metadata.record_step(
            STEP,
            json!({
                "montage": options.montage,
                "lambda2": options.lambda2,
                "n_regions": regions.len(),
                "dk_regions": regions_tsv.display().to_string(),
                "region_info": info_csv.display().to_string(),
            }),
        );
        match localized {
            Localized::Raw(roi) => self.context.source_raw = Some(roi),
            Localized::Epochs(roi) => self.context.source_epochs = Some(roi),
        }
        Ok(StepOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskKind;
    use crate::context::TaskContext;
    use crate::metadata::RunMetadata;
    use slate_lib::io::read_recording;
    use slate_lib::sourcespace::{dk_region_names, RegionInfo, SourceResult};
    use slate_lib::{Epochs, Recording};
    use std::path::Path;

    /// Stand-in backend: every region gets a copy of some input channel.
    struct FlatBackend;

    impl SourceBackend for FlatBackend {
        fn localize(
            &self,
            recording: &Recording,
            options: &LocalizeOptions,
        ) -> anyhow::Result<SourceResult> {
            options.validate()?;
            let names = dk_region_names();
            let regions = names
                .iter()
                .map(|full| {
                    let (base, hemisphere) = full.rsplit_once('-').unwrap();
                    RegionInfo {
                        name: base.to_string(),
                        hemisphere: hemisphere.to_string(),
                        n_vertices: 10,
                    }
                })
                .collect();
            let data = (0..names.len())
                .map(|i| recording.data[i % recording.data.len()].clone())
                .collect();
            Ok(SourceResult {
                rois: Recording {
                    fs: recording.fs,
                    channels: names,
                    data,
                },
                regions,
            })
        }
    }

    fn sensor_recording() -> Recording {
        Recording {
            fs: 100.0,
            channels: vec!["e1".into(), "e2".into()],
            data: vec![
                (0..800).map(|i| (i as f64 * 0.01).sin()).collect(),
                (0..800).map(|i| (i as f64 * 0.02).cos()).collect(),
            ],
        }
    }

    fn task_with(context: TaskContext, dir: &Path) -> Task {
        let mut config = crate::presets::default_config(TaskKind::SourceAnalysis);
        config.output.derivatives_dir = dir.to_path_buf();
        Task {
            config,
            context,
            metadata: RunMetadata::new("source_analysis", "test"),
            base: "subject01".to_string(),
            derivatives_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn continuous_input_produces_a_reloadable_container() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = task_with(TaskContext::with_raw(sensor_recording()), dir.path());
        let params = SourceLocalizationParams::default();
        assert_eq!(
            task.localize_with(&FlatBackend, &params).unwrap(),
            StepOutcome::Completed
        );
        let roi = task.context.source_raw.as_ref().unwrap();
        assert_eq!(roi.regions.len(), 68);
        assert_eq!(roi.recording.n_channels(), 68);

        let tsv = dir
            .path()
            .join("source_localization/subject01_dk_regions.tsv");
        let (reloaded, meta) = read_recording(&tsv).unwrap();
        assert_eq!(reloaded.n_channels(), 68);
        assert_eq!(meta.kind, ContainerKind::Rois);
        assert_eq!(
            meta.region_table.as_deref(),
            Some("subject01_region_info.csv")
        );
        assert!(dir
            .path()
            .join("source_localization/subject01_region_info.csv")
            .is_file());
        assert_eq!(
            task.metadata.steps["step_source_localization"]["n_regions"],
            json!(68)
        );
    }

    #[test]
    fn epoched_input_lands_in_source_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let recording = sensor_recording();
        let epochs = Epochs::from_recording(&recording, 2.0, 0.0).unwrap();
        let mut context = TaskContext::with_raw(recording);
        context.epochs = Some(epochs);
        let mut task = task_with(context, dir.path());
        let params = SourceLocalizationParams::default();
        task.localize_with(&FlatBackend, &params).unwrap();
        let roi = task.context.source_epochs.as_ref().unwrap();
        assert_eq!(roi.epochs.n_epochs(), 4);
        assert_eq!(roi.epochs.n_channels(), 68);
        assert!(task.context.source_raw.is_none());
    }

    #[test]
    fn missing_program_fails_the_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = task_with(TaskContext::with_raw(sensor_recording()), dir.path());
        task.config.steps.source_localization = StepConfig::Enabled(SourceLocalizationParams {
            program: "does-not-exist-anywhere".into(),
            ..SourceLocalizationParams::default()
        });
        let err = task.apply_source_localization().unwrap_err();
        assert!(matches!(err, StepError::Failed { .. }));
    }
}
