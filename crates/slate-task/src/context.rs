//! Data flowing between steps. Each step reads from and writes to one typed
//! bag; resolvers encode which inputs a step accepts and in which priority,
//! so a missing prerequisite is an explicit error instead of a silent skip.

use slate_lib::signal::{Epochs, Recording};
use slate_lib::sourcespace::RegionInfo;
use thiserror::Error;

/// Continuous region time courses with their atlas rows.
#[derive(Debug, Clone)]
pub struct RoiRecording {
    pub recording: Recording,
    pub regions: Vec<RegionInfo>,
}

/// Epoched region time courses with their atlas rows.
#[derive(Debug, Clone)]
pub struct RoiEpochs {
    pub epochs: Epochs,
    pub regions: Vec<RegionInfo>,
}

/// Per-ROI power spectra handed to the fit steps. `psd[roi][freq]`.
#[derive(Debug, Clone)]
pub struct RoiPsd {
    pub freqs: Vec<f64>,
    pub rois: Vec<String>,
    pub psd: Vec<Vec<f64>>,
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error("{step}: missing prerequisite: {what}")]
    MissingPrerequisite {
        step: &'static str,
        what: &'static str,
    },
    #[error("{step}: invalid parameter: {reason}")]
    InvalidParameter {
        step: &'static str,
        reason: String,
    },
    #[error("{step} failed")]
    Failed {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl StepError {
    pub fn failed(step: &'static str, source: anyhow::Error) -> Self {
        StepError::Failed { step, source }
    }

    pub fn invalid(step: &'static str, reason: impl Into<String>) -> Self {
        StepError::InvalidParameter {
            step,
            reason: reason.into(),
        }
    }

    pub fn step(&self) -> &'static str {
        match self {
            StepError::MissingPrerequisite { step, .. } => step,
            StepError::InvalidParameter { step, .. } => step,
            StepError::Failed { step, .. } => step,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Skipped,
}

/// Denoising works in place on whichever signal currently leads.
pub enum DenoiseTarget<'a> {
    Epochs(&'a mut Epochs),
    Raw(&'a mut Recording),
}

/// Read-only view used by source localization.
pub enum SensorInput<'a> {
    Epochs(&'a Epochs),
    Raw(&'a Recording),
}

/// Source-space input for the PSD step.
#[derive(Debug)]
pub enum SourceInput<'a> {
    Epochs(&'a RoiEpochs),
    Raw(&'a RoiRecording),
}

#[derive(Debug, Default)]
pub struct TaskContext {
    pub raw: Option<Recording>,
    pub epochs: Option<Epochs>,
    pub source_raw: Option<RoiRecording>,
    pub source_epochs: Option<RoiEpochs>,
    pub roi_psd: Option<RoiPsd>,
}

impl TaskContext {
    pub fn with_raw(raw: Recording) -> Self {
        Self {
            raw: Some(raw),
            ..Default::default()
        }
    }

    /// Epochs when present, else the continuous recording.
    pub fn denoise_target(&mut self, step: &'static str) -> Result<DenoiseTarget<'_>, StepError> {
        if let Some(epochs) = self.epochs.as_mut() {
            return Ok(DenoiseTarget::Epochs(epochs));
        }
        if let Some(raw) = self.raw.as_mut() {
            return Ok(DenoiseTarget::Raw(raw));
        }
        Err(StepError::MissingPrerequisite {
            step,
            what: "no recording or epochs loaded",
        })
    }

    /// Epochs when present, else the continuous recording, read-only.
    pub fn sensor_input(&self, step: &'static str) -> Result<SensorInput<'_>, StepError> {
        if let Some(epochs) = self.epochs.as_ref() {
            return Ok(SensorInput::Epochs(epochs));
        }
        if let Some(raw) = self.raw.as_ref() {
            return Ok(SensorInput::Raw(raw));
        }
        Err(StepError::MissingPrerequisite {
            step,
            what: "no recording or epochs loaded",
        })
    }

    /// Source epochs when present, else continuous source data.
    pub fn source_input(&self, step: &'static str) -> Result<SourceInput<'_>, StepError> {
        if let Some(epochs) = self.source_epochs.as_ref() {
            return Ok(SourceInput::Epochs(epochs));
        }
        if let Some(raw) = self.source_raw.as_ref() {
            return Ok(SourceInput::Raw(raw));
        }
        Err(StepError::MissingPrerequisite {
            step,
            what: "no source estimate; run source_localization first",
        })
    }

    /// Connectivity needs continuous source data; epoched estimates do not
    /// qualify because the epochs are re-drawn at random positions.
    pub fn connectivity_input(&self, step: &'static str) -> Result<&RoiRecording, StepError> {
        self.source_raw
            .as_ref()
            .ok_or(StepError::MissingPrerequisite {
                step,
                what: "no continuous source estimate; run source_localization on raw data",
            })
    }

    pub fn psd_input(&self, step: &'static str) -> Result<&RoiPsd, StepError> {
        self.roi_psd.as_ref().ok_or(StepError::MissingPrerequisite {
            step,
            what: "no ROI spectra; run source_psd first",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording() -> Recording {
        Recording {
            fs: 100.0,
            channels: vec!["E1".into()],
            data: vec![vec![0.0; 100]],
        }
    }

    fn epochs() -> Epochs {
        Epochs {
            fs: 100.0,
            channels: vec!["E1".into()],
            data: vec![vec![vec![0.0; 50]]],
        }
    }

    #[test]
    fn denoise_prefers_epochs_over_raw() {
        let mut ctx = TaskContext::with_raw(recording());
        assert!(matches!(
            ctx.denoise_target("wavelet_threshold"),
            Ok(DenoiseTarget::Raw(_))
        ));
        ctx.epochs = Some(epochs());
        assert!(matches!(
            ctx.denoise_target("wavelet_threshold"),
            Ok(DenoiseTarget::Epochs(_))
        ));
    }

    #[test]
    fn empty_context_reports_missing_prerequisites() {
        let ctx = TaskContext::default();
        let err = ctx.source_input("source_psd").unwrap_err();
        assert!(matches!(err, StepError::MissingPrerequisite { .. }));
        assert_eq!(err.step(), "source_psd");
        let err = ctx.psd_input("aperiodic_fit").unwrap_err();
        assert!(err.to_string().contains("source_psd"), "{err}");
    }

    #[test]
    fn connectivity_ignores_epoched_sources() {
        let mut ctx = TaskContext::default();
        ctx.source_epochs = Some(RoiEpochs {
            epochs: epochs(),
            regions: Vec::new(),
        });
        assert!(ctx.connectivity_input("connectivity").is_err());
        ctx.source_raw = Some(RoiRecording {
            recording: recording(),
            regions: Vec::new(),
        });
        assert!(ctx.connectivity_input("connectivity").is_ok());
    }
}
