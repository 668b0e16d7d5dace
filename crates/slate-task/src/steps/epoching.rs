//! Cut the continuous recording into fixed-length epochs.

use crate::config::StepConfig;
use crate::context::{StepError, StepOutcome};
use crate::task::Task;
use log::info;
use serde_json::json;
use slate_lib::Epochs;

const STEP: &str = "epoching";

impl Task {
    pub(crate) fn create_epochs(&mut self) -> Result<StepOutcome, StepError> {
        let params = match &self.config.steps.epoching {
            StepConfig::Disabled => {
                info!("epoching step is disabled");
                return Ok(StepOutcome::Skipped);
            }
            StepConfig::Enabled(params) => params.clone(),
        };
        let raw = self
            .context
            .raw
            .as_ref()
            .ok_or(StepError::MissingPrerequisite {
                step: STEP,
                what: "no continuous recording loaded",
            })?;
        if raw.duration() < params.length {
            return Err(StepError::invalid(
                STEP,
                format!(
                    "recording is {:.1} s, shorter than one {:.1} s epoch",
                    raw.duration(),
                    params.length
                ),
            ));
        }
        let epochs = Epochs::from_recording(raw, params.length, params.overlap)
            .map_err(|err| StepError::failed(STEP, err))?;
        info!(
            "cut {} epochs of {} s (overlap {} s)",
            epochs.n_epochs(),
            params.length,
            params.overlap
        );
        self.metadata.record_step(
            STEP,
            json!({
                "n_epochs": epochs.n_epochs(),
                "length": params.length,
                "overlap": params.overlap,
            }),
        );
        self.context.epochs = Some(epochs);
        Ok(StepOutcome::Completed)
    }
}
