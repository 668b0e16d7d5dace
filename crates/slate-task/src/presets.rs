//! Ready-to-edit configurations, one per task kind.

use crate::config::{
    AperiodicFitParams, ConnectivityParams, EpochingParams, LineNoiseParams, OutputConfig,
    PeriodicFitParams, RejectEpochsParams, SourceLocalizationParams, SourcePsdParams, StepConfig,
    StepTable, TaskConfig, TaskKind, WaveletParams, SCHEMA_VERSION,
};

/// Build the default configuration for a task kind. Every step in the
/// task's sequence is enabled with default parameters; the rest stay
/// disabled.
pub fn default_config(kind: TaskKind) -> TaskConfig {
    let steps = match kind {
        TaskKind::RestingSourcePsd => StepTable {
            line_noise: StepConfig::Enabled(LineNoiseParams::default()),
            wavelet_threshold: StepConfig::Enabled(WaveletParams::default()),
            epoching: StepConfig::Enabled(EpochingParams::default()),
            reject_epochs: StepConfig::Enabled(RejectEpochsParams::default()),
            source_localization: StepConfig::Enabled(SourceLocalizationParams::default()),
            source_psd: StepConfig::Enabled(SourcePsdParams::default()),
            aperiodic_fit: StepConfig::Enabled(AperiodicFitParams::default()),
            periodic_fit: StepConfig::Enabled(PeriodicFitParams::default()),
            ..StepTable::default()
        },
        TaskKind::SourceAnalysis => StepTable {
            source_localization: StepConfig::Enabled(SourceLocalizationParams::default()),
            source_psd: StepConfig::Enabled(SourcePsdParams::default()),
            connectivity: StepConfig::Enabled(ConnectivityParams::default()),
            ..StepTable::default()
        },
        TaskKind::LineNoiseCheck => StepTable {
            line_noise: StepConfig::Enabled(LineNoiseParams::default()),
            epoching: StepConfig::Enabled(EpochingParams::default()),
            reject_epochs: StepConfig::Enabled(RejectEpochsParams::default()),
            ..StepTable::default()
        },
    };
    TaskConfig {
        schema_version: SCHEMA_VERSION,
        task: kind,
        montage: "GSN-HydroCel-129".to_string(),
        output: OutputConfig::default(),
        steps,
    }
}
