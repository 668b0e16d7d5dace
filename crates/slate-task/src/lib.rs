pub mod config;
pub mod context;
pub mod metadata;
pub mod presets;
pub mod report;
pub mod steps;
pub mod task;

pub use config::{StepConfig, TaskConfig, TaskKind};
pub use context::{StepError, StepOutcome, TaskContext};
pub use metadata::RunMetadata;
pub use task::{load_recording, Task};
