//! Snapshot environments and the three-phase snapshot pipeline.

mod manager;
mod pipeline;
mod repository_config;
mod runner;

pub use manager::{BackendFactory, DefaultBackends, SnapshotManager, PENDING_SNAPSHOT};
pub use pipeline::{
    CumulativeResult, EnvironmentSettings, PipelineError, SnapshotBackends, SnapshotEnvironment,
    StepResult, SNAPSHOT_STEPS,
};
pub use repository_config::{template_value, RepositoryConfig, TemplateError};
pub use runner::{SnapshotError, SnapshotRunner, DEFAULT_MONITOR_DELAY};
