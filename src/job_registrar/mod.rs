//! Step-by-step job logging against build documents.
//!
//! A `JobRegistrar` records one attempt of one pipeline step: it appends an
//! "in progress" job record on start and finalizes it on completion, merging
//! whatever the step variant derives from the result into the build document.

mod dispatcher;
mod registrar;
mod stage;
pub mod variants;

pub use dispatcher::{DispatchError, PipelineDispatcher};
pub use registrar::{format_elapsed, JobRegistrar};
pub use stage::{transition, Stage, StageEvent};
pub use variants::{IndexerInfo, JobTarget, PipelineKind, StepVariant};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("Invalid registrar stage: cannot {event} while {stage}")]
    InvalidStage { stage: Stage, event: StageEvent },

    #[error("Build document '{0}' not found, can't log job")]
    BuildNotFound(String),

    #[error("Job #{position} is missing from build '{build_id}'")]
    JobMissing { build_id: String, position: usize },

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}
