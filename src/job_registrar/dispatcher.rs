use super::registrar::JobRegistrar;
use super::variants::{StepVariant, ALL_VARIANTS};
use crate::build_store::BuildStore;
use crate::metrics;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Unknown pipeline step '{0}'")]
    UnknownStep(String),
}

/// Step name to variant table.
pub struct PipelineDispatcher {
    steps: BTreeMap<&'static str, &'static StepVariant>,
}

impl Default for PipelineDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineDispatcher {
    /// Dispatcher knowing every built-in step.
    pub fn new() -> Self {
        let mut dispatcher = Self {
            steps: BTreeMap::new(),
        };
        for variant in ALL_VARIANTS {
            dispatcher.register(variant);
        }
        dispatcher
    }

    /// Add a step, replacing any variant registered under the same name.
    pub fn register(&mut self, variant: &'static StepVariant) {
        self.steps.insert(variant.name, variant);
    }

    pub fn dispatch(&self, step: &str) -> Result<&'static StepVariant, DispatchError> {
        self.steps
            .get(step)
            .copied()
            .ok_or_else(|| DispatchError::UnknownStep(step.to_string()))
    }

    pub fn step_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.steps.keys().copied()
    }

    /// Cancel jobs left "in progress" by a previous process.
    pub fn audit(&self, store: &dyn BuildStore) -> anyhow::Result<usize> {
        info!("Auditing build store for stale jobs");
        let cancelled = JobRegistrar::prune(store)?;
        metrics::record_stale_jobs_cancelled(cancelled);
        Ok(cancelled)
    }
}
