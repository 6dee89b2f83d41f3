use super::repository_config::RepositoryConfig;
use super::runner::SnapshotRunner;
use crate::build_store::{BuildDocument, BuildFilter, BuildStore};
use crate::document::deep_merge;
use crate::job_registrar::{
    DispatchError, IndexerInfo, JobRegistrar, JobTarget, PipelineDispatcher, RegistrarError,
};
use crate::metrics;
use crate::search_engine::SnapshotEngine;
use crate::storage::{ObjectStorage, StorageProvisioner};
use crate::worker::{ProcessInfo, WorkerPool};
use anyhow::anyhow;
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Phases of a snapshot run, in execution order.
pub const SNAPSHOT_STEPS: [&str; 3] = ["pre", "snapshot", "post"];

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Index '{index}' is not managed by this hub (no build owns it in indexer environment '{environment}')")]
    UnmanagedIndex { index: String, environment: String },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Registrar(#[from] RegistrarError),

    #[error("Step '{step}' of snapshot '{snapshot}' failed: {source:#}")]
    Phase {
        step: String,
        snapshot: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Build store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// What a single phase returns.
pub type StepResult = Map<String, JsonValue>;

/// Results of all phases so far, later phases winning on conflicts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CumulativeResult(Map<String, JsonValue>);

impl CumulativeResult {
    pub fn merge(&mut self, step: StepResult) {
        deep_merge(&mut self.0, step);
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.0.clone())
    }
}

/// Shared collaborators of every environment.
#[derive(Clone)]
pub struct SnapshotBackends {
    pub store: Arc<dyn BuildStore>,
    pub engine: Arc<dyn SnapshotEngine>,
    pub storage: Arc<dyn ObjectStorage>,
    pub dispatcher: Arc<PipelineDispatcher>,
    pub workers: WorkerPool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentSettings {
    pub name: String,
    pub indexer: IndexerInfo,
    /// Untemplated; resolved against the owning build on every run.
    pub repository: RepositoryConfig,
    pub monitor_delay: Duration,
    pub monitor_timeout: Option<Duration>,
    /// Recorded on the job records.
    pub logfile: Option<String>,
}

/// One snapshot destination: a repository in a search engine, fed from the
/// indexes of one indexer environment.
pub struct SnapshotEnvironment {
    settings: EnvironmentSettings,
    backends: SnapshotBackends,
}

impl SnapshotEnvironment {
    pub fn new(settings: EnvironmentSettings, backends: SnapshotBackends) -> Self {
        Self { settings, backends }
    }

    pub fn settings(&self) -> &EnvironmentSettings {
        &self.settings
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// The build document that created `index` in this environment's indexer.
    fn owning_build(&self, index: &str) -> Result<BuildDocument, PipelineError> {
        let environment = &self.settings.indexer.environment;
        let mut builds = self.backends.store.find(&BuildFilter::IndexEnvironment {
            index: index.to_string(),
            environment: environment.clone(),
        })?;

        if builds.len() > 1 {
            warn!(
                "Index '{}' is claimed by {} builds in environment '{}', using '{}'",
                index,
                builds.len(),
                environment,
                builds[0].id
            );
        }
        if builds.is_empty() {
            return Err(PipelineError::UnmanagedIndex {
                index: index.to_string(),
                environment: environment.clone(),
            });
        }
        Ok(builds.swap_remove(0))
    }

    /// Snapshot `index` as `snapshot` (defaults to the index name).
    ///
    /// Runs `pre`, `snapshot` and `post` in order, each logged as a job of the
    /// owning build. The first failing phase is recorded and ends the run;
    /// earlier phases are not rolled back.
    pub async fn snapshot(
        &self,
        index: &str,
        snapshot: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CumulativeResult, PipelineError> {
        let snapshot = snapshot.unwrap_or(index).to_string();
        let mut cumulative = CumulativeResult::default();

        for step in SNAPSHOT_STEPS {
            let build = self.owning_build(index)?;
            let variant = self.backends.dispatcher.dispatch(step)?;
            let target = JobTarget::new(build.id.clone(), snapshot.clone())
                .with_logfile(self.settings.logfile.clone())
                .with_indexer(self.settings.indexer.clone());

            let mut registrar = JobRegistrar::new(self.backends.store.clone(), variant, target);
            registrar.started()?;
            info!(
                "[{}] {}:{} started for index '{}' (build '{}')",
                self.settings.name, step, snapshot, index, build.id
            );

            metrics::record_phase_started();
            let started = Instant::now();
            let info = ProcessInfo::snapshot(&self.settings.name, step, &snapshot);
            let task = self.phase_task(step, &build, index, &snapshot, cancel);
            let outcome = match task {
                Ok(task) => self.backends.workers.run(info, task).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(result) => {
                    metrics::record_phase_finished(step, "success", started.elapsed());
                    let step_result = match result {
                        JsonValue::Object(map) => map,
                        _ => StepResult::new(),
                    };
                    cumulative.merge(step_result);
                    registrar.succeed(cumulative.to_json())?;
                    info!("[{}] {}:{} done", self.settings.name, step, snapshot);
                }
                Err(e) => {
                    metrics::record_phase_finished(step, "failed", started.elapsed());
                    error!(
                        "[{}] {}:{} failed: {:#}",
                        self.settings.name, step, snapshot, e
                    );
                    if let Err(record_err) = registrar.failed(format!("{:#}", e)) {
                        error!(
                            "Failed to record failure of {}:{}: {}",
                            step, snapshot, record_err
                        );
                    }
                    return Err(PipelineError::Phase {
                        step: step.to_string(),
                        snapshot,
                        source: e,
                    });
                }
            }
        }

        Ok(cumulative)
    }

    /// Body of one phase, detached from `self` so it can run on the pool.
    fn phase_task(
        &self,
        step: &str,
        build: &BuildDocument,
        index: &str,
        snapshot: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<BoxFuture<'static, anyhow::Result<JsonValue>>> {
        let repository = self.settings.repository.clone();
        let doc = build.to_json()?;

        let task: BoxFuture<'static, anyhow::Result<JsonValue>> = match step {
            "pre" => {
                let provisioner = StorageProvisioner::new(
                    self.backends.storage.clone(),
                    self.backends.engine.clone(),
                );
                let result = json!({
                    "indexer_env": self.settings.indexer.environment,
                    "environment": self.settings.name,
                });
                async move {
                    let repository = repository.format(Some(&doc))?;
                    provisioner.ensure(&repository).await?;
                    Ok::<_, anyhow::Error>(result)
                }
                .boxed()
            }
            "snapshot" => {
                let engine = self.backends.engine.clone();
                let (delay, timeout) = (self.settings.monitor_delay, self.settings.monitor_timeout);
                let (index, snapshot, cancel) =
                    (index.to_string(), snapshot.to_string(), cancel.clone());
                async move {
                    let repository = repository.format(Some(&doc))?;
                    let runner = SnapshotRunner::new(engine, repository.name)
                        .with_monitor_delay(delay)
                        .with_monitor_timeout(timeout);
                    Ok::<_, anyhow::Error>(runner.run(&index, &snapshot, &cancel).await?)
                }
                .boxed()
            }
            "post" => async { Ok(json!({})) }.boxed(),
            other => return Err(anyhow!("No phase body for step '{}'", other)),
        };
        Ok(task)
    }
}
