use super::pipeline::{CumulativeResult, EnvironmentSettings, SnapshotBackends, SnapshotEnvironment};
use super::runner::DEFAULT_MONITOR_DELAY;
use crate::build_store::{BuildDocument, BuildFilter, BuildStore};
use crate::config::{AppConfig, CloudConfig, IndexerEnvConfig, SnapshotEnvConfig};
use crate::document::lookup_path;
use crate::job_registrar::{IndexerInfo, PipelineDispatcher};
use crate::search_engine::{ElasticsearchClient, SnapshotEngine};
use crate::storage::{FsObjectStorage, ObjectStorage, S3ObjectStorage};
use crate::worker::WorkerPool;
use anyhow::{anyhow, bail, Result};
use futures::future::join_all;
use serde_json::{json, Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Tag in a build's `pending` set requesting a snapshot.
pub const PENDING_SNAPSHOT: &str = "snapshot";

const DEFAULT_INDEXER_TIMEOUT_SECS: u64 = 100;
const REDACTED: &str = "*****";

/// Creates the backend clients of a snapshot environment.
pub trait BackendFactory {
    fn engine(&self, env_name: &str, indexer: &IndexerEnvConfig) -> Result<Arc<dyn SnapshotEngine>>;
    fn storage(&self, env_name: &str, cloud: &CloudConfig) -> Result<Arc<dyn ObjectStorage>>;
}

/// Elasticsearch over HTTP, with filesystem or S3 buckets.
pub struct DefaultBackends;

impl BackendFactory for DefaultBackends {
    fn engine(&self, env_name: &str, indexer: &IndexerEnvConfig) -> Result<Arc<dyn SnapshotEngine>> {
        let host = indexer
            .host
            .as_deref()
            .ok_or_else(|| anyhow!("Snapshot environment '{}': indexer has no host", env_name))?;
        let timeout = indexer
            .request_timeout_secs()
            .unwrap_or(DEFAULT_INDEXER_TIMEOUT_SECS);
        for arg in indexer.unknown_args() {
            warn!(
                "Snapshot environment '{}': ignoring unknown indexer arg '{}'",
                env_name, arg
            );
        }
        let client = ElasticsearchClient::new(host, timeout)?
            .with_max_retries(indexer.max_retries().unwrap_or(0));
        Ok(Arc::new(client))
    }

    fn storage(&self, env_name: &str, cloud: &CloudConfig) -> Result<Arc<dyn ObjectStorage>> {
        match cloud.cloud_type.as_str() {
            "fs" => {
                let root = cloud.root.as_deref().ok_or_else(|| {
                    anyhow!("Snapshot environment '{}': cloud type 'fs' needs a root", env_name)
                })?;
                Ok(Arc::new(FsObjectStorage::new(root)))
            }
            "aws" => {
                let (Some(access_key), Some(secret_key)) =
                    (cloud.access_key.as_deref(), cloud.secret_key.as_deref())
                else {
                    bail!(
                        "Snapshot environment '{}': cloud type 'aws' needs access_key and secret_key",
                        env_name
                    );
                };
                Ok(Arc::new(S3ObjectStorage::new(
                    access_key,
                    secret_key,
                    cloud.region.as_deref(),
                )))
            }
            other => bail!(
                "Snapshot environment '{}': unknown cloud type '{}'",
                env_name,
                other
            ),
        }
    }
}

/// All configured snapshot environments, plus the pending-build poller.
pub struct SnapshotManager {
    store: Arc<dyn BuildStore>,
    dispatcher: Arc<PipelineDispatcher>,
    workers: WorkerPool,
    environments: BTreeMap<String, Arc<SnapshotEnvironment>>,
    info: Map<String, JsonValue>,
}

impl SnapshotManager {
    pub fn new(store: Arc<dyn BuildStore>, dispatcher: Arc<PipelineDispatcher>, workers: WorkerPool) -> Self {
        Self {
            store,
            dispatcher,
            workers,
            environments: BTreeMap::new(),
            info: Map::new(),
        }
    }

    pub fn configure(&mut self, config: &AppConfig) -> Result<()> {
        self.configure_with(config, &DefaultBackends)
    }

    /// Build one environment per `[snapshot.env.*]` entry.
    pub fn configure_with(&mut self, config: &AppConfig, factory: &dyn BackendFactory) -> Result<()> {
        for (name, env) in &config.snapshot_envs {
            let indexer_name = env.indexer.env_name();
            let base = config.indexer_envs.get(indexer_name).ok_or_else(|| {
                anyhow!(
                    "Snapshot environment '{}' refers to unknown indexer environment '{}'",
                    name,
                    indexer_name
                )
            })?;
            let indexer = env.indexer.merge_over(base);

            let backends = SnapshotBackends {
                store: self.store.clone(),
                engine: factory.engine(name, &indexer)?,
                storage: factory.storage(name, &env.cloud)?,
                dispatcher: self.dispatcher.clone(),
                workers: self.workers.clone(),
            };
            let settings = EnvironmentSettings {
                name: name.clone(),
                indexer: IndexerInfo {
                    host: indexer.host.clone(),
                    environment: indexer_name.to_string(),
                },
                repository: env.repository.clone(),
                monitor_delay: env
                    .monitor_delay
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_MONITOR_DELAY),
                monitor_timeout: env.monitor_timeout.map(Duration::from_secs),
                logfile: config.log_file.clone(),
            };

            self.info
                .insert(name.clone(), redacted_info(env, indexer_name, &indexer));
            self.register(SnapshotEnvironment::new(settings, backends));
            info!(
                "Configured snapshot environment '{}' (indexer '{}', repository '{}')",
                name, indexer_name, env.repository.name
            );
        }
        Ok(())
    }

    /// Add an environment, replacing any with the same name.
    pub fn register(&mut self, environment: SnapshotEnvironment) {
        self.environments
            .insert(environment.name().to_string(), Arc::new(environment));
    }

    pub fn environment_names(&self) -> impl Iterator<Item = &str> {
        self.environments.keys().map(|k| k.as_str())
    }

    fn environment(&self, name: &str) -> Result<&Arc<SnapshotEnvironment>> {
        self.environments
            .get(name)
            .ok_or_else(|| anyhow!("Unknown snapshot environment '{}'", name))
    }

    /// Cancel jobs a previous process left in progress.
    pub fn clean_stale_status(&self) -> Result<usize> {
        self.dispatcher.audit(self.store.as_ref())
    }

    pub async fn snapshot(
        &self,
        env: &str,
        index: &str,
        snapshot: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CumulativeResult> {
        let environment = self.environment(env)?;
        Ok(environment.snapshot(index, snapshot, cancel).await?)
    }

    /// Ask the poller to snapshot `build_id`.
    pub fn pending_snapshot(&self, build_id: &str) -> Result<()> {
        self.store.add_pending(build_id, PENDING_SNAPSHOT)
    }

    /// Snapshot the newest index of `build` into its autobuild environment
    /// (`build_config.autobuild.env`).
    pub async fn snapshot_build(
        &self,
        build: &BuildDocument,
        cancel: &CancellationToken,
    ) -> Result<CumulativeResult> {
        let doc = build.to_json()?;
        let env = lookup_path(&doc, "build_config.autobuild.env")
            .and_then(|env| env.as_str())
            .ok_or_else(|| anyhow!("Build '{}' has no autobuild environment", build.id))?;
        let index = build
            .latest_index()
            .ok_or_else(|| anyhow!("Build '{}' has no index to snapshot", build.id))?;

        info!(
            "Autobuild snapshot of index '{}' (build '{}') in environment '{}'",
            index, build.id, env
        );
        self.snapshot(env, index, None, cancel).await
    }

    /// Start a snapshot for every build tagged pending, clearing the tag first.
    ///
    /// Returns the spawned runs. Their failures are logged, not returned.
    pub fn poll_once(self: &Arc<Self>, cancel: &CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        let pending = self
            .store
            .find(&BuildFilter::Pending(PENDING_SNAPSHOT.to_string()))?;

        let mut handles = Vec::with_capacity(pending.len());
        for build in pending {
            if let Err(e) = self.store.remove_pending(&build.id, PENDING_SNAPSHOT) {
                error!("Failed to clear pending snapshot of build '{}': {}", build.id, e);
                continue;
            }
            info!("Build '{}' is pending a snapshot", build.id);

            let manager = Arc::clone(self);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                match manager.snapshot_build(&build, &cancel).await {
                    Ok(result) => info!(
                        "Snapshot of build '{}' done: {}",
                        build.id,
                        result.to_json()
                    ),
                    Err(e) => error!("Snapshot of build '{}' failed: {:#}", build.id, e),
                }
            }));
        }
        Ok(handles)
    }

    /// Poll for pending builds every `interval` until `cancel` fires, then
    /// wait for the runs still going.
    pub async fn poll_pending(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        info!("Polling for pending snapshots every {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        let mut running: Vec<JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            running.retain(|handle| !handle.is_finished());
            match self.poll_once(&cancel) {
                Ok(handles) => running.extend(handles),
                Err(e) => error!("Failed to poll pending snapshots: {:#}", e),
            }
        }

        if !running.is_empty() {
            warn!("Waiting for {} snapshot runs to stop", running.len());
        }
        join_all(running).await;
        info!("Pending snapshot poller stopped");
    }

    /// Configured environments, credentials redacted.
    pub fn snapshot_info(&self) -> JsonValue {
        json!({ "env": self.info })
    }
}

fn redacted_info(env: &SnapshotEnvConfig, indexer_name: &str, indexer: &IndexerEnvConfig) -> JsonValue {
    let mut cloud = env.cloud.clone();
    for secret in [&mut cloud.access_key, &mut cloud.secret_key] {
        if secret.is_some() {
            *secret = Some(REDACTED.to_string());
        }
    }
    json!({
        "monitor_delay": env.monitor_delay.unwrap_or(DEFAULT_MONITOR_DELAY.as_secs()),
        "monitor_timeout": env.monitor_timeout,
        "cloud": cloud,
        "repository": env.repository,
        "indexer": {
            "env": indexer_name,
            "host": indexer.host,
            "timeout_secs": indexer.timeout_secs,
            "args": indexer.args,
        },
    })
}
