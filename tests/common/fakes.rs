use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use snapshot_hub::config::{CloudConfig, IndexerEnvConfig};
use snapshot_hub::search_engine::{SnapshotEngine, SnapshotState};
use snapshot_hub::snapshot::BackendFactory;
use snapshot_hub::storage::ObjectStorage;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

/// A call received by [`FakeEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreateRepository { repository: String, settings: String },
    DeleteSnapshot { repository: String, snapshot: String },
    CreateSnapshot { repository: String, snapshot: String, index: String },
    SnapshotState { repository: String, snapshot: String },
}

/// In-memory search engine. Snapshot states are handed out from a script;
/// once it runs dry every poll reports SUCCESS.
#[derive(Default)]
pub struct FakeEngine {
    repositories: Mutex<BTreeSet<String>>,
    snapshots: Mutex<BTreeSet<(String, String)>>,
    states: Mutex<VecDeque<SnapshotState>>,
    calls: Mutex<Vec<EngineCall>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_states(states: impl IntoIterator<Item = SnapshotState>) -> Self {
        let engine = Self::new();
        engine.states.lock().unwrap().extend(states);
        engine
    }

    pub fn with_repository(self, repository: &str) -> Self {
        self.repositories.lock().unwrap().insert(repository.to_string());
        self
    }

    pub fn with_snapshot(self, repository: &str, snapshot: &str) -> Self {
        self.snapshots
            .lock()
            .unwrap()
            .insert((repository.to_string(), snapshot.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn has_repository(&self, repository: &str) -> bool {
        self.repositories.lock().unwrap().contains(repository)
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl SnapshotEngine for FakeEngine {
    async fn repository_exists(&self, repository: &str) -> Result<bool> {
        Ok(self.has_repository(repository))
    }

    async fn create_repository(
        &self,
        repository: &str,
        _repository_type: &str,
        settings: &JsonValue,
    ) -> Result<()> {
        self.record(EngineCall::CreateRepository {
            repository: repository.to_string(),
            settings: settings.to_string(),
        });
        self.repositories.lock().unwrap().insert(repository.to_string());
        Ok(())
    }

    async fn snapshot_exists(&self, repository: &str, snapshot: &str) -> Result<bool> {
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .contains(&(repository.to_string(), snapshot.to_string())))
    }

    async fn delete_snapshot(&self, repository: &str, snapshot: &str) -> Result<()> {
        self.record(EngineCall::DeleteSnapshot {
            repository: repository.to_string(),
            snapshot: snapshot.to_string(),
        });
        self.snapshots
            .lock()
            .unwrap()
            .remove(&(repository.to_string(), snapshot.to_string()));
        Ok(())
    }

    async fn create_snapshot(&self, repository: &str, snapshot: &str, index: &str) -> Result<()> {
        if !self.has_repository(repository) {
            bail!("repository_missing_exception: [{}] missing", repository);
        }
        self.record(EngineCall::CreateSnapshot {
            repository: repository.to_string(),
            snapshot: snapshot.to_string(),
            index: index.to_string(),
        });
        self.snapshots
            .lock()
            .unwrap()
            .insert((repository.to_string(), snapshot.to_string()));
        Ok(())
    }

    async fn snapshot_state(&self, repository: &str, snapshot: &str) -> Result<SnapshotState> {
        self.record(EngineCall::SnapshotState {
            repository: repository.to_string(),
            snapshot: snapshot.to_string(),
        });
        Ok(self
            .states
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SnapshotState::Success))
    }
}

/// In-memory bucket store.
#[derive(Default)]
pub struct FakeStorage {
    buckets: Mutex<Vec<(String, String)>>,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(bucket, acl)` pairs in creation order.
    pub fn buckets(&self) -> Vec<(String, String)> {
        self.buckets.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        Ok(self.buckets.lock().unwrap().iter().any(|(b, _)| b == bucket))
    }

    async fn create_bucket(&self, bucket: &str, acl: &str, _region: Option<&str>) -> Result<()> {
        self.buckets
            .lock()
            .unwrap()
            .push((bucket.to_string(), acl.to_string()));
        Ok(())
    }
}

/// Hands the same fakes to every configured environment.
pub struct FakeBackends {
    pub engine: Arc<FakeEngine>,
    pub storage: Arc<FakeStorage>,
}

impl FakeBackends {
    pub fn new(engine: FakeEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            storage: Arc::new(FakeStorage::new()),
        }
    }
}

impl BackendFactory for FakeBackends {
    fn engine(&self, _env_name: &str, _indexer: &IndexerEnvConfig) -> Result<Arc<dyn SnapshotEngine>> {
        Ok(self.engine.clone())
    }

    fn storage(&self, _env_name: &str, _cloud: &CloudConfig) -> Result<Arc<dyn ObjectStorage>> {
        Ok(self.storage.clone())
    }
}
