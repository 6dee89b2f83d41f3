use serde_json::json;
use snapshot_hub::build_store::{BuildDocument, BuildStore, MemoryBuildStore};
use snapshot_hub::config::{AppConfig, CliConfig, FileConfig};
use snapshot_hub::job_registrar::PipelineDispatcher;
use snapshot_hub::snapshot::SnapshotManager;
use snapshot_hub::worker::WorkerPool;
use std::path::PathBuf;
use std::sync::Arc;

use super::FakeBackends;

pub const BUILD_ID: &str = "news_20240101";
pub const INDEX_NAME: &str = "news_2024";
pub const SNAPSHOT_ENV: &str = "prod";
pub const INDEXER_ENV: &str = "local";
pub const BUILD_VERSION: &str = "20240101";

/// Snapshot environment `prod` reading from indexer environment `local`.
/// The repository and bucket names are templated from the build.
pub const HUB_CONFIG: &str = r#"
[indexer.env.local]
host = "http://localhost:9200"

[snapshot.env.prod]
monitor_delay = 1
indexer = "local"
cloud = { type = "fs", root = "/unused", access_key = "AKIA", secret_key = "hunter2" }

[snapshot.env.prod.repository]
name = "news-%(_meta.build_version)s"
type = "fs"
acl = "public-read"

[snapshot.env.prod.repository.settings]
bucket = "backups-$(Y)"
base_path = "news/%(_meta.build_version)s"
"#;

/// A build that created `news_2024` in indexer environment `local`.
pub fn indexed_build() -> BuildDocument {
    let mut build = BuildDocument::new(BUILD_ID);
    build
        .index
        .insert(INDEX_NAME.to_string(), json!({"environment": INDEXER_ENV, "count": 1200}));
    build
        .extra
        .insert("_meta".to_string(), json!({"build_version": BUILD_VERSION}));
    build.extra.insert(
        "build_config".to_string(),
        json!({"autobuild": {"env": SNAPSHOT_ENV}}),
    );
    build
}

pub fn hub_config(toml_text: &str) -> AppConfig {
    let cli = CliConfig {
        db_path: Some(PathBuf::from(":memory:")),
        metrics_port: 9091,
        poll_interval_secs: 60,
        max_concurrent_jobs: 2,
        ..Default::default()
    };
    let file: FileConfig = toml::from_str(toml_text).unwrap();
    AppConfig::resolve(&cli, Some(file)).unwrap()
}

/// A manager over `builds`, configured from [`HUB_CONFIG`] with `backends`.
pub fn create_test_manager(
    builds: impl IntoIterator<Item = BuildDocument>,
    backends: &FakeBackends,
) -> (Arc<MemoryBuildStore>, SnapshotManager) {
    let store = Arc::new(MemoryBuildStore::with_documents(builds));
    let mut manager = SnapshotManager::new(
        store.clone() as Arc<dyn BuildStore>,
        Arc::new(PipelineDispatcher::new()),
        WorkerPool::new(2),
    );
    manager
        .configure_with(&hub_config(HUB_CONFIG), backends)
        .unwrap();
    (store, manager)
}
