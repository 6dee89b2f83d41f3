//! Search engine snapshot API.

mod client;

pub use client::ElasticsearchClient;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value as JsonValue;

/// State of a snapshot as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotState {
    /// The engine does not report the snapshot yet.
    NotStarted,
    InProgress,
    Success,
    Failed,
    Other(String),
}

impl SnapshotState {
    pub fn parse(s: &str) -> Self {
        match s {
            "NOT_STARTED" => SnapshotState::NotStarted,
            "IN_PROGRESS" => SnapshotState::InProgress,
            "SUCCESS" => SnapshotState::Success,
            "FAILED" => SnapshotState::Failed,
            other => SnapshotState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SnapshotState::NotStarted => "NOT_STARTED",
            SnapshotState::InProgress => "IN_PROGRESS",
            SnapshotState::Success => "SUCCESS",
            SnapshotState::Failed => "FAILED",
            SnapshotState::Other(s) => s,
        }
    }
}

impl std::fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot repository and snapshot operations of a search engine.
#[async_trait]
pub trait SnapshotEngine: Send + Sync {
    async fn repository_exists(&self, repository: &str) -> Result<bool>;

    async fn create_repository(
        &self,
        repository: &str,
        repository_type: &str,
        settings: &JsonValue,
    ) -> Result<()>;

    async fn snapshot_exists(&self, repository: &str, snapshot: &str) -> Result<bool>;

    async fn delete_snapshot(&self, repository: &str, snapshot: &str) -> Result<()>;

    /// Start a snapshot of `index`. Returns once the engine accepted it.
    async fn create_snapshot(&self, repository: &str, snapshot: &str, index: &str) -> Result<()>;

    async fn snapshot_state(&self, repository: &str, snapshot: &str) -> Result<SnapshotState>;
}
