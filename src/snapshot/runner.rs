use crate::metrics;
use crate::search_engine::{SnapshotEngine, SnapshotState};
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_MONITOR_DELAY: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot '{snapshot}' failed with state {state}")]
    Failed {
        snapshot: String,
        state: SnapshotState,
    },

    #[error("Snapshot '{snapshot}' still not done after {elapsed:?}")]
    TimedOut { snapshot: String, elapsed: Duration },

    #[error("Monitoring of snapshot '{0}' was cancelled")]
    Cancelled(String),

    #[error("Search engine error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Creates one snapshot and waits for the engine to finish it.
pub struct SnapshotRunner {
    engine: Arc<dyn SnapshotEngine>,
    repository: String,
    monitor_delay: Duration,
    monitor_timeout: Option<Duration>,
}

impl SnapshotRunner {
    pub fn new(engine: Arc<dyn SnapshotEngine>, repository: impl Into<String>) -> Self {
        Self {
            engine,
            repository: repository.into(),
            monitor_delay: DEFAULT_MONITOR_DELAY,
            monitor_timeout: None,
        }
    }

    pub fn with_monitor_delay(mut self, delay: Duration) -> Self {
        self.monitor_delay = delay;
        self
    }

    pub fn with_monitor_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.monitor_timeout = timeout;
        self
    }

    /// Snapshot `index` as `snapshot`, replacing a previous snapshot of that name.
    ///
    /// Returns `{"replaced": bool, "created_at": <rfc3339>}`.
    pub async fn run(
        &self,
        index: &str,
        snapshot: &str,
        cancel: &CancellationToken,
    ) -> Result<JsonValue, SnapshotError> {
        let mut replaced = false;
        if self.engine.snapshot_exists(&self.repository, snapshot).await? {
            info!(
                "Deleting existing snapshot '{}' in repository '{}'",
                snapshot, self.repository
            );
            self.engine.delete_snapshot(&self.repository, snapshot).await?;
            replaced = true;
        }

        self.engine
            .create_snapshot(&self.repository, snapshot, index)
            .await?;
        info!(
            "Snapshot '{}' of index '{}' started in repository '{}'",
            snapshot, index, self.repository
        );

        self.wait_until_done(snapshot, cancel).await?;

        Ok(json!({
            "replaced": replaced,
            "created_at": Utc::now().to_rfc3339(),
        }))
    }

    async fn wait_until_done(
        &self,
        snapshot: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SnapshotError> {
        let started = Instant::now();
        loop {
            let state = self.engine.snapshot_state(&self.repository, snapshot).await?;
            metrics::record_snapshot_poll(state.as_str());
            debug!("Snapshot '{}' is {}", snapshot, state);

            match state {
                SnapshotState::Success => return Ok(()),
                SnapshotState::Failed => {
                    return Err(SnapshotError::Failed {
                        snapshot: snapshot.to_string(),
                        state,
                    })
                }
                _ => {}
            }

            let elapsed = started.elapsed();
            if self.monitor_timeout.is_some_and(|timeout| elapsed >= timeout) {
                return Err(SnapshotError::TimedOut {
                    snapshot: snapshot.to_string(),
                    elapsed,
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(SnapshotError::Cancelled(snapshot.to_string()));
                }
                _ = tokio::time::sleep(self.monitor_delay) => {}
            }
        }
    }
}
