use super::ObjectStorage;
use crate::metrics;
use crate::search_engine::SnapshotEngine;
use crate::snapshot::RepositoryConfig;
use anyhow::Result;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProvisionOutcome {
    pub bucket_created: bool,
    pub repository_created: bool,
}

/// Makes sure a snapshot repository and its bucket exist.
pub struct StorageProvisioner {
    storage: Arc<dyn ObjectStorage>,
    engine: Arc<dyn SnapshotEngine>,
}

impl StorageProvisioner {
    pub fn new(storage: Arc<dyn ObjectStorage>, engine: Arc<dyn SnapshotEngine>) -> Self {
        Self { storage, engine }
    }

    /// `repository` must already be templated.
    ///
    /// An existing repository is trusted as is: its bucket is not checked.
    pub async fn ensure(&self, repository: &RepositoryConfig) -> Result<ProvisionOutcome> {
        let mut outcome = ProvisionOutcome::default();

        if self.engine.repository_exists(&repository.name).await? {
            debug!("Repository '{}' already exists", repository.name);
            return Ok(outcome);
        }

        match repository.bucket() {
            Some(bucket) => {
                if !self.storage.bucket_exists(bucket).await? {
                    self.storage
                        .create_bucket(bucket, &repository.acl, repository.region())
                        .await?;
                    metrics::record_provisioned("bucket");
                    outcome.bucket_created = true;
                }
            }
            None => debug!(
                "Repository '{}' names no bucket, skipping bucket check",
                repository.name
            ),
        }

        self.engine
            .create_repository(
                &repository.name,
                &repository.repository_type,
                &JsonValue::Object(repository.settings.clone()),
            )
            .await?;
        metrics::record_provisioned("repository");
        outcome.repository_created = true;

        info!(
            "Provisioned repository '{}' (bucket created: {})",
            repository.name, outcome.bucket_created
        );
        Ok(outcome)
    }
}
