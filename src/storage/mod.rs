//! Object storage buckets backing snapshot repositories.

mod fs_storage;
mod provisioner;
mod s3_storage;

pub use fs_storage::FsObjectStorage;
pub use provisioner::{ProvisionOutcome, StorageProvisioner};
pub use s3_storage::S3ObjectStorage;

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    /// Create `bucket` with the given canned ACL ("private", "public-read", ...).
    async fn create_bucket(&self, bucket: &str, acl: &str, region: Option<&str>) -> Result<()>;
}
