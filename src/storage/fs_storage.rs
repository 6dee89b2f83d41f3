use super::ObjectStorage;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::info;

/// Marker file describing a bucket directory.
const BUCKET_MARKER: &str = ".bucket.json";

/// Buckets as directories under a root path.
///
/// Meant for single-host deployments where the search engine writes its
/// `fs` repositories to a shared mount.
pub struct FsObjectStorage {
    root: PathBuf,
}

impl FsObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_path(&self, bucket: &str) -> Result<PathBuf> {
        if bucket.is_empty()
            || bucket.contains(['/', '\\'])
            || bucket == "."
            || bucket == ".."
        {
            bail!("Invalid bucket name '{}'", bucket);
        }
        Ok(self.root.join(bucket))
    }
}

#[async_trait]
impl ObjectStorage for FsObjectStorage {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let marker = self.bucket_path(bucket)?.join(BUCKET_MARKER);
        tokio::fs::try_exists(&marker)
            .await
            .with_context(|| format!("Failed to check bucket marker {:?}", marker))
    }

    async fn create_bucket(&self, bucket: &str, acl: &str, region: Option<&str>) -> Result<()> {
        let path = self.bucket_path(bucket)?;
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("Failed to create bucket directory {:?}", path))?;

        let marker = json!({
            "bucket": bucket,
            "acl": acl,
            "region": region,
            "created_at": chrono::Utc::now().to_rfc3339(),
        });
        tokio::fs::write(path.join(BUCKET_MARKER), serde_json::to_vec_pretty(&marker)?)
            .await
            .with_context(|| format!("Failed to write bucket marker in {:?}", path))?;

        info!("Created bucket '{}' at {:?}", bucket, path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_and_check_bucket() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FsObjectStorage::new(temp_dir.path());

        assert!(!storage.bucket_exists("backup-2024").await.unwrap());
        storage
            .create_bucket("backup-2024", "private", Some("us-west-2"))
            .await
            .unwrap();
        assert!(storage.bucket_exists("backup-2024").await.unwrap());

        let marker: serde_json::Value = serde_json::from_slice(
            &std::fs::read(temp_dir.path().join("backup-2024").join(BUCKET_MARKER)).unwrap(),
        )
        .unwrap();
        assert_eq!(marker["acl"], "private");
        assert_eq!(marker["region"], "us-west-2");
    }

    #[tokio::test]
    async fn test_plain_directory_is_not_a_bucket() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join("stray")).unwrap();
        let storage = FsObjectStorage::new(temp_dir.path());

        assert!(!storage.bucket_exists("stray").await.unwrap());
    }

    #[tokio::test]
    async fn test_io_error_is_not_reported_as_missing() {
        let temp_dir = TempDir::new().unwrap();
        let not_a_dir = temp_dir.path().join("root-is-a-file");
        std::fs::write(&not_a_dir, b"").unwrap();
        let storage = FsObjectStorage::new(&not_a_dir);

        let err = storage.bucket_exists("backup-2024").await.unwrap_err();
        assert!(err.to_string().contains("Failed to check bucket marker"));
    }

    #[tokio::test]
    async fn test_rejects_path_like_names() {
        let storage = FsObjectStorage::new("/tmp");
        assert!(storage.bucket_exists("../etc").await.is_err());
        assert!(storage.create_bucket("", "private", None).await.is_err());
    }
}
