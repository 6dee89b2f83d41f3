use super::ObjectStorage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::types::{BucketCannedAcl, BucketLocationConstraint, CreateBucketConfiguration};
use tracing::info;

/// Region S3 creates buckets in when no location constraint is sent.
const DEFAULT_REGION: &str = "us-east-1";

/// S3 buckets, authenticated with a static key pair.
pub struct S3ObjectStorage {
    client: aws_sdk_s3::Client,
    region: String,
}

impl S3ObjectStorage {
    pub fn new(access_key: &str, secret_key: &str, region: Option<&str>) -> Self {
        let region = region.unwrap_or(DEFAULT_REGION).to_string();
        let credentials = Credentials::new(access_key, secret_key, None, None, "snapshot-hub");
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .credentials_provider(credentials)
            .build();

        Self {
            client: aws_sdk_s3::Client::from_conf(config),
            region,
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

/// Location constraint for a bucket in `region`; S3 rejects one for us-east-1.
fn location_constraint(region: &str) -> Option<BucketLocationConstraint> {
    if region == DEFAULT_REGION {
        return None;
    }
    Some(BucketLocationConstraint::from(region))
}

#[async_trait]
impl ObjectStorage for S3ObjectStorage {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) => match err.as_service_error() {
                Some(service) if service.is_not_found() => Ok(false),
                _ => Err(anyhow::Error::new(err))
                    .with_context(|| format!("Failed to check bucket '{}'", bucket)),
            },
        }
    }

    async fn create_bucket(&self, bucket: &str, acl: &str, region: Option<&str>) -> Result<()> {
        let region = region.unwrap_or(&self.region);
        let mut request = self
            .client
            .create_bucket()
            .bucket(bucket)
            .acl(BucketCannedAcl::from(acl));
        if let Some(constraint) = location_constraint(region) {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(constraint)
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {}
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_bucket_already_owned_by_you()) =>
            {
                info!("Bucket '{}' already exists", bucket);
                return Ok(());
            }
            Err(err) => {
                return Err(anyhow::Error::new(err))
                    .with_context(|| format!("Failed to create bucket '{}'", bucket))
            }
        }

        info!("Created bucket '{}' ({}, acl {})", bucket, region, acl);
        Ok(())
    }
}
