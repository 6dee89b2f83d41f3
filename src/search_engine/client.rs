//! HTTP client for the Elasticsearch snapshot API.

use super::{SnapshotEngine, SnapshotState};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tracing::warn;

/// Wait before the first retry, growing linearly with each attempt.
const RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct ElasticsearchClient {
    client: reqwest::Client,
    base_url: String,
    max_retries: u32,
}

impl ElasticsearchClient {
    /// Create a client for the cluster at `base_url` (e.g. "http://localhost:9200").
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries: 0,
        })
    }

    /// Retry requests that failed to connect or timed out.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            let Some(this_try) = request.try_clone() else {
                return request
                    .send()
                    .await
                    .context("Failed to connect to search engine");
            };
            match this_try.send().await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.max_retries && (e.is_connect() || e.is_timeout()) => {
                    attempt += 1;
                    warn!(
                        "Search engine request failed ({}), retry {}/{}",
                        e, attempt, self.max_retries
                    );
                    tokio::time::sleep(RETRY_DELAY * attempt).await;
                }
                Err(e) => return Err(e).context("Failed to connect to search engine"),
            }
        }
    }

    fn repository_url(&self, repository: &str) -> String {
        format!("{}/_snapshot/{}", self.base_url, repository)
    }

    fn snapshot_url(&self, repository: &str, snapshot: &str) -> String {
        format!("{}/_snapshot/{}/{}", self.base_url, repository, snapshot)
    }

    /// GET `url`, mapping 404 to `None`.
    async fn get_optional(&self, url: &str) -> Result<Option<JsonValue>> {
        let response = self
            .send(self.client.get(url))
            .await
            .with_context(|| format!("GET {}", url))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(
                response
                    .json()
                    .await
                    .with_context(|| format!("Failed to parse response from {}", url))?,
            )),
            status => {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("GET {} failed with status {}: {}", url, status, body)
            }
        }
    }

    async fn expect_success(response: reqwest::Response, what: &str) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Failed to {}: status {}: {}", what, status, body)
    }
}

/// Extract the state of the first snapshot in a `GET /_snapshot/<repo>/<snap>` body.
fn parse_snapshot_state(body: &JsonValue) -> SnapshotState {
    body.get("snapshots")
        .and_then(|s| s.get(0))
        .and_then(|s| s.get("state"))
        .and_then(|s| s.as_str())
        .map(SnapshotState::parse)
        .unwrap_or(SnapshotState::NotStarted)
}

#[async_trait]
impl SnapshotEngine for ElasticsearchClient {
    async fn repository_exists(&self, repository: &str) -> Result<bool> {
        Ok(self
            .get_optional(&self.repository_url(repository))
            .await?
            .is_some())
    }

    async fn create_repository(
        &self,
        repository: &str,
        repository_type: &str,
        settings: &JsonValue,
    ) -> Result<()> {
        let request = self
            .client
            .put(self.repository_url(repository))
            .json(&json!({"type": repository_type, "settings": settings}));
        let response = self.send(request).await?;
        Self::expect_success(response, &format!("create repository '{}'", repository)).await
    }

    async fn snapshot_exists(&self, repository: &str, snapshot: &str) -> Result<bool> {
        Ok(self
            .get_optional(&self.snapshot_url(repository, snapshot))
            .await?
            .is_some())
    }

    async fn delete_snapshot(&self, repository: &str, snapshot: &str) -> Result<()> {
        let response = self
            .send(self.client.delete(self.snapshot_url(repository, snapshot)))
            .await?;
        Self::expect_success(response, &format!("delete snapshot '{}'", snapshot)).await
    }

    async fn create_snapshot(&self, repository: &str, snapshot: &str, index: &str) -> Result<()> {
        let request = self
            .client
            .put(self.snapshot_url(repository, snapshot))
            .json(&json!({"indices": index, "include_global_state": false}));
        let response = self.send(request).await?;
        Self::expect_success(response, &format!("create snapshot '{}'", snapshot)).await
    }

    async fn snapshot_state(&self, repository: &str, snapshot: &str) -> Result<SnapshotState> {
        let body = self
            .get_optional(&self.snapshot_url(repository, snapshot))
            .await?;
        Ok(body
            .as_ref()
            .map(parse_snapshot_state)
            .unwrap_or(SnapshotState::NotStarted))
    }
}
