//! Bounded execution of pipeline phase bodies.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info_span, Instrument};

pub const SNAPSHOT_CATEGORY: &str = "snapshot";

/// What a running phase is, for logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub category: &'static str,
    /// `<step>:<snapshot>`
    pub step: String,
    pub description: String,
    /// Environment the phase runs for.
    pub source: String,
}

impl ProcessInfo {
    pub fn snapshot(environment: &str, step: &str, snapshot: &str) -> Self {
        Self {
            category: SNAPSHOT_CATEGORY,
            step: format!("{}:{}", step, snapshot),
            description: String::new(),
            source: environment.to_string(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Runs tasks on the runtime, at most `max_concurrent` at a time.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl WorkerPool {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `task` once a slot frees up and wait for its result.
    ///
    /// A panicking task is reported as an error.
    pub async fn run<F, T>(&self, info: ProcessInfo, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("Worker pool is closed")?;

        let span = info_span!(
            "job",
            category = info.category,
            step = %info.step,
            source = %info.source,
        );
        match tokio::spawn(task.instrument(span)).await {
            Ok(result) => result,
            Err(e) => Err(anyhow!("Task panic: {}", e)),
        }
    }
}
