use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Persisted status of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failed")]
    Failed,
    // older records were written with the american spelling
    #[serde(rename = "cancelled", alias = "canceled")]
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::InProgress => "in progress",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One logged attempt of a pipeline step against a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub step: String,
    pub status: JobStatus,
    pub step_started_at: DateTime<Utc>,
    /// Human readable duration, set at completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    /// Duration in whole seconds, set at completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_in_s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logfile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    /// Fields written by other tools are carried along untouched.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl JobRecord {
    /// A fresh "in progress" record for `step`, stamped with this process.
    pub fn in_progress(step: &str, logfile: Option<String>) -> Self {
        Self {
            step: step.to_string(),
            status: JobStatus::InProgress,
            step_started_at: Utc::now(),
            time: None,
            time_in_s: None,
            logfile,
            pid: Some(std::process::id()),
            err: None,
            extra: Map::new(),
        }
    }
}

/// The persistent record of one data build.
///
/// Known fields are typed; anything else (`_meta`, `build_config`, ...) is
/// preserved in `extra` so a round trip through the store never loses data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildDocument {
    #[serde(rename = "_id")]
    pub id: String,
    /// Incremented by the store on every write.
    #[serde(rename = "_rev", default)]
    pub revision: u64,
    #[serde(default)]
    pub jobs: Vec<JobRecord>,
    #[serde(default)]
    pub index: Map<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub snapshot: Map<String, JsonValue>,
    #[serde(default)]
    pub pending: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl BuildDocument {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision: 0,
            jobs: Vec::new(),
            index: Map::new(),
            snapshot: Map::new(),
            pending: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn to_json(&self) -> Result<JsonValue> {
        serde_json::to_value(self).context("Failed to serialize build document")
    }

    pub fn from_json(value: JsonValue) -> Result<Self> {
        serde_json::from_value(value).context("Failed to deserialize build document")
    }

    /// Merge a partial document into this one (see `document::deep_merge`).
    ///
    /// Identity fields (`_id`, `_rev`) are never taken from the delta.
    pub fn apply_delta(&mut self, delta: Map<String, JsonValue>) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        let (id, revision) = (self.id.clone(), self.revision);
        let mut current = match self.to_json()? {
            JsonValue::Object(map) => map,
            other => anyhow::bail!("Build document serialized to a non-object: {}", other),
        };
        crate::document::deep_merge(&mut current, delta);
        let mut updated = Self::from_json(JsonValue::Object(current))?;
        updated.id = id;
        updated.revision = revision;
        *self = updated;
        Ok(())
    }

    /// Name of the index added last, if any.
    pub fn latest_index(&self) -> Option<&str> {
        self.index.keys().last().map(|k| k.as_str())
    }

    pub fn has_pending(&self, tag: &str) -> bool {
        self.pending.iter().any(|p| p == tag)
    }
}

/// Query over build documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildFilter {
    All,
    /// Builds with at least one job in the given status.
    JobStatus(JobStatus),
    /// Builds whose `pending` set contains the tag.
    Pending(String),
    /// Builds owning `index.<index>` created in the given indexer environment.
    IndexEnvironment { index: String, environment: String },
}

impl BuildFilter {
    pub fn matches(&self, doc: &BuildDocument) -> bool {
        match self {
            BuildFilter::All => true,
            BuildFilter::JobStatus(status) => doc.jobs.iter().any(|j| j.status == *status),
            BuildFilter::Pending(tag) => doc.has_pending(tag),
            BuildFilter::IndexEnvironment { index, environment } => doc
                .index
                .get(index)
                .and_then(|meta| meta.get("environment"))
                .and_then(|env| env.as_str())
                .is_some_and(|env| env == environment),
        }
    }
}
