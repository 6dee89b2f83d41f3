//! Named step variants.
//!
//! A variant is the pair {label written into the job record, hook turning the
//! caller's result into a patch for the rest of the build document}. Variants
//! are plain statics, collected once into the dispatcher table.

use crate::document::{merged, take_marker, READY_MARKER, REPLACE_MARKER};
use chrono::Utc;
use serde_json::{json, Map, Value as JsonValue};

/// Turns a step result into a patch for the build document.
pub type ResultHook = fn(&JobTarget, JsonValue) -> Map<String, JsonValue>;

/// Which kind of pipeline a variant belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Index,
    Snapshot,
}

pub struct StepVariant {
    /// Key the dispatcher resolves.
    pub name: &'static str,
    /// Value written to the job record's `step` field.
    pub label: &'static str,
    pub kind: PipelineKind,
    pub result_hook: ResultHook,
}

impl std::fmt::Debug for StepVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepVariant")
            .field("name", &self.name)
            .field("label", &self.label)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Indexer environment an index was created in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerInfo {
    /// Only for display.
    pub host: Option<String>,
    pub environment: String,
}

/// What a registrar records against.
#[derive(Debug, Clone)]
pub struct JobTarget {
    pub build_id: String,
    /// Index name for index steps, snapshot name for snapshot steps.
    pub name: String,
    pub logfile: Option<String>,
    pub indexer: Option<IndexerInfo>,
}

impl JobTarget {
    pub fn new(build_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            name: name.into(),
            logfile: None,
            indexer: None,
        }
    }

    pub fn with_logfile(mut self, logfile: Option<String>) -> Self {
        self.logfile = logfile;
        self
    }

    pub fn with_indexer(mut self, indexer: IndexerInfo) -> Self {
        self.indexer = Some(indexer);
        self
    }
}

fn into_object(value: JsonValue) -> Map<String, JsonValue> {
    match value {
        JsonValue::Object(map) => map,
        _ => Map::new(),
    }
}

fn single(key: &str, inner: Map<String, JsonValue>) -> Map<String, JsonValue> {
    let mut patch = Map::new();
    patch.insert(key.to_string(), JsonValue::Object(inner));
    patch
}

/// Pre/post index steps only publish when the result says it is ready.
fn publish_when_ready(target: &JobTarget, result: JsonValue) -> Map<String, JsonValue> {
    let mut result = into_object(result);
    if !take_marker(&mut result, READY_MARKER) {
        return Map::new();
    }
    let mut index = Map::new();
    index.insert(target.name.clone(), JsonValue::Object(result));
    single("index", index)
}

/// The main index step seeds environment metadata and lets the caller's
/// fields win.
fn record_index_metadata(target: &JobTarget, result: JsonValue) -> Map<String, JsonValue> {
    let (host, environment) = match &target.indexer {
        Some(info) => (info.host.clone(), Some(info.environment.clone())),
        None => (None, None),
    };
    let seed = json!({
        REPLACE_MARKER: true,
        "host": host,
        "environment": environment,
        "created_at": Utc::now().to_rfc3339(),
    });
    let metadata = merged(seed, JsonValue::Object(into_object(result)));

    let mut index = Map::new();
    index.insert(target.name.clone(), metadata);
    single("index", index)
}

/// Snapshot steps persist the cumulative result under `snapshot.<name>`.
fn record_snapshot(target: &JobTarget, result: JsonValue) -> Map<String, JsonValue> {
    let mut snapshot = Map::new();
    snapshot.insert(target.name.clone(), JsonValue::Object(into_object(result)));
    single("snapshot", snapshot)
}

pub static PRE_INDEX: StepVariant = StepVariant {
    name: "pre-index",
    label: "pre-index",
    kind: PipelineKind::Index,
    result_hook: publish_when_ready,
};

pub static MAIN_INDEX: StepVariant = StepVariant {
    name: "index",
    label: "index",
    kind: PipelineKind::Index,
    result_hook: record_index_metadata,
};

pub static POST_INDEX: StepVariant = StepVariant {
    name: "post-index",
    label: "post-index",
    kind: PipelineKind::Index,
    result_hook: publish_when_ready,
};

pub static PRE_SNAPSHOT: StepVariant = StepVariant {
    name: "pre",
    label: "pre",
    kind: PipelineKind::Snapshot,
    result_hook: record_snapshot,
};

pub static MAIN_SNAPSHOT: StepVariant = StepVariant {
    name: "snapshot",
    label: "snapshot",
    kind: PipelineKind::Snapshot,
    result_hook: record_snapshot,
};

pub static POST_SNAPSHOT: StepVariant = StepVariant {
    name: "post",
    label: "post",
    kind: PipelineKind::Snapshot,
    result_hook: record_snapshot,
};

pub static ALL_VARIANTS: [&StepVariant; 6] = [
    &PRE_INDEX,
    &MAIN_INDEX,
    &POST_INDEX,
    &PRE_SNAPSHOT,
    &MAIN_SNAPSHOT,
    &POST_SNAPSHOT,
];

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> JobTarget {
        JobTarget::new("b1", "news_2024").with_indexer(IndexerInfo {
            host: Some("http://localhost:9200".to_string()),
            environment: "local".to_string(),
        })
    }

    #[test]
    fn test_publish_requires_ready_marker() {
        let patch = (PRE_INDEX.result_hook)(&target(), json!({"count": 3}));
        assert!(patch.is_empty());

        let patch = (POST_INDEX.result_hook)(&target(), json!({"__READY__": true, "count": 3}));
        assert_eq!(
            JsonValue::Object(patch),
            json!({"index": {"news_2024": {"count": 3}}})
        );
    }

    #[test]
    fn test_main_index_seeds_metadata_and_caller_wins() {
        let patch = (MAIN_INDEX.result_hook)(
            &target(),
            json!({"count": 99, "environment": "override"}),
        );
        let meta = &patch["index"]["news_2024"];

        assert_eq!(meta["__REPLACE__"], true);
        assert_eq!(meta["host"], "http://localhost:9200");
        assert_eq!(meta["environment"], "override");
        assert_eq!(meta["count"], 99);
        assert!(meta["created_at"].is_string());
    }

    #[test]
    fn test_main_index_ignores_non_object_result() {
        let patch = (MAIN_INDEX.result_hook)(&target(), JsonValue::Null);
        assert_eq!(patch["index"]["news_2024"]["environment"], "local");
    }

    #[test]
    fn test_snapshot_variants_nest_under_snapshot_name() {
        let patch = (MAIN_SNAPSHOT.result_hook)(
            &JobTarget::new("b1", "snap_1"),
            json!({"replaced": false}),
        );
        assert_eq!(
            JsonValue::Object(patch),
            json!({"snapshot": {"snap_1": {"replaced": false}}})
        );
    }

    #[test]
    fn test_labels_are_unique() {
        let mut labels: Vec<_> = ALL_VARIANTS.iter().map(|v| v.label).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), ALL_VARIANTS.len());
    }
}
