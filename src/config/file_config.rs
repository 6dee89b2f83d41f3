use crate::document::deep_merge;
use crate::snapshot::RepositoryConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_path: Option<String>,
    pub log_file: Option<String>,
    pub metrics_port: Option<u16>,
    pub poll_interval_secs: Option<u64>,
    pub max_concurrent_jobs: Option<usize>,

    // Environments
    pub indexer: Option<IndexerSection>,
    pub snapshot: Option<SnapshotSection>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct IndexerSection {
    pub env: BTreeMap<String, IndexerEnvConfig>,
}

/// Search engine client arguments understood in `args`.
pub const KNOWN_CLIENT_ARGS: [&str; 2] = ["timeout", "max_retries"];

/// `[indexer.env.<name>]`
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
#[serde(default)]
pub struct IndexerEnvConfig {
    pub host: Option<String>,
    pub timeout_secs: Option<u64>,
    /// Search engine client arguments, see [`KNOWN_CLIENT_ARGS`].
    pub args: Map<String, JsonValue>,
}

impl IndexerEnvConfig {
    /// Request timeout in seconds. `args.timeout` wins over `timeout_secs`.
    pub fn request_timeout_secs(&self) -> Option<u64> {
        self.args
            .get("timeout")
            .and_then(|t| t.as_u64())
            .or(self.timeout_secs)
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.args
            .get("max_retries")
            .and_then(|r| r.as_u64())
            .and_then(|r| u32::try_from(r).ok())
    }

    /// Names in `args` the client does not understand.
    pub fn unknown_args(&self) -> impl Iterator<Item = &str> {
        self.args
            .keys()
            .map(|k| k.as_str())
            .filter(|k| !KNOWN_CLIENT_ARGS.contains(k))
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SnapshotSection {
    pub env: BTreeMap<String, SnapshotEnvConfig>,
}

/// `[snapshot.env.<name>]`
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SnapshotEnvConfig {
    /// Seconds between snapshot state polls.
    pub monitor_delay: Option<u64>,
    /// Give up polling after this many seconds. Unbounded when unset.
    pub monitor_timeout: Option<u64>,
    pub cloud: CloudConfig,
    pub repository: RepositoryConfig,
    pub indexer: IndexerRef,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct CloudConfig {
    /// "fs" or "aws"
    #[serde(rename = "type")]
    pub cloud_type: String,
    /// Bucket root directory, "fs" only.
    pub root: Option<String>,
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

/// Which indexer environment a snapshot environment reads from.
///
/// Either just its name (`indexer = "local"`) or a table naming it and
/// overriding some of its settings.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum IndexerRef {
    Name(String),
    Table(IndexerOverride),
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IndexerOverride {
    #[serde(alias = "name")]
    pub env: String,
    pub host: Option<String>,
    pub timeout_secs: Option<u64>,
    /// Merged over the base environment's `args`.
    #[serde(default)]
    pub args: Map<String, JsonValue>,
}

impl IndexerRef {
    pub fn env_name(&self) -> &str {
        match self {
            IndexerRef::Name(name) => name,
            IndexerRef::Table(table) => &table.env,
        }
    }

    /// `base` with this reference's overrides applied on top.
    pub fn merge_over(&self, base: &IndexerEnvConfig) -> IndexerEnvConfig {
        match self {
            IndexerRef::Name(_) => base.clone(),
            IndexerRef::Table(table) => {
                let mut args = base.args.clone();
                deep_merge(&mut args, table.args.clone());
                IndexerEnvConfig {
                    host: table.host.clone().or_else(|| base.host.clone()),
                    timeout_secs: table.timeout_secs.or(base.timeout_secs),
                    args,
                }
            }
        }
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
