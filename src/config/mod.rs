mod file_config;

pub use file_config::{
    CloudConfig, FileConfig, IndexerEnvConfig, IndexerOverride, IndexerRef, IndexerSection,
    SnapshotEnvConfig, SnapshotSection,
};

use anyhow::{anyhow, bail, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// `db_path` value selecting the in-memory build store.
pub const IN_MEMORY_DB: &str = ":memory:";

/// CLI arguments that can be used for config resolution.
/// TOML values override these where present.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub log_file: Option<String>,
    pub metrics_port: u16,
    pub poll_interval_secs: u64,
    pub max_concurrent_jobs: usize,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub log_file: Option<String>,
    pub metrics_port: u16,
    pub poll_interval: Duration,
    pub max_concurrent_jobs: usize,

    pub indexer_envs: BTreeMap<String, IndexerEnvConfig>,
    pub snapshot_envs: BTreeMap<String, SnapshotEnvConfig>,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| anyhow!("db_path must be specified via --db-path or in config file"))?;

        if db_path.as_os_str() != IN_MEMORY_DB {
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                if !parent.is_dir() {
                    bail!("Database directory does not exist: {:?}", parent);
                }
            }
        }

        let log_file = file.log_file.or_else(|| cli.log_file.clone());
        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);
        let poll_interval_secs = file.poll_interval_secs.unwrap_or(cli.poll_interval_secs);
        if poll_interval_secs == 0 {
            bail!("poll_interval_secs must be greater than 0");
        }
        let max_concurrent_jobs = file.max_concurrent_jobs.unwrap_or(cli.max_concurrent_jobs);
        if max_concurrent_jobs == 0 {
            bail!("max_concurrent_jobs must be greater than 0");
        }

        let indexer_envs = file.indexer.unwrap_or_default().env;
        let snapshot_envs = file.snapshot.unwrap_or_default().env;

        for (name, env) in &snapshot_envs {
            let indexer = env.indexer.env_name();
            if !indexer_envs.contains_key(indexer) {
                bail!(
                    "Snapshot environment '{}' refers to unknown indexer environment '{}'",
                    name,
                    indexer
                );
            }
            if env.monitor_delay == Some(0) {
                bail!("Snapshot environment '{}': monitor_delay must be greater than 0", name);
            }
        }

        Ok(Self {
            db_path,
            log_file,
            metrics_port,
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_concurrent_jobs,
            indexer_envs,
            snapshot_envs,
        })
    }

    pub fn uses_in_memory_db(&self) -> bool {
        self.db_path.as_os_str() == IN_MEMORY_DB
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cli_with_db(temp_dir: &TempDir) -> CliConfig {
        CliConfig {
            db_path: Some(temp_dir.path().join("builds.db")),
            log_file: Some("/var/log/hub.log".to_string()),
            metrics_port: 9091,
            poll_interval_secs: 60,
            max_concurrent_jobs: 4,
        }
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = TempDir::new().unwrap();
        let config = AppConfig::resolve(&cli_with_db(&temp_dir), None).unwrap();

        assert_eq!(config.db_path, temp_dir.path().join("builds.db"));
        assert_eq!(config.log_file.as_deref(), Some("/var/log/hub.log"));
        assert_eq!(config.metrics_port, 9091);
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.max_concurrent_jobs, 4);
        assert!(config.snapshot_envs.is_empty());
        assert!(!config.uses_in_memory_db());
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = TempDir::new().unwrap();
        let file_config = FileConfig {
            metrics_port: Some(9200),
            poll_interval_secs: Some(5),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli_with_db(&temp_dir), Some(file_config)).unwrap();

        assert_eq!(config.metrics_port, 9200);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        // CLI value used when TOML doesn't specify
        assert_eq!(config.max_concurrent_jobs, 4);
    }

    #[test]
    fn test_resolve_missing_db_path_error() {
        let cli = CliConfig {
            poll_interval_secs: 60,
            max_concurrent_jobs: 1,
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_path must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_db_dir_error() {
        let cli = CliConfig {
            db_path: Some(PathBuf::from("/nonexistent/path/builds.db")),
            poll_interval_secs: 60,
            max_concurrent_jobs: 1,
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_in_memory_db() {
        let cli = CliConfig {
            db_path: Some(PathBuf::from(IN_MEMORY_DB)),
            poll_interval_secs: 60,
            max_concurrent_jobs: 1,
            ..Default::default()
        };
        assert!(AppConfig::resolve(&cli, None).unwrap().uses_in_memory_db());
    }

    #[test]
    fn test_resolve_zero_values_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut cli = cli_with_db(&temp_dir);
        cli.max_concurrent_jobs = 0;
        assert!(AppConfig::resolve(&cli, None).is_err());

        let mut cli = cli_with_db(&temp_dir);
        cli.poll_interval_secs = 0;
        assert!(AppConfig::resolve(&cli, None).is_err());
    }

    #[test]
    fn test_resolve_unknown_indexer_env() {
        let temp_dir = TempDir::new().unwrap();
        let file_config: FileConfig = toml::from_str(
            r#"
[snapshot.env.prod]
indexer = "missing"
cloud = { type = "fs", root = "/tmp" }
repository = { name = "repo", type = "fs" }
"#,
        )
        .unwrap();

        let err = AppConfig::resolve(&cli_with_db(&temp_dir), Some(file_config)).unwrap_err();
        assert!(err
            .to_string()
            .contains("unknown indexer environment 'missing'"));
    }
}
