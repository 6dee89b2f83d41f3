//! Snapshot Hub Library
//!
//! Build bookkeeping and search-index snapshot pipelines, exposed for the
//! binary and for integration tests.

pub mod build_store;
pub mod config;
pub mod document;
pub mod job_registrar;
pub mod metrics;
pub mod search_engine;
pub mod server;
pub mod snapshot;
pub mod sqlite_persistence;
pub mod storage;
pub mod worker;

// Re-export commonly used types for convenience
pub use build_store::{BuildDocument, BuildStore, MemoryBuildStore, SqliteBuildStore};
pub use config::AppConfig;
pub use job_registrar::PipelineDispatcher;
pub use snapshot::SnapshotManager;
pub use worker::WorkerPool;
