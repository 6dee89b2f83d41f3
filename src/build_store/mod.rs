//! Persistent build records.
//!
//! A build document accumulates the job log of every pipeline run against a
//! build. The store is key-addressed by build id and supports an atomic job
//! append plus a full-document replace guarded by the document revision.

mod memory_build_store;
mod models;
mod schema;
mod sqlite_build_store;

pub use memory_build_store::MemoryBuildStore;
pub use models::*;
pub use schema::BUILD_STORE_VERSIONED_SCHEMAS;
pub use sqlite_build_store::SqliteBuildStore;

use anyhow::Result;
use thiserror::Error;

/// Errors raised by store implementations.
///
/// They travel inside `anyhow::Error`; callers that care downcast.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Build document '{0}' not found")]
    BuildNotFound(String),

    #[error("Build document '{id}' was modified concurrently (expected revision {expected}, found {found})")]
    RevisionConflict {
        id: String,
        expected: u64,
        found: u64,
    },

    #[error("Build document '{0}' already exists")]
    AlreadyExists(String),
}

pub trait BuildStore: Send + Sync {
    fn find_one(&self, id: &str) -> Result<Option<BuildDocument>>;
    fn find(&self, filter: &BuildFilter) -> Result<Vec<BuildDocument>>;

    /// Insert a new build document. Fails if the id is taken.
    fn insert(&self, doc: &BuildDocument) -> Result<()>;

    /// Atomically append a job to the build's job log.
    /// Returns the position of the appended job.
    fn push_job(&self, id: &str, job: &JobRecord) -> Result<usize>;

    /// Replace the whole document.
    ///
    /// `doc.revision` must match the stored revision, otherwise
    /// `StoreError::RevisionConflict` is returned. On success the stored
    /// revision is incremented and returned.
    fn replace(&self, doc: &BuildDocument) -> Result<u64>;

    /// Add a tag to the build's `pending` set. No-op if already present.
    fn add_pending(&self, id: &str, tag: &str) -> Result<()>;

    /// Remove a tag from the build's `pending` set.
    fn remove_pending(&self, id: &str, tag: &str) -> Result<()>;
}

/// Whether `err` is a revision conflict reported by a store.
pub fn is_revision_conflict(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::RevisionConflict { .. })
    )
}
