use super::models::{BuildDocument, BuildFilter, JobRecord};
use super::{BuildStore, StoreError};
use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Build store kept in process memory.
///
/// Used by tests and by `--db-path :memory:` dry runs. Every operation holds
/// the lock for its full duration, so appends and revision checks are atomic.
#[derive(Default)]
pub struct MemoryBuildStore {
    docs: Mutex<BTreeMap<String, BuildDocument>>,
}

impl MemoryBuildStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents(docs: impl IntoIterator<Item = BuildDocument>) -> Self {
        let store = Self::new();
        {
            let mut map = store.docs.lock().unwrap();
            for doc in docs {
                map.insert(doc.id.clone(), doc);
            }
        }
        store
    }

    fn with_doc<T>(&self, id: &str, f: impl FnOnce(&mut BuildDocument) -> T) -> Result<T> {
        let mut docs = self.docs.lock().unwrap();
        let doc = docs
            .get_mut(id)
            .ok_or_else(|| StoreError::BuildNotFound(id.to_string()))?;
        Ok(f(doc))
    }
}

impl BuildStore for MemoryBuildStore {
    fn find_one(&self, id: &str) -> Result<Option<BuildDocument>> {
        Ok(self.docs.lock().unwrap().get(id).cloned())
    }

    fn find(&self, filter: &BuildFilter) -> Result<Vec<BuildDocument>> {
        Ok(self
            .docs
            .lock()
            .unwrap()
            .values()
            .filter(|doc| filter.matches(doc))
            .cloned()
            .collect())
    }

    fn insert(&self, doc: &BuildDocument) -> Result<()> {
        let mut docs = self.docs.lock().unwrap();
        if docs.contains_key(&doc.id) {
            return Err(StoreError::AlreadyExists(doc.id.clone()).into());
        }
        docs.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    fn push_job(&self, id: &str, job: &JobRecord) -> Result<usize> {
        self.with_doc(id, |doc| {
            doc.jobs.push(job.clone());
            doc.revision += 1;
            doc.jobs.len() - 1
        })
    }

    fn replace(&self, doc: &BuildDocument) -> Result<u64> {
        let mut docs = self.docs.lock().unwrap();
        let stored = docs
            .get_mut(&doc.id)
            .ok_or_else(|| StoreError::BuildNotFound(doc.id.clone()))?;
        if stored.revision != doc.revision {
            return Err(StoreError::RevisionConflict {
                id: doc.id.clone(),
                expected: doc.revision,
                found: stored.revision,
            }
            .into());
        }
        let mut updated = doc.clone();
        updated.revision += 1;
        let revision = updated.revision;
        *stored = updated;
        Ok(revision)
    }

    fn add_pending(&self, id: &str, tag: &str) -> Result<()> {
        self.with_doc(id, |doc| {
            if !doc.has_pending(tag) {
                doc.pending.push(tag.to_string());
                doc.revision += 1;
            }
        })
    }

    fn remove_pending(&self, id: &str, tag: &str) -> Result<()> {
        self.with_doc(id, |doc| {
            let before = doc.pending.len();
            doc.pending.retain(|p| p != tag);
            if doc.pending.len() != before {
                doc.revision += 1;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_store::is_revision_conflict;

    #[test]
    fn test_push_job_returns_position() {
        let store = MemoryBuildStore::with_documents([BuildDocument::new("b1")]);

        let first = store
            .push_job("b1", &JobRecord::in_progress("pre", None))
            .unwrap();
        let second = store
            .push_job("b1", &JobRecord::in_progress("snapshot", None))
            .unwrap();

        assert_eq!(first, 0);
        assert_eq!(second, 1);
        let doc = store.find_one("b1").unwrap().unwrap();
        assert_eq!(doc.jobs.len(), 2);
        assert_eq!(doc.revision, 2);
    }

    #[test]
    fn test_push_job_missing_build() {
        let store = MemoryBuildStore::new();
        let err = store
            .push_job("nope", &JobRecord::in_progress("pre", None))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<StoreError>(),
            Some(&StoreError::BuildNotFound("nope".to_string()))
        );
    }

    #[test]
    fn test_replace_detects_stale_revision() {
        let store = MemoryBuildStore::with_documents([BuildDocument::new("b1")]);
        let loaded = store.find_one("b1").unwrap().unwrap();

        // Someone else writes in between.
        store.add_pending("b1", "snapshot").unwrap();

        let err = store.replace(&loaded).unwrap_err();
        assert!(is_revision_conflict(&err));

        let fresh = store.find_one("b1").unwrap().unwrap();
        assert_eq!(store.replace(&fresh).unwrap(), fresh.revision + 1);
    }

    #[test]
    fn test_pending_set_semantics() {
        let store = MemoryBuildStore::with_documents([BuildDocument::new("b1")]);
        store.add_pending("b1", "snapshot").unwrap();
        store.add_pending("b1", "snapshot").unwrap();

        let doc = store.find_one("b1").unwrap().unwrap();
        assert_eq!(doc.pending, vec!["snapshot".to_string()]);

        store.remove_pending("b1", "snapshot").unwrap();
        let doc = store.find_one("b1").unwrap().unwrap();
        assert!(doc.pending.is_empty());
    }

    #[test]
    fn test_insert_rejects_duplicates() {
        let store = MemoryBuildStore::new();
        store.insert(&BuildDocument::new("b1")).unwrap();
        assert!(store.insert(&BuildDocument::new("b1")).is_err());
    }
}
