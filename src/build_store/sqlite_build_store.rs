use super::models::{BuildDocument, BuildFilter, JobRecord};
use super::schema::BUILD_STORE_VERSIONED_SCHEMAS;
use super::{BuildStore, StoreError};
use crate::sqlite_persistence::open_versioned;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub struct SqliteBuildStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBuildStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let is_new_db = !path.exists();

        let mut conn = Connection::open(path).context("Failed to open build database")?;
        if is_new_db {
            info!("Creating new build database at {:?}", path);
        }
        open_versioned(&mut conn, BUILD_STORE_VERSIONED_SCHEMAS, is_new_db, "build")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, mostly for tests.
    pub fn in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        open_versioned(&mut conn, BUILD_STORE_VERSIONED_SCHEMAS, true, "build")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_document(row: &rusqlite::Row) -> rusqlite::Result<(i64, String)> {
        Ok((row.get("revision")?, row.get("document")?))
    }

    fn decode((revision, raw): (i64, String)) -> Result<BuildDocument> {
        let mut doc: BuildDocument =
            serde_json::from_str(&raw).context("Corrupted build document")?;
        doc.revision = revision as u64;
        Ok(doc)
    }

    fn load_for_update(tx: &Transaction, id: &str) -> Result<BuildDocument> {
        let row = tx
            .query_row(
                "SELECT revision, document FROM builds WHERE id = ?1",
                params![id],
                Self::row_to_document,
            )
            .optional()?
            .ok_or_else(|| StoreError::BuildNotFound(id.to_string()))?;
        Self::decode(row)
    }

    /// Write `doc` back with its revision bumped. Caller holds the transaction.
    fn write_bumped(tx: &Transaction, mut doc: BuildDocument) -> Result<u64> {
        doc.revision += 1;
        tx.execute(
            "UPDATE builds SET revision = ?1, document = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                doc.revision as i64,
                serde_json::to_string(&doc)?,
                Utc::now().to_rfc3339(),
                doc.id
            ],
        )?;
        Ok(doc.revision)
    }

    fn modify(&self, id: &str, f: impl FnOnce(&mut BuildDocument) -> bool) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut doc = Self::load_for_update(&tx, id)?;
        if f(&mut doc) {
            Self::write_bumped(&tx, doc)?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl BuildStore for SqliteBuildStore {
    fn find_one(&self, id: &str) -> Result<Option<BuildDocument>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT revision, document FROM builds WHERE id = ?1",
                params![id],
                Self::row_to_document,
            )
            .optional()?;
        row.map(Self::decode).transpose()
    }

    fn find(&self, filter: &BuildFilter) -> Result<Vec<BuildDocument>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT revision, document FROM builds ORDER BY id")?;
        let rows = stmt
            .query_map(params![], Self::row_to_document)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut docs = Vec::new();
        for row in rows {
            // one unreadable document must not hide the others
            let doc = match Self::decode(row) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!("Skipping undecodable build document: {:#}", e);
                    continue;
                }
            };
            if filter.matches(&doc) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    fn insert(&self, doc: &BuildDocument) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let exists = conn
            .query_row("SELECT 1 FROM builds WHERE id = ?1", params![doc.id], |_| {
                Ok(())
            })
            .optional()?
            .is_some();
        if exists {
            return Err(StoreError::AlreadyExists(doc.id.clone()).into());
        }

        conn.execute(
            "INSERT INTO builds (id, revision, document, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                doc.id,
                doc.revision as i64,
                serde_json::to_string(doc)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn push_job(&self, id: &str, job: &JobRecord) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut doc = Self::load_for_update(&tx, id)?;
        doc.jobs.push(job.clone());
        let position = doc.jobs.len() - 1;
        Self::write_bumped(&tx, doc)?;
        tx.commit()?;
        Ok(position)
    }

    fn replace(&self, doc: &BuildDocument) -> Result<u64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let stored = Self::load_for_update(&tx, &doc.id)?;
        if stored.revision != doc.revision {
            return Err(StoreError::RevisionConflict {
                id: doc.id.clone(),
                expected: doc.revision,
                found: stored.revision,
            }
            .into());
        }
        let revision = Self::write_bumped(&tx, doc.clone())?;
        tx.commit()?;
        Ok(revision)
    }

    fn add_pending(&self, id: &str, tag: &str) -> Result<()> {
        self.modify(id, |doc| {
            if doc.has_pending(tag) {
                return false;
            }
            doc.pending.push(tag.to_string());
            true
        })
    }

    fn remove_pending(&self, id: &str, tag: &str) -> Result<()> {
        self.modify(id, |doc| {
            let before = doc.pending.len();
            doc.pending.retain(|p| p != tag);
            doc.pending.len() != before
        })
    }
}
