use super::stage::{transition, Stage, StageEvent};
use super::variants::{JobTarget, StepVariant};
use super::RegistrarError;
use crate::build_store::{
    is_revision_conflict, BuildFilter, BuildStore, JobRecord, JobStatus, StoreError,
};
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Attempts at persisting a finished job before a revision conflict surfaces.
const MAX_FINISH_ATTEMPTS: usize = 3;

/// Human readable duration: `1h2m3.45s`, seconds rounded to two decimals.
pub fn format_elapsed(elapsed: Duration) -> String {
    let centis = (elapsed.as_secs_f64() * 100.0).round() as u64;
    let hours = centis / 360_000;
    let minutes = (centis % 360_000) / 6_000;
    let seconds = (centis % 6_000) as f64 / 100.0;

    let mut formatted = String::new();
    if hours > 0 {
        formatted.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        formatted.push_str(&format!("{}m", minutes));
    }
    formatted.push_str(&format!("{}s", seconds));
    formatted
}

fn store_error(err: anyhow::Error) -> RegistrarError {
    match err.downcast_ref::<StoreError>() {
        Some(StoreError::BuildNotFound(id)) => RegistrarError::BuildNotFound(id.clone()),
        _ => RegistrarError::Store(err),
    }
}

/// Logs a single attempt of one step into a build document.
///
/// Single use: `started()` once, then exactly one of `succeed()` / `failed()`.
pub struct JobRegistrar {
    store: Arc<dyn BuildStore>,
    variant: &'static StepVariant,
    target: JobTarget,
    stage: Stage,
    started_at: Option<Instant>,
    position: Option<usize>,
}

impl JobRegistrar {
    pub fn new(store: Arc<dyn BuildStore>, variant: &'static StepVariant, target: JobTarget) -> Self {
        Self {
            store,
            variant,
            target,
            stage: Stage::Ready,
            started_at: None,
            position: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn variant(&self) -> &'static StepVariant {
        self.variant
    }

    pub fn target(&self) -> &JobTarget {
        &self.target
    }

    /// Append an "in progress" job record to the build.
    pub fn started(&mut self) -> Result<(), RegistrarError> {
        self.stage = transition(self.stage, StageEvent::Start)?;
        self.started_at = Some(Instant::now());

        let job = JobRecord::in_progress(self.variant.label, self.target.logfile.clone());
        let position = self
            .store
            .push_job(&self.target.build_id, &job)
            .map_err(store_error)?;
        self.position = Some(position);

        debug!(
            "Job #{} '{}' started on build '{}' ({})",
            position, self.variant.label, self.target.build_id, self.target.name
        );
        Ok(())
    }

    /// Mark the job successful and merge what the variant derives from `result`.
    pub fn succeed(&mut self, result: JsonValue) -> Result<(), RegistrarError> {
        let delta = (self.variant.result_hook)(&self.target, result);
        self.finish(JobStatus::Success, None, delta)
    }

    /// Mark the job failed. Nothing else in the build document is touched.
    pub fn failed(&mut self, error: impl std::fmt::Display) -> Result<(), RegistrarError> {
        self.finish(JobStatus::Failed, Some(error.to_string()), Map::new())
    }

    fn finish(
        &mut self,
        status: JobStatus,
        err: Option<String>,
        delta: Map<String, JsonValue>,
    ) -> Result<(), RegistrarError> {
        self.stage = transition(self.stage, StageEvent::Finish)?;
        let elapsed = self.started_at.map(|t| t.elapsed()).unwrap_or_default();
        let build_id = self.target.build_id.clone();

        let mut attempt = 1;
        loop {
            let mut build = self
                .store
                .find_one(&build_id)?
                .ok_or_else(|| RegistrarError::BuildNotFound(build_id.clone()))?;

            let position = self
                .position
                .or_else(|| build.jobs.len().checked_sub(1))
                .unwrap_or_default();
            let job = build
                .jobs
                .get_mut(position)
                .ok_or_else(|| RegistrarError::JobMissing {
                    build_id: build_id.clone(),
                    position,
                })?;
            job.status = status;
            job.time = Some(format_elapsed(elapsed));
            job.time_in_s = Some(elapsed.as_secs_f64().round() as u64);
            job.pid = None;
            if let Some(err) = &err {
                job.err = Some(err.clone());
            }
            build.apply_delta(delta.clone())?;

            match self.store.replace(&build) {
                Ok(_) => break,
                Err(e) if is_revision_conflict(&e) && attempt < MAX_FINISH_ATTEMPTS => {
                    warn!(
                        "Build '{}' changed while finishing job '{}' (attempt {}/{}), retrying",
                        build_id, self.variant.label, attempt, MAX_FINISH_ATTEMPTS
                    );
                    attempt += 1;
                }
                Err(e) => return Err(store_error(e)),
            }
        }

        debug!(
            "Job '{}' on build '{}' finished: {} in {}",
            self.variant.label,
            build_id,
            status,
            format_elapsed(elapsed)
        );
        Ok(())
    }

    /// Mark every "in progress" job of every build as cancelled.
    ///
    /// Meant to run at startup, before any registrar of this process started:
    /// whatever is still in progress then was left behind by a crash.
    /// Returns the number of jobs cancelled.
    pub fn prune(store: &dyn BuildStore) -> anyhow::Result<usize> {
        let stale = store.find(&BuildFilter::JobStatus(JobStatus::InProgress))?;
        let mut cancelled = 0;

        for build in stale {
            let mut attempt = 1;
            let mut build = build;
            loop {
                let mut count = 0;
                for (num, job) in build.jobs.iter_mut().enumerate() {
                    if job.status != JobStatus::InProgress {
                        continue;
                    }
                    warn!(
                        "Found stale job #{} '{}' in build '{}', marking as cancelled",
                        num, job.step, build.id
                    );
                    job.status = JobStatus::Cancelled;
                    job.pid = None;
                    count += 1;
                }
                if count == 0 {
                    break;
                }

                match store.replace(&build) {
                    Ok(_) => {
                        cancelled += count;
                        break;
                    }
                    Err(e) if is_revision_conflict(&e) && attempt < MAX_FINISH_ATTEMPTS => {
                        attempt += 1;
                        match store.find_one(&build.id)? {
                            Some(fresh) => build = fresh,
                            None => break,
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if cancelled > 0 {
            info!("Cancelled {} stale jobs", cancelled);
        }
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_store::{BuildDocument, MemoryBuildStore};
    use crate::job_registrar::variants::{
        IndexerInfo, MAIN_INDEX, MAIN_SNAPSHOT, POST_INDEX, PRE_SNAPSHOT,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn create_test_store(ids: &[&str]) -> Arc<MemoryBuildStore> {
        Arc::new(MemoryBuildStore::with_documents(
            ids.iter().map(|id| BuildDocument::new(*id)),
        ))
    }

    fn registrar(
        store: &Arc<MemoryBuildStore>,
        variant: &'static StepVariant,
        name: &str,
    ) -> JobRegistrar {
        let target = JobTarget::new("b1", name)
            .with_logfile(Some("/tmp/hub.log".to_string()))
            .with_indexer(IndexerInfo {
                host: Some("http://localhost:9200".to_string()),
                environment: "local".to_string(),
            });
        JobRegistrar::new(store.clone(), variant, target)
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_millis(120)), "0.12s");
        assert_eq!(format_elapsed(Duration::from_secs(3)), "3s");
        assert_eq!(format_elapsed(Duration::from_millis(63_500)), "1m3.5s");
        assert_eq!(format_elapsed(Duration::from_secs(3600 + 120 + 5)), "1h2m5s");
        // rounding carries into the minutes
        assert_eq!(format_elapsed(Duration::from_millis(59_996)), "1m0s");
        assert_eq!(format_elapsed(Duration::from_millis(119_996)), "2m0s");
        assert_eq!(format_elapsed(Duration::from_millis(3_599_999)), "1h0s");
    }

    #[test]
    fn test_started_appends_in_progress_job() {
        let store = create_test_store(&["b1"]);
        let mut reg = registrar(&store, &PRE_SNAPSHOT, "snap_1");

        reg.started().unwrap();

        assert_eq!(reg.stage(), Stage::Started);
        let doc = store.find_one("b1").unwrap().unwrap();
        assert_eq!(doc.jobs.len(), 1);
        let job = &doc.jobs[0];
        assert_eq!(job.step, "pre");
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.pid, Some(std::process::id()));
        assert_eq!(job.logfile.as_deref(), Some("/tmp/hub.log"));
        assert!(job.time.is_none());
    }

    #[test]
    fn test_succeed_finalizes_and_merges_snapshot() {
        let store = create_test_store(&["b1"]);
        let mut reg = registrar(&store, &MAIN_SNAPSHOT, "snap_1");

        reg.started().unwrap();
        reg.succeed(json!({"replaced": false})).unwrap();

        assert_eq!(reg.stage(), Stage::Done);
        let doc = store.find_one("b1").unwrap().unwrap();
        let job = &doc.jobs[0];
        assert_eq!(job.status, JobStatus::Success);
        assert!(job.pid.is_none());
        assert!(job.time.is_some());
        assert_eq!(job.time_in_s, Some(0));
        assert!(job.err.is_none());
        assert_eq!(doc.snapshot["snap_1"], json!({"replaced": false}));
    }

    #[test]
    fn test_failed_records_error_only() {
        let store = create_test_store(&["b1"]);
        let mut reg = registrar(&store, &MAIN_INDEX, "news_2024");

        reg.started().unwrap();
        reg.failed("boom").unwrap();

        let doc = store.find_one("b1").unwrap().unwrap();
        let job = &doc.jobs[0];
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.err.as_deref(), Some("boom"));
        assert!(job.pid.is_none());
        assert!(doc.index.is_empty());
    }

    #[test]
    fn test_main_index_replaces_previous_metadata() {
        let mut doc = BuildDocument::new("b1");
        doc.index.insert(
            "news_2024".to_string(),
            json!({"stale_field": 1, "count": 1}),
        );
        let store = Arc::new(MemoryBuildStore::with_documents([doc]));
        let mut reg = registrar(&store, &MAIN_INDEX, "news_2024");

        reg.started().unwrap();
        reg.succeed(json!({"count": 42})).unwrap();

        let doc = store.find_one("b1").unwrap().unwrap();
        let meta = &doc.index["news_2024"];
        assert_eq!(meta["count"], 42);
        assert_eq!(meta["environment"], "local");
        assert!(meta.get("stale_field").is_none());
        assert!(meta.get("__REPLACE__").is_none());
    }

    #[test]
    fn test_post_index_without_ready_marker_leaves_index_alone() {
        let store = create_test_store(&["b1"]);
        let mut reg = registrar(&store, &POST_INDEX, "news_2024");

        reg.started().unwrap();
        reg.succeed(json!({"aliases": ["news"]})).unwrap();

        let doc = store.find_one("b1").unwrap().unwrap();
        assert_eq!(doc.jobs[0].status, JobStatus::Success);
        assert!(doc.index.is_empty());
    }

    #[test]
    fn test_invalid_stage_orderings() {
        let store = create_test_store(&["b1"]);

        let mut reg = registrar(&store, &MAIN_SNAPSHOT, "snap_1");
        assert!(matches!(
            reg.succeed(json!({})),
            Err(RegistrarError::InvalidStage { .. })
        ));

        let mut reg = registrar(&store, &MAIN_SNAPSHOT, "snap_1");
        reg.started().unwrap();
        assert!(matches!(
            reg.started(),
            Err(RegistrarError::InvalidStage { .. })
        ));
        reg.succeed(json!({})).unwrap();
        assert!(matches!(
            reg.failed("late"),
            Err(RegistrarError::InvalidStage { .. })
        ));
    }

    #[test]
    fn test_missing_build() {
        let store = create_test_store(&[]);
        let mut reg = registrar(&store, &MAIN_SNAPSHOT, "snap_1");

        match reg.started() {
            Err(RegistrarError::BuildNotFound(id)) => assert_eq!(id, "b1"),
            other => panic!("expected BuildNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_build_deleted_before_finish() {
        let store = create_test_store(&["b1"]);
        let mut reg = registrar(&store, &MAIN_SNAPSHOT, "snap_1");
        reg.started().unwrap();

        let replacement: Arc<dyn BuildStore> = Arc::new(MemoryBuildStore::new());
        reg.store = replacement;

        assert!(matches!(
            reg.succeed(json!({})),
            Err(RegistrarError::BuildNotFound(_))
        ));
    }

    /// Bumps the stored revision right before the first `n` replaces.
    struct ContendedStore {
        inner: MemoryBuildStore,
        conflicts: AtomicUsize,
    }

    impl BuildStore for ContendedStore {
        fn find_one(&self, id: &str) -> anyhow::Result<Option<BuildDocument>> {
            self.inner.find_one(id)
        }
        fn find(&self, filter: &BuildFilter) -> anyhow::Result<Vec<BuildDocument>> {
            self.inner.find(filter)
        }
        fn insert(&self, doc: &BuildDocument) -> anyhow::Result<()> {
            self.inner.insert(doc)
        }
        fn push_job(&self, id: &str, job: &JobRecord) -> anyhow::Result<usize> {
            self.inner.push_job(id, job)
        }
        fn replace(&self, doc: &BuildDocument) -> anyhow::Result<u64> {
            if self.conflicts.load(Ordering::SeqCst) > 0 {
                self.conflicts.fetch_sub(1, Ordering::SeqCst);
                self.inner.add_pending(&doc.id, "concurrent")?;
            }
            self.inner.replace(doc)
        }
        fn add_pending(&self, id: &str, tag: &str) -> anyhow::Result<()> {
            self.inner.add_pending(id, tag)
        }
        fn remove_pending(&self, id: &str, tag: &str) -> anyhow::Result<()> {
            self.inner.remove_pending(id, tag)
        }
    }

    fn contended(conflicts: usize) -> Arc<ContendedStore> {
        Arc::new(ContendedStore {
            inner: MemoryBuildStore::with_documents([BuildDocument::new("b1")]),
            conflicts: AtomicUsize::new(conflicts),
        })
    }

    #[test]
    fn test_finish_retries_on_revision_conflict() {
        let store = contended(2);
        let mut reg = JobRegistrar::new(store.clone(), &MAIN_SNAPSHOT, JobTarget::new("b1", "s"));

        reg.started().unwrap();
        reg.succeed(json!({"replaced": true})).unwrap();

        let doc = store.find_one("b1").unwrap().unwrap();
        assert_eq!(doc.jobs[0].status, JobStatus::Success);
        assert!(doc.has_pending("concurrent"));
        assert_eq!(doc.snapshot["s"]["replaced"], true);
    }

    #[test]
    fn test_finish_gives_up_after_max_attempts() {
        let store = contended(MAX_FINISH_ATTEMPTS);
        let mut reg = JobRegistrar::new(store.clone(), &MAIN_SNAPSHOT, JobTarget::new("b1", "s"));

        reg.started().unwrap();
        match reg.succeed(json!({})) {
            Err(RegistrarError::Store(e)) => assert!(is_revision_conflict(&e)),
            other => panic!("expected revision conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_prune_cancels_stale_jobs() {
        let store = create_test_store(&["b1", "b2", "b3"]);
        store
            .push_job("b1", &JobRecord::in_progress("snapshot", None))
            .unwrap();
        store
            .push_job("b1", &JobRecord::in_progress("post", None))
            .unwrap();
        let mut done = JobRecord::in_progress("index", None);
        done.status = JobStatus::Success;
        done.pid = None;
        store.push_job("b2", &done).unwrap();
        let b2_revision = store.find_one("b2").unwrap().unwrap().revision;

        let cancelled = JobRegistrar::prune(store.as_ref()).unwrap();

        assert_eq!(cancelled, 2);
        let b1 = store.find_one("b1").unwrap().unwrap();
        assert!(b1
            .jobs
            .iter()
            .all(|j| j.status == JobStatus::Cancelled && j.pid.is_none()));
        let b2 = store.find_one("b2").unwrap().unwrap();
        assert_eq!(b2.revision, b2_revision);
        assert_eq!(b2.jobs[0].status, JobStatus::Success);
        assert!(store
            .find(&BuildFilter::JobStatus(JobStatus::InProgress))
            .unwrap()
            .is_empty());

        assert_eq!(JobRegistrar::prune(store.as_ref()).unwrap(), 0);
    }
}
