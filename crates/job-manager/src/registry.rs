//! The in-memory store of jobs.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use ahash::{HashMap, HashMapExt};
use error_stack::{Report, ResultExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{event, Level};

use crate::{
    job::{Job, JobError, JobId, JobKind},
    options::JobOptions,
};

struct JobEntry {
    /// Submission order.
    seq: u64,
    job: Mutex<Job>,
    /// Incremented after every committed change.
    changed: watch::Sender<u64>,
}

impl JobEntry {
    fn notify(&self) {
        self.changed.send_modify(|version| *version += 1);
    }
}

/// Jobs keyed by ID. The map lock is only held long enough to find a job's entry, and each job
/// has its own lock, so a busy job never blocks reads of other jobs.
#[derive(Default)]
pub struct Registry {
    jobs: RwLock<HashMap<JobId, Arc<JobEntry>>>,
    next_seq: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            jobs: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    fn entry(&self, id: JobId) -> Result<Arc<JobEntry>, Report<JobError>> {
        self.jobs
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Report::new(JobError::NotFound).attach_printable(format!("Job {id}")))
    }

    /// Insert a new job in the `Queued` stage.
    pub fn create(
        &self,
        id: JobId,
        kind: JobKind,
        options: Arc<JobOptions>,
        log_capacity: usize,
    ) -> Result<Job, Report<JobError>> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&id) {
            return Err(Report::new(JobError::DuplicateId).attach_printable(format!("Job {id}")));
        }

        let job = Job::new(id, kind, options, log_capacity);
        let (changed, _) = watch::channel(0);
        jobs.insert(
            id,
            Arc::new(JobEntry {
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                job: Mutex::new(job.clone()),
                changed,
            }),
        );

        event!(Level::DEBUG, %id, %kind, "Created job");
        Ok(job)
    }

    /// Return a snapshot of a job.
    pub fn get(&self, id: JobId) -> Result<Job, Report<JobError>> {
        let entry = self.entry(id)?;
        let job = entry.job.lock().clone();
        Ok(job)
    }

    /// Apply a transition to a job. The function works on a copy of the job, and the copy
    /// replaces the stored job only if the function succeeds, so a failed transition has no
    /// effect.
    pub fn mutate<T>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut Job) -> Result<T, Report<JobError>>,
    ) -> Result<T, Report<JobError>> {
        let entry = self.entry(id)?;
        let result = {
            let mut job = entry.job.lock();
            let mut draft = job.clone();
            let result = f(&mut draft)?;
            draft.touch();
            *job = draft;
            result
        };

        entry.notify();
        Ok(result)
    }

    /// Apply an infallible change in place. This avoids copying the job for the frequent log and
    /// progress updates.
    pub fn update<T>(&self, id: JobId, f: impl FnOnce(&mut Job) -> T) -> Result<T, Report<JobError>> {
        let entry = self.entry(id)?;
        let result = {
            let mut job = entry.job.lock();
            let result = f(&mut job);
            job.touch();
            result
        };

        entry.notify();
        Ok(result)
    }

    /// Watch a job for changes.
    pub fn watch(&self, id: JobId) -> Result<JobWatcher, Report<JobError>> {
        let entry = self.entry(id)?;
        let rx = entry.changed.subscribe();
        Ok(JobWatcher { entry, rx })
    }

    /// Snapshots of all jobs, in submission order.
    pub fn list(&self) -> Vec<Job> {
        let mut entries = self.jobs.read().values().cloned().collect::<Vec<_>>();
        entries.sort_by_key(|entry| entry.seq);
        entries
            .iter()
            .map(|entry| entry.job.lock().clone())
            .collect()
    }

    /// Remove a job that has finished.
    pub fn remove(&self, id: JobId) -> Result<Job, Report<JobError>> {
        let mut jobs = self.jobs.write();
        let entry = jobs
            .get(&id)
            .ok_or_else(|| Report::new(JobError::NotFound).attach_printable(format!("Job {id}")))?;

        let job = entry.job.lock().clone();
        if !job.is_terminal() {
            return Err(Report::new(JobError::StillActive))
                .attach_printable(format!("Job {id} is {}", job.stage()));
        }

        jobs.remove(&id);
        event!(Level::DEBUG, %id, "Removed job");
        Ok(job)
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

/// Wait for changes to a single job.
pub struct JobWatcher {
    entry: Arc<JobEntry>,
    rx: watch::Receiver<u64>,
}

impl JobWatcher {
    pub fn current(&self) -> Job {
        self.entry.job.lock().clone()
    }

    /// Wait for the next committed change and return the job as of that change.
    pub async fn changed(&mut self) -> Job {
        // The sender lives in the entry that we hold, so this can not fail.
        self.rx.changed().await.ok();
        self.current()
    }

    /// Wait until the job satisfies `predicate`.
    pub async fn wait_for(&mut self, mut predicate: impl FnMut(&Job) -> bool) -> Job {
        loop {
            self.rx.borrow_and_update();
            let job = self.current();
            if predicate(&job) {
                return job;
            }

            self.rx.changed().await.ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::stage::Stage;

    fn options() -> Arc<JobOptions> {
        Arc::new(JobOptions::single("paper.pdf"))
    }

    #[test]
    fn create_and_get() {
        let registry = Registry::new();
        let id = JobId::new();
        registry
            .create(id, JobKind::Video, options(), 10)
            .expect("creating job");

        let job = registry.get(id).expect("getting job");
        assert_eq!(job.id(), id);
        assert_eq!(job.stage(), Stage::Queued);

        let err = registry
            .create(id, JobKind::Video, options(), 10)
            .expect_err("duplicate ID");
        assert_eq!(err.current_context(), &JobError::DuplicateId);
    }

    #[test]
    fn unknown_job() {
        let registry = Registry::new();
        let err = registry.get(JobId::new()).expect_err("unknown job");
        assert_eq!(err.current_context(), &JobError::NotFound);

        let err = registry
            .mutate(JobId::new(), |_| Ok(()))
            .expect_err("unknown job");
        assert_eq!(err.current_context(), &JobError::NotFound);
    }

    #[test]
    fn failed_mutation_changes_nothing() {
        let registry = Registry::new();
        let id = JobId::new();
        registry.create(id, JobKind::Video, options(), 10).unwrap();

        let err = registry
            .mutate(id, |job| {
                job.record_progress(50, Some("halfway"));
                job.append_log("partial write");
                job.resume()
            })
            .expect_err("resume from queued");
        assert_eq!(err.current_context(), &JobError::InvalidStageForResume);

        let job = registry.get(id).unwrap();
        assert_eq!(job.progress(), 0);
        assert_eq!(job.log().count(), 0);
        assert_eq!(job.stage(), Stage::Queued);
    }

    #[test]
    fn snapshot_is_detached() {
        let registry = Registry::new();
        let id = JobId::new();
        registry.create(id, JobKind::Document, options(), 10).unwrap();

        let mut snapshot = registry.get(id).unwrap();
        snapshot.record_progress(99, None);
        assert_eq!(registry.get(id).unwrap().progress(), 0);
    }

    #[test]
    fn remove_only_finished_jobs() {
        let registry = Registry::new();
        let id = JobId::new();
        registry.create(id, JobKind::Document, options(), 10).unwrap();

        let err = registry.remove(id).expect_err("removing queued job");
        assert_eq!(err.current_context(), &JobError::StillActive);

        registry
            .mutate(id, |job| {
                job.fail(crate::spawn::TaskErrorKind::ExternalTaskFailed, "boom")
            })
            .unwrap();
        registry.remove(id).expect("removing failed job");
        assert!(registry.is_empty());
        assert_eq!(
            registry.remove(id).unwrap_err().current_context(),
            &JobError::NotFound
        );
    }

    #[test]
    fn list_in_creation_order() {
        let registry = Registry::new();
        let ids = (0..5).map(|_| JobId::new()).collect::<Vec<_>>();
        for id in &ids {
            registry.create(*id, JobKind::Slides, options(), 10).unwrap();
        }

        let listed = registry.list().iter().map(|j| j.id()).collect::<Vec<_>>();
        assert_eq!(listed, ids);
    }

    #[tokio::test]
    async fn watch_sees_changes() {
        let registry = Arc::new(Registry::new());
        let id = JobId::new();
        registry.create(id, JobKind::Video, options(), 10).unwrap();

        let mut watcher = registry.watch(id).unwrap();
        let writer = registry.clone();
        tokio::spawn(async move {
            for p in [10, 20, 30] {
                tokio::time::sleep(Duration::from_millis(5)).await;
                writer.update(id, |job| job.record_progress(p, None)).unwrap();
            }
        });

        let job = tokio::time::timeout(
            Duration::from_secs(5),
            watcher.wait_for(|job| job.progress() >= 30),
        )
        .await
        .expect("progress reached 30");
        assert_eq!(job.progress(), 30);
    }
}
