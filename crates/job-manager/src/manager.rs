use std::{path::PathBuf, sync::Arc};

use error_stack::{Report, ResultExt};
use tracing::{event, instrument, Level};

use crate::{
    config::OrchestratorConfig,
    job::{Job, JobError, JobId, JobKind, JobStatus},
    options::JobOptions,
    registry::{JobWatcher, Registry},
    scheduler::TaskSlots,
    spawn::Spawner,
    stage::Stage,
    status::StatusReport,
    worker::{enter_stage, spawn_worker, WorkerContext},
};


/// The entry point for submitting and tracking jobs.
///
/// All methods return immediately. Work happens in a background worker for each job, and the
/// state of a job can be read at any time without waiting for its worker. The methods that start
/// a worker must be called from within a Tokio runtime.
pub struct Orchestrator<SPAWNER: Spawner> {
    context: Arc<WorkerContext<SPAWNER>>,
}

impl<SPAWNER: Spawner> Clone for Orchestrator<SPAWNER> {
    fn clone(&self) -> Self {
        Orchestrator {
            context: self.context.clone(),
        }
    }
}

impl<SPAWNER: Spawner> Orchestrator<SPAWNER> {
    /// Create an orchestrator. Fails if the configuration is not usable.
    pub fn new(
        config: OrchestratorConfig,
        spawner: Arc<SPAWNER>,
    ) -> Result<Self, Report<JobError>> {
        config.validate()?;

        let slots = TaskSlots::new(config.max_concurrent_tasks);
        Ok(Orchestrator {
            context: Arc::new(WorkerContext {
                registry: Arc::new(Registry::new()),
                spawner,
                config: Arc::new(config),
                slots,
            }),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.context.config
    }

    /// Submit a new job and start working on it.
    pub fn submit(&self, kind: JobKind, options: JobOptions) -> Result<JobId, Report<JobError>> {
        self.submit_with_id(JobId::new(), kind, options)
    }

    /// Submit a new job with an ID chosen by the caller.
    #[instrument(level = Level::DEBUG, skip(self, options))]
    pub fn submit_with_id(
        &self,
        id: JobId,
        kind: JobKind,
        options: JobOptions,
    ) -> Result<JobId, Report<JobError>> {
        self.context.config.kind(kind)?;
        options
            .validate(kind)
            .attach_printable_lazy(|| format!("Submitting {kind} job"))?;

        self.context.registry.create(
            id,
            kind,
            Arc::new(options),
            self.context.config.log_capacity,
        )?;

        event!(Level::INFO, %id, %kind, "Submitted job");
        spawn_worker(self.context.clone(), id);
        Ok(id)
    }

    /// Continue a job that is waiting for review.
    #[instrument(level = Level::DEBUG, skip(self))]
    pub fn resume(&self, id: JobId) -> Result<(), Report<JobError>> {
        self.context.registry.mutate(id, |job| {
            job.resume()?;
            enter_stage(job, Stage::Finalizing);
            Ok(())
        })?;

        event!(Level::INFO, %id, "Resumed job");
        spawn_worker(self.context.clone(), id);
        Ok(())
    }

    /// Return a snapshot of a job.
    pub fn status(&self, id: JobId) -> Result<Job, Report<JobError>> {
        self.context.registry.get(id)
    }

    /// Return the status of a job in the form sent to clients, with up to `recent_lines` lines
    /// of its log.
    pub fn status_report(
        &self,
        id: JobId,
        recent_lines: usize,
    ) -> Result<StatusReport, Report<JobError>> {
        let job = self.context.registry.get(id)?;
        Ok(StatusReport::new(&job, recent_lines))
    }

    /// Return the path of the job's deliverable.
    pub fn result_location(&self, id: JobId) -> Result<PathBuf, Report<JobError>> {
        let job = self.context.registry.get(id)?;
        match (job.status(), job.result_path()) {
            (JobStatus::Completed, Some(path)) => Ok(path.clone()),
            (status, _) => Err(Report::new(JobError::NotReady))
                .attach_printable_lazy(|| format!("Job {id} is {status:?}")),
        }
    }

    /// Watch a job for changes.
    pub fn watch(&self, id: JobId) -> Result<JobWatcher, Report<JobError>> {
        self.context.registry.watch(id)
    }

    /// Snapshots of all jobs, in submission order.
    pub fn list(&self) -> Vec<Job> {
        self.context.registry.list()
    }

    /// Forget a job that has completed or failed. Its files are left in place.
    pub fn remove(&self, id: JobId) -> Result<Job, Report<JobError>> {
        self.context.registry.remove(id)
    }
}
