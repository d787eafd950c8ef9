//! The worker that drives one job through its stages.

use std::{
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    sync::Arc,
};

use error_stack::{AttachmentKind, FrameKind, Report, ResultExt};
use futures::FutureExt;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{event, instrument, Instrument, Level};

use crate::{
    artifacts::{self, AuditLog},
    config::{KindConfig, OrchestratorConfig},
    job::{Job, JobError, JobId, JobKind},
    options::{JobOptions, ReviewPolicy, SourceMode},
    progress::{default_rules, ProgressEstimator},
    registry::Registry,
    run_task::{recent_log, run_task, TaskLimits},
    scheduler::TaskSlots,
    spawn::{Spawner, TaskError, TaskErrorKind, TaskId},
    stage::{self, Stage, StagePlan, Step, Tool},
};

/// State shared by the orchestrator and all of its workers.
pub(crate) struct WorkerContext<SPAWNER: Spawner> {
    pub registry: Arc<Registry>,
    pub spawner: Arc<SPAWNER>,
    pub config: Arc<OrchestratorConfig>,
    pub slots: TaskSlots,
}

/// Start a worker for a job. The worker runs until the job completes, fails, or reaches the
/// review checkpoint. A panic inside the worker fails the job instead of leaving it running
/// forever.
pub(crate) fn spawn_worker<SPAWNER: Spawner>(
    context: Arc<WorkerContext<SPAWNER>>,
    id: JobId,
) -> JoinHandle<()> {
    let span = tracing::info_span!("job_worker", %id);
    tokio::task::spawn(
        async move {
            let result = AssertUnwindSafe(run_worker(&context, id))
                .catch_unwind()
                .await;

            if let Err(panic) = result {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                event!(Level::ERROR, %id, %message, "Worker panicked");

                context
                    .registry
                    .mutate(id, |job| {
                        job.append_log(format!("Worker crashed: {message}"));
                        job.fail(TaskErrorKind::Crashed, format!("Worker crashed: {message}"))
                    })
                    .ok();
            }
        }
        .instrument(span),
    )
}

async fn run_worker<SPAWNER: Spawner>(context: &WorkerContext<SPAWNER>, id: JobId) {
    let mut audit = None;
    let result = drive(context, id, &mut audit).await;

    if let Err(e) = result {
        let kind = e.current_context().kind();
        let message = failure_message(&e);
        event!(Level::ERROR, %id, error = ?e, "Job failed");

        if let Some(audit) = &audit {
            audit.write(OffsetDateTime::now_utc(), &format!("Failed: {message}"));
        }

        let committed = context.registry.mutate(id, |job| {
            job.append_log(format!("Failed: {}", e.current_context()));
            job.fail(kind, message)
        });
        if let Err(commit_err) = committed {
            event!(Level::ERROR, %id, error = ?commit_err, "Could not record job failure");
        }
    }

    if let Some(audit) = audit {
        audit.finish().await;
    }
}

/// Build the job's error string from a failure report.
fn failure_message(report: &Report<TaskError>) -> String {
    let mut message = report.current_context().to_string();

    let mut details = report
        .frames()
        .filter_map(|frame| match frame.kind() {
            FrameKind::Attachment(AttachmentKind::Printable(p)) => Some(p.to_string()),
            _ => None,
        })
        .collect::<Vec<_>>();
    details.reverse();
    for detail in details {
        message.push_str("; ");
        message.push_str(&detail);
    }

    if let Some(log) = recent_log(report).filter(|log| !log.0.is_empty()) {
        message.push_str("\nLast output:\n");
        message.push_str(&log.to_string());
    }

    message
}

fn commit<T>(
    registry: &Registry,
    id: JobId,
    f: impl FnOnce(&mut Job) -> Result<T, Report<JobError>>,
) -> Result<T, Report<TaskError>> {
    registry
        .mutate(id, f)
        .change_context(TaskError::Lost)
        .attach_printable("The job rejected a state change")
}

#[instrument(level = Level::DEBUG, skip(context, audit))]
async fn drive<SPAWNER: Spawner>(
    context: &WorkerContext<SPAWNER>,
    id: JobId,
    audit: &mut Option<AuditLog>,
) -> Result<(), Report<TaskError>> {
    let registry = context.registry.as_ref();
    let job = registry.get(id).change_context(TaskError::Lost)?;
    let kind = job.kind();
    let options = job.options().clone();
    let kind_config = context
        .config
        .kind(kind)
        .change_context(TaskError::DidNotStart)?;
    let mut output_dir = job.output_dir().cloned();

    // The job is read only once. From here on the worker follows the stages that it commits
    // itself, since a job that reaches review belongs to whoever resumes it.
    let mut stage = job.stage();

    loop {
        match stage {
            Stage::Queued => {
                let dir = context
                    .config
                    .work_root
                    .join(format!("{}-{id}", options.display_name()));
                tokio::fs::create_dir_all(&dir)
                    .await
                    .change_context(TaskError::DidNotStart)
                    .attach_printable_lazy(|| dir.display().to_string())?;
                *audit = Some(AuditLog::open(&dir).await?);

                let next = Stage::Preprocessing;
                commit(registry, id, |job| {
                    job.set_output_dir(dir.clone())?;
                    job.advance_to(next)?;
                    enter_stage(job, next);
                    Ok(())
                })?;
                event!(Level::INFO, %id, output_dir = %dir.display(), "Job started");

                output_dir = Some(dir);
                stage = next;
            }

            Stage::WaitingForReview => match options.review {
                ReviewPolicy::Manual => return Ok(()),
                ReviewPolicy::AutoContinue => {
                    write_audit(audit.as_ref(), CONTINUING_LINE);
                    commit(registry, id, |job| {
                        job.append_log(CONTINUING_LINE);
                        job.resume()?;
                        enter_stage(job, Stage::Finalizing);
                        Ok(())
                    })?;
                    event!(Level::INFO, %id, "Skipping review");
                    stage = Stage::Finalizing;
                }
            },

            Stage::Completed | Stage::Failed => return Ok(()),

            Stage::Preprocessing
            | Stage::PreviewRendering
            | Stage::Finalizing
            | Stage::Packaging => {
                let plan = stage::plan(kind, stage)
                    .ok_or_else(|| Report::new(TaskError::Lost))
                    .attach_printable_lazy(|| format!("No plan for {kind} stage {stage}"))?;
                let output_dir = output_dir
                    .clone()
                    .ok_or_else(|| Report::new(TaskError::Lost))
                    .attach_printable("Job has no output directory")?;

                if audit.is_none() {
                    *audit = Some(AuditLog::open(&output_dir).await?);
                }

                let runner = StageRunner {
                    context,
                    id,
                    kind,
                    kind_config,
                    options: options.clone(),
                    output_dir,
                    plan,
                    audit: audit.as_ref(),
                };

                let result = runner
                    .run()
                    .await
                    .attach_printable_lazy(|| format!("Stage {stage}"))?;

                let next = stage.next(kind);
                match (next, result) {
                    (Some(Stage::Completed), Some(result)) => {
                        commit(registry, id, |job| job.complete(result.clone()))?;
                        record(
                            registry,
                            audit.as_ref(),
                            id,
                            &format!("Completed: {}", result.display()),
                        );
                        event!(Level::INFO, %id, result = %result.display(), "Job completed");
                        return Ok(());
                    }
                    (Some(Stage::Completed), None) => {
                        return Err(Report::new(TaskError::ResultMissing))
                            .attach_printable_lazy(|| format!("Stage {stage} produced no result"));
                    }
                    (Some(Stage::WaitingForReview), _) => {
                        stage = enter_review(registry, audit.as_ref(), id, options.review, plan)?;
                        if stage == Stage::WaitingForReview {
                            event!(Level::INFO, %id, "Waiting for review");
                            return Ok(());
                        }
                    }
                    (Some(next), _) => {
                        commit(registry, id, |job| {
                            job.record_progress(plan.progress_end, None);
                            job.advance_to(next)?;
                            enter_stage(job, next);
                            Ok(())
                        })?;
                        event!(Level::DEBUG, %id, %stage, %next, "Stage finished");
                        stage = next;
                    }
                    (None, _) => {
                        return Err(Report::new(TaskError::Lost))
                            .attach_printable_lazy(|| format!("Stage {stage} has no successor"));
                    }
                }
            }
        }
    }
}

const WAITING_LINE: &str = "Preview ready, waiting for review";
const CONTINUING_LINE: &str = "Preview ready, continuing without review";

/// Move a job whose preview just finished into review, and return the stage the job ends up in.
///
/// Under [ReviewPolicy::Manual] the job stops at [Stage::WaitingForReview] and the worker must not
/// touch it again, because a resume may already be running the next stage. Under
/// [ReviewPolicy::AutoContinue] the job passes through review and on to
/// [Stage::Finalizing] in the same change, so a resume never sees it waiting.
fn enter_review(
    registry: &Registry,
    audit: Option<&AuditLog>,
    id: JobId,
    review: ReviewPolicy,
    plan: &StagePlan,
) -> Result<Stage, Report<TaskError>> {
    let line = match review {
        ReviewPolicy::Manual => WAITING_LINE,
        ReviewPolicy::AutoContinue => CONTINUING_LINE,
    };
    write_audit(audit, line);

    commit(registry, id, |job| {
        job.record_progress(plan.progress_end, None);
        job.advance_to(Stage::WaitingForReview)?;
        enter_stage(job, Stage::WaitingForReview);
        job.append_log(line);

        if review == ReviewPolicy::AutoContinue {
            job.resume()?;
            enter_stage(job, Stage::Finalizing);
        }

        Ok(job.stage())
    })
}

/// Set the progress and label for a stage that the job just moved into.
pub(crate) fn enter_stage(job: &mut Job, stage: Stage) {
    match stage::plan(job.kind(), stage) {
        Some(plan) => {
            job.record_progress(plan.progress_start, Some(plan.label));
        }
        None if stage == Stage::WaitingForReview => job.set_step_label("Waiting for review"),
        None => {}
    }
}

/// Append a line to the job's log and its audit file.
fn record(registry: &Registry, audit: Option<&AuditLog>, id: JobId, line: &str) {
    write_audit(audit, line);
    registry.update(id, |job| job.append_log(line)).ok();
}

fn write_audit(audit: Option<&AuditLog>, line: &str) {
    if let Some(audit) = audit {
        audit.write(OffsetDateTime::now_utc(), line);
    }
}

/// Runs the steps of one stage.
struct StageRunner<'a, SPAWNER: Spawner> {
    context: &'a WorkerContext<SPAWNER>,
    id: JobId,
    kind: JobKind,
    kind_config: &'a KindConfig,
    options: Arc<JobOptions>,
    output_dir: PathBuf,
    plan: &'static StagePlan,
    audit: Option<&'a AuditLog>,
}

/// Values produced by earlier steps of a stage.
#[derive(Default)]
struct StageOutputs {
    images_dir: Option<PathBuf>,
    job_config: Option<PathBuf>,
    result: Option<PathBuf>,
    tasks_run: u16,
}

impl<'a, SPAWNER: Spawner> StageRunner<'a, SPAWNER> {
    /// Run the steps in order and return the job's result, if this stage produced it.
    #[instrument(level = Level::DEBUG, skip(self), fields(id = %self.id, stage = %self.plan.stage))]
    async fn run(&self) -> Result<Option<PathBuf>, Report<TaskError>> {
        let stage_dir = self.output_dir.join(self.plan.stage.as_str());
        tokio::fs::create_dir_all(&stage_dir)
            .await
            .change_context(TaskError::DidNotStart)
            .attach_printable_lazy(|| stage_dir.display().to_string())?;

        self.log(&format!("Starting {}: {}", self.plan.stage, self.plan.label));

        let mut outputs = StageOutputs::default();
        if self.plan.stage == Stage::Finalizing {
            let existing = self.output_dir.join(artifacts::JOB_CONFIG_FILE);
            outputs.job_config = existing.is_file().then_some(existing);
        }

        for step in self.plan.steps {
            event!(Level::DEBUG, ?step, "Running step");
            match step {
                Step::StageInputs => {
                    let input = artifacts::stage_inputs(&self.options, &self.output_dir).await?;
                    self.log(&format!(
                        "Prepared {} source file(s) at {}",
                        self.options.sources.len(),
                        input.display()
                    ));
                }
                Step::External(tool) => {
                    self.run_tool(*tool, &stage_dir, &mut outputs).await?;
                }
                Step::StageAssets => {
                    let assets = &self.kind_config.assets;
                    let lines =
                        artifacts::stage_assets(assets, &self.options.background, &self.output_dir)
                            .await;
                    for line in lines {
                        if line.starts_with("Warning") {
                            event!(Level::WARN, id = %self.id, %line, "Asset staging");
                        }
                        self.log(&line);
                    }
                }
                Step::WriteJobConfig => {
                    let path = artifacts::write_job_config(&self.options, &self.output_dir).await?;
                    self.log(&format!("Wrote job configuration to {}", path.display()));
                    outputs.job_config = Some(path);
                }
                Step::CollectResult => {
                    let result = self
                        .kind_config
                        .result
                        .as_deref()
                        .ok_or_else(|| Report::new(TaskError::ResultMissing))
                        .attach_printable("No result location is configured")?;
                    let path = artifacts::verify_result(&self.output_dir, result).await?;
                    outputs.result = Some(path);
                }
                Step::LocateImages => {
                    let dir = artifacts::locate_images_dir(&self.output_dir).await?;
                    self.log(&format!("Using images from {}", dir.display()));
                    outputs.images_dir = Some(dir);
                }
                Step::PackageArchive => {
                    let (package_dir, archive) = artifacts::document_paths(
                        &self.output_dir,
                        &self.options.display_name(),
                    );
                    let archive = artifacts::package_archive(&package_dir, &archive).await?;
                    self.log(&format!("Packaged {}", archive.display()));
                    outputs.result = Some(archive);
                }
            }
        }

        Ok(outputs.result)
    }

    async fn run_tool(
        &self,
        tool: Tool,
        stage_dir: &Path,
        outputs: &mut StageOutputs,
    ) -> Result<(), Report<TaskError>> {
        let stage = self.plan.stage;
        let tool_config = self
            .kind_config
            .tool(tool)
            .ok_or_else(|| Report::new(TaskError::DidNotStart))
            .attach_printable_lazy(|| format!("No {tool} tool is configured"))?;

        let input = input_path(&self.options, &self.output_dir);
        let (package_dir, _) =
            artifacts::document_paths(&self.output_dir, &self.options.display_name());
        let path_str = |p: &Path| p.display().to_string();
        let vars = [
            ("input", path_str(&input)),
            ("output_dir", path_str(&self.output_dir)),
            ("stage_dir", path_str(stage_dir)),
            (
                "job_config",
                outputs.job_config.as_deref().map(path_str).unwrap_or_default(),
            ),
            (
                "images_dir",
                outputs.images_dir.as_deref().map(path_str).unwrap_or_default(),
            ),
            ("package_dir", path_str(&package_dir)),
            ("job_id", self.id.to_string()),
            ("name", self.options.display_name()),
        ];

        let mut env = vec![
            (paperflow_worker::JOB_ID_VAR.to_string(), self.id.to_string()),
            (paperflow_worker::STAGE_VAR.to_string(), stage.to_string()),
            (
                paperflow_worker::OUTPUT_DIR_VAR.to_string(),
                path_str(&self.output_dir),
            ),
            (paperflow_worker::INPUT_VAR.to_string(), path_str(&input)),
            (
                paperflow_worker::VOICE_VAR.to_string(),
                self.options.voice.as_str().to_string(),
            ),
            (
                paperflow_worker::DURATION_VAR.to_string(),
                self.options.duration.as_str().to_string(),
            ),
            (
                paperflow_worker::BACKGROUND_VAR.to_string(),
                self.options.background.as_str().to_string(),
            ),
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
            ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
        ];
        if let Some(job_config) = &outputs.job_config {
            env.push((
                paperflow_worker::JOB_CONFIG_VAR.to_string(),
                path_str(job_config),
            ));
        }

        let command = tool_config.render(&vars, &self.output_dir, env);
        let estimator = ProgressEstimator::new(
            tool_config
                .progress_rules
                .clone()
                .unwrap_or_else(|| default_rules(self.kind, stage)),
            self.plan.progress_end.saturating_sub(1),
        );

        let task_id = TaskId {
            job: self.id,
            stage,
            index: outputs.tasks_run,
        };
        outputs.tasks_run += 1;

        self.log(&format!("Running {tool}: {command}"));
        let limits = TaskLimits {
            slots: &self.context.slots,
            timeout: tool_config.timeout_duration(),
            tail_lines: self.context.config.tail_lines,
        };

        run_task(
            self.context.spawner.as_ref(),
            limits,
            task_id,
            &command,
            |line| self.tool_line(line, &estimator),
        )
        .await
        .attach_printable_lazy(|| format!("Tool {tool}"))?;

        self.log(&format!("{tool} finished"));
        Ok(())
    }

    /// Record a line of tool output and apply any progress it indicates.
    fn tool_line(&self, line: &str, estimator: &ProgressEstimator) {
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }

        if let Some(audit) = self.audit {
            audit.write(OffsetDateTime::now_utc(), line);
        }

        self.context
            .registry
            .update(self.id, |job| {
                job.append_log(line);
                if let Some(hint) = estimator.estimate(line, job.progress()) {
                    job.record_progress(hint.progress, Some(hint.label));
                }
            })
            .ok();
    }

    fn log(&self, line: &str) {
        record(&self.context.registry, self.audit, self.id, line);
    }
}

/// The path passed to tools as their input.
fn input_path(options: &JobOptions, output_dir: &Path) -> PathBuf {
    match options.mode {
        SourceMode::Single => options.sources.first().cloned().unwrap_or_default(),
        SourceMode::Batch => output_dir.join(artifacts::SOURCES_DIR),
    }
}
