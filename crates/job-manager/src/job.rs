use std::{collections::VecDeque, fmt::Display, path::PathBuf, str::FromStr, sync::Arc};

use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{options::JobOptions, spawn::TaskErrorKind, stage::Stage};

/// Errors returned by the orchestrator's public operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Job not found")]
    NotFound,
    #[error("A job with this ID already exists")]
    DuplicateId,
    #[error("Job is not waiting for review")]
    InvalidStageForResume,
    #[error("Job has not completed")]
    NotReady,
    #[error("Invalid job configuration")]
    InvalidConfig,
    #[error("Invalid stage transition")]
    InvalidTransition,
    #[error("Job is still active")]
    StillActive,
}

/// The unique ID of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        JobId(value)
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = Report<JobError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(JobId)
            .change_context(JobError::NotFound)
            .attach_printable_lazy(|| format!("Malformed job ID {s}"))
    }
}

/// The kind of deliverable a job produces. This selects the stage sequence and the tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Video,
    Document,
    Slides,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Video => "video",
            JobKind::Document => "document",
            JobKind::Slides => "slides",
        }
    }
}

impl Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = Report<JobError>;

    /// Parse a kind name. The older `markdown` and `ppt` names are accepted as aliases.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(JobKind::Video),
            "document" | "markdown" => Ok(JobKind::Document),
            "slides" | "ppt" => Ok(JobKind::Slides),
            _ => Err(Report::new(JobError::InvalidConfig))
                .attach_printable_lazy(|| format!("Unknown job kind {s}")),
        }
    }
}

/// The coarse lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    WaitingForReview,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: OffsetDateTime,
    pub line: String,
}

/// A job in the system. Values of this type handed out by the registry are snapshots, and
/// changing them has no effect on the stored job.
#[derive(Debug, Clone)]
pub struct Job {
    id: JobId,
    kind: JobKind,
    options: Arc<JobOptions>,
    stage: Stage,
    status: JobStatus,
    progress: u8,
    current_step_label: String,
    log: VecDeque<LogEntry>,
    log_capacity: usize,
    total_log_lines: u64,
    output_dir: Option<PathBuf>,
    result_path: Option<PathBuf>,
    error: Option<String>,
    error_kind: Option<TaskErrorKind>,
    failed_stage: Option<Stage>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        kind: JobKind,
        options: Arc<JobOptions>,
        log_capacity: usize,
    ) -> Job {
        let now = OffsetDateTime::now_utc();
        Job {
            id,
            kind,
            options,
            stage: Stage::Queued,
            status: JobStatus::Queued,
            progress: 0,
            current_step_label: "Queued".to_string(),
            log: VecDeque::with_capacity(log_capacity.min(64)),
            log_capacity: log_capacity.max(1),
            total_log_lines: 0,
            output_dir: None,
            result_path: None,
            error: None,
            error_kind: None,
            failed_stage: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn options(&self) -> &Arc<JobOptions> {
        &self.options
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn current_step_label(&self) -> &str {
        &self.current_step_label
    }

    /// The most recent log lines, oldest first.
    pub fn log(&self) -> impl Iterator<Item = &LogEntry> {
        self.log.iter()
    }

    /// The last `n` log lines, oldest first.
    pub fn recent_log(&self, n: usize) -> impl Iterator<Item = &LogEntry> {
        self.log.iter().skip(self.log.len().saturating_sub(n))
    }

    /// The number of log lines ever appended, including ones that have been dropped from the
    /// in-memory log.
    pub fn total_log_lines(&self) -> u64 {
        self.total_log_lines
    }

    pub fn output_dir(&self) -> Option<&PathBuf> {
        self.output_dir.as_ref()
    }

    pub fn result_path(&self) -> Option<&PathBuf> {
        self.result_path.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn error_kind(&self) -> Option<TaskErrorKind> {
        self.error_kind
    }

    /// The stage that was running when the job failed.
    pub fn failed_stage(&self) -> Option<Stage> {
        self.failed_stage
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn updated_at(&self) -> OffsetDateTime {
        self.updated_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = OffsetDateTime::now_utc();
    }

    /// Move to the next stage in this job's sequence. Anything other than the immediate
    /// successor of the current stage is rejected.
    pub fn advance_to(&mut self, next: Stage) -> Result<(), Report<JobError>> {
        let expected = Stage::sequence(self.kind)
            .iter()
            .skip_while(|s| **s != self.stage)
            .nth(1)
            .copied();

        if expected != Some(next) || next == Stage::Completed {
            return Err(Report::new(JobError::InvalidTransition)).attach_printable_lazy(|| {
                format!("{} job cannot move from {} to {next}", self.kind, self.stage)
            });
        }

        self.stage = next;
        self.status = next.status();
        Ok(())
    }

    /// Leave the review checkpoint. This is the only way out of [Stage::WaitingForReview].
    pub fn resume(&mut self) -> Result<(), Report<JobError>> {
        if self.stage != Stage::WaitingForReview {
            return Err(Report::new(JobError::InvalidStageForResume))
                .attach_printable_lazy(|| format!("Job is in stage {}", self.stage));
        }

        self.advance_to(Stage::Finalizing)
    }

    /// Set the output directory. It can only be assigned once.
    pub fn set_output_dir(&mut self, dir: PathBuf) -> Result<(), Report<JobError>> {
        match &self.output_dir {
            Some(existing) if existing != &dir => Err(Report::new(JobError::InvalidTransition))
                .attach_printable_lazy(|| {
                    format!("Output directory is already {}", existing.display())
                }),
            _ => {
                self.output_dir = Some(dir);
                Ok(())
            }
        }
    }

    /// Raise the progress value. Returns false if `progress` would not increase it.
    pub fn record_progress(&mut self, progress: u8, label: Option<&str>) -> bool {
        let progress = progress.min(100);
        if let Some(label) = label {
            self.set_step_label(label);
        }

        if progress <= self.progress {
            return false;
        }

        self.progress = progress;
        true
    }

    pub fn set_step_label(&mut self, label: &str) {
        if self.current_step_label != label {
            self.current_step_label = label.to_string();
        }
    }

    pub fn append_log(&mut self, line: impl Into<String>) {
        if self.log.len() >= self.log_capacity {
            self.log.pop_front();
        }

        self.log.push_back(LogEntry {
            timestamp: OffsetDateTime::now_utc(),
            line: line.into(),
        });
        self.total_log_lines += 1;
    }

    /// Mark the job as completed. This must directly follow the final work stage.
    pub fn complete(&mut self, result_path: PathBuf) -> Result<(), Report<JobError>> {
        let last_work_stage = Stage::sequence(self.kind)
            .iter()
            .rev()
            .nth(1)
            .copied();
        if Some(self.stage) != last_work_stage {
            return Err(Report::new(JobError::InvalidTransition)).attach_printable_lazy(|| {
                format!("{} job cannot complete from {}", self.kind, self.stage)
            });
        }

        if result_path.as_os_str().is_empty() {
            return Err(Report::new(JobError::InvalidTransition))
                .attach_printable("Completed jobs require a result path");
        }

        self.stage = Stage::Completed;
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.current_step_label = "Completed".to_string();
        self.result_path = Some(result_path);
        Ok(())
    }

    /// Mark the job as failed. Progress stays where it was.
    pub fn fail(
        &mut self,
        kind: TaskErrorKind,
        message: impl Into<String>,
    ) -> Result<(), Report<JobError>> {
        if self.is_terminal() {
            return Err(Report::new(JobError::InvalidTransition))
                .attach_printable_lazy(|| format!("Job already finished as {}", self.stage));
        }

        let mut message = message.into();
        if message.trim().is_empty() {
            message = format!("{kind} during {}", self.stage);
        }

        self.failed_stage = Some(self.stage);
        self.stage = Stage::Failed;
        self.status = JobStatus::Failed;
        self.current_step_label = format!("Failed during {}", self.failed_stage.unwrap_or(Stage::Queued));
        self.error = Some(message);
        self.error_kind = Some(kind);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{JobOptions, SourceMode};

    fn new_job(kind: JobKind) -> Job {
        let options = JobOptions::single("paper.pdf");
        assert_eq!(options.mode, SourceMode::Single);
        Job::new(JobId::new(), kind, Arc::new(options), 3)
    }

    #[test]
    fn follows_video_sequence() {
        let mut job = new_job(JobKind::Video);
        job.advance_to(Stage::Preprocessing).unwrap();
        job.advance_to(Stage::PreviewRendering).unwrap();
        job.advance_to(Stage::WaitingForReview).unwrap();
        assert_eq!(job.status(), JobStatus::WaitingForReview);
        job.resume().unwrap();
        assert_eq!(job.stage(), Stage::Finalizing);
        assert_eq!(job.status(), JobStatus::Running);
        job.complete(PathBuf::from("out/Full.mp4")).unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.progress(), 100);
    }

    #[test]
    fn rejects_skipped_stage() {
        let mut job = new_job(JobKind::Video);
        job.advance_to(Stage::Preprocessing).unwrap();
        let err = job
            .advance_to(Stage::Finalizing)
            .expect_err("skipping the review checkpoint");
        assert_eq!(err.current_context(), &JobError::InvalidTransition);
        assert_eq!(job.stage(), Stage::Preprocessing);
    }

    #[test]
    fn document_has_no_review_stage() {
        let mut job = new_job(JobKind::Document);
        job.advance_to(Stage::Preprocessing).unwrap();
        assert!(job.advance_to(Stage::PreviewRendering).is_err());
        job.advance_to(Stage::Packaging).unwrap();
        job.complete(PathBuf::from("doc.zip")).unwrap();
        assert_eq!(job.stage(), Stage::Completed);
    }

    #[test]
    fn complete_requires_last_stage() {
        let mut job = new_job(JobKind::Slides);
        job.advance_to(Stage::Preprocessing).unwrap();
        assert!(job.complete(PathBuf::from("deck.pptx")).is_err());
        assert_eq!(job.result_path(), None);
    }

    #[test]
    fn resume_outside_review() {
        let mut job = new_job(JobKind::Video);
        let err = job.resume().expect_err("resume from queued");
        assert_eq!(err.current_context(), &JobError::InvalidStageForResume);
        assert_eq!(job.stage(), Stage::Queued);
    }

    #[test]
    fn progress_never_decreases() {
        let mut job = new_job(JobKind::Video);
        assert!(job.record_progress(40, Some("Step 2")));
        assert!(!job.record_progress(20, None));
        assert_eq!(job.progress(), 40);
        assert_eq!(job.current_step_label(), "Step 2");
    }

    #[test]
    fn log_is_bounded() {
        let mut job = new_job(JobKind::Video);
        for i in 0..5 {
            job.append_log(format!("line {i}"));
        }

        let lines = job.log().map(|e| e.line.as_str()).collect::<Vec<_>>();
        assert_eq!(lines, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(job.total_log_lines(), 5);
        let recent = job.recent_log(2).map(|e| e.line.as_str()).collect::<Vec<_>>();
        assert_eq!(recent, vec!["line 3", "line 4"]);
    }

    #[test]
    fn fail_is_terminal() {
        let mut job = new_job(JobKind::Video);
        job.advance_to(Stage::Preprocessing).unwrap();
        job.record_progress(30, None);
        job.fail(TaskErrorKind::ExternalTaskFailed, "exited with code 1")
            .unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.failed_stage(), Some(Stage::Preprocessing));
        assert_eq!(job.progress(), 30);
        assert_eq!(job.error(), Some("exited with code 1"));
        assert!(job.fail(TaskErrorKind::Crashed, "again").is_err());
        assert!(job.advance_to(Stage::PreviewRendering).is_err());
    }

    #[test]
    fn output_dir_is_stable() {
        let mut job = new_job(JobKind::Video);
        job.set_output_dir(PathBuf::from("/work/a")).unwrap();
        job.set_output_dir(PathBuf::from("/work/a")).unwrap();
        assert!(job.set_output_dir(PathBuf::from("/work/b")).is_err());
    }

    #[test]
    fn kind_aliases() {
        assert_eq!("ppt".parse::<JobKind>().unwrap(), JobKind::Slides);
        assert_eq!("markdown".parse::<JobKind>().unwrap(), JobKind::Document);
        let err = "podcast".parse::<JobKind>().expect_err("unknown kind");
        assert_eq!(err.current_context(), &JobError::InvalidConfig);
    }
}
