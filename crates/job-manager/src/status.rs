use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    job::{Job, JobId, JobKind, JobStatus},
    spawn::TaskErrorKind,
    stage::Stage,
};

/// The number of log lines included in a status report by default.
pub const RECENT_LOG_LINES: usize = 20;

/// The status of a job, in the form returned to polling clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub stage: Stage,
    pub progress: u8,
    pub current_step_label: String,
    pub recent_log: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<TaskErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl StatusReport {
    pub fn new(job: &Job, recent_lines: usize) -> Self {
        StatusReport {
            id: job.id(),
            kind: job.kind(),
            status: job.status(),
            stage: job.stage(),
            progress: job.progress(),
            current_step_label: job.current_step_label().to_string(),
            recent_log: job
                .recent_log(recent_lines)
                .map(|entry| entry.line.clone())
                .collect(),
            output_dir: job.output_dir().cloned(),
            result_path: job.result_path().cloned(),
            error: job.error().map(String::from),
            error_kind: job.error_kind(),
            failed_stage: job.failed_stage(),
            created_at: job.created_at(),
            updated_at: job.updated_at(),
        }
    }
}

impl From<&Job> for StatusReport {
    fn from(job: &Job) -> Self {
        StatusReport::new(job, RECENT_LOG_LINES)
    }
}
