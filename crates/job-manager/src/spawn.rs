#[cfg(any(test, feature = "inprocess"))]
pub mod fail_wrapper;
#[cfg(any(test, feature = "inprocess"))]
pub mod inprocess;

use std::{fmt::Display, path::PathBuf, time::Duration};

use error_stack::Report;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{job::JobId, stage::Stage};

/// A fully resolved external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCommand {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl TaskCommand {
    /// Look up an environment variable that will be set for the command.
    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

impl Display for TaskCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Identifies one external task run by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub job: JobId,
    pub stage: Stage,
    /// The position of the task within its stage.
    pub index: u16,
}

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{:02}", self.job, self.stage, self.index)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Failed to start")]
    DidNotStart,
    #[error("Task exited with code {0}")]
    ExternalTaskFailed(i32),
    #[error("Task timed out after {0:?}")]
    Timeout(Duration),
    #[error("Task was lost by runtime")]
    Lost,
    #[error("Post-processing failed")]
    PostProcessing,
    #[error("Result file is missing")]
    ResultMissing,
    #[error("Worker crashed")]
    Crashed,
}

impl TaskError {
    pub fn kind(&self) -> TaskErrorKind {
        match self {
            TaskError::DidNotStart => TaskErrorKind::DidNotStart,
            TaskError::ExternalTaskFailed(_) => TaskErrorKind::ExternalTaskFailed,
            TaskError::Timeout(_) => TaskErrorKind::Timeout,
            TaskError::Lost => TaskErrorKind::Lost,
            TaskError::PostProcessing => TaskErrorKind::PostProcessing,
            TaskError::ResultMissing => TaskErrorKind::ResultMissing,
            TaskError::Crashed => TaskErrorKind::Crashed,
        }
    }
}

/// The kind of error that failed a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    DidNotStart,
    ExternalTaskFailed,
    Timeout,
    Lost,
    PostProcessing,
    ResultMissing,
    Crashed,
}

impl Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let desc = match self {
            TaskErrorKind::DidNotStart => "task did not start",
            TaskErrorKind::ExternalTaskFailed => "task failed",
            TaskErrorKind::Timeout => "task timed out",
            TaskErrorKind::Lost => "task was lost",
            TaskErrorKind::PostProcessing => "post-processing failed",
            TaskErrorKind::ResultMissing => "result missing",
            TaskErrorKind::Crashed => "worker crashed",
        };
        f.write_str(desc)
    }
}

/// The last lines of output from a task that failed, attached to its error report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentLog(pub Vec<String>);

impl Display for RecentLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, line) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            f.write_str(line)?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
pub trait Spawner: Send + Sync + 'static {
    type SpawnedTask: SpawnedTask;

    /// Start running a command.
    async fn spawn(
        &self,
        task_id: TaskId,
        command: &TaskCommand,
    ) -> Result<Self::SpawnedTask, Report<TaskError>>;
}

#[async_trait::async_trait]
pub trait SpawnedTask: Send {
    /// The internal ID of the spawned task in the runtime.
    async fn runtime_id(&self) -> Result<String, TaskError>;
    /// Return the next line of output, with stdout and stderr merged. Returns `None` once the
    /// task has closed its output.
    async fn next_line(&mut self) -> Option<String>;
    /// Wait for the task to exit and return its exit code. Call this after [SpawnedTask::next_line]
    /// returns `None`, so that no output is lost.
    async fn wait(&mut self) -> Result<i32, Report<TaskError>>;
    /// Attempt to kill a task before it finishes.
    async fn kill(&mut self) -> Result<(), Report<TaskError>>;
}
