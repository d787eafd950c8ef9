//! Orchestrates jobs that turn papers into videos, slide decks and documents by running a
//! sequence of external tools, with a human review checkpoint in the middle of the video and
//! slide pipelines.

pub mod artifacts;
pub mod config;
pub mod job;
pub mod manager;
pub mod options;
pub mod progress;
pub mod registry;
mod run_task;
pub mod scheduler;
pub mod spawn;
pub mod stage;
pub mod status;
#[cfg(test)]
mod test_util;
mod worker;

pub use config::{AssetConfig, KindConfig, OrchestratorConfig, ToolCommand};
pub use job::{Job, JobError, JobId, JobKind, JobStatus, LogEntry};
pub use manager::Orchestrator;
pub use options::{Background, JobOptions, ReviewPolicy, SourceMode, VideoDuration, Voice};
pub use progress::{Matcher, ProgressEstimator, ProgressRule};
pub use registry::{JobWatcher, Registry};
pub use run_task::recent_log;
pub use spawn::{
    RecentLog, SpawnedTask, Spawner, TaskCommand, TaskError, TaskErrorKind, TaskId,
};
pub use stage::{Stage, Tool};
pub use status::StatusReport;
