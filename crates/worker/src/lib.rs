//! Code shared between the paperflow orchestrator and the external tools that it runs.
//!
//! The orchestrator treats every tool as an opaque command. The only contract is the set of
//! environment variables it sets, the job configuration file that it writes before the
//! finalizing stage, and the `Step N: ...` lines that its progress estimator looks for.

#[cfg(feature = "worker-side")]
use std::{io::Write, path::Path};
use std::path::PathBuf;

use error_stack::{Report, ResultExt};
#[cfg(feature = "worker-side")]
use serde::Deserialize;
#[cfg(feature = "spawner-side")]
use serde::Serialize;
use thiserror::Error;

/// The ID of the job that the tool is running for.
pub const JOB_ID_VAR: &str = "PAPERFLOW_JOB_ID";
/// The stage that the tool is running in, e.g. `preprocessing`.
pub const STAGE_VAR: &str = "PAPERFLOW_STAGE";
/// The job's output directory.
pub const OUTPUT_DIR_VAR: &str = "PAPERFLOW_OUTPUT_DIR";
/// The input path: the paper itself for single jobs, or a folder of papers for batch jobs.
pub const INPUT_VAR: &str = "PAPERFLOW_INPUT";
/// Location of the [JobConfigFile], once it has been written.
pub const JOB_CONFIG_VAR: &str = "PAPERFLOW_JOB_CONFIG";
pub const VOICE_VAR: &str = "PAPERFLOW_VOICE";
pub const DURATION_VAR: &str = "PAPERFLOW_DURATION";
pub const BACKGROUND_VAR: &str = "PAPERFLOW_BACKGROUND";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("Missing environment variable {0}")]
    MissingEnv(&'static str),
    #[error("Failed to read job config")]
    ReadConfig,
    #[error("Failed to serialize job config")]
    WriteConfig,
}

/// Voice and narration settings handed to the finalizing tools. The orchestrator writes this
/// file right before the finalizing stage so that tools never need the original request.
#[cfg_attr(feature = "spawner-side", derive(Serialize))]
#[cfg_attr(feature = "worker-side", derive(Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfigFile {
    pub voice_type: String,
    /// Absolute path to an uploaded voice sample, for custom voices.
    pub custom_voice_path: Option<PathBuf>,
    /// Transcript of the custom voice sample.
    pub custom_voice_text: Option<String>,
    pub video_duration: String,
}

#[cfg(feature = "spawner-side")]
impl JobConfigFile {
    pub fn to_vec(&self) -> Result<Vec<u8>, Report<WorkerError>> {
        serde_json::to_vec_pretty(self).change_context(WorkerError::WriteConfig)
    }
}

#[cfg(feature = "worker-side")]
impl JobConfigFile {
    pub fn read(path: &Path) -> Result<Self, Report<WorkerError>> {
        let file = std::fs::File::open(path)
            .change_context(WorkerError::ReadConfig)
            .attach_printable_lazy(|| path.display().to_string())?;
        serde_json::from_reader(std::io::BufReader::new(file))
            .change_context(WorkerError::ReadConfig)
            .attach_printable_lazy(|| path.display().to_string())
    }
}

/// Format a progress line in the shape that the orchestrator's default progress rules match.
pub fn step_line(step: &str, label: &str) -> String {
    format!("Step {step}: {label}")
}

/// Information that the orchestrator passes to a tool through its environment.
#[cfg(feature = "worker-side")]
#[derive(Debug, Clone)]
pub struct TaskEnvironment {
    pub job_id: String,
    pub stage: String,
    pub output_dir: PathBuf,
    pub input: Option<PathBuf>,
    pub job_config: Option<PathBuf>,
}

#[cfg(feature = "worker-side")]
impl TaskEnvironment {
    pub fn from_env() -> Result<Self, Report<WorkerError>> {
        let required = |name: &'static str| {
            std::env::var(name).map_err(|_| Report::new(WorkerError::MissingEnv(name)))
        };

        Ok(TaskEnvironment {
            job_id: required(JOB_ID_VAR)?,
            stage: required(STAGE_VAR)?,
            output_dir: PathBuf::from(required(OUTPUT_DIR_VAR)?),
            input: std::env::var_os(INPUT_VAR).map(PathBuf::from),
            job_config: std::env::var_os(JOB_CONFIG_VAR).map(PathBuf::from),
        })
    }

    /// Read the job configuration file, if the orchestrator has written one for this stage.
    pub fn read_job_config(&self) -> Result<Option<JobConfigFile>, Report<WorkerError>> {
        self.job_config
            .as_deref()
            .map(JobConfigFile::read)
            .transpose()
    }

    /// Print a progress line and flush it immediately, so that the orchestrator sees it while
    /// the tool is still running.
    pub fn report_step(&self, step: &str, label: &str) {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", step_line(step, label)).ok();
        stdout.flush().ok();

        #[cfg(feature = "tracing")]
        tracing::event!(tracing::Level::DEBUG, job_id = %self.job_id, %step, %label, "reported step");
    }
}

#[cfg(all(test, feature = "spawner-side", feature = "worker-side"))]
mod tests {
    use super::*;

    #[test]
    fn job_config_file_is_read_back() {
        let dir = tempfile::TempDir::new().expect("Creating temp dir");
        let path = dir.path().join("job_config.json");
        let config = JobConfigFile {
            voice_type: "custom".to_string(),
            custom_voice_path: Some(PathBuf::from("/data/voice.wav")),
            custom_voice_text: Some("hello there".to_string()),
            video_duration: "short".to_string(),
        };

        std::fs::write(&path, config.to_vec().expect("serializing")).expect("writing config");

        let read = JobConfigFile::read(&path).expect("reading config");
        assert_eq!(read, config);
    }

    #[test]
    fn missing_job_config() {
        let err = JobConfigFile::read(Path::new("/definitely/not/here.json"))
            .expect_err("reading a missing file");
        assert_eq!(err.current_context(), &WorkerError::ReadConfig);
    }

    #[test]
    fn step_line_format() {
        assert_eq!(step_line("6", "speech synthesis"), "Step 6: speech synthesis");
    }
}
