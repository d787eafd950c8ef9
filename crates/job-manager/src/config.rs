//! Orchestrator configuration. This is usually read from a JSON file.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};

use crate::{
    job::{JobError, JobKind},
    progress::ProgressRule,
    spawn::TaskCommand,
    stage::{required_tools, Tool},
};

fn default_log_capacity() -> usize {
    500
}

fn default_tail_lines() -> usize {
    20
}

fn default_code_dir() -> PathBuf {
    PathBuf::from("final_results/Code")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Each job gets an output directory under this path.
    pub work_root: PathBuf,
    /// The number of log lines kept in memory for each job.
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    /// The maximum number of external tasks to run at once, across all jobs. Leave this as
    /// `None` to run every task as soon as its job is ready for it.
    #[serde(default)]
    pub max_concurrent_tasks: Option<usize>,
    /// The number of log lines to include in the error of a failed task.
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
    #[serde(default)]
    pub video: Option<KindConfig>,
    #[serde(default)]
    pub slides: Option<KindConfig>,
    #[serde(default)]
    pub document: Option<KindConfig>,
}

/// The tools and file locations for one kind of job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KindConfig {
    #[serde(default)]
    pub preprocess: Option<ToolCommand>,
    #[serde(default)]
    pub render_preview: Option<ToolCommand>,
    #[serde(default)]
    pub finalize: Option<ToolCommand>,
    #[serde(default)]
    pub package: Option<ToolCommand>,
    /// The deliverable, relative to the job's output directory. Document jobs produce an archive
    /// and ignore this.
    #[serde(default)]
    pub result: Option<PathBuf>,
    #[serde(default)]
    pub assets: AssetConfig,
}

impl KindConfig {
    pub fn tool(&self, tool: Tool) -> Option<&ToolCommand> {
        match tool {
            Tool::Preprocess => self.preprocess.as_ref(),
            Tool::RenderPreview => self.render_preview.as_ref(),
            Tool::Finalize => self.finalize.as_ref(),
            Tool::Package => self.package.as_ref(),
        }
    }

    pub fn with_tool(mut self, tool: Tool, command: ToolCommand) -> Self {
        let slot = match tool {
            Tool::Preprocess => &mut self.preprocess,
            Tool::RenderPreview => &mut self.render_preview,
            Tool::Finalize => &mut self.finalize,
            Tool::Package => &mut self.package,
        };
        *slot = Some(command);
        self
    }

    pub fn with_result(mut self, result: impl Into<PathBuf>) -> Self {
        self.result = Some(result.into());
        self
    }
}

/// Files copied into the tool's code directory after preprocessing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetConfig {
    /// Scene files (`*.py`) for the cover.
    #[serde(default)]
    pub cover_dir: Option<PathBuf>,
    #[serde(default)]
    pub logo: Option<PathBuf>,
    /// The directory that holds the preset backgrounds.
    #[serde(default)]
    pub backgrounds_dir: Option<PathBuf>,
    /// The destination, relative to the job's output directory.
    #[serde(default = "default_code_dir")]
    pub code_dir: PathBuf,
}

impl Default for AssetConfig {
    fn default() -> Self {
        AssetConfig {
            cover_dir: None,
            logo: None,
            backgrounds_dir: None,
            code_dir: default_code_dir(),
        }
    }
}

/// How to run an external tool.
///
/// `args`, `env` values and `work_dir` can contain these placeholders:
/// - `{input}`: the paper, or the folder of papers for a batch job
/// - `{output_dir}`: the job's output directory
/// - `{stage_dir}`: a directory under the output directory named after the stage
/// - `{job_config}`: the job configuration file, once it has been written
/// - `{images_dir}`: the images directory found for document packaging
/// - `{package_dir}`: the folder that the packaging tool should fill
/// - `{job_id}` and `{name}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Defaults to the job's output directory.
    #[serde(default)]
    pub work_dir: Option<String>,
    /// Kill the tool if it runs longer than this.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Replace the built-in progress rules for this tool's stage.
    #[serde(default)]
    pub progress_rules: Option<Vec<ProgressRule>>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        ToolCommand {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            work_dir: None,
            timeout_secs: None,
            progress_rules: None,
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Fill in placeholders and build the command to run.
    pub fn render(
        &self,
        vars: &[(&str, String)],
        default_work_dir: &Path,
        extra_env: impl IntoIterator<Item = (String, String)>,
    ) -> TaskCommand {
        let work_dir = self
            .work_dir
            .as_deref()
            .map(|dir| PathBuf::from(expand(dir, vars)))
            .unwrap_or_else(|| default_work_dir.to_path_buf());

        let mut env = extra_env.into_iter().collect::<Vec<_>>();
        env.extend(
            self.env
                .iter()
                .map(|(key, value)| (key.clone(), expand(value, vars))),
        );

        TaskCommand {
            program: expand(&self.program, vars),
            args: self.args.iter().map(|arg| expand(arg, vars)).collect(),
            work_dir,
            env,
        }
    }
}

/// Replace `{name}` placeholders. Unknown placeholders are left alone.
pub fn expand(template: &str, vars: &[(&str, String)]) -> String {
    if !template.contains('{') {
        return template.to_string();
    }

    vars.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{name}}}"), value)
    })
}

impl OrchestratorConfig {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        OrchestratorConfig {
            work_root: work_root.into(),
            log_capacity: default_log_capacity(),
            max_concurrent_tasks: None,
            tail_lines: default_tail_lines(),
            video: None,
            slides: None,
            document: None,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, Report<JobError>> {
        let file = std::fs::File::open(path)
            .change_context(JobError::InvalidConfig)
            .attach_printable_lazy(|| path.display().to_string())?;
        serde_json::from_reader(std::io::BufReader::new(file))
            .change_context(JobError::InvalidConfig)
            .attach_printable_lazy(|| path.display().to_string())
    }

    pub fn with_kind(mut self, kind: JobKind, config: KindConfig) -> Self {
        *self.kind_slot(kind) = Some(config);
        self
    }

    fn kind_slot(&mut self, kind: JobKind) -> &mut Option<KindConfig> {
        match kind {
            JobKind::Video => &mut self.video,
            JobKind::Slides => &mut self.slides,
            JobKind::Document => &mut self.document,
        }
    }

    /// The configuration for a kind of job. Fails if the kind has not been set up.
    pub fn kind(&self, kind: JobKind) -> Result<&KindConfig, Report<JobError>> {
        let config = match kind {
            JobKind::Video => self.video.as_ref(),
            JobKind::Slides => self.slides.as_ref(),
            JobKind::Document => self.document.as_ref(),
        };

        config.ok_or_else(|| {
            Report::new(JobError::InvalidConfig)
                .attach_printable(format!("No tools are configured for {kind} jobs"))
        })
    }

    /// Check that every configured kind can run all of its stages.
    pub fn validate(&self) -> Result<(), Report<JobError>> {
        let invalid = |msg: String| Err(Report::new(JobError::InvalidConfig).attach_printable(msg));

        if self.work_root.as_os_str().is_empty() {
            return invalid("work_root must be set".to_string());
        }

        if self.log_capacity == 0 {
            return invalid("log_capacity must be at least 1".to_string());
        }

        if self.max_concurrent_tasks == Some(0) {
            return invalid("max_concurrent_tasks must be at least 1".to_string());
        }

        let mut configured = 0;
        for kind in [JobKind::Video, JobKind::Slides, JobKind::Document] {
            let Ok(config) = self.kind(kind) else {
                continue;
            };
            configured += 1;

            for tool in required_tools(kind) {
                match config.tool(tool) {
                    None => {
                        return invalid(format!("{kind} jobs need a {tool} tool"));
                    }
                    Some(command) if command.program.trim().is_empty() => {
                        return invalid(format!("The {tool} tool for {kind} jobs has no program"));
                    }
                    Some(command) if command.timeout_secs == Some(0) => {
                        return invalid(format!("The {tool} tool for {kind} jobs has a zero timeout"));
                    }
                    _ => {}
                }
            }

            if kind != JobKind::Document && config.result.is_none() {
                return invalid(format!("{kind} jobs need a result location"));
            }
        }

        if configured == 0 {
            return invalid("No job kinds are configured".to_string());
        }

        Ok(())
    }
}
