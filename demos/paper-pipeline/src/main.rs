//! A sample application that turns papers into a video, slide deck or document with the paperflow
//! orchestrator.
//!
//! The orchestrator and the pipeline tools are the same executable running in different modes.
//! The tools only simulate the real work, which makes the example easy to run anywhere. Pass
//! `--config` to use a configuration file that points at real tools instead.

use std::{
    io::{BufRead, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Parser, ValueEnum};
use error_stack::{Context, Report};
use eyre::eyre;
use paperflow_job_manager::{
    Job, JobKind, JobOptions, KindConfig, Orchestrator, OrchestratorConfig, ReviewPolicy, Stage,
    ToolCommand, Tool, VideoDuration, Voice,
};
use paperflow_local_jobs::LocalSpawner;
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

mod tools;

#[derive(Debug, Parser)]
pub struct Cli {
    /// Run as one of the pipeline tools instead of the orchestrator.
    #[clap(long, hide = true)]
    mode: Option<tools::ToolMode>,
    /// Where the finalize tool writes the deliverable, relative to the output directory.
    #[clap(long, hide = true)]
    result: Option<PathBuf>,
    /// The images directory given to the package tool.
    #[clap(long, hide = true)]
    images: Option<PathBuf>,
    /// The folder that the package tool fills.
    #[clap(long, hide = true)]
    package_dir: Option<PathBuf>,

    /// The kind of deliverable to produce: video, slides or document.
    #[clap(long, default_value = "video", value_parser = parse_kind)]
    kind: JobKind,
    /// Papers to process. Passing more than one runs the job in batch mode.
    papers: Vec<PathBuf>,
    /// A name for the output folder.
    #[clap(long)]
    name: Option<String>,
    #[clap(long, value_enum, default_value_t = VoiceArg::Female)]
    voice: VoiceArg,
    #[clap(long, value_enum, default_value_t = DurationArg::Medium)]
    duration: DurationArg,
    /// Continue past the preview without asking.
    #[clap(long)]
    auto_continue: bool,
    /// Job output directories are created here.
    #[clap(long, default_value = "paperflow-output")]
    work_root: PathBuf,
    /// Read the orchestrator configuration from this JSON file.
    #[clap(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum VoiceArg {
    Female,
    Male,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DurationArg {
    Short,
    Medium,
    Long,
}

fn parse_kind(s: &str) -> Result<JobKind, String> {
    s.parse()
        .map_err(|_| format!("{s} is not one of video, slides or document"))
}

fn report<C: Context>(e: Report<C>) -> eyre::Report {
    eyre!("{e:?}")
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let args = Cli::parse();

    if let Some(mode) = args.mode {
        return tools::run(mode, &args).await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    run_orchestrator(args).await
}

/// A configuration that runs this executable's simulated tools.
fn simulated_config(work_root: &Path) -> eyre::Result<OrchestratorConfig> {
    let exe = std::env::current_exe()?.display().to_string();
    let tool = |mode: &str| ToolCommand::new(&exe).args(["--mode", mode]);
    let reviewed = |result: &str| {
        KindConfig::default()
            .with_tool(Tool::Preprocess, tool("preprocess"))
            .with_tool(Tool::RenderPreview, tool("render-preview"))
            .with_tool(
                Tool::Finalize,
                tool("finalize").args(["--mode", "finalize", "--result", result]),
            )
            .with_result(result)
    };

    Ok(OrchestratorConfig::new(work_root)
        .with_kind(JobKind::Video, reviewed("final_results/Video_with_voice/Full.mp4"))
        .with_kind(JobKind::Slides, reviewed("final_results/full_presentation.pptx"))
        .with_kind(
            JobKind::Document,
            KindConfig::default()
                .with_tool(Tool::Preprocess, tool("preprocess"))
                .with_tool(
                    Tool::Package,
                    tool("package").args([
                        "--mode",
                        "package",
                        "--images",
                        "{images_dir}",
                        "--package-dir",
                        "{package_dir}",
                    ]),
                ),
        ))
}

async fn run_orchestrator(args: Cli) -> eyre::Result<()> {
    if args.papers.is_empty() {
        return Err(eyre!("Pass at least one paper"));
    }

    let config = match &args.config {
        Some(path) => OrchestratorConfig::from_file(path).map_err(report)?,
        None => simulated_config(&args.work_root)?,
    };
    let orchestrator =
        Orchestrator::new(config, Arc::new(LocalSpawner::default())).map_err(report)?;

    let options = match args.papers.as_slice() {
        [paper] => JobOptions::single(paper),
        papers => JobOptions::batch(papers),
    };
    let mut options = options
        .with_voice(match args.voice {
            VoiceArg::Female => Voice::Female,
            VoiceArg::Male => Voice::Male,
        })
        .with_duration(match args.duration {
            DurationArg::Short => VideoDuration::Short,
            DurationArg::Medium => VideoDuration::Medium,
            DurationArg::Long => VideoDuration::Long,
        })
        .with_review(if args.auto_continue {
            ReviewPolicy::AutoContinue
        } else {
            ReviewPolicy::Manual
        });
    if let Some(name) = &args.name {
        options = options.with_name(name);
    }

    let id = orchestrator.submit(args.kind, options).map_err(report)?;
    println!("Submitted {} job {id}", args.kind);

    let mut watcher = orchestrator.watch(id).map_err(report)?;
    let mut printed = 0;
    loop {
        let job = watcher
            .wait_for(|job| {
                job.total_log_lines() > printed
                    || job.stage() == Stage::WaitingForReview
                    || job.is_terminal()
            })
            .await;
        printed = print_new_lines(&job, printed);

        match job.stage() {
            Stage::WaitingForReview => {
                if !confirm_review(&job).await? {
                    println!("Leaving job {id} waiting for review");
                    return Ok(());
                }
                orchestrator.resume(id).map_err(report)?;
            }
            Stage::Completed => {
                let result = orchestrator.result_location(id).map_err(report)?;
                println!("Finished: {}", result.display());
                return Ok(());
            }
            Stage::Failed => {
                event!(Level::ERROR, %id, error = ?job.error(), "Job failed");
                return Err(eyre!(
                    "Job failed during {}: {}",
                    job.failed_stage().unwrap_or(Stage::Queued),
                    job.error().unwrap_or("unknown error")
                ));
            }
            _ => {}
        }
    }
}

/// Print the log lines that arrived since the last call and return the new line count.
fn print_new_lines(job: &Job, printed: u64) -> u64 {
    let total = job.total_log_lines();
    let new_lines = usize::try_from(total - printed).unwrap_or(usize::MAX);
    for entry in job.recent_log(new_lines) {
        println!("[{:>3}%] {}", job.progress(), entry.line);
    }
    total
}

async fn confirm_review(job: &Job) -> eyre::Result<bool> {
    if let Some(dir) = job.output_dir() {
        println!("The preview is ready in {}", dir.display());
    }
    print!("Continue with finalizing? [Y/n] ");
    std::io::stdout().flush()?;

    let answer = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line).map(|_| line)
    })
    .await??;

    let answer = answer.trim().to_lowercase();
    Ok(answer.is_empty() || answer == "y" || answer == "yes")
}
