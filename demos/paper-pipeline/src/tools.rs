//! Simulated pipeline tools. Each one reports its steps the way the real tools do and leaves
//! behind placeholder files where the real tools would write their output.

use std::{path::Path, time::Duration};

use clap::ValueEnum;
use eyre::eyre;
use paperflow_worker::TaskEnvironment;
use rand::Rng;

use crate::{report, Cli};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ToolMode {
    Preprocess,
    RenderPreview,
    Finalize,
    Package,
}

pub async fn run(mode: ToolMode, args: &Cli) -> eyre::Result<()> {
    let env = TaskEnvironment::from_env().map_err(report)?;
    eprintln!("{mode:?} starting for job {} in {}", env.job_id, env.stage);

    match mode {
        ToolMode::Preprocess => preprocess(&env).await,
        ToolMode::RenderPreview => render_preview(&env).await,
        ToolMode::Finalize => {
            let result = args
                .result
                .as_deref()
                .ok_or_else(|| eyre!("--result is required"))?;
            finalize(&env, result).await
        }
        ToolMode::Package => {
            let images = args
                .images
                .as_deref()
                .ok_or_else(|| eyre!("--images is required"))?;
            let package_dir = args
                .package_dir
                .as_deref()
                .ok_or_else(|| eyre!("--package-dir is required"))?;
            package(&env, images, package_dir).await
        }
    }
}

async fn pause() {
    let millis = rand::thread_rng().gen_range(200..800);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

fn write_placeholder(path: &Path, contents: &str) -> eyre::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}

async fn preprocess(env: &TaskEnvironment) -> eyre::Result<()> {
    let input = env
        .input
        .as_deref()
        .ok_or_else(|| eyre!("No input was given"))?;
    println!("Reading {}", input.display());

    for (step, label) in [
        ("1", "Extracting paper structure"),
        ("2", "Writing the narration script"),
        ("3", "Planning scenes"),
        ("3.5", "Generating scene code"),
    ] {
        pause().await;
        env.report_step(step, label);
    }

    let sections = rand::thread_rng().gen_range(2..5);
    for i in 1..=sections {
        write_placeholder(
            &env.output_dir
                .join(format!("sections/combined_images/section_{i:02}.png")),
            "image",
        )?;
        write_placeholder(
            &env.output_dir
                .join(format!("final_results/Code/scene_{i:02}.py")),
            "# scene",
        )?;
    }

    Ok(())
}

async fn render_preview(env: &TaskEnvironment) -> eyre::Result<()> {
    pause().await;
    env.report_step("4.5", "Rendering the silent preview");
    write_placeholder(&env.output_dir.join("final_results/preview.mp4"), "preview")
}

async fn finalize(env: &TaskEnvironment, result: &Path) -> eyre::Result<()> {
    let config = env
        .read_job_config()
        .map_err(report)?
        .ok_or_else(|| eyre!("No job configuration was given"))?;
    println!(
        "Using the {} voice for a {} video",
        config.voice_type, config.video_duration
    );

    for (step, label) in [
        ("5", "Generating narration"),
        ("6", "Synthesizing voice"),
        ("7", "Composing scenes"),
        ("8", "Adding subtitles"),
        ("9", "Merging audio and video"),
    ] {
        pause().await;
        env.report_step(step, label);
    }

    write_placeholder(
        &env.output_dir.join(result),
        &format!("{} voice, {}", config.voice_type, config.video_duration),
    )
}

async fn package(env: &TaskEnvironment, images: &Path, package_dir: &Path) -> eyre::Result<()> {
    pause().await;
    env.report_step("3", "Writing the markdown document");

    write_placeholder(&package_dir.join("speech.md"), "# Speech\n")?;
    let images_out = package_dir.join("images");
    std::fs::create_dir_all(&images_out)?;
    for entry in std::fs::read_dir(images)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::copy(entry.path(), images_out.join(entry.file_name()))?;
        }
    }

    Ok(())
}
