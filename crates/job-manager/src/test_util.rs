use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

use crate::{
    config::{KindConfig, OrchestratorConfig, ToolCommand},
    job::JobKind,
    stage::Tool,
};

pub static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        configure_tracing();
    }
});

fn configure_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, EnvFilter};
    let tree = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    let subscriber = tracing_subscriber::Registry::default()
        .with(EnvFilter::from_env("TEST_LOG"))
        .with(tree);

    tracing::subscriber::set_global_default(subscriber).ok();
}

pub fn setup_test_tracing() {
    Lazy::force(&TRACING);
}

pub const VIDEO_RESULT: &str = "final_results/Video_with_voice/Full.mp4";
pub const SLIDES_RESULT: &str = "final_results/full_presentation.pptx";

/// Write a fake paper into `dir`.
pub fn write_paper(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("%PDF-1.4 {name}")).expect("writing paper");
    path
}

fn reviewed_kind(result: &str) -> KindConfig {
    KindConfig::default()
        .with_tool(
            Tool::Preprocess,
            ToolCommand::new("preprocess").args(["{input}", "--output-dir", "{output_dir}"]),
        )
        .with_tool(
            Tool::RenderPreview,
            ToolCommand::new("render_preview").args(["{output_dir}"]),
        )
        .with_tool(
            Tool::Finalize,
            ToolCommand::new("finalize").args(["{output_dir}", "{job_config}", result]),
        )
        .with_result(result)
}

/// A configuration whose tools are the fake tools understood by the tests' in-process spawner.
pub fn test_config(work_root: &Path) -> OrchestratorConfig {
    OrchestratorConfig::new(work_root)
        .with_kind(JobKind::Video, reviewed_kind(VIDEO_RESULT))
        .with_kind(JobKind::Slides, reviewed_kind(SLIDES_RESULT))
        .with_kind(
            JobKind::Document,
            KindConfig::default()
                .with_tool(
                    Tool::Preprocess,
                    ToolCommand::new("preprocess").args(["{input}", "--output-dir", "{output_dir}"]),
                )
                .with_tool(
                    Tool::Package,
                    ToolCommand::new("package").args(["{images_dir}", "{package_dir}"]),
                ),
        )
}
