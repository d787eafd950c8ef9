//! Local steps that prepare or collect files in a job's output directory.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use error_stack::{Report, ResultExt};
use paperflow_worker::JobConfigFile;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::task::JoinHandle;
use tracing::{event, Level};
use walkdir::WalkDir;

use crate::{
    config::AssetConfig,
    options::{Background, JobOptions, SourceMode, Voice},
    spawn::TaskError,
};

pub const SOURCES_DIR: &str = "sources";
pub const JOB_CONFIG_FILE: &str = "temp/job_config.json";
pub const AUDIT_LOG_FILE: &str = "job.log";
const EMPTY_IMAGES_DIR: &str = "temp_empty_images";

async fn run_blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, Report<TaskError>> + Send + 'static,
) -> Result<T, Report<TaskError>> {
    tokio::task::spawn_blocking(f)
        .await
        .change_context(TaskError::PostProcessing)?
}

/// Lay out the job's source files for the preprocessing tool and return the path to pass as its
/// input. Single jobs use the paper directly. Batch jobs copy every paper into a `sources`
/// folder in file name order, with a numeric prefix so that the tools see the same order.
pub async fn stage_inputs(
    options: &JobOptions,
    output_dir: &Path,
) -> Result<PathBuf, Report<TaskError>> {
    if options.mode == SourceMode::Single {
        return options
            .sources
            .first()
            .cloned()
            .ok_or_else(|| Report::new(TaskError::PostProcessing))
            .attach_printable("Job has no source file");
    }

    let mut sources = options.sources.clone();
    sources.sort_by(|a, b| a.file_name().cmp(&b.file_name()).then_with(|| a.cmp(b)));

    let dest_dir = output_dir.join(SOURCES_DIR);
    tokio::fs::create_dir_all(&dest_dir)
        .await
        .change_context(TaskError::PostProcessing)
        .attach_printable_lazy(|| dest_dir.display().to_string())?;

    for (i, source) in sources.iter().enumerate() {
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "source".to_string());
        let dest = dest_dir.join(format!("{i:03}_{file_name}"));
        tokio::fs::copy(source, &dest)
            .await
            .change_context(TaskError::PostProcessing)
            .attach_printable_lazy(|| format!("Copying {}", source.display()))?;
    }

    Ok(dest_dir)
}

/// Find the images directory produced by preprocessing. A `combined_images` directory is
/// preferred over `images`. If neither exists, an empty placeholder directory is created.
pub async fn locate_images_dir(output_dir: &Path) -> Result<PathBuf, Report<TaskError>> {
    let output_dir = output_dir.to_path_buf();
    run_blocking(move || {
        let mut combined = None;
        let mut plain = None;
        for entry in WalkDir::new(&output_dir)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
        {
            match entry.file_name().to_str() {
                Some("combined_images") if combined.is_none() => {
                    combined = Some(entry.into_path());
                }
                Some("images") if plain.is_none() => {
                    plain = Some(entry.into_path());
                }
                _ => {}
            }
        }

        if let Some(dir) = combined.or(plain) {
            return Ok(dir);
        }

        let placeholder = output_dir.join(EMPTY_IMAGES_DIR);
        std::fs::create_dir_all(&placeholder)
            .change_context(TaskError::PostProcessing)
            .attach_printable_lazy(|| placeholder.display().to_string())?;
        Ok(placeholder)
    })
    .await
}

/// The folder that the document packaging tool fills, and the archive made from it.
pub fn document_paths(output_dir: &Path, name: &str) -> (PathBuf, PathBuf) {
    (
        output_dir.join(format!("{name}_document")),
        output_dir.join(format!("{name}_document.zip")),
    )
}

/// Zip the contents of `source_dir` into `archive`. Entries are named relative to
/// `source_dir` and added in sorted order.
pub async fn package_archive(
    source_dir: &Path,
    archive: &Path,
) -> Result<PathBuf, Report<TaskError>> {
    let source_dir = source_dir.to_path_buf();
    let archive = archive.to_path_buf();
    run_blocking(move || {
        if !source_dir.is_dir() {
            return Err(Report::new(TaskError::PostProcessing)).attach_printable_lazy(|| {
                format!("{} was not created", source_dir.display())
            });
        }

        let file = File::create(&archive)
            .change_context(TaskError::PostProcessing)
            .attach_printable_lazy(|| archive.display().to_string())?;
        let mut zip = zip::ZipWriter::new(BufWriter::new(file));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        for entry in WalkDir::new(&source_dir)
            .min_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.change_context(TaskError::PostProcessing)?;
            let Ok(relative) = entry.path().strip_prefix(&source_dir) else {
                continue;
            };
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if entry.file_type().is_dir() {
                zip.add_directory(name, options)
                    .change_context(TaskError::PostProcessing)?;
            } else {
                zip.start_file(name, options)
                    .change_context(TaskError::PostProcessing)?;
                let mut input = File::open(entry.path())
                    .change_context(TaskError::PostProcessing)
                    .attach_printable_lazy(|| entry.path().display().to_string())?;
                std::io::copy(&mut input, &mut zip).change_context(TaskError::PostProcessing)?;
            }
        }

        let mut writer = zip.finish().change_context(TaskError::PostProcessing)?;
        writer.flush().change_context(TaskError::PostProcessing)?;
        Ok(archive)
    })
    .await
}

/// Copy the cover scenes, the logo and the chosen background into the tool's code directory.
/// Problems are reported in the returned log lines and never fail the job.
pub async fn stage_assets(
    assets: &AssetConfig,
    background: &Background,
    output_dir: &Path,
) -> Vec<String> {
    let assets = assets.clone();
    let background = background.clone();
    let output_dir = output_dir.to_path_buf();

    let result = tokio::task::spawn_blocking(move || {
        let mut log = Vec::new();
        stage_assets_blocking(&assets, &background, &output_dir, &mut log);
        log
    })
    .await;

    result.unwrap_or_else(|e| vec![format!("Warning: asset staging stopped: {e}")])
}

fn stage_assets_blocking(
    assets: &AssetConfig,
    background: &Background,
    output_dir: &Path,
    log: &mut Vec<String>,
) {
    let code_dir = output_dir.join(&assets.code_dir);
    if !code_dir.is_dir() {
        log.push(format!(
            "Warning: code directory {} does not exist, skipping assets",
            code_dir.display()
        ));
        return;
    }

    let copy = |source: &Path, log: &mut Vec<String>| {
        let Some(file_name) = source.file_name() else {
            return;
        };

        match std::fs::copy(source, code_dir.join(file_name)) {
            Ok(_) => log.push(format!("Copied {}", file_name.to_string_lossy())),
            Err(e) => log.push(format!(
                "Warning: failed to copy {}: {e}",
                source.display()
            )),
        }
    };

    match &assets.cover_dir {
        Some(cover_dir) if cover_dir.is_dir() => {
            let scenes = WalkDir::new(cover_dir)
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.file_type().is_file()
                        && e.path().extension().and_then(|x| x.to_str()) == Some("py")
                });
            for scene in scenes {
                copy(scene.path(), log);
            }
        }
        Some(cover_dir) => log.push(format!(
            "Warning: cover directory {} does not exist",
            cover_dir.display()
        )),
        None => {}
    }

    match &assets.logo {
        Some(logo) if logo.is_file() => copy(logo, log),
        Some(logo) => log.push(format!("Warning: logo {} not found", logo.display())),
        None => {}
    }

    match background {
        Background::Default => log.push("Using the default background".to_string()),
        Background::Custom(path) => {
            if path.is_file() {
                copy(path, log);
            } else {
                log.push(format!(
                    "Warning: custom background {} not found",
                    path.display()
                ));
            }
        }
        Background::Preset(name) => {
            match assets.backgrounds_dir.as_ref().map(|dir| dir.join(name)) {
                Some(path) if path.is_file() => copy(&path, log),
                Some(path) => log.push(format!(
                    "Warning: preset background {} not found",
                    path.display()
                )),
                None => log.push(format!(
                    "Warning: no backgrounds directory configured for preset {name}"
                )),
            }
        }
    }
}

/// Write the voice settings read by the finalizing tool, and return the file's path.
pub async fn write_job_config(
    options: &JobOptions,
    output_dir: &Path,
) -> Result<PathBuf, Report<TaskError>> {
    let (custom_voice_path, custom_voice_text) = match &options.voice {
        Voice::Custom { sample, transcript } => {
            let sample = tokio::fs::canonicalize(sample)
                .await
                .change_context(TaskError::PostProcessing)
                .attach_printable_lazy(|| format!("Voice sample {}", sample.display()))?;
            (Some(sample), Some(transcript.clone()))
        }
        _ => (None, None),
    };

    let file = JobConfigFile {
        voice_type: options.voice.as_str().to_string(),
        custom_voice_path,
        custom_voice_text,
        video_duration: options.duration.as_str().to_string(),
    };
    let contents = file.to_vec().change_context(TaskError::PostProcessing)?;

    let path = output_dir.join(JOB_CONFIG_FILE);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .change_context(TaskError::PostProcessing)
            .attach_printable_lazy(|| parent.display().to_string())?;
    }

    tokio::fs::write(&path, contents)
        .await
        .change_context(TaskError::PostProcessing)
        .attach_printable_lazy(|| path.display().to_string())?;
    Ok(path)
}

/// Check that a tool produced the job's deliverable.
pub async fn verify_result(output_dir: &Path, result: &Path) -> Result<PathBuf, Report<TaskError>> {
    let path = output_dir.join(result);
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => Ok(path),
        _ => Err(Report::new(TaskError::ResultMissing))
            .attach_printable_lazy(|| format!("Expected {}", path.display())),
    }
}

/// Appends every log line of a job to `job.log` in its output directory. Writes happen on a
/// blocking thread so that a slow disk never holds up the worker.
pub struct AuditLog {
    tx: flume::Sender<String>,
    writer: JoinHandle<()>,
}

impl AuditLog {
    pub async fn open(output_dir: &Path) -> Result<AuditLog, Report<TaskError>> {
        let path = output_dir.join(AUDIT_LOG_FILE);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .change_context(TaskError::PostProcessing)
            .attach_printable_lazy(|| path.display().to_string())?
            .into_std()
            .await;

        let (tx, rx) = flume::unbounded::<String>();
        let writer = tokio::task::spawn_blocking(move || {
            let mut file = BufWriter::new(file);
            while let Ok(line) = rx.recv() {
                if let Err(e) = writeln!(file, "{line}") {
                    event!(Level::WARN, path = %path.display(), error = %e, "Failed to write audit log");
                    return;
                }

                if rx.is_empty() {
                    file.flush().ok();
                }
            }

            file.flush().ok();
        });

        Ok(AuditLog { tx, writer })
    }

    pub fn write(&self, timestamp: OffsetDateTime, line: &str) {
        let timestamp = timestamp
            .format(&Rfc3339)
            .unwrap_or_else(|_| timestamp.unix_timestamp().to_string());
        self.tx.send(format!("{timestamp} {line}")).ok();
    }

    /// Flush the remaining lines and close the file.
    pub async fn finish(self) {
        drop(self.tx);
        self.writer.await.ok();
    }
}
