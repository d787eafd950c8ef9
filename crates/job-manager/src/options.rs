//! User-supplied parameters for a job, captured once at submission.

use std::path::{Path, PathBuf};

use error_stack::Report;
use serde::{Deserialize, Serialize};

use crate::job::{JobError, JobKind};

/// How the source files of a job are passed to the preprocessing tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    /// Exactly one paper, passed directly.
    Single,
    /// Several papers, copied into a folder in file name order and passed as that folder.
    Batch,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoDuration {
    Short,
    #[default]
    Medium,
    Long,
}

impl VideoDuration {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoDuration::Short => "short",
            VideoDuration::Medium => "medium",
            VideoDuration::Long => "long",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Voice {
    #[default]
    Female,
    Male,
    /// Clone the voice from an uploaded sample.
    Custom { sample: PathBuf, transcript: String },
}

impl Voice {
    pub fn as_str(&self) -> &'static str {
        match self {
            Voice::Female => "female",
            Voice::Male => "male",
            Voice::Custom { .. } => "custom",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Background {
    #[default]
    Default,
    /// A file name in the configured backgrounds directory.
    Preset(String),
    /// An uploaded image.
    Custom(PathBuf),
}

impl Background {
    pub fn as_str(&self) -> &str {
        match self {
            Background::Default => "default",
            Background::Preset(name) => name,
            Background::Custom(_) => "custom",
        }
    }
}

/// What happens when a job reaches the review checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPolicy {
    /// Wait for an explicit resume.
    #[default]
    Manual,
    /// Resume immediately without waiting for a human.
    AutoContinue,
}

/// The configuration of a job. This is immutable once the job is submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub mode: SourceMode,
    pub sources: Vec<PathBuf>,
    /// A display name for the job, used in the output directory name. Defaults to the name of the
    /// first source file.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub duration: VideoDuration,
    #[serde(default)]
    pub voice: Voice,
    #[serde(default)]
    pub background: Background,
    #[serde(default)]
    pub review: ReviewPolicy,
}

impl JobOptions {
    pub fn single(source: impl Into<PathBuf>) -> Self {
        Self::new(SourceMode::Single, vec![source.into()])
    }

    pub fn batch(sources: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self::new(
            SourceMode::Batch,
            sources.into_iter().map(Into::into).collect(),
        )
    }

    fn new(mode: SourceMode, sources: Vec<PathBuf>) -> Self {
        JobOptions {
            mode,
            sources,
            name: None,
            duration: VideoDuration::default(),
            voice: Voice::default(),
            background: Background::default(),
            review: ReviewPolicy::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_duration(mut self, duration: VideoDuration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_voice(mut self, voice: Voice) -> Self {
        self.voice = voice;
        self
    }

    pub fn with_background(mut self, background: Background) -> Self {
        self.background = background;
        self
    }

    pub fn with_review(mut self, review: ReviewPolicy) -> Self {
        self.review = review;
        self
    }

    /// The name used for the job's output directory and packaged documents.
    pub fn display_name(&self) -> String {
        let name = self.name.clone().or_else(|| {
            self.sources
                .first()
                .and_then(|p| p.file_stem())
                .map(|s| s.to_string_lossy().into_owned())
        });

        let name = sanitize_name(name.as_deref().unwrap_or_default());
        if name.is_empty() {
            "job".to_string()
        } else {
            name
        }
    }

    /// Check the options before a job is created.
    pub fn validate(&self, kind: JobKind) -> Result<(), Report<JobError>> {
        let invalid = |msg: String| Err(Report::new(JobError::InvalidConfig).attach_printable(msg));

        match (self.mode, self.sources.len()) {
            (_, 0) => return invalid("At least one source file is required".to_string()),
            (SourceMode::Single, n) if n > 1 => {
                return invalid(format!("Single mode takes one source file, got {n}"))
            }
            _ => {}
        }

        for source in &self.sources {
            if !source.is_file() {
                return invalid(format!("Source file {} does not exist", source.display()));
            }
        }

        if let Some(name) = &self.name {
            if sanitize_name(name).is_empty() {
                return invalid(format!("Job name {name:?} has no usable characters"));
            }
        }

        if kind == JobKind::Document {
            return Ok(());
        }

        if let Voice::Custom { sample, transcript } = &self.voice {
            if !sample.is_file() {
                return invalid(format!("Voice sample {} does not exist", sample.display()));
            }

            if transcript.trim().is_empty() {
                return invalid("Custom voices require a transcript of the sample".to_string());
            }
        }

        match &self.background {
            Background::Default => {}
            Background::Preset(name) => {
                if name.is_empty() || Path::new(name).components().count() != 1 {
                    return invalid(format!("Invalid background preset {name:?}"));
                }
            }
            Background::Custom(path) => {
                if !path.is_file() {
                    return invalid(format!("Background image {} does not exist", path.display()));
                }
            }
        }

        Ok(())
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}
