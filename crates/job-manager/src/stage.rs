//! The per-kind stage tables that drive every job.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::job::{JobKind, JobStatus};

/// A position in a job's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Queued,
    Preprocessing,
    PreviewRendering,
    WaitingForReview,
    Finalizing,
    Packaging,
    Completed,
    Failed,
}

const REVIEWED_SEQUENCE: &[Stage] = &[
    Stage::Queued,
    Stage::Preprocessing,
    Stage::PreviewRendering,
    Stage::WaitingForReview,
    Stage::Finalizing,
    Stage::Completed,
];

const DOCUMENT_SEQUENCE: &[Stage] = &[
    Stage::Queued,
    Stage::Preprocessing,
    Stage::Packaging,
    Stage::Completed,
];

impl Stage {
    /// The ordered stages that a job of this kind passes through when it succeeds.
    pub fn sequence(kind: JobKind) -> &'static [Stage] {
        match kind {
            JobKind::Video | JobKind::Slides => REVIEWED_SEQUENCE,
            JobKind::Document => DOCUMENT_SEQUENCE,
        }
    }

    /// The stage that follows this one for the given kind.
    pub fn next(&self, kind: JobKind) -> Option<Stage> {
        let sequence = Self::sequence(kind);
        sequence
            .iter()
            .position(|s| s == self)
            .and_then(|i| sequence.get(i + 1))
            .copied()
    }

    pub fn status(&self) -> JobStatus {
        match self {
            Stage::Queued => JobStatus::Queued,
            Stage::WaitingForReview => JobStatus::WaitingForReview,
            Stage::Completed => JobStatus::Completed,
            Stage::Failed => JobStatus::Failed,
            Stage::Preprocessing
            | Stage::PreviewRendering
            | Stage::Finalizing
            | Stage::Packaging => JobStatus::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::Preprocessing => "preprocessing",
            Stage::PreviewRendering => "preview_rendering",
            Stage::WaitingForReview => "waiting_for_review",
            Stage::Finalizing => "finalizing",
            Stage::Packaging => "packaging",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An external tool that a stage can run. Each job kind configures its own command for each tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    Preprocess,
    RenderPreview,
    Finalize,
    Package,
}

impl Tool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::Preprocess => "preprocess",
            Tool::RenderPreview => "render_preview",
            Tool::Finalize => "finalize",
            Tool::Package => "package",
        }
    }
}

impl Display for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step within a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Lay out the source files for the preprocessing tool.
    StageInputs,
    /// Run an external tool.
    External(Tool),
    /// Copy cover scenes, the logo and the chosen background into the tool's code directory.
    StageAssets,
    /// Write the job configuration file read by the finalizing tool.
    WriteJobConfig,
    /// Check that the configured result file exists.
    CollectResult,
    /// Find the images directory for the packaging tool.
    LocateImages,
    /// Zip the generated document folder.
    PackageArchive,
}

/// The work done by one stage, and the range of progress values that it covers.
#[derive(Debug, Clone, Copy)]
pub struct StagePlan {
    pub stage: Stage,
    pub label: &'static str,
    pub progress_start: u8,
    pub progress_end: u8,
    pub steps: &'static [Step],
}

const VIDEO_PLANS: &[StagePlan] = &[
    StagePlan {
        stage: Stage::Preprocessing,
        label: "Generating content",
        progress_start: 5,
        progress_end: 80,
        steps: &[
            Step::StageInputs,
            Step::External(Tool::Preprocess),
            Step::StageAssets,
        ],
    },
    StagePlan {
        stage: Stage::PreviewRendering,
        label: "Rendering preview",
        progress_start: 80,
        progress_end: 90,
        steps: &[Step::External(Tool::RenderPreview)],
    },
    StagePlan {
        stage: Stage::Finalizing,
        label: "Synthesizing speech and rendering",
        progress_start: 90,
        progress_end: 100,
        steps: &[
            Step::WriteJobConfig,
            Step::External(Tool::Finalize),
            Step::CollectResult,
        ],
    },
];

const DOCUMENT_PLANS: &[StagePlan] = &[
    StagePlan {
        stage: Stage::Preprocessing,
        label: "Splitting paper into sections",
        progress_start: 5,
        progress_end: 70,
        steps: &[Step::StageInputs, Step::External(Tool::Preprocess)],
    },
    StagePlan {
        stage: Stage::Packaging,
        label: "Packaging document",
        progress_start: 70,
        progress_end: 100,
        steps: &[
            Step::LocateImages,
            Step::External(Tool::Package),
            Step::PackageArchive,
        ],
    },
];

/// Return the plan for a stage that does work. Stages that only mark a position in the state
/// machine have no plan.
pub fn plan(kind: JobKind, stage: Stage) -> Option<&'static StagePlan> {
    let plans = match kind {
        JobKind::Video | JobKind::Slides => VIDEO_PLANS,
        JobKind::Document => DOCUMENT_PLANS,
    };

    plans.iter().find(|p| p.stage == stage)
}

/// The tools that a job kind needs to run to completion.
pub fn required_tools(kind: JobKind) -> impl Iterator<Item = Tool> {
    Stage::sequence(kind)
        .iter()
        .filter_map(move |stage| plan(kind, *stage))
        .flat_map(|plan| plan.steps.iter())
        .filter_map(|step| match step {
            Step::External(tool) => Some(*tool),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_stage() {
        assert_eq!(
            Stage::PreviewRendering.next(JobKind::Slides),
            Some(Stage::WaitingForReview)
        );
        assert_eq!(
            Stage::Preprocessing.next(JobKind::Document),
            Some(Stage::Packaging)
        );
        assert_eq!(Stage::Completed.next(JobKind::Video), None);
        assert_eq!(Stage::Failed.next(JobKind::Video), None);
        assert_eq!(Stage::Finalizing.next(JobKind::Document), None);
    }

    #[test]
    fn plans_cover_progress_range() {
        for kind in [JobKind::Video, JobKind::Slides, JobKind::Document] {
            let plans = Stage::sequence(kind)
                .iter()
                .filter_map(|s| plan(kind, *s))
                .collect::<Vec<_>>();

            assert_eq!(plans.first().map(|p| p.progress_start), Some(5), "{kind}");
            assert_eq!(plans.last().map(|p| p.progress_end), Some(100), "{kind}");
            for pair in plans.windows(2) {
                assert_eq!(pair[0].progress_end, pair[1].progress_start, "{kind}");
            }
        }
    }

    #[test]
    fn checkpoint_has_no_plan() {
        assert!(plan(JobKind::Video, Stage::WaitingForReview).is_none());
        assert!(plan(JobKind::Video, Stage::Packaging).is_none());
    }

    #[test]
    fn tools_per_kind() {
        let video = required_tools(JobKind::Video).collect::<Vec<_>>();
        assert_eq!(
            video,
            vec![Tool::Preprocess, Tool::RenderPreview, Tool::Finalize]
        );

        let document = required_tools(JobKind::Document).collect::<Vec<_>>();
        assert_eq!(document, vec![Tool::Preprocess, Tool::Package]);
    }
}
