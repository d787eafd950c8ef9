//! Estimate job progress from the output of external tools.
//!
//! None of the tools report structured progress, so the estimator matches each line of output
//! against an ordered list of rules. The first rule that matches and would move progress forward
//! wins. The result is approximate but never goes backwards, and the worker always moves progress
//! to the end of the stage's range when the stage finishes.

use std::fmt::Debug;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{job::JobKind, stage::Stage};

/// A compiled regular expression that can be read from configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Pattern)
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.0.is_match(line)
    }
}

impl Debug for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Pattern").field(&self.0.as_str()).finish()
    }
}

impl TryFrom<String> for Pattern {
    type Error = regex::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Pattern::new(&value)
    }
}

impl From<Pattern> for String {
    fn from(value: Pattern) -> Self {
        value.0.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Matcher {
    Contains(String),
    Pattern(Pattern),
}

impl Matcher {
    pub fn matches(&self, line: &str) -> bool {
        match self {
            Matcher::Contains(s) => line.contains(s.as_str()),
            Matcher::Pattern(p) => p.is_match(line),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRule {
    pub matcher: Matcher,
    /// The progress value that a matching line indicates.
    pub progress: u8,
    pub label: String,
}

impl ProgressRule {
    pub fn contains(needle: &str, progress: u8, label: &str) -> Self {
        ProgressRule {
            matcher: Matcher::Contains(needle.to_string()),
            progress,
            label: label.to_string(),
        }
    }

    /// Create a rule from a regular expression. Only used with the built-in patterns.
    fn pattern(pattern: &str, progress: u8, label: &str) -> Option<Self> {
        Some(ProgressRule {
            matcher: Matcher::Pattern(Pattern::new(pattern).ok()?),
            progress,
            label: label.to_string(),
        })
    }
}

/// A progress update suggested by a line of output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressHint<'a> {
    pub progress: u8,
    pub label: &'a str,
}

#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    rules: Vec<ProgressRule>,
    ceiling: u8,
}

impl ProgressEstimator {
    /// Create an estimator whose hints never exceed `ceiling`, normally the end of the stage's
    /// progress range.
    pub fn new(rules: Vec<ProgressRule>, ceiling: u8) -> Self {
        ProgressEstimator {
            rules,
            ceiling: ceiling.min(100),
        }
    }

    /// Look for a rule that moves progress beyond `current`.
    pub fn estimate(&self, line: &str, current: u8) -> Option<ProgressHint<'_>> {
        self.rules
            .iter()
            .find(|rule| rule.progress > current && rule.matcher.matches(line))
            .map(|rule| ProgressHint {
                progress: rule.progress.min(self.ceiling),
                label: &rule.label,
            })
            .filter(|hint| hint.progress > current)
    }
}

/// The built-in rules for each kind and stage. These match the `Step N` lines that the pipeline
/// tools print.
pub fn default_rules(kind: JobKind, stage: Stage) -> Vec<ProgressRule> {
    let rules = match (kind, stage) {
        (JobKind::Video | JobKind::Slides, Stage::Preprocessing) => vec![
            Some(ProgressRule::contains("Step 1", 20, "Step 1: Extracting paper structure")),
            Some(ProgressRule::contains("Step 2", 40, "Step 2: Generating script")),
            // Before the plain `Step 3` rule, which also matches these lines.
            ProgressRule::pattern(r"Step 3\.[5-9]", 75, "Step 3.5: Preparing cover"),
            Some(ProgressRule::contains("Step 3", 60, if kind == JobKind::Video {
                "Step 3: Generating scenes"
            } else {
                "Step 3: Generating slides"
            })),
        ],
        (JobKind::Video | JobKind::Slides, Stage::PreviewRendering) => vec![
            ProgressRule::pattern(r"Step 4\.5", 85, "Step 4.5: Rendering preview"),
        ],
        (JobKind::Video | JobKind::Slides, Stage::Finalizing) => vec![
            Some(ProgressRule::contains("Step 6", 91, "Step 6: Speech synthesis")),
            Some(ProgressRule::contains("Step 7", 94, "Step 7: Aligning audio and video")),
            Some(ProgressRule::contains("Step 8", 97, "Step 8: Rendering")),
            Some(ProgressRule::contains("Step 9", 99, "Step 9: Merging audio and video")),
        ],
        (JobKind::Document, Stage::Preprocessing) => vec![
            Some(ProgressRule::contains("Step 1", 30, "Step 1: Splitting paper into sections")),
            Some(ProgressRule::contains("Step 2", 50, "Step 2: Generating speech text")),
        ],
        (JobKind::Document, Stage::Packaging) => vec![Some(ProgressRule::contains(
            "Step 3",
            80,
            "Step 3: Writing document",
        ))],
        _ => Vec::new(),
    };

    rules.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> ProgressEstimator {
        ProgressEstimator::new(default_rules(JobKind::Video, Stage::Finalizing), 100)
    }

    #[test]
    fn first_rule_above_current() {
        let estimator = estimator();
        let hint = estimator
            .estimate("=== Step 7: audio alignment ===", 90)
            .expect("matching line");
        assert_eq!(hint.progress, 94);
        assert_eq!(hint.label, "Step 7: Aligning audio and video");
    }

    #[test]
    fn stale_rule_is_skipped() {
        let estimator = estimator();
        assert_eq!(estimator.estimate("Step 6 again", 97), None);
        assert_eq!(estimator.estimate("unrelated output", 90), None);
    }

    #[test]
    fn hint_is_capped() {
        let estimator =
            ProgressEstimator::new(vec![ProgressRule::contains("done", 95, "Done")], 90);
        assert_eq!(estimator.estimate("done", 10).map(|h| h.progress), Some(90));
        assert_eq!(estimator.estimate("done", 90), None);
    }

    #[test]
    fn pattern_rules() {
        let estimator =
            ProgressEstimator::new(default_rules(JobKind::Slides, Stage::PreviewRendering), 90);
        assert_eq!(
            estimator.estimate("Step 4.5 preview", 80).map(|h| h.progress),
            Some(85)
        );
        assert_eq!(estimator.estimate("Step 415", 80), None);
    }

    #[test]
    fn half_step_is_not_taken_for_whole_step() {
        let estimator =
            ProgressEstimator::new(default_rules(JobKind::Video, Stage::Preprocessing), 80);
        let hint = estimator
            .estimate("Step 3.5: cover", 40)
            .expect("matching line");
        assert_eq!(hint.progress, 75);
        assert_eq!(hint.label, "Step 3.5: Preparing cover");
        assert_eq!(estimator.estimate("Step 3: scenes", 40).map(|h| h.progress), Some(60));
        assert_eq!(estimator.estimate("Step 3: scenes", 75), None);
    }

    #[test]
    fn finalizing_rules_start_above_stage_start() {
        let plan = crate::stage::plan(JobKind::Video, Stage::Finalizing).expect("finalizing plan");
        let rules = default_rules(JobKind::Video, Stage::Finalizing);
        assert!(rules.iter().all(|rule| rule.progress > plan.progress_start));
    }

    #[test]
    fn rules_from_config() {
        let rules: Vec<ProgressRule> = serde_json::from_str(
            r#"[
                {"matcher": {"contains": "extracting"}, "progress": 10, "label": "Extract"},
                {"matcher": {"pattern": "^chunk \\d+$"}, "progress": 30, "label": "Chunks"}
            ]"#,
        )
        .expect("parsing rules");

        let estimator = ProgressEstimator::new(rules, 70);
        assert_eq!(estimator.estimate("chunk 12", 10).map(|h| h.progress), Some(30));
        assert_eq!(estimator.estimate("chunk twelve", 10), None);
    }

    #[test]
    fn bad_pattern_is_rejected() {
        let result = serde_json::from_str::<Matcher>(r#"{"pattern": "(unclosed"}"#);
        assert!(result.is_err());
    }
}
