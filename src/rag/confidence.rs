//! Confidence grading of retrieved evidence.

use crate::config::{IntentThresholds, RetrievalSettings};
use serde::{Deserialize, Serialize};

/// How well an answer is supported, ordered from least to most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    NotCovered,
    Low,
    Medium,
    High,
}

str_enum!(Confidence {
    NotCovered => "not_covered",
    Low => "low",
    Medium => "medium",
    High => "high",
});

/// Global similarity floors applied regardless of intent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidencePolicy {
    pub min_similarity_for_any_answer: f32,
    pub min_similarity_for_confident_answer: f32,
}

impl From<&RetrievalSettings> for ConfidencePolicy {
    fn from(settings: &RetrievalSettings) -> Self {
        Self {
            min_similarity_for_any_answer: settings.min_similarity_for_any_answer,
            min_similarity_for_confident_answer: settings.min_similarity_for_confident_answer,
        }
    }
}

/// Grade the best similarity among chunks that cleared `thresholds.min_threshold`.
///
/// | best similarity                                   | confidence    |
/// |---------------------------------------------------|---------------|
/// | none cleared `min_threshold`                      | `not_covered` |
/// | below `min_similarity_for_any_answer`             | `low`         |
/// | at least `preferred_threshold` and the confident floor | `high`   |
/// | anything else                                     | `medium`      |
pub fn grade(
    best_similarity: Option<f32>,
    thresholds: &IntentThresholds,
    policy: &ConfidencePolicy,
) -> Confidence {
    let Some(best) = best_similarity.filter(|s| *s >= thresholds.min_threshold) else {
        return Confidence::NotCovered;
    };

    if best < policy.min_similarity_for_any_answer {
        Confidence::Low
    } else if best >= thresholds.preferred_threshold
        && best >= policy.min_similarity_for_confident_answer
    {
        Confidence::High
    } else {
        Confidence::Medium
    }
}
