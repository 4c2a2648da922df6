//! Lexical query intent classification.

use crate::config::{IntentThresholds, RetrievalSettings};
use serde::{Deserialize, Serialize};

/// What kind of answer a question is after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    /// Broad questions answered by synthesizing several excerpts.
    General,
    /// The creator's opinion or stance on a topic.
    Conceptual,
    /// Where or when something was said; wants a precise timestamp.
    Moment,
}

str_enum!(QueryIntent {
    General => "general",
    Conceptual => "conceptual",
    Moment => "moment",
});

const MOMENT_PHRASES: &[&str] = &[
    "what time",
    "which video",
    "which episode",
    "what video",
    "timestamp",
    "at what point",
    "what part",
];

const MOMENT_WORDS: &[&str] = &["where", "when"];

const CONCEPTUAL_PHRASES: &[&str] = &[
    "do you think",
    "does he think",
    "does she think",
    "do they think",
    "your opinion",
    "opinion on",
    "opinion of",
    "thoughts on",
    "feel about",
    "stance on",
    "view on",
    "views on",
    "take on",
    "believe",
    "why do you",
];

impl QueryIntent {
    /// Classify a question by lexical cues. Moment cues win over conceptual ones.
    pub fn classify(query: &str) -> Self {
        let lower = query.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .filter(|w| !w.is_empty())
            .collect();

        if MOMENT_PHRASES.iter().any(|p| lower.contains(p))
            || words.iter().any(|w| MOMENT_WORDS.contains(w))
        {
            return QueryIntent::Moment;
        }

        if CONCEPTUAL_PHRASES.iter().any(|p| lower.contains(p)) {
            return QueryIntent::Conceptual;
        }

        QueryIntent::General
    }

    /// Retrieval parameters for this intent.
    pub fn thresholds(&self, settings: &RetrievalSettings) -> IntentThresholds {
        match self {
            QueryIntent::General => settings.general,
            QueryIntent::Conceptual => settings.conceptual,
            QueryIntent::Moment => settings.moment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moment_cues() {
        for q in [
            "Where do you explain lifetimes?",
            "When did you first mention async?",
            "What time in the video do you show the benchmark?",
            "Which video covers error handling?",
        ] {
            assert_eq!(QueryIntent::classify(q), QueryIntent::Moment, "{}", q);
        }
    }

    #[test]
    fn test_conceptual_cues() {
        for q in [
            "What do you think about Go?",
            "How do you feel about tabs vs spaces?",
            "Thoughts on microservices?",
        ] {
            assert_eq!(QueryIntent::classify(q), QueryIntent::Conceptual, "{}", q);
        }
    }

    #[test]
    fn test_general_default() {
        assert_eq!(
            QueryIntent::classify("What is your favorite pizza topping?"),
            QueryIntent::General
        );
        assert_eq!(QueryIntent::classify("Explain the borrow checker"), QueryIntent::General);
        // "whenever" is not the word "when"
        assert_eq!(QueryIntent::classify("Is whenever a keyword?"), QueryIntent::General);
    }

    #[test]
    fn test_moment_is_more_selective() {
        let settings = RetrievalSettings::default();
        let moment = QueryIntent::Moment.thresholds(&settings);
        let general = QueryIntent::General.thresholds(&settings);
        assert!(moment.match_count < general.match_count);
        assert!(moment.min_threshold > general.min_threshold);
    }
}
