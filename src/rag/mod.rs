//! Retrieval-augmented answers over a channel's transcript chunks.
//!
//! A question is classified by intent, which picks the retrieval parameters.
//! Retrieved chunks grade the answer's confidence; with no usable evidence the
//! engine refuses instead of generating.

mod confidence;
pub mod context;
mod generator;
mod intent;
mod response;

pub use confidence::{grade, Confidence, ConfidencePolicy};
pub use context::{Retrieval, Retriever};
pub use generator::{AnswerGenerator, GenerationRequest, OpenAIAnswerGenerator, TextStream};
pub use intent::QueryIntent;
pub use response::{is_not_covered, AnswerEvent, AnswerRequest, AnswerStream, RagEngine};

use crate::channel::Video;
use crate::store::ChunkMatch;
use crate::transcript::format_timestamp;
use serde::{Deserialize, Serialize};

/// Message shown instead of an answer when the channel's videos do not cover a question.
pub const REFUSAL_MESSAGE: &str =
    "This topic isn't covered in the creator's videos that have been indexed so far, so I can't answer it without guessing.";

/// Author of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

str_enum!(Role {
    User => "user",
    Assistant => "assistant",
});

/// One prior turn passed to the answer model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: Role,
    pub content: String,
}

/// Link from an answer to the video moment that grounds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub video_id: String,
    pub video_title: String,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    /// Human-readable start time. Absent for untimed chunks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Only true when the chunk had valid timestamps; nothing else may render a seek link.
    pub has_timestamp: bool,
    pub similarity: f32,
    pub url: String,
    /// Source text, included in debug responses only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_text: Option<String>,
}

impl Citation {
    pub fn from_match(m: &ChunkMatch, include_text: bool) -> Self {
        let chunk = &m.chunk;
        let start_time = chunk.start_time.filter(|_| chunk.has_timestamps);
        let end_time = chunk.end_time.filter(|_| chunk.has_timestamps);

        Self {
            video_id: chunk.video_id.clone(),
            video_title: m.video_title.clone(),
            start_time,
            end_time,
            timestamp: start_time.map(format_timestamp),
            has_timestamp: start_time.is_some(),
            similarity: m.similarity,
            url: Video::watch_url(&chunk.video_id, start_time),
            chunk_text: include_text.then(|| chunk.text.clone()),
        }
    }
}

/// Counts describing the evidence behind an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    pub chunks_used: usize,
    /// Distinct videos among cited chunks.
    pub videos_referenced: usize,
}

impl Evidence {
    pub fn from_citations(citations: &[Citation]) -> Self {
        let mut videos: Vec<&str> = citations.iter().map(|c| c.video_id.as_str()).collect();
        videos.sort_unstable();
        videos.dedup();
        Self {
            chunks_used: citations.len(),
            videos_referenced: videos.len(),
        }
    }
}

/// Retrieval details returned when a caller asks for debug output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerDebug {
    pub intent: QueryIntent,
    pub match_count: usize,
    pub min_threshold: f32,
    pub preferred_threshold: f32,
    pub best_similarity: Option<f32>,
    pub candidates: usize,
}

/// Answer with its confidence, citations and evidence counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAnswer {
    pub answer: String,
    pub confidence: Confidence,
    pub citations: Vec<Citation>,
    pub evidence: Evidence,
    pub is_refusal: bool,
    pub show_citations: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<AnswerDebug>,
}

impl ChatAnswer {
    /// A grounded answer. Citations are shown for `high` and `medium` confidence.
    pub fn grounded(answer: String, confidence: Confidence, citations: Vec<Citation>) -> Self {
        let evidence = Evidence::from_citations(&citations);
        let show_citations =
            !citations.is_empty() && matches!(confidence, Confidence::High | Confidence::Medium);
        Self {
            answer,
            confidence,
            citations,
            evidence,
            is_refusal: false,
            show_citations,
            debug: None,
        }
    }

    /// A refusal carries no citations and no evidence.
    pub fn refusal() -> Self {
        Self::not_covered(REFUSAL_MESSAGE.to_string(), true)
    }

    /// An assistant-style message explaining a failure while answering.
    pub fn failure(message: String) -> Self {
        Self::not_covered(message, false)
    }

    fn not_covered(answer: String, is_refusal: bool) -> Self {
        Self {
            answer,
            confidence: Confidence::NotCovered,
            citations: Vec::new(),
            evidence: Evidence::default(),
            is_refusal,
            show_citations: false,
            debug: None,
        }
    }
}
