//! Retrieval of grounding chunks for a question.

use super::{grade, Confidence, ConfidencePolicy, QueryIntent};
use crate::config::{IntentThresholds, RetrievalSettings};
use crate::embedding::Embedder;
use crate::error::Result;
use crate::store::{ChunkMatch, Store};
use crate::transcript::format_timestamp;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Chunks retrieved for one question with their confidence grade.
#[derive(Debug, Clone)]
pub struct Retrieval {
    pub intent: QueryIntent,
    pub thresholds: IntentThresholds,
    /// Chunks at or above the intent's minimum threshold, best first.
    pub matches: Vec<ChunkMatch>,
    pub confidence: Confidence,
}

impl Retrieval {
    pub fn best_similarity(&self) -> Option<f32> {
        self.matches.first().map(|m| m.similarity)
    }
}

/// Embeds questions and searches a channel's chunks with intent-specific parameters.
pub struct Retriever {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    settings: RetrievalSettings,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            settings,
        }
    }

    #[instrument(skip(self, query), fields(channel_id = %channel_id))]
    pub async fn retrieve(&self, channel_id: &str, query: &str) -> Result<Retrieval> {
        let intent = QueryIntent::classify(query);
        let thresholds = intent.thresholds(&self.settings);

        let query_embedding = self.embedder.embed(query).await?;
        let matches = self
            .store
            .search_chunks(
                channel_id,
                &query_embedding,
                thresholds.match_count,
                thresholds.min_threshold,
            )
            .await?;

        let best = matches.first().map(|m| m.similarity);
        let confidence = grade(best, &thresholds, &ConfidencePolicy::from(&self.settings));

        debug!(
            intent = %intent,
            matches = matches.len(),
            best = ?best,
            confidence = %confidence,
            "Retrieved context"
        );

        Ok(Retrieval {
            intent,
            thresholds,
            matches,
            confidence,
        })
    }
}

/// Format retrieved chunks as numbered excerpts for the answer prompt.
pub fn format_context_for_prompt(matches: &[ChunkMatch]) -> String {
    matches
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let position = match (m.chunk.has_timestamps, m.chunk.start_time) {
                (true, Some(start)) => format!(" @ {}", format_timestamp(start)),
                _ => String::new(),
            };
            format!(
                "---\n[{}] {}{}\n{}\n---",
                i + 1,
                m.video_title,
                position,
                m.chunk.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
