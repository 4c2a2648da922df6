//! Answer composition: retrieval, confidence grading, generation and citations.

use super::context::{format_context_for_prompt, Retrieval};
use super::generator::{AnswerGenerator, GenerationRequest, TextStream};
use super::{AnswerDebug, ChatAnswer, Citation, Confidence, HistoryMessage, Retriever};
use crate::config::{RetrievalSettings, NOT_COVERED_MARKER};
use crate::embedding::Embedder;
use crate::error::{Result, TubechatError};
use crate::store::Store;
use futures::stream::{self, BoxStream, Fuse, StreamExt};
use std::sync::Arc;
use tracing::{info, instrument};

/// One question against one channel.
#[derive(Debug, Clone)]
pub struct AnswerRequest {
    pub channel_id: String,
    pub creator_name: String,
    pub question: String,
    /// Prior turns, oldest first. Trimmed to the configured window.
    pub history: Vec<HistoryMessage>,
    /// Include retrieval details and chunk text in the answer.
    pub debug: bool,
}

/// Event of a streamed answer.
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerEvent {
    /// A piece of answer text.
    Delta(String),
    /// The complete answer. Always the last event of a successful stream.
    Final(ChatAnswer),
}

pub type AnswerStream = BoxStream<'static, Result<AnswerEvent>>;

/// Answers questions from a channel's indexed transcripts.
pub struct RagEngine {
    retriever: Retriever,
    generator: Arc<dyn AnswerGenerator>,
    history_window: usize,
}

impl RagEngine {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn AnswerGenerator>,
        settings: RetrievalSettings,
    ) -> Self {
        let history_window = settings.history_window;
        Self {
            retriever: Retriever::new(store, embedder, settings),
            generator,
            history_window,
        }
    }

    /// Answer a question, refusing when the channel's chunks do not cover it.
    #[instrument(skip(self, request), fields(channel_id = %request.channel_id))]
    pub async fn answer(&self, request: &AnswerRequest) -> Result<ChatAnswer> {
        let retrieval = self.retrieve(request).await?;
        let grounding = Grounding::new(&retrieval, request.debug);

        if retrieval.confidence == Confidence::NotCovered {
            info!("No chunk cleared the retrieval threshold, refusing");
            return Ok(grounding.refusal());
        }

        let generation = self.generation_request(request, &retrieval);
        let text = self.generator.generate(&generation).await?;
        grounding.compose(&text)
    }

    /// Stream an answer as text deltas followed by the complete answer.
    ///
    /// Text that may still turn out to be the not-covered marker is held back,
    /// so a refusal never leaks partial marker text to the caller.
    #[instrument(skip(self, request), fields(channel_id = %request.channel_id))]
    pub async fn answer_stream(&self, request: &AnswerRequest) -> Result<AnswerStream> {
        let retrieval = self.retrieve(request).await?;
        let grounding = Grounding::new(&retrieval, request.debug);

        if retrieval.confidence == Confidence::NotCovered {
            info!("No chunk cleared the retrieval threshold, refusing");
            let refusal = grounding.refusal();
            return Ok(stream::once(async move { Ok(AnswerEvent::Final(refusal)) }).boxed());
        }

        let generation = self.generation_request(request, &retrieval);
        let deltas = self.generator.generate_stream(&generation).await?;
        Ok(marker_aware_stream(deltas, grounding))
    }

    async fn retrieve(&self, request: &AnswerRequest) -> Result<Retrieval> {
        if request.question.trim().is_empty() {
            return Err(TubechatError::InvalidInput("query must not be empty".to_string()));
        }
        self.retriever
            .retrieve(&request.channel_id, request.question.trim())
            .await
    }

    fn generation_request(&self, request: &AnswerRequest, retrieval: &Retrieval) -> GenerationRequest {
        let skip = request.history.len().saturating_sub(self.history_window);
        GenerationRequest {
            creator_name: request.creator_name.clone(),
            question: request.question.trim().to_string(),
            context: format_context_for_prompt(&retrieval.matches),
            confidence: retrieval.confidence,
            history: request.history[skip..].to_vec(),
        }
    }
}

/// Whether generated text is the model saying the excerpts do not cover the question.
pub fn is_not_covered(text: &str) -> bool {
    text.trim_start().starts_with(NOT_COVERED_MARKER)
}

/// Citations and grade captured from a retrieval, used once the text is known.
#[derive(Debug, Clone)]
struct Grounding {
    confidence: Confidence,
    citations: Vec<Citation>,
    debug: Option<AnswerDebug>,
}

impl Grounding {
    fn new(retrieval: &Retrieval, include_debug: bool) -> Self {
        let citations = retrieval
            .matches
            .iter()
            .map(|m| Citation::from_match(m, include_debug))
            .collect();

        let debug = include_debug.then(|| AnswerDebug {
            intent: retrieval.intent,
            match_count: retrieval.thresholds.match_count,
            min_threshold: retrieval.thresholds.min_threshold,
            preferred_threshold: retrieval.thresholds.preferred_threshold,
            best_similarity: retrieval.best_similarity(),
            candidates: retrieval.matches.len(),
        });

        Self {
            confidence: retrieval.confidence,
            citations,
            debug,
        }
    }

    fn refusal(&self) -> ChatAnswer {
        let mut answer = ChatAnswer::refusal();
        answer.debug = self.debug.clone();
        answer
    }

    fn compose(&self, text: &str) -> Result<ChatAnswer> {
        if is_not_covered(text) {
            info!("Model reported the question is not covered, refusing");
            return Ok(self.refusal());
        }

        let text = text.trim();
        if text.is_empty() {
            return Err(TubechatError::Rag("Empty response from LLM".to_string()));
        }

        let mut answer = ChatAnswer::grounded(text.to_string(), self.confidence, self.citations.clone());
        answer.debug = self.debug.clone();
        Ok(answer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum MarkerMode {
    /// Everything so far could still be the marker.
    Undecided,
    Passing,
    Refusal,
}

struct StreamState {
    deltas: Fuse<TextStream>,
    text: String,
    mode: MarkerMode,
    grounding: Grounding,
    done: bool,
}

fn marker_aware_stream(deltas: TextStream, grounding: Grounding) -> AnswerStream {
    let state = StreamState {
        deltas: deltas.fuse(),
        text: String::new(),
        mode: MarkerMode::Undecided,
        grounding,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }

        loop {
            match state.deltas.next().await {
                Some(Ok(delta)) => {
                    state.text.push_str(&delta);
                    match state.mode {
                        MarkerMode::Passing => return Some((Ok(AnswerEvent::Delta(delta)), state)),
                        MarkerMode::Refusal => continue,
                        MarkerMode::Undecided => {
                            let so_far = state.text.trim_start();
                            if so_far.starts_with(NOT_COVERED_MARKER) {
                                state.mode = MarkerMode::Refusal;
                            } else if !NOT_COVERED_MARKER.starts_with(so_far) {
                                state.mode = MarkerMode::Passing;
                                let held = state.text.clone();
                                return Some((Ok(AnswerEvent::Delta(held)), state));
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                None => {
                    // Held text that ended up not being the marker still goes out.
                    if state.mode == MarkerMode::Undecided && !state.text.trim().is_empty() {
                        state.mode = MarkerMode::Passing;
                        let held = state.text.clone();
                        return Some((Ok(AnswerEvent::Delta(held)), state));
                    }

                    state.done = true;
                    let event = state.grounding.compose(&state.text).map(AnswerEvent::Final);
                    return Some((event, state));
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::QueryIntent;
    use crate::store::{ChunkMatch, EmbeddingStatus, StoredChunk};
    use chrono::Utc;
    use futures::TryStreamExt;
    use uuid::Uuid;

    fn retrieval(similarity: f32, confidence: Confidence) -> Retrieval {
        let settings = RetrievalSettings::default();
        Retrieval {
            intent: QueryIntent::Moment,
            thresholds: settings.moment,
            matches: vec![ChunkMatch {
                chunk: StoredChunk {
                    id: Uuid::new_v4(),
                    transcript_id: "t1".to_string(),
                    channel_id: "UC1".to_string(),
                    video_id: "vid1".to_string(),
                    chunk_index: 0,
                    text: "we benchmark the allocator here".to_string(),
                    start_time: Some(42.0),
                    end_time: Some(80.0),
                    has_timestamps: true,
                    token_count: 8,
                    embedding: vec![1.0, 0.0],
                    embedding_status: EmbeddingStatus::Completed,
                    created_at: Utc::now(),
                },
                video_title: "Allocators".to_string(),
                similarity,
            }],
            confidence,
        }
    }

    fn deltas(parts: &[&str]) -> TextStream {
        let owned: Vec<Result<String>> = parts.iter().map(|p| Ok(p.to_string())).collect();
        stream::iter(owned).boxed()
    }

    async fn collect(parts: &[&str]) -> Vec<AnswerEvent> {
        let grounding = Grounding::new(&retrieval(0.5, Confidence::High), false);
        marker_aware_stream(deltas(parts), grounding)
            .try_collect()
            .await
            .unwrap()
    }

    #[test]
    fn test_compose_grounded_answer() {
        let grounding = Grounding::new(&retrieval(0.5, Confidence::High), false);
        let answer = grounding.compose("  The benchmark is at [1].  ").unwrap();
        assert_eq!(answer.answer, "The benchmark is at [1].");
        assert_eq!(answer.confidence, Confidence::High);
        assert!(answer.show_citations);
        assert!(answer.citations[0].has_timestamp);
        assert!(answer.debug.is_none());
    }

    #[test]
    fn test_compose_marker_is_refusal() {
        let grounding = Grounding::new(&retrieval(0.5, Confidence::High), true);
        let answer = grounding.compose("NOT_COVERED").unwrap();
        assert!(answer.is_refusal);
        assert!(answer.citations.is_empty());
        assert_eq!(answer.evidence.chunks_used, 0);
        assert_eq!(answer.confidence, Confidence::NotCovered);
        assert!(answer.debug.is_some());
    }

    #[test]
    fn test_compose_empty_text_is_error() {
        let grounding = Grounding::new(&retrieval(0.5, Confidence::High), false);
        assert!(grounding.compose("   ").is_err());
    }

    #[tokio::test]
    async fn test_stream_passes_text_through() {
        let events = collect(&["The ", "allocator ", "is at [1]."]).await;
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], AnswerEvent::Delta("The ".to_string()));

        match events.last().unwrap() {
            AnswerEvent::Final(answer) => {
                assert_eq!(answer.answer, "The allocator is at [1].");
                assert!(!answer.is_refusal);
            }
            other => panic!("expected final event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_hides_split_marker() {
        let events = collect(&["NOT_", "COV", "ERED"]).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            AnswerEvent::Final(answer) => assert!(answer.is_refusal),
            other => panic!("expected final event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_releases_held_prefix() {
        // Starts like the marker but diverges.
        let events = collect(&["NOT", " really, see [1]."]).await;
        assert_eq!(events[0], AnswerEvent::Delta("NOT really, see [1].".to_string()));
        assert!(matches!(events.last(), Some(AnswerEvent::Final(a)) if !a.is_refusal));

        // Ends while still ambiguous.
        let events = collect(&["NOT"]).await;
        assert_eq!(events[0], AnswerEvent::Delta("NOT".to_string()));
        assert!(matches!(events.last(), Some(AnswerEvent::Final(a)) if a.answer == "NOT"));
    }
}
