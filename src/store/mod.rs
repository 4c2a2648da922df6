//! Persistence for channels, videos, transcripts, chunks and chat state.
//!
//! Provides a trait-based interface so pipeline stages depend on typed
//! operations rather than on a storage engine.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::channel::{Channel, Video, VideoTranscriptStatus};
use crate::error::Result;
use crate::queue::{WorkItem, WorkStatus};
use crate::rag::{Citation, Role};
use crate::transcript::Transcript;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Embedding state of a persisted chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingStatus {
    Completed,
}

str_enum!(EmbeddingStatus {
    Completed => "completed",
});

/// A transcript chunk with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub id: Uuid,
    pub transcript_id: String,
    pub channel_id: String,
    pub video_id: String,
    pub chunk_index: usize,
    pub text: String,
    /// `None` exactly when the source segments had no valid timestamps.
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub has_timestamps: bool,
    pub token_count: usize,
    pub embedding: Vec<f32>,
    pub embedding_status: EmbeddingStatus,
    pub created_at: DateTime<Utc>,
}

/// A chunk returned by similarity search.
#[derive(Debug, Clone)]
pub struct ChunkMatch {
    pub chunk: StoredChunk,
    pub video_title: String,
    /// Cosine similarity with the query embedding.
    pub similarity: f32,
}

/// One user's conversation with one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub user_id: String,
    pub channel_id: String,
    pub created_at: DateTime<Utc>,
}

/// An immutable chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: Role,
    pub content: String,
    pub sources: Vec<Citation>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(session_id: Uuid, role: Role, content: String, sources: Vec<Citation>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            role,
            content,
            sources,
            created_at: Utc::now(),
        }
    }
}

/// A chat request remembered for deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub idempotency_key: String,
    pub request_hash: String,
    /// `None` while the claiming request is still being answered.
    pub response_json: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Typed data-store operations used by the pipeline and chat.
#[async_trait]
pub trait Store: Send + Sync {
    // Channels

    async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>>;

    /// Insert or replace by `channel_id`.
    async fn save_channel(&self, channel: &Channel) -> Result<()>;

    async fn link_user_channel(&self, user_id: &str, channel_id: &str) -> Result<()>;

    // Videos

    async fn list_videos(&self, channel_id: &str) -> Result<Vec<Video>>;

    /// Insert videos not already present. Returns the number inserted.
    async fn insert_videos(&self, videos: &[Video]) -> Result<usize>;

    async fn set_video_status(
        &self,
        channel_id: &str,
        video_id: &str,
        status: VideoTranscriptStatus,
    ) -> Result<()>;

    // Transcripts

    async fn get_transcript(&self, transcript_id: &str) -> Result<Option<Transcript>>;

    async fn get_transcript_for_video(
        &self,
        channel_id: &str,
        video_id: &str,
    ) -> Result<Option<Transcript>>;

    /// Insert or replace by `(channel_id, video_id)`.
    async fn save_transcript(&self, transcript: &Transcript) -> Result<()>;

    /// Completed transcripts of a channel that have no embedded chunk yet.
    async fn transcripts_pending_embedding(&self, channel_id: &str) -> Result<Vec<Transcript>>;

    // Chunks

    /// Atomically delete a transcript's chunks and insert `chunks`.
    async fn replace_chunks(&self, transcript_id: &str, chunks: &[StoredChunk]) -> Result<usize>;

    async fn chunks_for_transcript(&self, transcript_id: &str) -> Result<Vec<StoredChunk>>;

    /// Top `limit` chunks of a channel with similarity `>= min_score`, best first.
    async fn search_chunks(
        &self,
        channel_id: &str,
        query_embedding: &[f32],
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<ChunkMatch>>;

    /// Distinct videos of a channel that have at least one embedded chunk.
    async fn count_indexed_videos(&self, channel_id: &str) -> Result<u32>;

    // Operation locks

    /// Take the named lease unless a live one is held by another owner.
    async fn try_acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    async fn release_lock(&self, key: &str, owner: &str) -> Result<()>;

    // Work queue

    async fn enqueue_work(&self, item: &WorkItem) -> Result<()>;

    /// Oldest pending item for a channel.
    async fn next_pending_work(&self, channel_id: &str) -> Result<Option<WorkItem>>;

    async fn update_work(&self, id: Uuid, status: WorkStatus, error: Option<&str>) -> Result<()>;

    /// Return items left `running` by a crashed invocation to `pending`.
    async fn requeue_running_work(&self, channel_id: &str) -> Result<usize>;

    async fn list_work(&self, channel_id: &str, limit: usize) -> Result<Vec<WorkItem>>;

    // Chat

    async fn get_or_create_session(&self, user_id: &str, channel_id: &str) -> Result<ChatSession>;

    async fn append_message(&self, message: &ChatMessage) -> Result<()>;

    /// The last `limit` messages of a session, oldest first.
    async fn recent_messages(&self, session_id: Uuid, limit: usize) -> Result<Vec<ChatMessage>>;

    async fn find_request(&self, idempotency_key: &str) -> Result<Option<RequestRecord>>;

    /// Claim an idempotency key before answering. Returns `false` when the key
    /// is answered already or was claimed less than `ttl` ago.
    async fn claim_request(&self, idempotency_key: &str, request_hash: &str, ttl: Duration) -> Result<bool>;

    /// Store the response of a claimed request.
    async fn complete_request(&self, idempotency_key: &str, response_json: &str) -> Result<()>;

    /// Drop an unanswered claim so the key can be retried.
    async fn release_request(&self, idempotency_key: &str) -> Result<()>;

    // Usage counters

    async fn message_count(&self, user_id: &str, period: &str) -> Result<u32>;

    async fn increment_message_count(&self, user_id: &str, period: &str) -> Result<u32>;
}

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);

        let c = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &c)).abs() < 0.001);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) + 1.0).abs() < 0.001);
    }

    #[test]
    fn test_cosine_similarity_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
