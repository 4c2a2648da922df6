//! Chunking and embedding stage.

use super::Embedder;
use crate::channel::{ChannelStatus, VideoTranscriptStatus};
use crate::chunking::{chunk_segments, ChunkingConfig};
use crate::config::{ChunkingSettings, EmbeddingSettings};
use crate::error::{Result, TubechatError};
use crate::store::{EmbeddingStatus, Store, StoredChunk};
use crate::transcript::Transcript;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const PROGRESS_START: u8 = 50;
const PROGRESS_END: u8 = 95;

/// Which transcripts an indexing run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexTarget {
    /// These transcripts, re-embedded even when they already have chunks.
    Transcripts(Vec<String>),
    /// Completed transcripts of a channel that have no embedded chunk yet.
    Channel(String),
}

/// Result of an indexing run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexReport {
    pub processed: usize,
    pub chunks_created: usize,
    pub chunks_with_timestamps: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Chunks completed transcripts, embeds the chunks in batches and replaces
/// each transcript's stored chunks.
pub struct ChunkIndexer {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    chunking: ChunkingConfig,
    batch_size: usize,
}

impl ChunkIndexer {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
        chunking: &ChunkingSettings,
        embedding: &EmbeddingSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            chunking: ChunkingConfig::from(chunking),
            batch_size: embedding.batch_size.max(1),
        }
    }

    #[instrument(skip(self), fields(stage = "embed"))]
    pub async fn run(&self, target: &IndexTarget) -> Result<IndexReport> {
        let mut report = IndexReport::default();
        let transcripts = self.select(target, &mut report).await?;

        let channels: BTreeSet<String> = match target {
            IndexTarget::Channel(channel_id) => BTreeSet::from([channel_id.clone()]),
            IndexTarget::Transcripts(_) => transcripts.iter().map(|t| t.channel_id.clone()).collect(),
        };

        info!("Indexing {} transcripts", transcripts.len());

        for (i, transcript) in transcripts.iter().enumerate() {
            match self.index_transcript(transcript).await {
                Ok((created, timed)) => {
                    report.processed += 1;
                    report.chunks_created += created;
                    report.chunks_with_timestamps += timed;
                }
                Err(e) => {
                    warn!(
                        transcript_id = %transcript.id,
                        video_id = %transcript.video_id,
                        "Failed to index transcript: {}",
                        e
                    );
                    report.failed += 1;
                    report.errors.push(format!("{}: {}", transcript.video_id, e));
                }
            }

            if let IndexTarget::Channel(channel_id) = target {
                self.report_progress(channel_id, i + 1, transcripts.len()).await?;
            }
        }

        for channel_id in &channels {
            self.finalize_channel(channel_id).await?;
        }

        info!(
            processed = report.processed,
            chunks = report.chunks_created,
            failed = report.failed,
            "Indexing finished"
        );
        Ok(report)
    }

    async fn select(&self, target: &IndexTarget, report: &mut IndexReport) -> Result<Vec<Transcript>> {
        match target {
            IndexTarget::Channel(channel_id) => {
                if self.store.get_channel(channel_id).await?.is_none() {
                    return Err(TubechatError::ChannelNotFound(channel_id.clone()));
                }
                self.store.transcripts_pending_embedding(channel_id).await
            }
            IndexTarget::Transcripts(ids) => {
                let mut transcripts = Vec::with_capacity(ids.len());
                let mut unknown = Vec::new();
                for id in ids {
                    match self.store.get_transcript(id).await? {
                        Some(t) if t.is_usable() => transcripts.push(t),
                        Some(t) => {
                            report.failed += 1;
                            report.errors.push(format!(
                                "{}: transcript is {}, nothing to embed",
                                t.video_id, t.extraction_status
                            ));
                        }
                        None => {
                            report.failed += 1;
                            report.errors.push(format!("{}: transcript not found", id));
                            unknown.push(id.as_str());
                        }
                    }
                }
                if !ids.is_empty() && unknown.len() == ids.len() {
                    return Err(TubechatError::TranscriptNotFound(unknown.join(", ")));
                }
                Ok(transcripts)
            }
        }
    }

    /// Chunk and embed one transcript. Returns `(chunks stored, chunks with timestamps)`.
    ///
    /// A failed batch is skipped; its chunks are simply not stored. When no
    /// batch succeeds the previous chunks are left in place.
    #[instrument(skip(self, transcript), fields(transcript_id = %transcript.id, video_id = %transcript.video_id))]
    async fn index_transcript(&self, transcript: &Transcript) -> Result<(usize, usize)> {
        let chunks = chunk_segments(&transcript.segments, &self.chunking);
        if chunks.is_empty() {
            return Err(TubechatError::Embedding("transcript produced no chunks".to_string()));
        }

        let mut stored = Vec::with_capacity(chunks.len());
        let mut failed_batches = 0usize;

        for (batch_index, batch) in chunks.chunks(self.batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let embeddings = match self.embedder.embed_batch(&texts).await {
                Ok(embeddings) => embeddings,
                Err(e) => {
                    warn!(batch_index, size = batch.len(), "Embedding batch failed, continuing: {}", e);
                    failed_batches += 1;
                    continue;
                }
            };

            let now = Utc::now();
            for (chunk, embedding) in batch.iter().zip(embeddings) {
                stored.push(StoredChunk {
                    id: Uuid::new_v4(),
                    transcript_id: transcript.id.clone(),
                    channel_id: transcript.channel_id.clone(),
                    video_id: transcript.video_id.clone(),
                    chunk_index: chunk.chunk_index,
                    text: chunk.text.clone(),
                    start_time: chunk.start_time,
                    end_time: chunk.end_time,
                    has_timestamps: chunk.has_timestamps(),
                    token_count: chunk.token_count,
                    embedding,
                    embedding_status: EmbeddingStatus::Completed,
                    created_at: now,
                });
            }
        }

        if stored.is_empty() {
            return Err(TubechatError::Embedding(format!(
                "all {} embedding batches failed",
                failed_batches
            )));
        }

        let timed = stored.iter().filter(|c| c.has_timestamps).count();
        self.store.replace_chunks(&transcript.id, &stored).await?;

        debug!(
            chunks = chunks.len(),
            stored = stored.len(),
            failed_batches,
            "Indexed transcript"
        );
        Ok((stored.len(), timed))
    }

    async fn report_progress(&self, channel_id: &str, done: usize, total: usize) -> Result<()> {
        let Some(mut channel) = self.store.get_channel(channel_id).await? else {
            return Ok(());
        };
        if channel.status != ChannelStatus::Processing {
            return Ok(());
        }

        let span = (PROGRESS_END - PROGRESS_START) as usize;
        let progress = PROGRESS_START + (span * done / total.max(1)) as u8;
        if channel.advance(ChannelStatus::Processing, progress) {
            self.store.save_channel(&channel).await?;
        }
        Ok(())
    }

    /// Settle the channel's terminal status from what is now indexed.
    ///
    /// A channel that another run has moved back to an earlier stage only gets
    /// its counters refreshed.
    async fn finalize_channel(&self, channel_id: &str) -> Result<()> {
        let Some(mut channel) = self.store.get_channel(channel_id).await? else {
            return Ok(());
        };

        let videos = self.store.list_videos(channel_id).await?;
        let total = videos.len() as u32;
        let indexed = self.store.count_indexed_videos(channel_id).await?;
        channel.set_counts(indexed, total);

        if channel.status == ChannelStatus::Processing || channel.status.is_terminal() {
            let without_captions = videos
                .iter()
                .filter(|v| v.transcript_status == VideoTranscriptStatus::NoTranscript)
                .count();

            let (status, message) = if indexed == 0 {
                (ChannelStatus::Failed, Some("No transcript could be indexed".to_string()))
            } else if indexed < total {
                (
                    ChannelStatus::Partial,
                    Some(format!(
                        "Indexed {} of {} videos ({} without captions)",
                        indexed, total, without_captions
                    )),
                )
            } else {
                (ChannelStatus::Completed, None)
            };

            channel.advance(status, 100);
            channel.error_message = message;
            info!(channel_id, status = %status, indexed, total, "Channel indexing settled");
        }

        self.store.save_channel(&channel).await
    }
}
