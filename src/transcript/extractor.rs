//! Transcript extraction stage.

use super::{CaptionsProvider, ExtractionStatus, Transcript};
use crate::channel::{ChannelStatus, VideoTranscriptStatus};
use crate::error::{Result, TubechatError};
use crate::queue::{hand_off, WorkStage};
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Progress reported when extraction starts and ends.
const PROGRESS_START: u8 = 5;
const PROGRESS_END: u8 = 50;

/// Per-run video counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtractionStats {
    pub total: usize,
    pub completed: usize,
    pub no_captions: usize,
    pub failed: usize,
}

/// Result of one extraction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionReport {
    pub channel_id: String,
    pub status: ChannelStatus,
    pub stats: ExtractionStats,
    /// Wire name kept for existing clients.
    #[serde(rename = "readyForLayer2")]
    pub ready_for_embedding: bool,
    /// Set when the embedding stage could not be enqueued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoff_error: Option<String>,
}

/// Fetches captions for every video of a channel, one at a time.
pub struct TranscriptExtractor {
    store: Arc<dyn Store>,
    provider: Arc<dyn CaptionsProvider>,
    request_delay: Duration,
}

impl TranscriptExtractor {
    pub fn new(store: Arc<dyn Store>, provider: Arc<dyn CaptionsProvider>, request_delay: Duration) -> Self {
        Self {
            store,
            provider,
            request_delay,
        }
    }

    /// Extract transcripts for a channel's videos and hand off to embedding.
    ///
    /// Videos that already have a completed, non-empty transcript are skipped
    /// without a provider call. Provider failures are recorded per video and
    /// never abort the run.
    #[instrument(skip(self), fields(stage = "extract"))]
    pub async fn run(&self, channel_id: &str) -> Result<ExtractionReport> {
        let mut channel = self
            .store
            .get_channel(channel_id)
            .await?
            .ok_or_else(|| TubechatError::ChannelNotFound(channel_id.to_string()))?;
        let videos = self.store.list_videos(channel_id).await?;

        if !channel.status.can_advance_to(ChannelStatus::Extracting) {
            channel.begin_run();
        }
        channel.error_message = None;
        channel.advance(ChannelStatus::Extracting, PROGRESS_START);
        self.store.save_channel(&channel).await?;

        info!("Extracting transcripts for {} videos", videos.len());

        let mut stats = ExtractionStats {
            total: videos.len(),
            ..Default::default()
        };
        let mut called_provider = false;

        for (i, video) in videos.iter().enumerate() {
            let existing = self
                .store
                .get_transcript_for_video(channel_id, &video.video_id)
                .await?;

            if existing.as_ref().is_some_and(|t| t.is_usable()) {
                debug!(video_id = %video.video_id, "Transcript already extracted, skipping");
                stats.completed += 1;
                if video.transcript_status != VideoTranscriptStatus::Completed {
                    self.store
                        .set_video_status(channel_id, &video.video_id, VideoTranscriptStatus::Completed)
                        .await?;
                }
                continue;
            }

            if called_provider && !self.request_delay.is_zero() {
                tokio::time::sleep(self.request_delay).await;
            }
            called_provider = true;

            self.store
                .set_video_status(channel_id, &video.video_id, VideoTranscriptStatus::Processing)
                .await?;

            let mut transcript = match self.provider.fetch(&video.video_id).await {
                Ok(captions) => {
                    stats.completed += 1;
                    Transcript::completed(channel_id, &video.video_id, captions.segments, captions.confidence)
                }
                Err(TubechatError::NoCaptions(_)) => {
                    debug!(video_id = %video.video_id, "No captions");
                    stats.no_captions += 1;
                    Transcript::unsuccessful(
                        channel_id,
                        &video.video_id,
                        ExtractionStatus::NoCaptions,
                        "No captions available for this video".to_string(),
                    )
                }
                Err(e) => {
                    warn!(video_id = %video.video_id, "Caption extraction failed: {}", e);
                    stats.failed += 1;
                    Transcript::unsuccessful(channel_id, &video.video_id, ExtractionStatus::Failed, e.to_string())
                }
            };

            if let Some(previous) = existing {
                transcript.id = previous.id;
                transcript.created_at = previous.created_at;
            }
            self.store.save_transcript(&transcript).await?;

            let video_status = match transcript.extraction_status {
                ExtractionStatus::Completed => VideoTranscriptStatus::Completed,
                ExtractionStatus::NoCaptions => VideoTranscriptStatus::NoTranscript,
                ExtractionStatus::Failed => VideoTranscriptStatus::Failed,
            };
            self.store
                .set_video_status(channel_id, &video.video_id, video_status)
                .await?;

            channel.advance(ChannelStatus::Extracting, stage_progress(i + 1, videos.len()));
            self.store.save_channel(&channel).await?;
        }

        let mut handoff_error = None;
        if stats.completed > 0 {
            channel.advance(ChannelStatus::Processing, PROGRESS_END);
            self.store.save_channel(&channel).await?;
            handoff_error = hand_off(self.store.as_ref(), channel_id, WorkStage::Embed).await;
        } else if stats.total > 0 && stats.no_captions == stats.total {
            channel.advance(ChannelStatus::NoCaptions, 100);
            channel.error_message = Some(format!(
                "None of the {} selected videos have captions",
                stats.total
            ));
            self.store.save_channel(&channel).await?;
        } else {
            channel.advance(ChannelStatus::Failed, 100);
            channel.error_message = Some(if stats.total == 0 {
                "No videos to extract transcripts from".to_string()
            } else {
                format!(
                    "Transcript extraction failed ({} failed, {} without captions)",
                    stats.failed, stats.no_captions
                )
            });
            self.store.save_channel(&channel).await?;
        }

        info!(
            completed = stats.completed,
            no_captions = stats.no_captions,
            failed = stats.failed,
            status = %channel.status,
            "Extraction finished"
        );

        Ok(ExtractionReport {
            channel_id: channel_id.to_string(),
            status: channel.status,
            stats,
            ready_for_embedding: stats.completed > 0,
            handoff_error,
        })
    }
}

fn stage_progress(done: usize, total: usize) -> u8 {
    if total == 0 {
        return PROGRESS_END;
    }
    let span = (PROGRESS_END - PROGRESS_START) as usize;
    PROGRESS_START + (span * done / total) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelProfile, ContentType, ContentTypes, ImportSettings, Video};
    use crate::queue::WorkStatus;
    use crate::store::SqliteStore;
    use crate::transcript::{Captions, TranscriptSegment};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Captions keyed by video id; absent ids have no captions, "boom" fails.
    struct StubCaptions {
        captions: HashMap<String, Vec<TranscriptSegment>>,
        calls: Mutex<Vec<(String, Instant)>>,
    }

    impl StubCaptions {
        fn new(with_captions: &[&str]) -> Self {
            let captions = with_captions
                .iter()
                .map(|id| {
                    (
                        id.to_string(),
                        vec![TranscriptSegment::new(format!("captions of {}", id), 0.0, 3.0)],
                    )
                })
                .collect();
            Self {
                captions,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CaptionsProvider for StubCaptions {
        async fn fetch(&self, video_id: &str) -> Result<Captions> {
            self.calls.lock().unwrap().push((video_id.to_string(), Instant::now()));
            if video_id == "boom" {
                return Err(TubechatError::ProviderRateLimited("slow down".to_string()));
            }
            match self.captions.get(video_id) {
                Some(segments) => Ok(Captions {
                    segments: segments.clone(),
                    confidence: 1.0,
                }),
                None => Err(TubechatError::NoCaptions(video_id.to_string())),
            }
        }
    }

    async fn seeded_store(video_ids: &[&str]) -> Arc<SqliteStore> {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let profile = ChannelProfile {
            channel_id: "UC1".to_string(),
            name: "Ferris Codes".to_string(),
            avatar_url: None,
            subscriber_count: None,
            uploads_playlist_id: None,
        };
        let channel = Channel::new(&profile, ContentTypes::default(), ImportSettings::default());
        store.save_channel(&channel).await.unwrap();

        let videos: Vec<Video> = video_ids
            .iter()
            .map(|id| Video {
                channel_id: "UC1".to_string(),
                video_id: id.to_string(),
                title: format!("Video {}", id),
                published_at: None,
                duration_seconds: Some(600),
                thumbnail_url: None,
                content_type: ContentType::Video,
                transcript_status: VideoTranscriptStatus::Pending,
            })
            .collect();
        store.insert_videos(&videos).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_partial_captions_hand_off_to_embedding() {
        let store = seeded_store(&["a", "b", "c"]).await;
        let provider = Arc::new(StubCaptions::new(&["a", "b"]));
        let extractor = TranscriptExtractor::new(store.clone(), provider, Duration::ZERO);

        let report = extractor.run("UC1").await.unwrap();
        assert_eq!(report.stats.total, 3);
        assert_eq!(report.stats.completed, 2);
        assert_eq!(report.stats.no_captions, 1);
        assert_eq!(report.status, ChannelStatus::Processing);
        assert!(report.ready_for_embedding);
        assert!(report.handoff_error.is_none());

        let work = store.list_work("UC1", 10).await.unwrap();
        assert_eq!(work.len(), 1);
        assert_eq!(work[0].stage, WorkStage::Embed);
        assert_eq!(work[0].status, WorkStatus::Pending);

        let videos = store.list_videos("UC1").await.unwrap();
        let c = videos.iter().find(|v| v.video_id == "c").unwrap();
        assert_eq!(c.transcript_status, VideoTranscriptStatus::NoTranscript);
    }

    #[tokio::test]
    async fn test_all_without_captions() {
        let store = seeded_store(&["a", "b"]).await;
        let extractor = TranscriptExtractor::new(store.clone(), Arc::new(StubCaptions::new(&[])), Duration::ZERO);

        let report = extractor.run("UC1").await.unwrap();
        assert_eq!(report.status, ChannelStatus::NoCaptions);
        assert!(!report.ready_for_embedding);

        let channel = store.get_channel("UC1").await.unwrap().unwrap();
        assert!(channel.error_message.is_some());
        assert!(store.list_work("UC1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provider_errors_fail_channel_without_aborting() {
        let store = seeded_store(&["boom", "x"]).await;
        let provider = Arc::new(StubCaptions::new(&[]));
        let extractor = TranscriptExtractor::new(store.clone(), provider.clone(), Duration::ZERO);

        let report = extractor.run("UC1").await.unwrap();
        assert_eq!(report.stats.failed, 1);
        assert_eq!(report.stats.no_captions, 1);
        assert_eq!(report.status, ChannelStatus::Failed);
        assert_eq!(provider.calls().len(), 2);

        let failed = store.get_transcript_for_video("UC1", "boom").await.unwrap().unwrap();
        assert_eq!(failed.extraction_status, ExtractionStatus::Failed);
        assert!(failed.error_message.unwrap().contains("retry later"));
    }

    #[tokio::test]
    async fn test_rerun_skips_completed_videos() {
        let store = seeded_store(&["a", "b"]).await;
        let provider = Arc::new(StubCaptions::new(&["a"]));
        let extractor = TranscriptExtractor::new(store.clone(), provider.clone(), Duration::ZERO);

        extractor.run("UC1").await.unwrap();
        let first_id = store.get_transcript_for_video("UC1", "a").await.unwrap().unwrap().id;
        assert_eq!(provider.calls().len(), 2);

        let report = extractor.run("UC1").await.unwrap();
        assert_eq!(report.stats.completed, 1);
        // Only the video without captions is asked again.
        let calls = provider.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].0, "b");

        let again = store.get_transcript_for_video("UC1", "a").await.unwrap().unwrap();
        assert_eq!(again.id, first_id);
    }

    #[tokio::test]
    async fn test_delay_between_provider_calls() {
        let store = seeded_store(&["a", "b", "c"]).await;
        let provider = Arc::new(StubCaptions::new(&["a", "b", "c"]));
        let delay = Duration::from_millis(30);
        let extractor = TranscriptExtractor::new(store, provider.clone(), delay);

        extractor.run("UC1").await.unwrap();
        let calls = provider.calls();
        assert_eq!(calls.len(), 3);
        for pair in calls.windows(2) {
            assert!(pair[1].1.duration_since(pair[0].1) >= delay);
        }
    }

    #[test]
    fn test_stage_progress() {
        assert_eq!(stage_progress(0, 4), 5);
        assert_eq!(stage_progress(2, 4), 27);
        assert_eq!(stage_progress(4, 4), 50);
    }
}
