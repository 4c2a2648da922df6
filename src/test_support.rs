//! Stub providers shared by unit tests.

use crate::channel::{ChannelLister, ChannelProfile, ChannelRef, ImportMode, VideoListing};
use crate::config::Settings;
use crate::embedding::Embedder;
use crate::error::Result;
use crate::orchestrator::{Components, Orchestrator};
use crate::rag::{AnswerGenerator, GenerationRequest};
use crate::store::SqliteStore;
use crate::transcript::{Captions, CaptionsProvider, TranscriptSegment};
use async_trait::async_trait;
use std::sync::Arc;

/// Resolves every reference to `UC1` with a single ten-minute upload.
pub struct OneVideoLister;

#[async_trait]
impl ChannelLister for OneVideoLister {
    async fn resolve(&self, _reference: &ChannelRef) -> Result<ChannelProfile> {
        Ok(ChannelProfile {
            channel_id: "UC1".to_string(),
            name: "Ferris Codes".to_string(),
            avatar_url: None,
            subscriber_count: None,
            uploads_playlist_id: None,
        })
    }

    async fn list_uploads(
        &self,
        _profile: &ChannelProfile,
        _mode: ImportMode,
        _ceiling: usize,
    ) -> Result<Vec<VideoListing>> {
        Ok(vec![VideoListing {
            video_id: "vid1".to_string(),
            title: "Ownership".to_string(),
            published_at: None,
            duration_seconds: Some(600),
            thumbnail_url: None,
            explicit_type: None,
        }])
    }
}

pub struct FixedCaptions;

#[async_trait]
impl CaptionsProvider for FixedCaptions {
    async fn fetch(&self, _video_id: &str) -> Result<Captions> {
        Ok(Captions {
            segments: vec![
                TranscriptSegment::new("Ownership means one owner", 0.0, 3.0),
                TranscriptSegment::new("at a time", 3.0, 5.0),
            ],
            confidence: 1.0,
        })
    }
}

/// Embeds everything onto the same unit vector.
pub struct UnitEmbedder;

#[async_trait]
impl Embedder for UnitEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![1.0, 0.0])
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
    }

    fn dimensions(&self) -> usize {
        2
    }
}

pub struct EchoGenerator;

#[async_trait]
impl AnswerGenerator for EchoGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        Ok(format!("About {}", request.question))
    }
}

/// Orchestrator over the stubs with no inter-request delay.
pub fn stub_orchestrator(store: Arc<SqliteStore>) -> Orchestrator {
    let mut settings = Settings::default();
    settings.captions.request_delay_ms = 0;
    Orchestrator::with_components(
        settings,
        Components {
            store,
            lister: Arc::new(OneVideoLister),
            captions: Arc::new(FixedCaptions),
            embedder: Arc::new(UnitEmbedder),
            generator: Arc::new(EchoGenerator),
        },
    )
}
