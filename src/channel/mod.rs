//! Channels, videos and the channel/video listing provider.
//!
//! A [`Channel`] carries both display metadata and the ingestion state that
//! every pipeline stage updates. [`ChannelLister`] abstracts the external
//! listing API; [`ChannelResolver`] is the first pipeline stage.

mod reference;
mod resolver;
mod youtube;

pub use reference::ChannelRef;
pub use resolver::{classify_content_type, select_videos, ChannelResolver, ResolveOutcome, ResolveRequest};
pub use youtube::{parse_iso8601_duration, YoutubeDataApi};

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ingestion state of a channel.
///
/// Ordered by pipeline stage; within one run a channel never moves back to an
/// earlier stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Pending,
    Extracting,
    Processing,
    Completed,
    Partial,
    Failed,
    NoCaptions,
}

str_enum!(ChannelStatus {
    Pending => "pending",
    Extracting => "extracting",
    Processing => "processing",
    Completed => "completed",
    Partial => "partial",
    Failed => "failed",
    NoCaptions => "no_captions",
});

impl ChannelStatus {
    /// Pipeline stage this status belongs to. Terminal states share the last rank.
    pub fn stage_rank(&self) -> u8 {
        match self {
            ChannelStatus::Pending => 0,
            ChannelStatus::Extracting => 1,
            ChannelStatus::Processing => 2,
            ChannelStatus::Completed
            | ChannelStatus::Partial
            | ChannelStatus::Failed
            | ChannelStatus::NoCaptions => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage_rank() == 3
    }

    /// Whether moving from `self` to `next` keeps the run monotonic.
    pub fn can_advance_to(&self, next: ChannelStatus) -> bool {
        next.stage_rank() >= self.stage_rank()
    }
}

/// Kind of upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Video,
    Short,
    Live,
}

str_enum!(ContentType {
    Video => "video",
    Short => "short",
    Live => "live",
});

/// Which content types a channel ingests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentTypes {
    #[serde(default = "default_true", alias = "ingestVideos")]
    pub videos: bool,
    #[serde(default, alias = "ingestShorts")]
    pub shorts: bool,
    #[serde(default, alias = "ingestLives")]
    pub lives: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ContentTypes {
    fn default() -> Self {
        Self {
            videos: true,
            shorts: false,
            lives: false,
        }
    }
}

impl ContentTypes {
    pub fn allows(&self, content_type: ContentType) -> bool {
        match content_type {
            ContentType::Video => self.videos,
            ContentType::Short => self.shorts,
            ContentType::Live => self.lives,
        }
    }
}

/// Which end of the upload history to import from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    #[default]
    Latest,
    Oldest,
    All,
}

str_enum!(ImportMode {
    Latest => "latest",
    Oldest => "oldest",
    All => "all",
});

/// Import policy for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSettings {
    #[serde(default)]
    pub mode: ImportMode,
    /// Per-request limit. Ignored for [`ImportMode::All`].
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            mode: ImportMode::Latest,
            limit: Some(25),
        }
    }
}

/// A creator channel and its ingestion state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub channel_id: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub subscriber_count: Option<u64>,
    pub content_types: ContentTypes,
    pub import_settings: ImportSettings,
    pub status: ChannelStatus,
    /// 0..=100
    pub progress: u8,
    pub error_message: Option<String>,
    pub indexed_videos: u32,
    pub total_videos: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    /// Create a channel record in the `pending` state.
    pub fn new(
        profile: &ChannelProfile,
        content_types: ContentTypes,
        import_settings: ImportSettings,
    ) -> Self {
        let now = Utc::now();
        Self {
            channel_id: profile.channel_id.clone(),
            name: profile.name.clone(),
            avatar_url: profile.avatar_url.clone(),
            subscriber_count: profile.subscriber_count,
            content_types,
            import_settings,
            status: ChannelStatus::Pending,
            progress: 0,
            error_message: None,
            indexed_videos: 0,
            total_videos: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reset ingestion state for a fresh run.
    pub fn begin_run(&mut self) {
        self.status = ChannelStatus::Pending;
        self.progress = 0;
        self.error_message = None;
        self.updated_at = Utc::now();
    }

    /// Move to `status` with `progress`.
    ///
    /// Returns false and leaves the record untouched when the move would go
    /// back to an earlier stage.
    pub fn advance(&mut self, status: ChannelStatus, progress: u8) -> bool {
        if !self.status.can_advance_to(status) {
            return false;
        }
        self.status = status;
        self.progress = progress.min(100);
        self.updated_at = Utc::now();
        true
    }

    /// Update counters, keeping `indexed_videos <= total_videos`.
    pub fn set_counts(&mut self, indexed_videos: u32, total_videos: u32) {
        self.total_videos = total_videos;
        self.indexed_videos = indexed_videos.min(total_videos);
    }

    /// Refresh display metadata from a newer profile lookup.
    pub fn apply_profile(&mut self, profile: &ChannelProfile) {
        self.name = profile.name.clone();
        self.avatar_url = profile.avatar_url.clone();
        self.subscriber_count = profile.subscriber_count;
    }
}

/// Per-video transcript state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoTranscriptStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    NoTranscript,
}

str_enum!(VideoTranscriptStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    NoTranscript => "no_transcript",
});

/// A video selected for ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub channel_id: String,
    pub video_id: String,
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<u32>,
    pub thumbnail_url: Option<String>,
    pub content_type: ContentType,
    pub transcript_status: VideoTranscriptStatus,
}

impl Video {
    /// Build a pending video row from a listing entry.
    pub fn from_listing(channel_id: &str, listing: &VideoListing) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            video_id: listing.video_id.clone(),
            title: listing.title.clone(),
            published_at: listing.published_at,
            duration_seconds: listing.duration_seconds,
            thumbnail_url: listing.thumbnail_url.clone(),
            content_type: classify_content_type(listing.explicit_type, listing.duration_seconds),
            transcript_status: VideoTranscriptStatus::Pending,
        }
    }

    /// Watch URL, optionally seeking to `seconds`.
    pub fn watch_url(video_id: &str, seconds: Option<f64>) -> String {
        match seconds {
            Some(s) => format!("https://youtube.com/watch?v={}&t={}s", video_id, s.max(0.0) as u32),
            None => format!("https://youtube.com/watch?v={}", video_id),
        }
    }
}

/// Channel identity and display metadata returned by the listing provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelProfile {
    pub channel_id: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub subscriber_count: Option<u64>,
    /// Playlist holding every upload, when the provider exposes one.
    pub uploads_playlist_id: Option<String>,
}

/// One upload as reported by the listing provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoListing {
    pub video_id: String,
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<u32>,
    pub thumbnail_url: Option<String>,
    /// Type reported by the provider, when it reports one.
    pub explicit_type: Option<ContentType>,
}

/// Channel/video listing API.
#[async_trait]
pub trait ChannelLister: Send + Sync {
    /// Resolve a parsed reference to the channel's stable identity.
    async fn resolve(&self, reference: &ChannelRef) -> Result<ChannelProfile>;

    /// List up to `ceiling` uploads, newest first.
    ///
    /// With [`ImportMode::Oldest`] the window holds the channel's earliest
    /// uploads, otherwise its most recent ones.
    async fn list_uploads(
        &self,
        profile: &ChannelProfile,
        mode: ImportMode,
        ceiling: usize,
    ) -> Result<Vec<VideoListing>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ChannelProfile {
        ChannelProfile {
            channel_id: "UCabcdefghijklmnopqrstuv".to_string(),
            name: "Ferris Codes".to_string(),
            avatar_url: None,
            subscriber_count: Some(1200),
            uploads_playlist_id: None,
        }
    }

    #[test]
    fn test_status_is_monotonic() {
        let mut channel = Channel::new(&profile(), ContentTypes::default(), ImportSettings::default());
        assert!(channel.advance(ChannelStatus::Extracting, 10));
        assert!(channel.advance(ChannelStatus::Processing, 50));
        assert!(!channel.advance(ChannelStatus::Extracting, 20));
        assert_eq!(channel.status, ChannelStatus::Processing);
        assert_eq!(channel.progress, 50);

        channel.begin_run();
        assert_eq!(channel.status, ChannelStatus::Pending);
        assert_eq!(channel.progress, 0);
    }

    #[test]
    fn test_progress_clamped_and_counts_bounded() {
        let mut channel = Channel::new(&profile(), ContentTypes::default(), ImportSettings::default());
        channel.advance(ChannelStatus::Completed, 250);
        assert_eq!(channel.progress, 100);

        channel.set_counts(7, 5);
        assert_eq!(channel.indexed_videos, 5);
        assert_eq!(channel.total_videos, 5);
    }

    #[test]
    fn test_status_string_roundtrip() {
        assert_eq!(ChannelStatus::NoCaptions.as_str(), "no_captions");
        assert_eq!("partial".parse::<ChannelStatus>().unwrap(), ChannelStatus::Partial);
        assert!("exploded".parse::<ChannelStatus>().is_err());
    }

    #[test]
    fn test_content_types_accept_ingest_aliases() {
        let types: ContentTypes =
            serde_json::from_str(r#"{"ingestVideos": false, "ingestShorts": true}"#).unwrap();
        assert!(!types.videos);
        assert!(types.shorts);
        assert!(!types.lives);
    }

    #[test]
    fn test_watch_url() {
        assert_eq!(
            Video::watch_url("dQw4w9WgXcQ", Some(125.7)),
            "https://youtube.com/watch?v=dQw4w9WgXcQ&t=125s"
        );
        assert_eq!(
            Video::watch_url("dQw4w9WgXcQ", None),
            "https://youtube.com/watch?v=dQw4w9WgXcQ"
        );
    }
}
