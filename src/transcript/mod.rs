//! Caption transcripts and the extraction stage.

mod captions;
mod extractor;

pub use captions::{map_response, normalize_segments, Captions, CaptionsProvider, HttpCaptionsProvider};
pub use extractor::{ExtractionReport, ExtractionStats, TranscriptExtractor};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A timed piece of caption text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub text: String,
    /// Start time in seconds.
    pub start: f64,
    /// End time in seconds.
    pub end: f64,
}

impl TranscriptSegment {
    pub fn new(text: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            text: text.into(),
            start,
            end,
        }
    }
}

/// Whether a segment list carries usable timing.
///
/// Providers that lack timing report `start == end` sentinels; one segment
/// with a positive span is enough to trust the whole list.
pub fn has_valid_timestamps(segments: &[TranscriptSegment]) -> bool {
    segments.iter().any(|s| s.end > s.start)
}

/// Format seconds as `MM:SS` or `H:MM:SS`.
pub fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

/// Outcome of extracting one video's captions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Completed,
    NoCaptions,
    Failed,
}

str_enum!(ExtractionStatus {
    Completed => "completed",
    NoCaptions => "no_captions",
    Failed => "failed",
});

/// Stored transcript of one video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub id: String,
    pub channel_id: String,
    pub video_id: String,
    pub full_text: String,
    /// Non-empty whenever `extraction_status` is `completed`.
    pub segments: Vec<TranscriptSegment>,
    pub extraction_status: ExtractionStatus,
    /// Share of segments whose timing came straight from the provider.
    pub confidence: f32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transcript {
    /// A completed transcript built from normalized segments.
    pub fn completed(
        channel_id: &str,
        video_id: &str,
        segments: Vec<TranscriptSegment>,
        confidence: f32,
    ) -> Self {
        let full_text = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        Self::with_status(
            channel_id,
            video_id,
            full_text,
            segments,
            ExtractionStatus::Completed,
            confidence,
            None,
        )
    }

    /// A transcript record for a video whose extraction did not succeed.
    pub fn unsuccessful(
        channel_id: &str,
        video_id: &str,
        status: ExtractionStatus,
        error_message: String,
    ) -> Self {
        Self::with_status(
            channel_id,
            video_id,
            String::new(),
            Vec::new(),
            status,
            0.0,
            Some(error_message),
        )
    }

    fn with_status(
        channel_id: &str,
        video_id: &str,
        full_text: String,
        segments: Vec<TranscriptSegment>,
        extraction_status: ExtractionStatus,
        confidence: f32,
        error_message: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            channel_id: channel_id.to_string(),
            video_id: video_id.to_string(),
            full_text,
            segments,
            extraction_status,
            confidence,
            error_message,
            created_at: now,
            updated_at: now,
        }
    }

    /// Completed with segments to chunk, so extraction can be skipped.
    pub fn is_usable(&self) -> bool {
        self.extraction_status == ExtractionStatus::Completed && !self.segments.is_empty()
    }

    pub fn has_valid_timestamps(&self) -> bool {
        has_valid_timestamps(&self.segments)
    }
}
