//! Captions transcript provider.

use super::TranscriptSegment;
use crate::error::{Result, TubechatError};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument};

/// Duration assumed for a segment whose duration is missing or invalid.
const DEFAULT_SEGMENT_DURATION: f64 = 2.0;

/// Normalized captions of one video.
#[derive(Debug, Clone, PartialEq)]
pub struct Captions {
    pub segments: Vec<TranscriptSegment>,
    /// Share of segments whose start and duration parsed cleanly.
    pub confidence: f32,
}

/// External captions API.
#[async_trait]
pub trait CaptionsProvider: Send + Sync {
    /// Fetch captions for a video.
    ///
    /// Fails with [`TubechatError::NoCaptions`] when the video has none.
    async fn fetch(&self, video_id: &str) -> Result<Captions>;
}

/// Captions provider over HTTP: `GET {base}/transcript?video_id=…` with bearer auth.
pub struct HttpCaptionsProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpCaptionsProvider {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl CaptionsProvider for HttpCaptionsProvider {
    #[instrument(skip(self))]
    async fn fetch(&self, video_id: &str) -> Result<Captions> {
        let mut request = self
            .client
            .get(format!("{}/transcript", self.base_url))
            .query(&[("video_id", video_id)]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        debug!(status, bytes = body.len(), "Captions response");
        map_response(status, &body, video_id)
    }
}

/// Map a captions response onto normalized captions or a classified error.
pub fn map_response(status: u16, body: &str, video_id: &str) -> Result<Captions> {
    match status {
        200..=299 => {
            let json: Value =
                serde_json::from_str(body).map_err(|_| TubechatError::UnexpectedFormat)?;
            normalize_segments(&json, video_id)
        }
        404 => Err(TubechatError::NoCaptions(video_id.to_string())),
        401 | 403 => Err(TubechatError::ProviderAuth(format!(
            "captions API returned HTTP {}",
            status
        ))),
        429 => Err(TubechatError::ProviderRateLimited(
            "captions API request limit reached".to_string(),
        )),
        _ => Err(TubechatError::provider_response("Captions API", status, body)),
    }
}

/// Normalize a provider payload into segments.
///
/// Accepts a top-level array or an object wrapping it in `content`. Each item
/// needs `text`; `start` (or `offset`) and `duration` may be numbers or
/// numeric strings. Unparseable starts become 0, unparseable or negative
/// durations become 2s, and blank text is dropped.
pub fn normalize_segments(payload: &Value, video_id: &str) -> Result<Captions> {
    let items = payload
        .as_array()
        .or_else(|| payload["content"].as_array())
        .ok_or(TubechatError::UnexpectedFormat)?;

    let mut segments = Vec::with_capacity(items.len());
    let mut timed = 0usize;

    for item in items {
        let text = item["text"].as_str().unwrap_or_default().trim();
        if text.is_empty() {
            continue;
        }

        let start = coerce_seconds(&item["start"]).or_else(|| coerce_seconds(&item["offset"]));
        let duration = coerce_seconds(&item["duration"]);
        if start.is_some() && duration.is_some() {
            timed += 1;
        }

        let start = start.unwrap_or(0.0);
        let duration = duration.unwrap_or(DEFAULT_SEGMENT_DURATION);
        segments.push(TranscriptSegment::new(text, start, start + duration));
    }

    if segments.is_empty() {
        return Err(TubechatError::NoCaptions(video_id.to_string()));
    }

    let confidence = timed as f32 / segments.len() as f32;
    Ok(Captions {
        segments,
        confidence,
    })
}

/// A non-negative finite number of seconds from a number or numeric string.
fn coerce_seconds(value: &Value) -> Option<f64> {
    let seconds = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    (seconds.is_finite() && seconds >= 0.0).then_some(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_coerces_strings_and_defaults() {
        let payload = json!([
            { "text": " Hello ", "start": 0, "duration": 2 },
            { "text": "world", "start": "2.5", "duration": "1.5" },
            { "text": "   ", "start": 4, "duration": 1 },
            { "text": "bad duration", "start": 5, "duration": "abc" },
            { "text": "negative", "start": 9, "duration": -3 },
            { "text": "zero", "start": 11, "duration": 0 }
        ]);

        let captions = normalize_segments(&payload, "vid1").unwrap();
        let segments = &captions.segments;
        assert_eq!(segments.len(), 5);
        assert_eq!(segments[0], TranscriptSegment::new("Hello", 0.0, 2.0));
        assert_eq!(segments[1], TranscriptSegment::new("world", 2.5, 4.0));
        assert_eq!(segments[2], TranscriptSegment::new("bad duration", 5.0, 7.0));
        assert_eq!(segments[3], TranscriptSegment::new("negative", 9.0, 11.0));
        assert_eq!(segments[4], TranscriptSegment::new("zero", 11.0, 11.0));
        assert!((captions.confidence - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_accepts_content_wrapper_and_offset() {
        let payload = json!({ "content": [{ "text": "hi", "offset": 1.0, "duration": 1.0 }] });
        let captions = normalize_segments(&payload, "vid1").unwrap();
        assert_eq!(captions.segments[0], TranscriptSegment::new("hi", 1.0, 2.0));
    }

    #[test]
    fn test_normalize_empty_is_no_captions() {
        for payload in [json!([]), json!([{ "text": "  " }, { "text": "" }])] {
            assert!(matches!(
                normalize_segments(&payload, "vid1"),
                Err(TubechatError::NoCaptions(_))
            ));
        }
    }

    #[test]
    fn test_normalize_non_array_is_unexpected_format() {
        let err = normalize_segments(&json!({ "error": "nope" }), "vid1").unwrap_err();
        assert!(matches!(err, TubechatError::UnexpectedFormat));
        assert_eq!(err.to_string(), "Unexpected API response format");
    }

    #[test]
    fn test_map_response_statuses() {
        assert!(matches!(map_response(404, "", "v"), Err(TubechatError::NoCaptions(_))));
        assert!(matches!(map_response(401, "", "v"), Err(TubechatError::ProviderAuth(_))));
        assert!(matches!(map_response(403, "", "v"), Err(TubechatError::ProviderAuth(_))));
        assert!(matches!(
            map_response(429, "", "v"),
            Err(TubechatError::ProviderRateLimited(_))
        ));
        assert!(map_response(429, "", "v").unwrap_err().is_retryable());

        let body = "x".repeat(500);
        match map_response(503, &body, "v") {
            Err(TubechatError::Provider(message)) => assert!(message.len() < 260),
            other => panic!("expected provider error, got {:?}", other),
        }

        assert!(matches!(
            map_response(200, "<html>", "v"),
            Err(TubechatError::UnexpectedFormat)
        ));
        let ok = map_response(200, r#"[{"text":"hi","start":0,"duration":1}]"#, "v").unwrap();
        assert_eq!(ok.segments.len(), 1);
    }
}
