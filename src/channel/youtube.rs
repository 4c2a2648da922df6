//! YouTube Data API v3 implementation of [`ChannelLister`].

use super::{ChannelLister, ChannelProfile, ChannelRef, ContentType, ImportMode, VideoListing};
use crate::error::{Result, TubechatError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, instrument};

/// Page size limit of the Data API.
const PAGE_SIZE: usize = 50;

static ISO_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^P(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?)?$").expect("Invalid regex")
});

/// Parse an ISO-8601 duration such as `PT1H2M3S` into seconds.
///
/// Durations beyond `u32::MAX` seconds saturate.
pub fn parse_iso8601_duration(value: &str) -> Option<u32> {
    let caps = ISO_DURATION.captures(value)?;
    let part = |i: usize| -> Option<u64> {
        match caps.get(i) {
            Some(m) => m.as_str().parse::<u64>().ok(),
            None => Some(0),
        }
    };
    let total = [(1, 86_400u64), (2, 3_600), (3, 60), (4, 1)]
        .into_iter()
        .try_fold(0u64, |acc, (i, unit)| part(i)?.checked_mul(unit)?.checked_add(acc));
    Some(total.and_then(|t| u32::try_from(t).ok()).unwrap_or(u32::MAX))
}

/// Channel lister backed by the YouTube Data API.
pub struct YoutubeDataApi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl YoutubeDataApi {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}/{}", self.base_url, path))
            .query(query)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            401 | 403 => TubechatError::ProviderAuth(format!(
                "YouTube Data API rejected the request (HTTP {})",
                status.as_u16()
            )),
            404 => TubechatError::ChannelNotFound(path.to_string()),
            429 => TubechatError::ProviderRateLimited("YouTube Data API quota exhausted".to_string()),
            code => TubechatError::provider_response("YouTube Data API", code, &body),
        })
    }

    /// Fetch duration, live metadata and canonical snippet for up to 50 ids.
    async fn video_details(&self, ids: &[String]) -> Result<Vec<Value>> {
        let json = self
            .get_json(
                "videos",
                &[
                    ("part", "contentDetails,snippet,liveStreamingDetails".to_string()),
                    ("id", ids.join(",")),
                    ("maxResults", PAGE_SIZE.to_string()),
                ],
            )
            .await?;

        Ok(json["items"].as_array().cloned().unwrap_or_default())
    }
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn best_thumbnail(thumbnails: &Value) -> Option<String> {
    ["high", "medium", "default"]
        .iter()
        .find_map(|size| thumbnails[*size]["url"].as_str())
        .map(|s| s.to_string())
}

/// Map one `videos` resource into a listing entry.
fn listing_from_video(item: &Value) -> Option<VideoListing> {
    let video_id = item["id"].as_str()?.to_string();
    let snippet = &item["snippet"];

    let is_live = !item["liveStreamingDetails"].is_null()
        || snippet["liveBroadcastContent"]
            .as_str()
            .is_some_and(|c| c != "none");

    Some(VideoListing {
        video_id,
        title: snippet["title"].as_str().unwrap_or("Untitled").to_string(),
        published_at: parse_time(&snippet["publishedAt"]),
        duration_seconds: item["contentDetails"]["duration"]
            .as_str()
            .and_then(parse_iso8601_duration),
        thumbnail_url: best_thumbnail(&snippet["thumbnails"]),
        explicit_type: is_live.then_some(ContentType::Live),
    })
}

#[async_trait]
impl ChannelLister for YoutubeDataApi {
    #[instrument(skip(self))]
    async fn resolve(&self, reference: &ChannelRef) -> Result<ChannelProfile> {
        let selector = match reference {
            ChannelRef::Id(id) => ("id", id.clone()),
            ChannelRef::Handle(handle) => ("forHandle", format!("@{}", handle)),
            ChannelRef::Username(name) => ("forUsername", name.clone()),
        };

        let json = self
            .get_json(
                "channels",
                &[
                    ("part", "snippet,statistics,contentDetails".to_string()),
                    selector,
                ],
            )
            .await?;

        let item = json["items"]
            .as_array()
            .and_then(|items| items.first())
            .ok_or_else(|| TubechatError::ChannelNotFound(reference.value().to_string()))?;

        let channel_id = item["id"]
            .as_str()
            .ok_or(TubechatError::UnexpectedFormat)?
            .to_string();

        Ok(ChannelProfile {
            channel_id,
            name: item["snippet"]["title"].as_str().unwrap_or_default().to_string(),
            avatar_url: best_thumbnail(&item["snippet"]["thumbnails"]),
            subscriber_count: item["statistics"]["subscriberCount"]
                .as_str()
                .and_then(|s| s.parse().ok()),
            uploads_playlist_id: item["contentDetails"]["relatedPlaylists"]["uploads"]
                .as_str()
                .map(|s| s.to_string()),
        })
    }

    #[instrument(skip(self, profile), fields(channel_id = %profile.channel_id))]
    async fn list_uploads(
        &self,
        profile: &ChannelProfile,
        mode: ImportMode,
        ceiling: usize,
    ) -> Result<Vec<VideoListing>> {
        let playlist_id = profile.uploads_playlist_id.clone().unwrap_or_else(|| {
            // Uploads playlist ids mirror the channel id with a `UU` prefix.
            format!("UU{}", profile.channel_id.trim_start_matches("UC"))
        });

        let mut video_ids: Vec<String> = Vec::new();
        let mut page_token: Option<String> = None;
        // The playlist is newest first, so the earliest uploads sit on its last pages.
        let to_end = mode == ImportMode::Oldest;

        while to_end || video_ids.len() < ceiling {
            let mut query = vec![
                ("part", "contentDetails".to_string()),
                ("playlistId", playlist_id.clone()),
                ("maxResults", PAGE_SIZE.to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let page = self.get_json("playlistItems", &query).await?;
            let items = page["items"].as_array().cloned().unwrap_or_default();

            video_ids.extend(
                items
                    .iter()
                    .filter_map(|item| item["contentDetails"]["videoId"].as_str())
                    .map(|s| s.to_string()),
            );

            page_token = page["nextPageToken"].as_str().map(|s| s.to_string());
            if page_token.is_none() || items.is_empty() {
                break;
            }
        }
        if to_end {
            let skip = video_ids.len().saturating_sub(ceiling);
            video_ids.drain(..skip);
        } else {
            video_ids.truncate(ceiling);
        }

        let mut listings = Vec::with_capacity(video_ids.len());
        for batch in video_ids.chunks(PAGE_SIZE) {
            let details = self.video_details(batch).await?;
            listings.extend(details.iter().filter_map(listing_from_video));
        }

        listings.sort_by_key(|l| std::cmp::Reverse(l.published_at));
        debug!("Listed {} uploads", listings.len());
        Ok(listings)
    }
}
