//! First pipeline stage: resolve a channel and record the videos to ingest.

use super::{
    Channel, ChannelLister, ChannelProfile, ChannelRef, ChannelStatus, ContentType, ContentTypes,
    ImportMode, ImportSettings, Video, VideoListing,
};
use crate::config::LimitSettings;
use crate::error::{Result, TubechatError};
use crate::queue::{hand_off, WorkStage};
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Longest duration, in seconds, classified as a short when the provider gives no type.
pub const SHORT_MAX_SECONDS: u32 = 60;

/// Classify an upload. Provider-supplied type wins over the duration heuristic.
pub fn classify_content_type(explicit: Option<ContentType>, duration_seconds: Option<u32>) -> ContentType {
    if let Some(content_type) = explicit {
        return content_type;
    }
    match duration_seconds {
        Some(d) if d <= SHORT_MAX_SECONDS => ContentType::Short,
        _ => ContentType::Video,
    }
}

/// Filter a listing by content type and apply the import mode.
///
/// `latest` and `oldest` keep `min(limit, plan_max)` videos; `all` ignores the
/// per-request limit and keeps at most `plan_max`. Videos without a publish
/// time sort last either way.
pub fn select_videos(
    listings: Vec<VideoListing>,
    content_types: &ContentTypes,
    import: &ImportSettings,
    plan_max: usize,
) -> Vec<VideoListing> {
    let mut seen = HashSet::new();
    let mut selected: Vec<VideoListing> = listings
        .into_iter()
        .filter(|l| seen.insert(l.video_id.clone()))
        .filter(|l| content_types.allows(classify_content_type(l.explicit_type, l.duration_seconds)))
        .collect();

    let cap = match import.mode {
        ImportMode::Latest => {
            selected.sort_by(|a, b| by_published(a, b, true));
            import.limit.unwrap_or(plan_max).min(plan_max)
        }
        ImportMode::Oldest => {
            selected.sort_by(|a, b| by_published(a, b, false));
            import.limit.unwrap_or(plan_max).min(plan_max)
        }
        ImportMode::All => plan_max,
    };

    selected.truncate(cap);
    selected
}

fn by_published(a: &VideoListing, b: &VideoListing, newest_first: bool) -> Ordering {
    match (a.published_at, b.published_at) {
        (Some(x), Some(y)) if newest_first => y.cmp(&x),
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Resolve request as received from a client.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    #[serde(default)]
    pub channel_url: Option<String>,
    /// Known channel id; takes precedence over `channel_url`.
    #[serde(default, alias = "channel_id")]
    pub channel_id: Option<String>,
    #[serde(default, alias = "user_id")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub content_types: Option<ContentTypes>,
    #[serde(default)]
    pub import_settings: Option<ImportSettings>,
    /// Only add videos missing from an existing channel.
    #[serde(default)]
    pub refresh: bool,
}

impl ResolveRequest {
    /// The reference to resolve.
    pub fn reference(&self) -> Result<ChannelRef> {
        if let Some(id) = self.channel_id.as_deref().filter(|id| !id.trim().is_empty()) {
            return Ok(ChannelRef::Id(id.trim().to_string()));
        }
        match self.channel_url.as_deref() {
            Some(url) => ChannelRef::parse(url),
            None => Err(TubechatError::InvalidInput(
                "channelUrl or channelId is required".to_string(),
            )),
        }
    }
}

/// Result of a resolve or refresh.
#[derive(Debug, Clone, Serialize)]
pub struct ResolveOutcome {
    pub channel: Channel,
    pub new_videos_count: usize,
    pub up_to_date: bool,
    /// Whether an extract work item was enqueued.
    pub queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoff_error: Option<String>,
}

pub struct ChannelResolver {
    store: Arc<dyn Store>,
    lister: Arc<dyn ChannelLister>,
    plan_max: usize,
    listing_ceiling: usize,
}

impl ChannelResolver {
    pub fn new(
        store: Arc<dyn Store>,
        lister: Arc<dyn ChannelLister>,
        limits: &LimitSettings,
        listing_ceiling: usize,
    ) -> Self {
        Self {
            store,
            lister,
            plan_max: limits.max_videos_per_channel,
            listing_ceiling,
        }
    }

    /// Resolve the request's reference to a channel profile. No state is written.
    #[instrument(skip_all)]
    pub async fn lookup(&self, request: &ResolveRequest) -> Result<ChannelProfile> {
        let reference = request.reference()?;
        let profile = self.lister.resolve(&reference).await?;
        info!(channel_id = %profile.channel_id, "Resolved channel");
        Ok(profile)
    }

    /// Look up and apply in one call. Callers that need the channel lock use
    /// [`lookup`](Self::lookup) and [`apply`](Self::apply) separately.
    pub async fn resolve(&self, request: &ResolveRequest) -> Result<ResolveOutcome> {
        let profile = self.lookup(request).await?;
        self.apply(&profile, request).await
    }

    /// Upsert the channel, record newly selected videos and enqueue extraction.
    #[instrument(skip_all, fields(channel_id = %profile.channel_id, refresh = request.refresh))]
    pub async fn apply(&self, profile: &ChannelProfile, request: &ResolveRequest) -> Result<ResolveOutcome> {
        let channel_id = profile.channel_id.as_str();
        let existing = self.store.get_channel(channel_id).await?;

        if request.refresh && existing.is_none() {
            return Err(TubechatError::ChannelNotFound(channel_id.to_string()));
        }

        let is_new = existing.is_none();
        let mut channel = match existing {
            Some(mut channel) => {
                channel.apply_profile(profile);
                if let Some(content_types) = request.content_types {
                    channel.content_types = content_types;
                }
                if let Some(import_settings) = request.import_settings {
                    channel.import_settings = import_settings;
                }
                channel
            }
            None => Channel::new(
                profile,
                request.content_types.unwrap_or_default(),
                request.import_settings.unwrap_or_default(),
            ),
        };

        let listings = self
            .lister
            .list_uploads(profile, channel.import_settings.mode, self.listing_ceiling)
            .await?;
        let listed = listings.len();
        let selected = select_videos(
            listings,
            &channel.content_types,
            &channel.import_settings,
            self.plan_max,
        );
        let videos: Vec<Video> = selected
            .iter()
            .map(|listing| Video::from_listing(channel_id, listing))
            .collect();

        let inserted = self.store.insert_videos(&videos).await?;
        let total = self.store.list_videos(channel_id).await?.len() as u32;
        info!(listed, selected = videos.len(), inserted, total, "Recorded videos");

        if let Some(user_id) = request.user_id.as_deref() {
            self.store.link_user_channel(user_id, channel_id).await?;
        }

        if total == 0 {
            channel.begin_run();
            channel.advance(ChannelStatus::Failed, 100);
            channel.error_message = Some("No videos matched the selected content types".to_string());
            channel.set_counts(0, 0);
            self.store.save_channel(&channel).await?;
            warn!("Channel has no videos to ingest");
            return Ok(ResolveOutcome {
                channel,
                new_videos_count: 0,
                up_to_date: false,
                queued: false,
                handoff_error: None,
            });
        }

        if inserted == 0 && !is_new {
            let indexed = channel.indexed_videos;
            channel.set_counts(indexed, total);
            self.store.save_channel(&channel).await?;
            info!("Channel is up to date");
            return Ok(ResolveOutcome {
                channel,
                new_videos_count: 0,
                up_to_date: true,
                queued: false,
                handoff_error: None,
            });
        }

        channel.begin_run();
        let indexed = channel.indexed_videos;
        channel.set_counts(indexed, total);
        self.store.save_channel(&channel).await?;

        let handoff_error = hand_off(self.store.as_ref(), channel_id, WorkStage::Extract).await;

        Ok(ResolveOutcome {
            channel,
            new_videos_count: inserted,
            up_to_date: false,
            queued: handoff_error.is_none(),
            handoff_error,
        })
    }
}
