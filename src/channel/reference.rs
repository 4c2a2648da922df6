//! Parsing of user-supplied channel references.

use crate::error::{Result, TubechatError};
use regex::Regex;
use std::sync::LazyLock;
use url::Url;

static CHANNEL_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^UC[A-Za-z0-9_-]{22}$").expect("Invalid regex"));

static HANDLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]{3,30}$").expect("Invalid regex"));

/// A parsed reference to a channel, before it is resolved to a stable id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRef {
    /// Stable channel id (`UC…`).
    Id(String),
    /// `@handle`, stored without the `@`.
    Handle(String),
    /// Legacy `/user/<name>` URL.
    Username(String),
}

impl ChannelRef {
    /// Parse a channel URL, `@handle` URL, bare handle or channel id.
    ///
    /// Accepted forms:
    /// - `https://www.youtube.com/channel/UC…`
    /// - `https://www.youtube.com/@handle` (optionally followed by `/videos` etc.)
    /// - `https://www.youtube.com/c/name` (treated as a handle)
    /// - `https://www.youtube.com/user/name`
    /// - `@handle` or `handle`
    /// - `UC…`
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(TubechatError::InvalidChannelReference(
                "empty channel reference".to_string(),
            ));
        }

        if let Some(url) = Self::as_youtube_url(trimmed) {
            return Self::from_url(&url).ok_or_else(|| {
                TubechatError::InvalidChannelReference(format!(
                    "URL does not point to a channel: {}",
                    input
                ))
            });
        }

        Self::from_bare(trimmed).ok_or_else(|| {
            TubechatError::InvalidChannelReference(format!(
                "expected a channel URL, @handle or channel id: {}",
                input
            ))
        })
    }

    /// Value usable as a provider query parameter.
    pub fn value(&self) -> &str {
        match self {
            ChannelRef::Id(v) | ChannelRef::Handle(v) | ChannelRef::Username(v) => v,
        }
    }

    fn as_youtube_url(input: &str) -> Option<Url> {
        let lower = input.to_ascii_lowercase();
        let candidate = if lower.starts_with("http://") || lower.starts_with("https://") {
            input.to_string()
        } else if lower.starts_with("youtube.com/")
            || lower.starts_with("www.youtube.com/")
            || lower.starts_with("m.youtube.com/")
        {
            format!("https://{}", input)
        } else {
            return None;
        };

        let url = Url::parse(&candidate).ok()?;
        let host = url.host_str()?.to_ascii_lowercase();
        if host == "youtube.com" || host.ends_with(".youtube.com") {
            Some(url)
        } else {
            None
        }
    }

    fn from_url(url: &Url) -> Option<Self> {
        let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
        let first = segments.next()?;

        if let Some(handle) = first.strip_prefix('@') {
            return Self::handle(handle);
        }

        let second = segments.next()?;
        match first {
            "channel" if CHANNEL_ID.is_match(second) => Some(ChannelRef::Id(second.to_string())),
            "c" => Self::handle(second),
            "user" if HANDLE.is_match(second) => Some(ChannelRef::Username(second.to_string())),
            _ => None,
        }
    }

    fn from_bare(input: &str) -> Option<Self> {
        if let Some(handle) = input.strip_prefix('@') {
            return Self::handle(handle);
        }
        if CHANNEL_ID.is_match(input) {
            return Some(ChannelRef::Id(input.to_string()));
        }
        Self::handle(input)
    }

    fn handle(value: &str) -> Option<Self> {
        HANDLE
            .is_match(value)
            .then(|| ChannelRef::Handle(value.to_string()))
    }
}
