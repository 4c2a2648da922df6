//! Error types for tubechat.

use axum::http::StatusCode;
use thiserror::Error;

/// Library-level error type for tubechat operations.
#[derive(Error, Debug)]
pub enum TubechatError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid channel reference: {0}")]
    InvalidChannelReference(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Transcript not found: {0}")]
    TranscriptNotFound(String),

    #[error("Operation already in progress for {key}, retry after the lock expires")]
    OperationInProgress { key: String },

    #[error("Too many requests, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Idempotency key reused with a different request: {0}")]
    IdempotencyConflict(String),

    #[error("Usage limit reached: {0}")]
    QuotaExceeded(String),

    #[error("No captions available for video {0}")]
    NoCaptions(String),

    #[error("Provider rejected credentials, check the API key configuration: {0}")]
    ProviderAuth(String),

    #[error("Provider rate limit hit, retry later: {0}")]
    ProviderRateLimited(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Unexpected API response format")]
    UnexpectedFormat,

    #[error("Embedding generation failed: {0}")]
    Embedding(String),

    #[error("OpenAI API error: {0}")]
    OpenAI(String),

    #[error("RAG error: {0}")]
    Rag(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Longest provider response body carried in an error message.
const MAX_PROVIDER_BODY_CHARS: usize = 200;

impl TubechatError {
    /// Provider failure carrying the response body, truncated.
    pub fn provider_response(provider: &str, status: u16, body: &str) -> Self {
        let body: String = body.trim().chars().take(MAX_PROVIDER_BODY_CHARS).collect();
        TubechatError::Provider(format!("{} returned HTTP {}: {}", provider, status, body))
    }

    /// HTTP status used when this error crosses a stage boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            TubechatError::InvalidInput(_) | TubechatError::InvalidChannelReference(_) => {
                StatusCode::BAD_REQUEST
            }
            TubechatError::ChannelNotFound(_) | TubechatError::TranscriptNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            TubechatError::OperationInProgress { .. } | TubechatError::IdempotencyConflict(_) => {
                StatusCode::CONFLICT
            }
            TubechatError::RateLimited { .. } | TubechatError::QuotaExceeded(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            TubechatError::NoCaptions(_)
            | TubechatError::ProviderAuth(_)
            | TubechatError::ProviderRateLimited(_)
            | TubechatError::Provider(_)
            | TubechatError::UnexpectedFormat
            | TubechatError::Embedding(_)
            | TubechatError::OpenAI(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to a caller. Internal failures are redacted.
    pub fn public_message(&self) -> String {
        if self.status_code() == StatusCode::INTERNAL_SERVER_ERROR {
            "Internal server error".to_string()
        } else {
            self.to_string()
        }
    }

    /// Whether a caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TubechatError::OperationInProgress { .. }
                | TubechatError::RateLimited { .. }
                | TubechatError::ProviderRateLimited(_)
                | TubechatError::Http(_)
        )
    }
}

/// Result type alias for tubechat operations.
pub type Result<T> = std::result::Result<T, TubechatError>;
