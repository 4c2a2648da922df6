//! Configuration settings for tubechat.

use crate::error::{Result, TubechatError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Maximum inputs the embeddings provider accepts in a single request.
pub const EMBEDDING_PROVIDER_BATCH_CEILING: usize = 2048;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub store: StoreSettings,
    pub youtube: YoutubeSettings,
    pub captions: CaptionsSettings,
    pub embedding: EmbeddingSettings,
    pub chunking: ChunkingSettings,
    pub retrieval: RetrievalSettings,
    pub limits: LimitSettings,
    pub server: ServerSettings,
    pub prompts: PromptSettings,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Directory for storing application data.
    pub data_dir: String,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.tubechat".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Path to the SQLite database.
    pub sqlite_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            sqlite_path: "~/.tubechat/tubechat.db".to_string(),
        }
    }
}

/// Channel/video listing API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct YoutubeSettings {
    /// YouTube Data API key. Falls back to `YOUTUBE_API_KEY`.
    pub api_key: Option<String>,
    /// Base URL of the Data API.
    pub api_base_url: String,
    /// Maximum number of uploads fetched from a channel listing.
    pub listing_ceiling: usize,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for YoutubeSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base_url: "https://www.googleapis.com/youtube/v3".to_string(),
            listing_ceiling: 500,
            timeout_secs: 30,
        }
    }
}

/// Captions transcript provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptionsSettings {
    /// Base URL of the transcript API.
    pub api_base_url: String,
    /// API key. Falls back to `CAPTIONS_API_KEY`.
    pub api_key: Option<String>,
    /// Minimum delay between consecutive provider calls in one run.
    pub request_delay_ms: u64,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for CaptionsSettings {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.supadata.ai/v1/youtube".to_string(),
            api_key: None,
            request_delay_ms: 200,
            timeout_secs: 30,
        }
    }
}

/// Embedding generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// Embedding model to use for both chunks and queries.
    pub model: String,
    /// Embedding dimensions.
    pub dimensions: u32,
    /// Chunk texts per embeddings request.
    pub batch_size: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            batch_size: 100,
        }
    }
}

/// Transcript chunking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    /// Target chunk size in approximate tokens.
    pub target_tokens: usize,
    /// Tokens carried over from the end of one chunk into the next.
    pub overlap_tokens: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            target_tokens: 400,
            overlap_tokens: 75,
        }
    }
}

/// Retrieval parameters for one query intent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntentThresholds {
    /// Candidate chunks requested from similarity search.
    pub match_count: usize,
    /// Similarity below which a chunk is not considered at all.
    pub min_threshold: f32,
    /// Similarity needed for a `high` confidence answer.
    pub preferred_threshold: f32,
}

/// Retrieval and answer composition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    /// LLM model for answer generation.
    pub model: String,
    /// Broad synthesis questions.
    pub general: IntentThresholds,
    /// Opinion and "what do you think about" questions.
    pub conceptual: IntentThresholds,
    /// "Where/when did you talk about" questions.
    pub moment: IntentThresholds,
    /// Global floor below which any answer is `low` confidence.
    pub min_similarity_for_any_answer: f32,
    /// Global floor for a confident answer.
    pub min_similarity_for_confident_answer: f32,
    /// Prior messages passed to the model as conversation context.
    pub history_window: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            general: IntentThresholds {
                match_count: 10,
                min_threshold: 0.20,
                preferred_threshold: 0.35,
            },
            conceptual: IntentThresholds {
                match_count: 8,
                min_threshold: 0.25,
                preferred_threshold: 0.40,
            },
            moment: IntentThresholds {
                match_count: 5,
                min_threshold: 0.30,
                preferred_threshold: 0.40,
            },
            min_similarity_for_any_answer: 0.25,
            min_similarity_for_confident_answer: 0.40,
            history_window: 10,
        }
    }
}

/// Plan limits and abuse controls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    /// Plan-level cap on videos imported per channel.
    pub max_videos_per_channel: usize,
    /// Lease duration of the per-channel ingestion lock.
    pub lock_ttl_secs: u64,
    /// How long a client-facing ingestion call waits before reporting a timeout.
    pub ingest_wait_secs: u64,
    /// Chat requests per minute for signed-in callers.
    pub authenticated_requests_per_minute: u32,
    /// Chat requests per minute for anonymous callers.
    pub anonymous_requests_per_minute: u32,
    /// Monthly assistant answers per signed-in user. `None` disables the check.
    pub monthly_message_quota: Option<u32>,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_videos_per_channel: 200,
            lock_ttl_secs: 600,
            ingest_wait_secs: 30,
            authenticated_requests_per_minute: 30,
            anonymous_requests_per_minute: 10,
            monthly_message_quota: Some(500),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

/// Prompt customization settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PromptSettings {
    /// Directory for custom prompts (overrides defaults).
    pub custom_dir: Option<String>,
    /// Custom variables available in all prompts as {{variable_name}}.
    pub variables: std::collections::HashMap<String, String>,
}

impl Settings {
    /// Load settings from the default configuration file.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load settings from a specific path, or default location if None.
    pub fn load_from(path: Option<&PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.clone(),
            None => Self::default_config_path(),
        };

        let settings = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            Settings::default()
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.embedding.batch_size == 0
            || self.embedding.batch_size > EMBEDDING_PROVIDER_BATCH_CEILING
        {
            return Err(TubechatError::Config(format!(
                "embedding.batch_size must be between 1 and {}",
                EMBEDDING_PROVIDER_BATCH_CEILING
            )));
        }

        if self.chunking.target_tokens == 0
            || self.chunking.overlap_tokens >= self.chunking.target_tokens
        {
            return Err(TubechatError::Config(
                "chunking.overlap_tokens must be smaller than a non-zero chunking.target_tokens"
                    .to_string(),
            ));
        }

        let r = &self.retrieval;
        let thresholds = [
            r.general.min_threshold,
            r.general.preferred_threshold,
            r.conceptual.min_threshold,
            r.conceptual.preferred_threshold,
            r.moment.min_threshold,
            r.moment.preferred_threshold,
            r.min_similarity_for_any_answer,
            r.min_similarity_for_confident_answer,
        ];
        if thresholds.iter().any(|t| !(0.0..=1.0).contains(t)) {
            return Err(TubechatError::Config(
                "retrieval thresholds must be within [0, 1]".to_string(),
            ));
        }

        for (name, bucket) in [
            ("general", &r.general),
            ("conceptual", &r.conceptual),
            ("moment", &r.moment),
        ] {
            if bucket.match_count == 0 || bucket.preferred_threshold < bucket.min_threshold {
                return Err(TubechatError::Config(format!(
                    "retrieval.{name} needs match_count > 0 and preferred_threshold >= min_threshold"
                )));
            }
        }

        Ok(())
    }

    /// Save settings to a specific path.
    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| TubechatError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tubechat")
            .join("config.toml")
    }

    /// Expand shell variables in paths (e.g., ~).
    pub fn expand_path(path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).to_string())
    }

    /// Get the expanded data directory path.
    pub fn data_dir(&self) -> PathBuf {
        Self::expand_path(&self.general.data_dir)
    }

    /// Get the expanded SQLite database path.
    pub fn sqlite_path(&self) -> PathBuf {
        Self::expand_path(&self.store.sqlite_path)
    }

    /// YouTube Data API key from config or environment.
    pub fn youtube_api_key(&self) -> Option<String> {
        self.youtube
            .api_key
            .clone()
            .or_else(|| std::env::var("YOUTUBE_API_KEY").ok())
    }

    /// Captions provider key from config or environment.
    pub fn captions_api_key(&self) -> Option<String> {
        self.captions
            .api_key
            .clone()
            .or_else(|| std::env::var("CAPTIONS_API_KEY").ok())
    }
}
