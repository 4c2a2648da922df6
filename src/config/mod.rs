//! Configuration module for tubechat.
//!
//! Handles loading and managing application settings and prompt templates.

mod prompts;
mod settings;

pub use prompts::{Prompts, RagPrompts, NOT_COVERED_MARKER};
pub use settings::{
    CaptionsSettings, ChunkingSettings, EmbeddingSettings, GeneralSettings, IntentThresholds,
    LimitSettings, PromptSettings, RetrievalSettings, ServerSettings, Settings, StoreSettings,
    YoutubeSettings, EMBEDDING_PROVIDER_BATCH_CEILING,
};
