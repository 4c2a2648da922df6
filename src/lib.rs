//! tubechat - transcript ingestion and grounded chat over YouTube channels
//!
//! Ingests a creator's videos into a searchable knowledge base and answers
//! questions with citations that point back to the moment in a video.
//!
//! # Overview
//!
//! Ingestion runs in stages, each handing the next one a queued work item:
//!
//! 1. Resolve a channel reference and record the videos that match its
//!    content-type and import settings.
//! 2. Extract captions for every pending video.
//! 3. Chunk the transcripts and embed the chunks.
//!
//! Chat retrieves the closest chunks for a question, grades the evidence and
//! either answers with citations or refuses.
//!
//! # Architecture
//!
//! - `config` - Configuration management
//! - `channel` - Channel references, listing and video selection
//! - `transcript` - Captions fetching and transcript extraction
//! - `chunking` - Transcript chunking
//! - `embedding` - Embedding generation and chunk indexing
//! - `store` - Persistence
//! - `queue` - Stage hand-off work items
//! - `guard` - Operation locks, rate limits and request hashing
//! - `rag` - Retrieval, confidence grading and answer generation
//! - `chat` - Chat requests with identity, quota and history
//! - `server` - HTTP API
//! - `orchestrator` - Pipeline coordination
//!
//! # Example
//!
//! ```rust,no_run
//! use tubechat::channel::ResolveRequest;
//! use tubechat::config::Settings;
//! use tubechat::orchestrator::Orchestrator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load()?;
//!     let orchestrator = Orchestrator::new(settings)?;
//!
//!     let request = ResolveRequest {
//!         channel_url: Some("https://www.youtube.com/@ferriscodes".to_string()),
//!         ..Default::default()
//!     };
//!     let report = orchestrator.ingest(&request).await?;
//!     println!("Indexed {} videos", report.channel.indexed_videos);
//!
//!     Ok(())
//! }
//! ```

#[macro_use]
mod macros;

pub mod channel;
pub mod chat;
pub mod chunking;
pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod guard;
pub mod openai;
pub mod orchestrator;
pub mod queue;
pub mod rag;
pub mod server;
pub mod store;
pub mod transcript;

#[cfg(test)]
mod test_support;

pub use error::{Result, TubechatError};
