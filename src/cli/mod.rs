//! CLI module for tubechat.

pub mod commands;
mod output;

pub use output::Output;

use crate::channel::{ContentTypes, ImportMode, ImportSettings};
use clap::{Parser, Subcommand};

/// tubechat - chat with a YouTube creator's videos
///
/// Ingests a channel's transcripts into a local knowledge base and answers
/// questions with timestamped citations.
#[derive(Parser, Debug)]
#[command(name = "tubechat")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "TUBECHAT_CONFIG")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Host to bind to (defaults to the configured host)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to (defaults to the configured port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Resolve a channel and run every ingestion stage
    Ingest {
        /// Channel URL, @handle or channel id
        channel: String,

        /// User the channel is linked to
        #[arg(short, long)]
        user: Option<String>,

        #[command(flatten)]
        filters: IngestFilters,

        /// Only add videos missing from an already ingested channel
        #[arg(long)]
        refresh: bool,
    },

    /// Fetch captions for every pending video of a channel
    Extract {
        /// Channel id
        channel_id: String,
    },

    /// Chunk and embed transcripts
    Index {
        /// Index every completed transcript of this channel that has no chunks yet
        #[arg(long, conflicts_with = "transcript")]
        channel: Option<String>,

        /// Re-index these transcripts
        #[arg(long, num_args = 1..)]
        transcript: Vec<String>,
    },

    /// Ask a question about a channel's videos
    Ask {
        /// Channel id
        channel_id: String,

        /// The question to ask
        question: String,

        /// Creator name used in the prompt (defaults to the channel name)
        #[arg(long)]
        creator: Option<String>,

        /// Show retrieval details and source text
        #[arg(long)]
        debug: bool,
    },

    /// Show a channel's ingestion state and recent work
    Status {
        /// Channel id
        channel_id: String,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Content-type and import flags for `ingest`.
#[derive(clap::Args, Debug, Clone)]
pub struct IngestFilters {
    /// Skip regular videos
    #[arg(long)]
    pub no_videos: bool,

    /// Include Shorts
    #[arg(long)]
    pub shorts: bool,

    /// Include past live streams
    #[arg(long)]
    pub lives: bool,

    /// Which end of the upload history to import (latest, oldest, all)
    #[arg(long, default_value = "latest")]
    pub mode: ImportMode,

    /// Maximum number of videos to import
    #[arg(long)]
    pub limit: Option<usize>,
}

impl IngestFilters {
    pub fn content_types(&self) -> ContentTypes {
        ContentTypes {
            videos: !self.no_videos,
            shorts: self.shorts,
            lives: self.lives,
        }
    }

    pub fn import_settings(&self) -> ImportSettings {
        ImportSettings {
            mode: self.mode,
            limit: self.limit.or(ImportSettings::default().limit),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,
}
