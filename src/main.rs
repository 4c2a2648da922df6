//! tubechat CLI entry point.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tubechat::cli::{commands, Cli, Commands};
use tubechat::config::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| format!("tubechat={}", log_level)),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Load configuration
    let settings = match &cli.config {
        Some(path) => Settings::load_from(Some(&std::path::PathBuf::from(path)))?,
        None => Settings::load()?,
    };

    std::fs::create_dir_all(settings.data_dir())?;

    match cli.command {
        Commands::Serve { host, port } => {
            commands::run_serve(host, port, settings).await?;
        }

        Commands::Ingest {
            channel,
            user,
            filters,
            refresh,
        } => {
            commands::run_ingest(&channel, user, &filters, refresh, settings).await?;
        }

        Commands::Extract { channel_id } => {
            commands::run_extract(&channel_id, settings).await?;
        }

        Commands::Index {
            channel,
            transcript,
        } => {
            commands::run_index(channel, transcript, settings).await?;
        }

        Commands::Ask {
            channel_id,
            question,
            creator,
            debug,
        } => {
            commands::run_ask(&channel_id, &question, creator, debug, settings).await?;
        }

        Commands::Status { channel_id } => {
            commands::run_status(&channel_id, settings).await?;
        }

        Commands::Config { action } => {
            commands::run_config(&action, &settings, cli.config.as_deref())?;
        }
    }

    Ok(())
}
