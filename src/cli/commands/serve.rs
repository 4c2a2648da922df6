//! Serve command implementation.

use crate::cli::Output;
use crate::config::Settings;
use crate::orchestrator::Orchestrator;
use crate::server;
use anyhow::Result;
use std::sync::Arc;

/// Run the HTTP API server.
pub async fn run_serve(host: Option<String>, port: Option<u16>, settings: Settings) -> Result<()> {
    let host = host.unwrap_or_else(|| settings.server.host.clone());
    let port = port.unwrap_or(settings.server.port);
    let orchestrator = Arc::new(Orchestrator::new(settings)?);

    Output::header("tubechat API Server");
    println!();
    Output::success(&format!("Listening on http://{}:{}", host, port));
    println!();
    println!("Endpoints:");
    Output::kv("Health", "GET  /health");
    Output::kv("Resolve", "POST /resolve-channel");
    Output::kv("Extract", "POST /extract-transcripts");
    Output::kv("Embed", "POST /process-embeddings");
    Output::kv("Chat", "POST /chat");
    Output::kv("Status", "GET  /channels/{channel_id}/status");
    println!();
    Output::info("Press Ctrl+C to stop the server.");

    server::serve(orchestrator, &host, port).await?;

    Ok(())
}
