//! Ingest, extract and index commands.

use crate::channel::ResolveRequest;
use crate::cli::{IngestFilters, Output};
use crate::config::Settings;
use crate::embedding::{IndexReport, IndexTarget};
use crate::orchestrator::Orchestrator;
use crate::queue::WorkStatus;
use anyhow::Result;

/// Resolve a channel and run every queued stage.
pub async fn run_ingest(
    channel: &str,
    user: Option<String>,
    filters: &IngestFilters,
    refresh: bool,
    settings: Settings,
) -> Result<()> {
    let orchestrator = Orchestrator::new(settings)?;
    let request = ResolveRequest {
        channel_url: Some(channel.to_string()),
        user_id: user,
        content_types: Some(filters.content_types()),
        import_settings: Some(filters.import_settings()),
        refresh,
        ..Default::default()
    };

    let spinner = Output::spinner(&format!("Ingesting {}...", channel));
    let result = orchestrator.ingest(&request).await;
    spinner.finish_and_clear();

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            Output::error(&format!("Ingestion failed: {}", e));
            return Err(e.into());
        }
    };

    if report.resolve.up_to_date {
        Output::success("Channel is up to date, no new videos.");
    } else {
        Output::success(&format!(
            "Added {} new videos.",
            report.resolve.new_videos_count
        ));
    }
    if let Some(handoff) = &report.resolve.handoff_error {
        Output::warning(&format!("Could not queue extraction: {}", handoff));
    }
    for item in &report.work {
        match (&item.status, &item.error) {
            (WorkStatus::Failed, Some(error)) => {
                Output::warning(&format!("{} stage failed: {}", item.stage, error))
            }
            _ => Output::list_item(&format!("{} {}", item.stage, item.status)),
        }
    }
    Output::channel(&report.channel);

    Ok(())
}

/// Fetch captions for a channel's pending videos.
pub async fn run_extract(channel_id: &str, settings: Settings) -> Result<()> {
    let orchestrator = Orchestrator::new(settings)?;

    let spinner = Output::spinner("Fetching captions...");
    let result = orchestrator.extract(channel_id).await;
    spinner.finish_and_clear();

    let report = result?;
    Output::header("Extraction");
    Output::kv("Status", report.status.as_str());
    Output::kv("Videos", &report.stats.total.to_string());
    Output::kv("Completed", &report.stats.completed.to_string());
    Output::kv("No captions", &report.stats.no_captions.to_string());
    Output::kv("Failed", &report.stats.failed.to_string());
    if let Some(handoff) = &report.handoff_error {
        Output::warning(&format!("Could not queue embedding: {}", handoff));
    }
    Ok(())
}

/// Chunk and embed a channel or explicit transcripts.
pub async fn run_index(
    channel: Option<String>,
    transcripts: Vec<String>,
    settings: Settings,
) -> Result<()> {
    let target = match channel {
        Some(channel_id) => IndexTarget::Channel(channel_id),
        None if !transcripts.is_empty() => IndexTarget::Transcripts(transcripts),
        None => {
            Output::error("Pass --channel or at least one --transcript");
            return Err(anyhow::anyhow!("no index target"));
        }
    };

    let orchestrator = Orchestrator::new(settings)?;

    let spinner = Output::spinner("Chunking and embedding transcripts...");
    let result = orchestrator.index(&target).await;
    spinner.finish_and_clear();

    print_index_report(&result?);
    Ok(())
}

fn print_index_report(report: &IndexReport) {
    Output::header("Indexing");
    Output::kv("Transcripts", &report.processed.to_string());
    Output::kv("Chunks", &report.chunks_created.to_string());
    Output::kv("With timestamps", &report.chunks_with_timestamps.to_string());
    Output::kv("Failed", &report.failed.to_string());
    for error in &report.errors {
        Output::warning(error);
    }
}
