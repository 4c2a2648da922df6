//! Status command implementation.

use crate::cli::Output;
use crate::config::Settings;
use crate::orchestrator::Orchestrator;
use anyhow::Result;

/// Print a channel's ingestion state and recent work items.
pub async fn run_status(channel_id: &str, settings: Settings) -> Result<()> {
    let orchestrator = Orchestrator::new(settings)?;
    let report = orchestrator.status(channel_id).await?;

    Output::channel(&report.channel);

    if !report.work.is_empty() {
        Output::header("Recent work");
        for item in &report.work {
            let line = format!(
                "{} {} ({})",
                item.stage,
                item.status,
                item.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
            Output::list_item(&line);
            if let Some(error) = &item.error {
                Output::kv("Error", error);
            }
        }
    }

    Ok(())
}
