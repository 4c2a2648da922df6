//! Ask command implementation.

use crate::cli::Output;
use crate::config::Settings;
use crate::error::TubechatError;
use crate::orchestrator::Orchestrator;
use crate::rag::AnswerRequest;
use anyhow::Result;

/// Run the ask command.
pub async fn run_ask(
    channel_id: &str,
    question: &str,
    creator: Option<String>,
    debug: bool,
    settings: Settings,
) -> Result<()> {
    let orchestrator = Orchestrator::new(settings)?;

    let channel = orchestrator
        .store()
        .get_channel(channel_id)
        .await?
        .ok_or_else(|| TubechatError::ChannelNotFound(channel_id.to_string()))?;

    let request = AnswerRequest {
        channel_id: channel.channel_id.clone(),
        creator_name: creator.unwrap_or(channel.name),
        question: question.to_string(),
        history: Vec::new(),
        debug,
    };

    let spinner = Output::spinner("Searching the channel's videos...");
    let result = orchestrator.engine().answer(&request).await;
    spinner.finish_and_clear();

    let answer = match result {
        Ok(answer) => answer,
        Err(e) => {
            Output::error(&format!("Failed to generate answer: {}", e));
            return Err(e.into());
        }
    };

    println!("\n{}\n", answer.answer);
    Output::kv("Confidence", answer.confidence.as_str());

    if answer.show_citations || debug {
        Output::header("Sources");
        for citation in &answer.citations {
            Output::citation(citation);
        }
    }

    if let Some(details) = &answer.debug {
        Output::header("Retrieval");
        println!("{}", serde_json::to_string_pretty(details)?);
    }

    Ok(())
}
