//! CLI output formatting utilities.

use crate::channel::Channel;
use crate::rag::Citation;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

/// Output helper for CLI formatting.
pub struct Output;

impl Output {
    /// Print an info message.
    pub fn info(msg: &str) {
        println!("{} {}", style(">>").cyan().bold(), msg);
    }

    /// Print a success message.
    pub fn success(msg: &str) {
        println!("{} {}", style(">>").green().bold(), msg);
    }

    /// Print a warning message.
    pub fn warning(msg: &str) {
        eprintln!("{} {}", style(">>").yellow().bold(), msg);
    }

    /// Print an error message.
    pub fn error(msg: &str) {
        eprintln!("{} {}", style(">>").red().bold(), msg);
    }

    /// Print a header.
    pub fn header(msg: &str) {
        println!("\n{}", style(msg).bold().underlined());
    }

    /// Print a key-value pair.
    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", style(key).dim(), value);
    }

    /// Print a list item.
    pub fn list_item(msg: &str) {
        println!("  {} {}", style("*").cyan(), msg);
    }

    /// Print a channel's ingestion state.
    pub fn channel(channel: &Channel) {
        Output::header(&channel.name);
        Output::kv("Channel", &channel.channel_id);
        Output::kv("Status", &format!("{} ({}%)", channel.status, channel.progress));
        Output::kv(
            "Indexed",
            &format!("{} of {} videos", channel.indexed_videos, channel.total_videos),
        );
        if let Some(message) = &channel.error_message {
            Output::kv("Message", message);
        }
    }

    /// Print one citation. Only timestamped citations show a seek position.
    pub fn citation(citation: &Citation) {
        let position = match (&citation.timestamp, citation.has_timestamp) {
            (Some(timestamp), true) => format!(" @ {}", style(timestamp).cyan()),
            _ => String::new(),
        };
        println!(
            "\n{} {}{} (similarity: {:.2})",
            style(">>").green(),
            style(&citation.video_title).bold(),
            position,
            citation.similarity
        );
        println!("   {}", style(&citation.url).dim());
        if let Some(text) = &citation.chunk_text {
            println!("   {}", content_preview(text, 200));
        }
    }

    /// Create a spinner.
    pub fn spinner(msg: &str) -> ProgressBar {
        let pb = ProgressBar::new_spinner();
        let template = ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(template);
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        pb
    }
}

/// Truncate content with ellipsis.
fn content_preview(content: &str, max_chars: usize) -> String {
    let content = content.replace('\n', " ");
    if content.chars().count() <= max_chars {
        content
    } else {
        let truncated: String = content.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}
