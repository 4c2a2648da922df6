//! Persisted hand-off between pipeline stages.
//!
//! A stage that finishes successfully enqueues the next stage as a pending
//! [`WorkItem`] instead of invoking it directly. Items record their outcome,
//! so a failed hand-off stays visible and can be re-run.

use crate::error::Result;
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Pipeline stage a work item runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStage {
    Extract,
    Embed,
}

str_enum!(WorkStage {
    Extract => "extract",
    Embed => "embed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Running,
    Done,
    Failed,
}

str_enum!(WorkStatus {
    Pending => "pending",
    Running => "running",
    Done => "done",
    Failed => "failed",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: Uuid,
    pub channel_id: String,
    pub stage: WorkStage,
    pub status: WorkStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(channel_id: &str, stage: WorkStage) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            channel_id: channel_id.to_string(),
            stage,
            status: WorkStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Enqueue `stage` for a channel.
///
/// Returns the failure as a message rather than an error: the stage that
/// hands off has already succeeded and reports the message alongside its
/// own result.
pub async fn hand_off(store: &dyn Store, channel_id: &str, stage: WorkStage) -> Option<String> {
    match enqueue(store, channel_id, stage).await {
        Ok(_) => None,
        Err(e) => {
            warn!(channel_id, stage = %stage, "Failed to enqueue next stage: {}", e);
            Some(format!("Failed to enqueue {} stage: {}", stage, e))
        }
    }
}

/// Enqueue `stage` for a channel and return the new item.
pub async fn enqueue(store: &dyn Store, channel_id: &str, stage: WorkStage) -> Result<WorkItem> {
    let item = WorkItem::new(channel_id, stage);
    store.enqueue_work(&item).await?;
    info!(channel_id, stage = %stage, work_id = %item.id, "Enqueued work");
    Ok(item)
}
