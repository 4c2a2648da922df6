//! Content hashing for idempotent chat requests.

use crate::rag::HistoryMessage;
use sha2::{Digest, Sha256};

/// SHA-256 over the parts of a chat request that determine its answer.
///
/// Fields are length-prefixed so different splits of the same bytes never
/// collide.
pub fn request_hash(channel_id: &str, query: &str, history: &[HistoryMessage]) -> String {
    let mut hasher = Sha256::new();
    update_field(&mut hasher, channel_id);
    update_field(&mut hasher, query.trim());
    hasher.update((history.len() as u64).to_le_bytes());
    for message in history {
        update_field(&mut hasher, message.role.as_str());
        update_field(&mut hasher, &message.content);
    }
    hex::encode(hasher.finalize())
}

fn update_field(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}
