//! Named, expiring operation locks backed by the store.

use crate::error::{Result, TubechatError};
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Hands out leases on named operations, such as ingesting one channel.
#[derive(Clone)]
pub struct OperationLock {
    store: Arc<dyn Store>,
    ttl: Duration,
}

/// A held lease. Release it explicitly; an abandoned lease expires after its TTL.
#[derive(Debug)]
pub struct LockLease {
    key: String,
    owner: String,
}

impl LockLease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl OperationLock {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Lock key for ingesting a channel.
    pub fn channel_key(channel_id: &str) -> String {
        format!("ingest:{}", channel_id)
    }

    /// Take the lease, or fail with [`TubechatError::OperationInProgress`].
    pub async fn acquire(&self, key: &str) -> Result<LockLease> {
        let owner = Uuid::new_v4().to_string();
        if !self.store.try_acquire_lock(key, &owner, self.ttl).await? {
            return Err(TubechatError::OperationInProgress {
                key: key.to_string(),
            });
        }

        debug!(key, owner = %owner, "Acquired operation lock");
        Ok(LockLease {
            key: key.to_string(),
            owner,
        })
    }

    /// Release a lease. Failures are logged; the lease then expires on its own.
    pub async fn release(&self, lease: LockLease) {
        match self.store.release_lock(&lease.key, &lease.owner).await {
            Ok(()) => debug!(key = %lease.key, "Released operation lock"),
            Err(e) => warn!(key = %lease.key, "Failed to release operation lock: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    #[tokio::test]
    async fn test_second_acquire_is_in_progress() {
        let lock = OperationLock::new(Arc::new(SqliteStore::in_memory().unwrap()), Duration::from_secs(60));
        let key = OperationLock::channel_key("UC1");

        let lease = lock.acquire(&key).await.unwrap();
        let err = lock.acquire(&key).await.unwrap_err();
        assert!(matches!(err, TubechatError::OperationInProgress { .. }));
        assert!(err.is_retryable());

        // Other channels are independent.
        let other = lock.acquire(&OperationLock::channel_key("UC2")).await.unwrap();

        lock.release(lease).await;
        let again = lock.acquire(&key).await.unwrap();
        assert_eq!(again.key(), "ingest:UC1");
        lock.release(again).await;
        lock.release(other).await;
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let lock = OperationLock::new(Arc::new(SqliteStore::in_memory().unwrap()), Duration::ZERO);
        let _abandoned = lock.acquire("ingest:UC1").await.unwrap();
        assert!(lock.acquire("ingest:UC1").await.is_ok());
    }
}
