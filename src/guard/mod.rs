//! Abuse controls and mutual exclusion: operation locks, per-identity rate
//! limits and request deduplication hashes.

mod dedup;
mod lock;
mod rate_limit;

pub use dedup::request_hash;
pub use lock::{LockLease, OperationLock};
pub use rate_limit::RateLimiter;
