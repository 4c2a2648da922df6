//! In-process fixed-window rate limiting per caller identity.

use crate::error::{Result, TubechatError};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Number of tracked identities above which expired windows are pruned.
const PRUNE_THRESHOLD: usize = 4096;

struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window counter keyed by identity.
pub struct RateLimiter {
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_minute() -> Self {
        Self::new(Duration::from_secs(60))
    }

    /// Count one request for `key` against `limit` requests per window.
    pub fn check(&self, key: &str, limit: u32) -> Result<()> {
        let now = Instant::now();
        let mut windows = self
            .windows
            .lock()
            .map_err(|e| TubechatError::Store(format!("Failed to acquire lock: {}", e)))?;

        if windows.len() > PRUNE_THRESHOLD {
            let window = self.window;
            windows.retain(|_, w| now.duration_since(w.started) < window);
        }

        let entry = windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count >= limit {
            let remaining = self.window.saturating_sub(now.duration_since(entry.started));
            return Err(TubechatError::RateLimited {
                retry_after_secs: remaining.as_secs().max(1),
            });
        }

        entry.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_per_key() {
        let limiter = RateLimiter::per_minute();
        assert!(limiter.check("user:a", 2).is_ok());
        assert!(limiter.check("user:a", 2).is_ok());

        match limiter.check("user:a", 2) {
            Err(TubechatError::RateLimited { retry_after_secs }) => {
                assert!((1..=60).contains(&retry_after_secs))
            }
            other => panic!("expected rate limit, got {:?}", other),
        }

        assert!(limiter.check("user:b", 2).is_ok());
    }

    #[test]
    fn test_window_resets() {
        let limiter = RateLimiter::new(Duration::from_millis(20));
        assert!(limiter.check("anon:x", 1).is_ok());
        assert!(limiter.check("anon:x", 1).is_err());
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check("anon:x", 1).is_ok());
    }

    #[test]
    fn test_zero_limit_rejects() {
        let limiter = RateLimiter::per_minute();
        assert!(limiter.check("anon:x", 0).is_err());
    }
}
