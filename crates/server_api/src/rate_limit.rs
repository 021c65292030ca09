//! Fixed-window request limiter. Process-local, injected rather than
//! global, with explicit eviction of dead windows.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Error)]
#[error("rate limit exceeded for '{key}', retry in {retry_in:?}")]
pub struct RateLimited {
    pub key: String,
    pub retry_in: Duration,
}

/// Gate for AI and presence endpoints, keyed per `operation:caller`.
pub trait RateLimiter: Send + Sync {
    fn check(&self, key: &str, window: Duration, max_requests: u32) -> Result<(), RateLimited>;
}

struct Window {
    started_at: Instant,
    length: Duration,
    count: u32,
}

/// Counter per key that resets at discrete window boundaries. A burst
/// straddling a boundary can pass up to twice the nominal rate.
#[derive(Default)]
pub struct FixedWindowLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

impl FixedWindowLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every window whose interval has fully elapsed. Callers decide
    /// the cadence; the limiter never evicts on its own.
    pub fn evict_expired(&self) {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("limiter lock poisoned");
        windows.retain(|_, window| now.duration_since(window.started_at) < window.length);
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().expect("limiter lock poisoned").len()
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn check(&self, key: &str, window: Duration, max_requests: u32) -> Result<(), RateLimited> {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("limiter lock poisoned");
        let entry = windows.entry(key.to_string()).or_insert(Window {
            started_at: now,
            length: window,
            count: 0,
        });

        let elapsed = now.duration_since(entry.started_at);
        if elapsed >= entry.length {
            entry.started_at = now;
            entry.length = window;
            entry.count = 0;
        }

        entry.count += 1;
        if entry.count > max_requests {
            return Err(RateLimited {
                key: key.to_string(),
                retry_in: entry.length.saturating_sub(elapsed),
            });
        }
        Ok(())
    }
}
