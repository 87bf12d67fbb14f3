// Per-key fixed-window rate limiter

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

/// Tracked keys above which `allow` sweeps out expired windows
const PRUNE_AT: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Window {
    opened: Instant,
    used: u32,
}

/// Admits at most `max_requests` calls per key within each window. A denied
/// call is not queued; callers get `false` and report it.
#[derive(Debug)]
pub struct RateLimiter {
    windows: DashMap<String, Window>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        RateLimiter {
            windows: DashMap::new(),
            max_requests,
            window,
        }
    }

    /// Consume one unit of `key`'s budget if any is left
    pub fn allow(&self, key: &str) -> bool {
        if self.windows.len() >= PRUNE_AT {
            self.prune();
        }

        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            opened: now,
            used: 0,
        });

        if now.duration_since(entry.opened) >= self.window {
            entry.opened = now;
            entry.used = 0;
        }

        if entry.used < self.max_requests {
            entry.used += 1;
            true
        } else {
            warn!(key, limit = self.max_requests, "rate limit exceeded");
            false
        }
    }

    /// Budget left for `key` in its current window
    pub fn remaining(&self, key: &str) -> u32 {
        match self.windows.get(key) {
            Some(w) if w.opened.elapsed() < self.window => {
                self.max_requests.saturating_sub(w.used)
            }
            _ => self.max_requests,
        }
    }

    /// Forget keys whose window has run out; they start fresh anyway
    pub fn prune(&self) {
        let window = self.window;
        self.windows.retain(|_, w| w.opened.elapsed() < window);
    }

    /// Keys currently holding a window
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }

    pub fn reset(&self, key: &str) {
        self.windows.remove(key);
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        RateLimiter::new(10, Duration::from_secs(60))
    }
}
