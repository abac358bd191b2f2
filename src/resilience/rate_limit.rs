//! Per-client request rate limiting for the HTTP API.
//!
//! Each client key (API token or remote address) gets a counting window:
//! the first request in a window records `reset_at = now + window`, and
//! subsequent requests increment the counter until it passes `max_requests`,
//! after which they are rejected until the window expires.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests allowed per window
    pub max_requests: u32,
    /// Window length
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Request is within the window budget.
    Allowed {
        /// Requests remaining in the current window after this one
        remaining: u32,
    },
    /// Request exceeds the budget for the current window.
    Rejected {
        /// Seconds until the window resets
        retry_after_secs: u64,
    },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

struct WindowEntry {
    count: u32,
    reset_at: Instant,
}

/// Counting-window rate limiter keyed by client identifier.
///
/// Shared via `Arc` from application state. The map is guarded by a plain
/// mutex; each check is a short critical section with no await inside.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, WindowEntry>>,
}

impl RateLimiter {
    /// Create a rate limiter with default configuration.
    pub fn new() -> Self {
        Self::with_config(RateLimitConfig::default())
    }

    /// Create a rate limiter with custom configuration.
    pub fn with_config(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Check and record a request for the given client key.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        let mut windows = self.windows.lock().unwrap();

        let entry = windows.entry(key.to_string()).or_insert(WindowEntry {
            count: 0,
            reset_at: now + self.config.window,
        });

        if now >= entry.reset_at {
            entry.count = 0;
            entry.reset_at = now + self.config.window;
        }

        entry.count += 1;
        if entry.count > self.config.max_requests {
            let retry_after = entry.reset_at.saturating_duration_since(now);
            // Round up so clients never retry inside the same window
            let retry_after_secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            RateLimitDecision::Rejected { retry_after_secs }
        } else {
            RateLimitDecision::Allowed {
                remaining: self.config.max_requests - entry.count,
            }
        }
    }

    /// Drop windows that expired before `now`.
    ///
    /// Called opportunistically so the map does not grow without bound.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        windows.retain(|_, entry| now < entry.reset_at);
    }

    /// Number of tracked client windows.
    pub fn tracked_clients(&self) -> usize {
        self.windows.lock().unwrap().len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_ms: u64) -> RateLimiter {
        RateLimiter::with_config(RateLimitConfig {
            max_requests: max,
            window: Duration::from_millis(window_ms),
        })
    }

    #[test]
    fn test_allows_up_to_max() {
        let rl = limiter(3, 1000);
        assert!(rl.check("client-a").is_allowed());
        assert!(rl.check("client-a").is_allowed());
        assert!(rl.check("client-a").is_allowed());
    }

    #[test]
    fn test_rejects_request_over_max() {
        let rl = limiter(3, 1000);
        for _ in 0..3 {
            assert!(rl.check("client-a").is_allowed());
        }
        let decision = rl.check("client-a");
        assert!(!decision.is_allowed());
        match decision {
            RateLimitDecision::Rejected { retry_after_secs } => {
                assert!(retry_after_secs >= 1);
            }
            _ => panic!("expected rejection"),
        }
    }

    #[test]
    fn test_keys_are_independent() {
        let rl = limiter(1, 1000);
        assert!(rl.check("client-a").is_allowed());
        assert!(rl.check("client-b").is_allowed());
        assert!(!rl.check("client-a").is_allowed());
    }

    #[test]
    fn test_window_reset_restores_budget() {
        let rl = limiter(2, 1000);
        let start = Instant::now();
        assert!(rl.check_at("client-a", start).is_allowed());
        assert!(rl.check_at("client-a", start).is_allowed());
        assert!(!rl.check_at("client-a", start).is_allowed());

        // After the window elapses, the counter resets
        let later = start + Duration::from_millis(1001);
        assert!(rl.check_at("client-a", later).is_allowed());
    }

    #[test]
    fn test_remaining_counts_down() {
        let rl = limiter(3, 1000);
        assert_eq!(
            rl.check("client-a"),
            RateLimitDecision::Allowed { remaining: 2 }
        );
        assert_eq!(
            rl.check("client-a"),
            RateLimitDecision::Allowed { remaining: 1 }
        );
        assert_eq!(
            rl.check("client-a"),
            RateLimitDecision::Allowed { remaining: 0 }
        );
    }

    #[test]
    fn test_purge_expired() {
        let rl = limiter(5, 10);
        rl.check("client-a");
        rl.check("client-b");
        assert_eq!(rl.tracked_clients(), 2);

        std::thread::sleep(Duration::from_millis(20));
        rl.purge_expired();
        assert_eq!(rl.tracked_clients(), 0);
    }
}
