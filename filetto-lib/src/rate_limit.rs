//! Per-user fixed-window limiter for lobby creation.
//!
//! Process-local by design: the deployment model is a single server
//! instance, and the window state is disposable. Windows reset lazily on
//! the next request; the cleanup sweeper evicts entries nobody touches
//! again.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    entries: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record one request for `user_id` and report whether it is within
    /// the cap for the current window.
    pub async fn allow(&self, user_id: &str) -> bool {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get_mut(user_id) {
            Some(window) if now.duration_since(window.started_at) < self.window => {
                if window.count >= self.max_requests {
                    debug!("{}: lobby creation rate limited", user_id);
                    return false;
                }
                window.count += 1;
                true
            }
            _ => {
                entries.insert(
                    user_id.to_string(),
                    Window {
                        started_at: now,
                        count: 1,
                    },
                );
                true
            }
        }
    }

    /// Forget a user's window, re-allowing immediate creation. Invoked
    /// when their lobby is deleted.
    pub async fn clear(&self, user_id: &str) {
        self.entries.lock().await.remove(user_id);
    }

    /// Drop windows that have elapsed. Returns the number evicted.
    pub async fn evict_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, window| now.duration_since(window.started_at) < self.window);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn second_request_in_window_is_rejected() {
        let limiter = RateLimiter::new(Duration::from_millis(80), 1);
        assert!(limiter.allow("alice").await);
        assert!(!limiter.allow("alice").await);
        // Other users have their own windows.
        assert!(limiter.allow("bob").await);
    }

    #[tokio::test]
    async fn window_resets_after_elapsing() {
        let limiter = RateLimiter::new(Duration::from_millis(40), 1);
        assert!(limiter.allow("alice").await);
        assert!(!limiter.allow("alice").await);
        sleep(Duration::from_millis(60)).await;
        assert!(limiter.allow("alice").await);
    }

    #[tokio::test]
    async fn clear_reopens_the_window() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        assert!(limiter.allow("alice").await);
        limiter.clear("alice").await;
        assert!(limiter.allow("alice").await);
    }

    #[tokio::test]
    async fn eviction_only_touches_elapsed_windows() {
        let limiter = RateLimiter::new(Duration::from_millis(40), 1);
        limiter.allow("old").await;
        sleep(Duration::from_millis(60)).await;
        limiter.allow("fresh").await;
        assert_eq!(limiter.evict_expired().await, 1);
        assert!(!limiter.allow("fresh").await);
    }
}
