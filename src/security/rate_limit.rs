use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

const HOUR: Duration = Duration::from_secs(60 * 60);

/// Hex chars of the stored hash used as the counter key.
const KEY_LEN: usize = 12;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    // Set once when the window opens; increments never move it.
    expires_at: Instant,
}

/// Fixed-window request counter shared by all requests.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    window: Duration,
    inner: Arc<Mutex<HashMap<String, Window>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new_per_hour()
    }
}

/// Counter key for a credential: a short prefix of its stored digest.
pub fn window_key(secret_hash: &str) -> &str {
    secret_hash.get(..KEY_LEN).unwrap_or(secret_hash)
}

impl RateLimiter {
    pub fn new_per_hour() -> Self {
        Self::with_window(HOUR)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Count one request against `key`. Returns false, without counting, once
    /// `ceiling` requests have been admitted in the current window.
    pub async fn allow(&self, key: &str, ceiling: u32) -> bool {
        if ceiling == 0 {
            return false;
        }
        let now = Instant::now();
        let mut map = self.inner.lock().await;
        if let Some(window) = map.get_mut(key) {
            if window.expires_at > now {
                if window.count >= ceiling {
                    return false;
                }
                window.count += 1;
                return true;
            }
        }

        // No window, or the previous one has run out.
        map.insert(
            key.to_string(),
            Window {
                count: 1,
                expires_at: now + self.window,
            },
        );
        true
    }

    /// Time until the current window for `key` closes, if one is open.
    pub async fn retry_after(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let map = self.inner.lock().await;
        map.get(key)
            .filter(|w| w.expires_at > now)
            .map(|w| w.expires_at.saturating_duration_since(now))
    }

    /// Requests admitted in the open window for `key` (0 if none is open).
    pub async fn count(&self, key: &str) -> u32 {
        let now = Instant::now();
        let map = self.inner.lock().await;
        map.get(key)
            .filter(|w| w.expires_at > now)
            .map_or(0, |w| w.count)
    }

    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = self.inner.lock().await;
        let before = map.len();
        map.retain(|_, w| w.expires_at > now);
        before - map.len()
    }

    /// Sweep expired windows every `every` in the background, off the
    /// request path. Abort the handle to stop it.
    pub fn spawn_purge(&self, every: Duration) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = limiter.purge_expired().await;
                if removed > 0 {
                    debug!(removed, "purged expired rate-limit windows");
                }
            }
        })
    }

    /// Windows currently held, open or not yet swept.
    pub async fn tracked(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_key_is_bounded_prefix() {
        let hash = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert_eq!(window_key(hash), "ba7816bf8f01");
        assert_eq!(window_key("short"), "short");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_within_window() {
        let rl = RateLimiter::new_per_hour();
        for _ in 0..3 {
            assert!(rl.allow("k", 3).await);
        }
        assert!(!rl.allow("k", 3).await);
        // Denials are not counted.
        assert_eq!(rl.count("k").await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_expiry() {
        let rl = RateLimiter::new_per_hour();
        assert!(rl.allow("k", 2).await);
        assert!(rl.allow("k", 2).await);
        assert!(!rl.allow("k", 2).await);

        tokio::time::advance(HOUR).await;
        assert!(rl.allow("k", 2).await);
        assert_eq!(rl.count("k").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_increments_do_not_extend_window() {
        let rl = RateLimiter::new_per_hour();
        assert!(rl.allow("k", 100).await);
        tokio::time::advance(Duration::from_secs(45 * 60)).await;
        assert!(rl.allow("k", 100).await);
        assert_eq!(rl.count("k").await, 2);

        // One hour after creation, regardless of the increment at 45 minutes.
        tokio::time::advance(Duration::from_secs(15 * 60)).await;
        assert_eq!(rl.count("k").await, 0);
        assert!(rl.allow("k", 100).await);
        assert_eq!(rl.count("k").await, 1);
        assert_eq!(rl.retry_after("k").await, Some(HOUR));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let rl = RateLimiter::new_per_hour();
        assert!(rl.allow("a", 1).await);
        assert!(!rl.allow("a", 1).await);
        assert!(rl.allow("b", 1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_counts_down() {
        let rl = RateLimiter::new_per_hour();
        assert_eq!(rl.retry_after("k").await, None);
        rl.allow("k", 1).await;
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(rl.retry_after("k").await, Some(Duration::from_secs(3000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let rl = RateLimiter::with_window(Duration::from_secs(10));
        rl.allow("a", 5).await;
        tokio::time::advance(Duration::from_secs(5)).await;
        rl.allow("b", 5).await;
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(rl.purge_expired().await, 1);
        assert_eq!(rl.count("b").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_leaves_sweeping_to_purge_task() {
        let rl = RateLimiter::with_window(Duration::from_secs(10));
        for i in 0..2000 {
            rl.allow(&format!("key-{i}"), 5).await;
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        rl.allow("fresh", 5).await;
        assert_eq!(rl.tracked().await, 2001);

        let purge = rl.spawn_purge(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(31)).await;
        // "fresh" expired too by now.
        assert_eq!(rl.tracked().await, 0);
        purge.abort();
    }

    #[tokio::test]
    async fn test_zero_ceiling_denies() {
        let rl = RateLimiter::new_per_hour();
        assert!(!rl.allow("k", 0).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_at_ceiling() {
        let rl = RateLimiter::new_per_hour();
        let ceiling = 25;
        let handles: Vec<_> = (0..ceiling * 2)
            .map(|_| {
                let rl = rl.clone();
                tokio::spawn(async move { rl.allow("shared", ceiling).await })
            })
            .collect();

        let mut allowed = 0;
        for h in handles {
            if h.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, ceiling);
    }
}
