//! In-process rate limiting for the public entry points.
//!
//! Two flavors, both keyed by an arbitrary string (in practice the client
//! session id, or a fixed key for global limits): a token bucket for
//! expensive operations, and a fixed window for cheap polling ones.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

// Cap on tracked keys. When reached, stale entries are pruned before
// inserting a new one.
const MAX_TRACKED_KEYS: usize = 100_000;

struct BucketState {
    tokens: f64,
    refreshed_at: Instant,
}

/// A token bucket limiter: `capacity` burst, one token minted every
/// `refill_period`.
pub struct TokenBucket {
    capacity: f64,
    refill_period: Duration,
    buckets: Mutex<HashMap<String, BucketState>>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_period: Duration) -> Self {
        Self {
            capacity: capacity.into(),
            refill_period,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for this key. Returns whether the caller may proceed.
    pub fn try_acquire(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("Must not be poisoned");

        if buckets.len() >= MAX_TRACKED_KEYS && !buckets.contains_key(key) {
            // A session back at full capacity is indistinguishable from an
            // unknown one.
            let (capacity, refill_period) = (self.capacity, self.refill_period);
            buckets.retain(|_, state| {
                let minted = now.duration_since(state.refreshed_at).as_secs_f64()
                    / refill_period.as_secs_f64();
                state.tokens + minted < capacity
            });
        }

        let capacity = self.capacity;
        let state = buckets.entry(key.to_string()).or_insert(BucketState {
            tokens: capacity,
            refreshed_at: now,
        });
        let minted = now.duration_since(state.refreshed_at).as_secs_f64()
            / self.refill_period.as_secs_f64();
        state.tokens = (state.tokens + minted).min(self.capacity);
        state.refreshed_at = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct WindowState {
    started_at: Instant,
    count: u32,
}

/// A fixed-window limiter: at most `limit` calls per `window`.
pub struct FixedWindow {
    window: Duration,
    limit: u32,
    windows: Mutex<HashMap<String, WindowState>>,
}

impl FixedWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            window,
            limit,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one call for this key. Returns whether the caller may proceed.
    pub fn try_acquire(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("Must not be poisoned");

        if windows.len() >= MAX_TRACKED_KEYS && !windows.contains_key(key) {
            let window = self.window;
            windows.retain(|_, state| now.duration_since(state.started_at) < window);
        }

        let state = windows.entry(key.to_string()).or_insert(WindowState {
            started_at: now,
            count: 0,
        });
        if now.duration_since(state.started_at) >= self.window {
            state.started_at = now;
            state.count = 0;
        }

        if state.count < self.limit {
            state.count += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    #[test]
    fn token_bucket_caps_bursts() {
        let bucket = TokenBucket::new(1, Duration::from_secs(300));

        assert!(bucket.try_acquire("session-1"));
        assert!(!bucket.try_acquire("session-1"));
        assert!(!bucket.try_acquire("session-1"));

        // Sessions don't share buckets.
        assert!(bucket.try_acquire("session-2"));
    }

    #[test]
    fn token_bucket_refills() {
        let bucket = TokenBucket::new(1, Duration::from_millis(30));

        assert!(bucket.try_acquire("s"));
        assert!(!bucket.try_acquire("s"));
        thread::sleep(Duration::from_millis(40));
        assert!(bucket.try_acquire("s"));
        // The bucket does not accumulate beyond its capacity.
        thread::sleep(Duration::from_millis(100));
        assert!(bucket.try_acquire("s"));
        assert!(!bucket.try_acquire("s"));
    }

    #[test]
    fn fixed_window_resets() {
        let window = FixedWindow::new(2, Duration::from_millis(40));

        assert!(window.try_acquire("s"));
        assert!(window.try_acquire("s"));
        assert!(!window.try_acquire("s"));
        assert!(window.try_acquire("other"));

        thread::sleep(Duration::from_millis(50));
        assert!(window.try_acquire("s"));
    }
}
