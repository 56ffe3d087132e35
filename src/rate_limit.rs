use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Sliding-window limiter keyed by chat user id.
#[derive(Debug, Default)]
pub struct RateLimiter {
    requests: HashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an attempt for `key` and returns true if it is over the limit.
    /// Rejected attempts are not counted against the window.
    pub fn check_rate_limit(&mut self, key: &str, max: usize, window_secs: u64) -> bool {
        self.check_at(key, max, Duration::from_secs(window_secs), Instant::now())
    }

    fn check_at(&mut self, key: &str, max: usize, window: Duration, now: Instant) -> bool {
        // Drop keys whose whole history has aged out
        self.requests
            .retain(|_, stamps| stamps.iter().any(|&t| now.duration_since(t) < window));

        let timestamps = self.requests.entry(key.to_string()).or_default();
        timestamps.retain(|&t| now.duration_since(t) < window);

        if timestamps.len() < max {
            timestamps.push(now);
            false
        } else {
            true
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_per_key() {
        let mut limiter = RateLimiter::new();
        let now = Instant::now();
        let window = Duration::from_secs(60);
        assert!(!limiter.check_at("U1", 2, window, now));
        assert!(!limiter.check_at("U1", 2, window, now));
        assert!(limiter.check_at("U1", 2, window, now));
        assert!(!limiter.check_at("U2", 2, window, now));
    }

    #[test]
    fn window_slides() {
        let mut limiter = RateLimiter::new();
        let start = Instant::now();
        let window = Duration::from_secs(10);
        assert!(!limiter.check_at("U1", 1, window, start));
        assert!(limiter.check_at("U1", 1, window, start + Duration::from_secs(5)));
        assert!(!limiter.check_at("U1", 1, window, start + Duration::from_secs(11)));
    }

    #[test]
    fn idle_keys_are_forgotten() {
        let mut limiter = RateLimiter::new();
        let start = Instant::now();
        let window = Duration::from_secs(10);
        limiter.check_at("U1", 5, window, start);
        limiter.check_at("U2", 5, window, start + Duration::from_secs(20));
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn zero_limit_blocks_everything() {
        let mut limiter = RateLimiter::new();
        assert!(limiter.check_rate_limit("U1", 0, 60));
    }
}
