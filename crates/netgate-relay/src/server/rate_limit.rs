//! Fixed-window request limiter keyed by client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use netgate_core::Clock;

const WINDOW_MS: i64 = 60_000;

#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, (i64, u32)>>,
}

impl RateLimiter {
    /// `limit` requests per client per minute; 0 disables limiting.
    pub fn new(limit: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count a request from `client`, returning whether it is allowed.
    pub fn check(&self, client: &str) -> bool {
        if self.limit == 0 {
            return true;
        }
        let now = self.clock.now_ms();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        if windows.len() > 10_000 {
            windows.retain(|_, (start, _)| now - *start <= WINDOW_MS);
        }
        let (start, count) = windows.entry(client.to_string()).or_insert((now, 0));
        if now - *start > WINDOW_MS {
            *start = now;
            *count = 0;
        }
        *count = count.saturating_add(1);
        *count <= self.limit
    }
}

#[cfg(test)]
mod tests {
    use netgate_core::ManualClock;

    use super::*;

    #[test]
    fn window_resets() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::new(2, clock.clone());
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        assert!(limiter.check("b"));
        clock.advance(60_001);
        assert!(limiter.check("a"));
    }

    #[test]
    fn zero_disables() {
        let limiter = RateLimiter::new(0, Arc::new(ManualClock::new(0)));
        for _ in 0..1_000 {
            assert!(limiter.check("a"));
        }
    }
}
