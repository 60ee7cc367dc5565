//! Per-process, non-blocking rate limiting for outbound email providers.
//!
//! `check_limit` never waits: it either admits the call and counts it against
//! the window immediately, or refuses with the remaining time until the
//! window resets. Refusals are reported to the caller as a retryable failure
//! with a computed reset time, never as a blocking sleep in the handler path.

use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub requests_per_second: u32,
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub burst_limit: u32,
}

impl RateLimits {
    pub const fn new(requests_per_second: u32, requests_per_minute: u32, requests_per_hour: u32, burst_limit: u32) -> Self {
        Self {
            requests_per_second,
            requests_per_minute,
            requests_per_hour,
            burst_limit,
        }
    }
}

pub const SENDGRID_DEFAULT: RateLimits = RateLimits::new(10, 500, 10_000, 20);
pub const SES_DEFAULT: RateLimits = RateLimits::new(14, 500, 10_000, 28);
pub const RESEND_DEFAULT: RateLimits = RateLimits::new(10, 500, 10_000, 20);
pub const SMTP_DEFAULT: RateLimits = RateLimits::new(5, 200, 5_000, 10);

#[derive(Debug, Default)]
struct Window {
    count: u32,
    started_at: Option<Instant>,
}

impl Window {
    fn tick(&mut self, period: Duration, limit: u32) -> Result<(), Duration> {
        if limit == 0 {
            return Ok(());
        }

        let now = Instant::now();
        match self.started_at {
            Some(start) if now.duration_since(start) < period => {
                if self.count >= limit {
                    return Err(period - now.duration_since(start));
                }
                self.count += 1;
                Ok(())
            }
            _ => {
                self.started_at = Some(now);
                self.count = 1;
                Ok(())
            }
        }
    }
}

#[derive(Debug, Default)]
struct ProviderWindows {
    second: Window,
    minute: Window,
    hour: Window,
}

/// Keyed by `(provider, credential fingerprint)` so distinct destinations
/// sharing a provider but not credentials get independent budgets.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: DashMap<String, ProviderWindows>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_limit(&self, key: &str, limits: &RateLimits) -> Result<(), Duration> {
        let mut entry = self.windows.entry(key.to_string()).or_default();
        entry.second.tick(Duration::from_secs(1), limits.requests_per_second)?;
        entry.minute.tick(Duration::from_secs(60), limits.requests_per_minute)?;
        entry.hour.tick(Duration::from_secs(3600), limits.requests_per_hour)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_calls_under_the_limit() {
        let limiter = RateLimiter::new();
        let limits = RateLimits::new(2, 100, 1000, 2);
        assert!(limiter.check_limit("k", &limits).is_ok());
        assert!(limiter.check_limit("k", &limits).is_ok());
    }

    #[test]
    fn refuses_once_the_per_second_limit_is_exceeded() {
        let limiter = RateLimiter::new();
        let limits = RateLimits::new(1, 100, 1000, 1);
        assert!(limiter.check_limit("k", &limits).is_ok());
        assert!(limiter.check_limit("k", &limits).is_err());
    }

    #[test]
    fn distinct_keys_have_independent_budgets() {
        let limiter = RateLimiter::new();
        let limits = RateLimits::new(1, 100, 1000, 1);
        assert!(limiter.check_limit("a", &limits).is_ok());
        assert!(limiter.check_limit("b", &limits).is_ok());
    }
}
