//! Failed-authentication throttling
//!
//! Each client IP accumulates failures inside a sliding window. Reaching the
//! limit blocks the IP for a fixed period; a successful login clears it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::AuthRateLimitConfig;

/// Thresholds for the limiter
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Failures tolerated inside one window
    pub max_failures: u32,
    /// How long an IP stays blocked
    pub block_duration: Duration,
    /// Failure counting window
    pub window_duration: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        (&AuthRateLimitConfig::default()).into()
    }
}

impl From<&AuthRateLimitConfig> for RateLimitConfig {
    fn from(cfg: &AuthRateLimitConfig) -> Self {
        Self {
            max_failures: cfg.max_failures,
            block_duration: Duration::from_secs(cfg.block_duration_secs),
            window_duration: Duration::from_secs(cfg.window_duration_secs),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Strikes {
    count: u32,
    window_start: Instant,
    blocked_at: Option<Instant>,
}

impl Strikes {
    fn fresh(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            blocked_at: None,
        }
    }
}

/// Per-IP failure tracker
pub struct RateLimiter {
    config: RateLimitConfig,
    strikes: Mutex<HashMap<IpAddr, Strikes>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            strikes: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, Strikes>> {
        self.strikes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count one failure; returns whether the IP is now blocked
    pub fn record_failure(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut strikes = self.lock();
        let entry = strikes.entry(ip).or_insert_with(|| Strikes::fresh(now));

        if let Some(blocked_at) = entry.blocked_at {
            if now.duration_since(blocked_at) < self.config.block_duration {
                return true;
            }
            *entry = Strikes::fresh(now);
        }
        if now.duration_since(entry.window_start) >= self.config.window_duration {
            *entry = Strikes::fresh(now);
        }

        entry.count += 1;
        if entry.count >= self.config.max_failures {
            entry.blocked_at = Some(now);
            return true;
        }
        false
    }

    /// Whether the IP is inside an active block
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.remaining_block_time(ip).is_some()
    }

    /// Time left on an active block
    pub fn remaining_block_time(&self, ip: IpAddr) -> Option<Duration> {
        let blocked_at = self.lock().get(&ip)?.blocked_at?;
        self.config
            .block_duration
            .checked_sub(blocked_at.elapsed())
            .filter(|left| !left.is_zero())
    }

    /// Forget an IP after a successful login
    pub fn reset(&self, ip: IpAddr) {
        self.lock().remove(&ip);
    }

    /// Failures counted in the current window
    pub fn failure_count(&self, ip: IpAddr) -> u32 {
        match self.lock().get(&ip) {
            Some(s) if s.window_start.elapsed() < self.config.window_duration => s.count,
            _ => 0,
        }
    }

    /// Drop entries whose window and block have both lapsed
    pub fn cleanup(&self) {
        let (window, block) = (self.config.window_duration, self.config.block_duration);
        self.lock().retain(|_, s| {
            s.blocked_at.map_or(false, |at| at.elapsed() < block)
                || s.window_start.elapsed() < window
        });
    }

    /// Number of IPs being tracked
    pub fn tracked(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn limiter(max_failures: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_failures,
            block_duration: Duration::from_secs(60),
            window_duration: Duration::from_secs(120),
        })
    }

    // Test 1: failures accumulate until the limit blocks
    #[test]
    fn test_blocks_at_limit() {
        let limiter = limiter(3);
        assert!(!limiter.record_failure(ip(1)));
        assert!(!limiter.record_failure(ip(1)));
        assert_eq!(limiter.failure_count(ip(1)), 2);
        assert!(limiter.record_failure(ip(1)));
        assert!(limiter.is_blocked(ip(1)));
        assert!(limiter.remaining_block_time(ip(1)).unwrap() <= Duration::from_secs(60));
    }

    // Test 2: IPs are independent
    #[test]
    fn test_ips_independent() {
        let limiter = limiter(1);
        limiter.record_failure(ip(1));
        assert!(limiter.is_blocked(ip(1)));
        assert!(!limiter.is_blocked(ip(2)));
    }

    // Test 3: reset clears a block
    #[test]
    fn test_reset() {
        let limiter = limiter(1);
        limiter.record_failure(ip(1));
        limiter.reset(ip(1));
        assert!(!limiter.is_blocked(ip(1)));
        assert_eq!(limiter.failure_count(ip(1)), 0);
    }

    // Test 4: cleanup forgets expired entries
    #[test]
    fn test_cleanup() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_failures: 10,
            block_duration: Duration::from_millis(1),
            window_duration: Duration::from_millis(1),
        });
        limiter.record_failure(ip(1));
        assert_eq!(limiter.tracked(), 1);
        std::thread::sleep(Duration::from_millis(5));
        limiter.cleanup();
        assert_eq!(limiter.tracked(), 0);
    }

    // Test 5: defaults follow the configuration defaults
    #[test]
    fn test_default_config() {
        let config = RateLimitConfig::default();
        assert_eq!(config.max_failures, 10);
        assert_eq!(config.block_duration, Duration::from_secs(300));
    }
}
