use crate::clock::{Timestamp, TICKS_PER_SECOND};
use crate::debug::trace_rate_limit;
use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

pub const DEFAULT_SNAPSHOTS_PER_SECOND: u32 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_per_second: u32,
    pub window_duration: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_second: DEFAULT_SNAPSHOTS_PER_SECOND,
            window_duration: Duration::from_secs(1),
        }
    }
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_per_second(mut self, max: u32) -> Self {
        self.max_per_second = max;
        self
    }

    pub fn with_window_duration(mut self, duration: Duration) -> Self {
        self.window_duration = duration;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_per_second == 0 {
            return Err(ClusterError::InvalidConfig(
                "max snapshots per second must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn min_interval_ticks(&self) -> i64 {
        TICKS_PER_SECOND / i64::from(self.max_per_second.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitStats {
    pub total_allowed: u64,
    pub total_deferred: u64,
    pub allowed_in_window: u32,
}

/// Caps how often an authoritative object emits snapshots.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    last_allowed: Option<Timestamp>,
    history: VecDeque<Timestamp>,
    total_allowed: u64,
    total_deferred: u64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            last_allowed: None,
            history: VecDeque::new(),
            total_allowed: 0,
            total_deferred: 0,
        }
    }

    /// Returns whether a snapshot may go out at `now`, recording it if so.
    pub fn check_and_record(&mut self, now: Timestamp) -> bool {
        self.cleanup_old_records(now);

        if let Some(last) = self.last_allowed {
            if now.ticks_since(last) < self.config.min_interval_ticks() {
                self.total_deferred += 1;
                return false;
            }
        }

        self.last_allowed = Some(now);
        self.history.push_back(now);
        self.total_allowed += 1;
        true
    }

    /// [`RateLimiter::check_and_record`] for the object named `key`, traced.
    pub fn check_for(&mut self, key: &str, now: Timestamp) -> bool {
        let allowed = self.check_and_record(now);
        trace_rate_limit(key, allowed, self.config.max_per_second);
        allowed
    }

    fn cleanup_old_records(&mut self, now: Timestamp) {
        let cutoff = now - self.config.window_duration;

        while let Some(timestamp) = self.history.front() {
            if *timestamp < cutoff {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn reset(&mut self) {
        self.last_allowed = None;
        self.history.clear();
    }

    pub fn get_stats(&self) -> RateLimitStats {
        RateLimitStats {
            total_allowed: self.total_allowed,
            total_deferred: self.total_deferred,
            allowed_in_window: self.history.len() as u32,
        }
    }

    pub fn get_config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: RateLimitConfig) {
        self.config = config;
    }
}
