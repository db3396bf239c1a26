use crate::byte_stack::ByteStack;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Point in time measured in 100ns ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_ticks(ticks: i64) -> Self {
        Self(ticks)
    }

    pub fn from_secs_f64(seconds: f64) -> Self {
        Self((seconds * TICKS_PER_SECOND as f64).round() as i64)
    }

    pub fn ticks(self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / TICKS_PER_SECOND as f64
    }

    pub fn ticks_since(self, earlier: Timestamp) -> i64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Signed distance to `earlier` in seconds.
    pub fn seconds_since(self, earlier: Timestamp) -> f32 {
        (self.ticks_since(earlier) as f64 / TICKS_PER_SECOND as f64) as f32
    }

    pub fn offset(self, ticks: i64) -> Self {
        Self(self.0.saturating_add(ticks))
    }
}

fn duration_ticks(duration: Duration) -> i64 {
    (duration.as_nanos() / 100).min(i64::MAX as u128) as i64
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        self.offset(duration_ticks(rhs))
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        self.offset(-duration_ticks(rhs))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}s", self.as_secs_f64())
    }
}

pub trait Clock {
    fn now(&self) -> Timestamp;
}

/// Wall clock, so independent processes share an epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp::ZERO + elapsed
    }
}

/// Clock advanced explicitly, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    ticks: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            ticks: Arc::new(AtomicI64::new(start.ticks())),
        }
    }

    pub fn advance(&self, duration: Duration) -> Timestamp {
        let ticks = duration_ticks(duration);
        Timestamp(self.ticks.fetch_add(ticks, Ordering::SeqCst) + ticks)
    }

    pub fn set(&self, timestamp: Timestamp) {
        self.ticks.store(timestamp.ticks(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.ticks.load(Ordering::SeqCst))
    }
}

/// Stamps outgoing payloads with the sender's clock and maps incoming stamps
/// onto the local clock using the sending peer's offset.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeManager;

impl TimeManager {
    pub fn push_timestamp(&self, content: &mut ByteStack, now: Timestamp) {
        content.push_i64(now.ticks());
    }

    /// `remote_offset_ticks` is the estimate of (remote clock - local clock).
    pub fn pop_timestamp(&self, content: &mut ByteStack, remote_offset_ticks: i64) -> Result<Timestamp> {
        let remote = content.pop_i64()?;
        Ok(Timestamp(remote.saturating_sub(remote_offset_ticks)))
    }
}
