//! Network time: seconds since the Horizon epoch

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Unix time of epoch second 0: 2013-11-24 12:00:00 UTC
pub const EPOCH_BEGINNING: u64 = 1_385_294_400;

/// Source of protocol timestamps
pub trait Clock: Send + Sync {
    /// Current epoch time in seconds
    fn now(&self) -> u32;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct EpochClock;

impl EpochClock {
    /// Epoch seconds of a Unix timestamp, 0 before the epoch
    pub fn from_unix(unix_secs: u64) -> u32 {
        u32::try_from(unix_secs.saturating_sub(EPOCH_BEGINNING)).unwrap_or(u32::MAX)
    }
}

impl Clock for EpochClock {
    fn now(&self) -> u32 {
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::from_unix(unix)
    }
}

/// Clock running `multiplier` times faster than real time, from a given
/// starting epoch time. Only used on offline test networks.
#[derive(Debug, Clone)]
pub struct FasterClock {
    start: u32,
    started_at: Instant,
    multiplier: u32,
}

impl FasterClock {
    pub fn new(start: u32, multiplier: u32) -> Self {
        Self {
            start,
            started_at: Instant::now(),
            multiplier: multiplier.max(1),
        }
    }
}

impl Clock for FasterClock {
    fn now(&self) -> u32 {
        let elapsed = self.started_at.elapsed().as_millis() * u128::from(self.multiplier) / 1000;
        let elapsed = u32::try_from(elapsed).unwrap_or(u32::MAX);
        self.start.saturating_add(elapsed)
    }
}

/// Manually driven clock, shared by clones
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU32>,
}

impl ManualClock {
    pub fn new(now: u32) -> Self {
        Self {
            now: Arc::new(AtomicU32::new(now)),
        }
    }

    pub fn set(&self, now: u32) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u32) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u32 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_conversion() {
        assert_eq!(EpochClock::from_unix(EPOCH_BEGINNING), 0);
        assert_eq!(EpochClock::from_unix(EPOCH_BEGINNING + 61), 61);
        assert_eq!(EpochClock::from_unix(0), 0);
        assert!(EpochClock.now() > 300_000_000);
    }

    #[test]
    fn test_manual_clock_is_shared() {
        let clock = ManualClock::new(100);
        let other = clock.clone();
        other.advance(20);
        assert_eq!(clock.now(), 120);
        clock.set(5);
        assert_eq!(other.now(), 5);
    }

    #[test]
    fn test_faster_clock_starts_at_start() {
        let clock = FasterClock::new(1_000, 10);
        let now = clock.now();
        assert!(now >= 1_000);
        assert!(now < 1_100);
    }
}
