//! Hardware watchdog abstraction.
//!
//! The firmware arms a hardware watchdog that resets the MCU when it is not
//! fed in time.  [`SoftWatchdog`] models that timer against an explicit
//! millisecond clock so long-running routines (the bring-up self-test) can
//! be checked for feed gaps without real hardware.

/// A resettable hardware watchdog.
pub trait HardwareWatchdog {
    /// Feed the watchdog, restarting its countdown.
    fn feed(&mut self);
}

/// Watchdog model with an explicit clock.
///
/// `advance` moves time forward; if more than `timeout_ms` passes between
/// two feeds the watchdog records a trip, which on real hardware would have
/// reset the board.
#[derive(Debug, Clone)]
pub struct SoftWatchdog {
    timeout_ms: u64,
    now_ms: u64,
    last_feed_ms: u64,
    feeds: u64,
    max_gap_ms: u64,
    tripped: bool,
}

impl SoftWatchdog {
    /// Arm a watchdog that trips after `timeout_ms` without a feed.
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            now_ms: 0,
            last_feed_ms: 0,
            feeds: 0,
            max_gap_ms: 0,
            tripped: false,
        }
    }

    /// Move the watchdog's clock forward by `ms`.
    pub fn advance(&mut self, ms: u64) {
        self.now_ms += ms;
        let gap = self.now_ms - self.last_feed_ms;
        self.max_gap_ms = self.max_gap_ms.max(gap);
        if gap > self.timeout_ms {
            self.tripped = true;
        }
    }

    /// Whether a feed gap ever exceeded the timeout.
    pub fn tripped(&self) -> bool {
        self.tripped
    }

    pub fn feeds(&self) -> u64 {
        self.feeds
    }

    /// Longest observed interval between feeds.
    pub fn max_gap_ms(&self) -> u64 {
        self.max_gap_ms
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }
}

impl HardwareWatchdog for SoftWatchdog {
    fn feed(&mut self) {
        self.last_feed_ms = self.now_ms;
        self.feeds += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_feeds_keep_watchdog_quiet() {
        let mut wd = SoftWatchdog::new(250);
        for _ in 0..20 {
            wd.feed();
            wd.advance(100);
        }
        assert!(!wd.tripped());
        assert_eq!(wd.feeds(), 20);
        assert_eq!(wd.max_gap_ms(), 100);
    }

    #[test]
    fn long_silence_trips() {
        let mut wd = SoftWatchdog::new(250);
        wd.feed();
        wd.advance(200);
        assert!(!wd.tripped());
        wd.advance(100);
        assert!(wd.tripped());
    }
}
