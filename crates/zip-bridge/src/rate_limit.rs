//! Per-client motion call rate limiting.
//!
//! Each upstream client gets its own `governor` token bucket, kept in a
//! [`KeyedStore`] so idle clients age out and the table stays bounded.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::debug;
use zip_types::ZipError;

use crate::keyed_store::{Clock, KeyedStore};

/// Client id used when the caller does not identify itself.
pub const DEFAULT_CLIENT: &str = "local";

pub struct MotionRateLimiter {
    quota: Quota,
    rate_hz: u32,
    clients: Mutex<KeyedStore<String, Arc<DefaultDirectRateLimiter>>>,
}

impl MotionRateLimiter {
    /// Allow `rate_hz` calls per second per client, with a burst of the
    /// same size.  A rate of zero is treated as one.
    pub fn new(rate_hz: u32, max_idle: Duration, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let per_second = NonZeroU32::new(rate_hz).unwrap_or(NonZeroU32::MIN);
        let clients = KeyedStore::new(clock)
            .with_max_idle(max_idle)
            .with_capacity(capacity);
        Self {
            quota: Quota::per_second(per_second),
            rate_hz: per_second.get(),
            clients: Mutex::new(clients),
        }
    }

    /// Spend one call from `client`'s budget.  Clients idle past the
    /// configured age are forgotten first.
    ///
    /// # Errors
    ///
    /// Returns [`ZipError::RateLimited`] when the budget is exhausted.
    pub fn check(&self, client: &str) -> Result<(), ZipError> {
        let limiter = {
            let mut clients = self.clients.lock().unwrap_or_else(|p| p.into_inner());
            let evicted = clients.evict_idle();
            if evicted > 0 {
                debug!(evicted, "idle rate-limit clients dropped");
            }
            let quota = self.quota;
            Arc::clone(clients.get_or_insert_with(client.to_string(), || {
                Arc::new(RateLimiter::direct(quota))
            }))
        };
        limiter.check().map_err(|_| {
            ZipError::RateLimited(format!("client '{client}' exceeded {} Hz", self.rate_hz))
        })
    }

    /// Forget clients idle past the configured age.
    pub fn evict_idle(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .evict_idle()
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn rate_hz(&self) -> u32 {
        self.rate_hz
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyed_store::ManualClock;

    fn limiter(rate: u32, capacity: usize, clock: &ManualClock) -> MotionRateLimiter {
        MotionRateLimiter::new(rate, Duration::from_secs(60), capacity, Arc::new(clock.clone()))
    }

    #[test]
    fn burst_beyond_rate_is_rejected() {
        let clock = ManualClock::new();
        let rl = limiter(50, 8, &clock);
        for _ in 0..50 {
            rl.check("ws-1").unwrap();
        }
        let err = rl.check("ws-1").unwrap_err();
        assert!(matches!(err, ZipError::RateLimited(_)));
    }

    #[test]
    fn clients_have_independent_budgets() {
        let clock = ManualClock::new();
        let rl = limiter(2, 8, &clock);
        rl.check("a").unwrap();
        rl.check("a").unwrap();
        assert!(rl.check("a").is_err());
        assert!(rl.check("b").is_ok());
        assert_eq!(rl.tracked_clients(), 2);
    }

    #[test]
    fn table_is_bounded_and_ages_out() {
        let clock = ManualClock::new();
        let rl = limiter(10, 2, &clock);
        for client in ["a", "b", "c"] {
            rl.check(client).unwrap();
        }
        assert_eq!(rl.tracked_clients(), 2);

        clock.advance(Duration::from_secs(61));
        assert_eq!(rl.evict_idle(), 2);
        assert_eq!(rl.tracked_clients(), 0);
    }

    #[test]
    fn check_forgets_idle_clients() {
        let clock = ManualClock::new();
        let rl = limiter(10, 8, &clock);
        rl.check("a").unwrap();
        rl.check("b").unwrap();
        clock.advance(Duration::from_secs(30));
        rl.check("b").unwrap();

        clock.advance(Duration::from_secs(45));
        rl.check("c").unwrap();
        assert_eq!(rl.tracked_clients(), 2);
    }

    #[test]
    fn zero_rate_is_raised_to_one() {
        let clock = ManualClock::new();
        let rl = limiter(0, 1, &clock);
        assert_eq!(rl.rate_hz(), 1);
        assert!(rl.check(DEFAULT_CLIENT).is_ok());
        assert!(rl.check(DEFAULT_CLIENT).is_err());
    }
}
