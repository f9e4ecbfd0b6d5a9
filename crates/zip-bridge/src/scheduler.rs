//! Cancelable periodic tasks.
//!
//! A [`TimerSlot`] holds at most one [`PeriodicTask`].  Arming the slot
//! always cancels the previous task first, so however often a caller
//! re-arms, only one cadence is ever live.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// A callback running on a fixed period inside the Tokio runtime.
///
/// The first tick fires one full period after spawning.  Ticks that fall
/// behind (a slow callback, a stalled runtime) are skipped rather than
/// replayed in a burst.  Dropping the task cancels it.
#[derive(Debug)]
pub struct PeriodicTask {
    handle: JoinHandle<()>,
    period: Duration,
}

impl PeriodicTask {
    /// Spawn `tick` every `period`.  Must be called from within a runtime.
    pub fn spawn<F>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                tick();
            }
        });
        Self { handle, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Stop the task.  No tick starts after this returns.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Holder for the single live [`PeriodicTask`].
#[derive(Debug, Default)]
pub struct TimerSlot {
    task: Option<PeriodicTask>,
    arms: u64,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel whatever is armed, then arm `tick` at `period`.
    pub fn arm<F>(&mut self, period: Duration, tick: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.cancel();
        self.task = Some(PeriodicTask::spawn(period, tick));
        self.arms += 1;
    }

    /// Cancel the armed task.  Returns `false` if nothing was armed.
    pub fn cancel(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                task.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    pub fn period(&self) -> Option<Duration> {
        self.task.as_ref().map(PeriodicTask::period)
    }

    /// How many times the slot has been armed.
    pub fn arm_count(&self) -> u64 {
        self.arms
    }
}
