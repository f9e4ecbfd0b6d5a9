//! TTL-guarded differential-drive motion controller.
//!
//! A setpoint drives the motors only until its TTL elapses; the next
//! [`MotionController::tick`] after that halts them.  The host's streamer
//! keeps refreshing the setpoint, so losing the host stops the robot within
//! one TTL.  Time is passed in explicitly as milliseconds since boot.

use zip_hal::codec::clamp_pwm;
use zip_types::{MotionState, Setpoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActiveSetpoint {
    v: i16,
    w: i16,
    expires_at_ms: u64,
}

/// Motion state machine for the two drive motors.
///
/// `driver_enabled` mirrors the driver's standby pin: high while any motion
/// source owns the motors, pulled low by an explicit stop.
#[derive(Debug, Clone, Default)]
pub struct MotionController {
    state: MotionState,
    active: Option<ActiveSetpoint>,
    left: i16,
    right: i16,
    driver_enabled: bool,
}

/// `left = v − w`, `right = v + w`, each clamped to the PWM range.
pub fn differential_mix(v: i16, w: i16) -> (i16, i16) {
    let (v, w) = (i32::from(v), i32::from(w));
    (clamp_pwm(v - w), clamp_pwm(v + w))
}

impl MotionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a setpoint immediately and (re)start its TTL window.
    pub fn set_setpoint(&mut self, setpoint: Setpoint, now_ms: u64) {
        let (left, right) = differential_mix(setpoint.v, setpoint.w);
        self.active = Some(ActiveSetpoint {
            v: setpoint.v,
            w: setpoint.w,
            expires_at_ms: now_ms + u64::from(setpoint.ttl_ms),
        });
        self.state = MotionState::Setpoint;
        self.left = left;
        self.right = right;
        self.driver_enabled = true;
    }

    /// Expire a stale setpoint.  Returns `true` if this call halted motion.
    pub fn tick(&mut self, now_ms: u64) -> bool {
        match self.active {
            Some(active) if self.state == MotionState::Setpoint => {
                if now_ms >= active.expires_at_ms {
                    self.halt();
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Explicit stop: outputs to zero and the driver back into standby.
    pub fn stop(&mut self) {
        self.halt();
        self.driver_enabled = false;
    }

    /// Bypass the setpoint path and drive each side directly.  Direct PWM
    /// has no TTL.
    pub fn set_direct(&mut self, left: i16, right: i16) {
        self.active = None;
        self.state = MotionState::Direct;
        self.left = left;
        self.right = right;
        self.driver_enabled = true;
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    /// Current `(left, right)` PWM outputs.
    pub fn outputs(&self) -> (i16, i16) {
        (self.left, self.right)
    }

    /// Current `(v, w)` command, zero when nothing is active.
    pub fn setpoint(&self) -> (i16, i16) {
        self.active.map(|a| (a.v, a.w)).unwrap_or((0, 0))
    }

    pub fn driver_enabled(&self) -> bool {
        self.driver_enabled
    }

    fn halt(&mut self) {
        self.active = None;
        self.state = MotionState::Idle;
        self.left = 0;
        self.right = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sp(v: i16, w: i16, ttl_ms: u32) -> Setpoint {
        Setpoint { v, w, ttl_ms }
    }

    #[test]
    fn mix_turns_and_clamps() {
        assert_eq!(differential_mix(100, 0), (100, 100));
        assert_eq!(differential_mix(100, 50), (50, 150));
        assert_eq!(differential_mix(200, 200), (0, 255));
        assert_eq!(differential_mix(-255, 255), (-255, 0));
    }

    #[test]
    fn setpoint_applies_immediately() {
        let mut mc = MotionController::new();
        assert_eq!(mc.state(), MotionState::Idle);
        mc.set_setpoint(sp(100, 20, 200), 0);
        assert_eq!(mc.state(), MotionState::Setpoint);
        assert_eq!(mc.outputs(), (80, 120));
        assert!(mc.driver_enabled());
    }

    #[test]
    fn ttl_expiry_halts_motors() {
        let mut mc = MotionController::new();
        mc.set_setpoint(sp(100, 0, 200), 1_000);
        assert!(!mc.tick(1_199));
        assert_eq!(mc.outputs(), (100, 100));
        assert!(mc.tick(1_200));
        assert_eq!(mc.outputs(), (0, 0));
        assert_eq!(mc.state(), MotionState::Idle);
        assert!(!mc.tick(1_300));
    }

    #[test]
    fn refresh_rearms_ttl() {
        let mut mc = MotionController::new();
        mc.set_setpoint(sp(60, 0, 200), 0);
        for now in (100..=1_000).step_by(100) {
            mc.set_setpoint(sp(60, 0, 200), now);
            assert!(!mc.tick(now + 50));
        }
        assert_eq!(mc.outputs(), (60, 60));
        assert!(mc.tick(1_200));
    }

    #[test]
    fn stop_disables_driver() {
        let mut mc = MotionController::new();
        mc.set_setpoint(sp(50, 0, 300), 0);
        mc.stop();
        assert_eq!(mc.outputs(), (0, 0));
        assert!(!mc.driver_enabled());
        assert_eq!(mc.setpoint(), (0, 0));
    }

    #[test]
    fn direct_mode_ignores_ttl() {
        let mut mc = MotionController::new();
        mc.set_direct(-90, 90);
        assert_eq!(mc.state(), MotionState::Direct);
        assert!(!mc.tick(u64::MAX));
        assert_eq!(mc.outputs(), (-90, 90));
    }
}
