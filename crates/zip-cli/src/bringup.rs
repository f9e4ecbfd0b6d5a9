//! Simulated board bring-up.
//!
//! Mirrors what the firmware does at power-on before it will take remote
//! commands: validate the reset-retained safe-mode record, run the motor
//! self-test under a watchdog, then either clear the failure counter or add
//! one to it.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use tracing::{info, warn};
use zip_firmware::safe_mode::SAFE_MODE_MAX_FAILURES;
use zip_firmware::{
    run_self_test, Delay, FileStore, HardwareWatchdog, MotorDriver, SafeModeError,
    SafeModeTracker, SoftWatchdog, StatusIndicator,
};

/// Hardware watchdog timeout on the board, in milliseconds.
const BOARD_WATCHDOG_MS: u64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BringUpReport {
    pub safe_mode_at_boot: bool,
    pub self_test_passed: bool,
    pub failures: u8,
    pub safe_mode: bool,
    pub watchdog_feeds: u64,
    pub max_feed_gap_ms: u64,
}

#[derive(Default)]
struct ConsoleMotors {
    enabled: bool,
    moves: u32,
}

impl MotorDriver for ConsoleMotors {
    fn enable(&mut self) {
        self.enabled = true;
    }

    fn set_motors(&mut self, left: i16, right: i16) {
        if left != 0 || right != 0 {
            self.moves += 1;
        }
        info!(left, right, standby = self.enabled, "motors");
    }
}

struct ConsoleIndicator;

impl StatusIndicator for ConsoleIndicator {
    fn set_idle(&mut self) {
        info!("indicator idle");
    }

    fn set_color(&mut self, r: u8, g: u8, b: u8) {
        info!(r, g, b, "indicator colour");
    }
}

struct Feed(Rc<RefCell<SoftWatchdog>>);

impl HardwareWatchdog for Feed {
    fn feed(&mut self) {
        self.0.borrow_mut().feed();
    }
}

/// Advances the board clock, sleeping for real only when asked to.
struct BoardDelay {
    watchdog: Rc<RefCell<SoftWatchdog>>,
    real_time: bool,
}

impl Delay for BoardDelay {
    fn delay_ms(&mut self, ms: u64) {
        if self.real_time {
            std::thread::sleep(Duration::from_millis(ms));
        }
        self.watchdog.borrow_mut().advance(ms);
    }
}

/// Boot the simulated board with its safe-mode record kept at `store_path`.
///
/// With `real_time` the self-test takes as long as it would on the robot.
pub fn run(store_path: &Path, real_time: bool) -> Result<BringUpReport, SafeModeError> {
    let mut tracker = SafeModeTracker::init(FileStore::new(store_path))?;
    let safe_mode_at_boot = tracker.is_enabled();
    if safe_mode_at_boot {
        warn!(failures = tracker.fail_count(), "board booting in safe mode");
    }

    let watchdog = Rc::new(RefCell::new(SoftWatchdog::new(BOARD_WATCHDOG_MS)));
    let mut motors = ConsoleMotors::default();
    let passed = run_self_test(
        &mut motors,
        &mut ConsoleIndicator,
        &mut Feed(Rc::clone(&watchdog)),
        &mut BoardDelay {
            watchdog: Rc::clone(&watchdog),
            real_time,
        },
    ) && motors.moves > 0
        && !watchdog.borrow().tripped();

    if passed {
        tracker.clear_failures()?;
    } else {
        tracker.record_failure()?;
        warn!(
            failures = tracker.fail_count(),
            threshold = SAFE_MODE_MAX_FAILURES,
            "bring-up failed"
        );
    }

    let wd = watchdog.borrow();
    Ok(BringUpReport {
        safe_mode_at_boot,
        self_test_passed: passed,
        failures: tracker.fail_count(),
        safe_mode: tracker.is_enabled(),
        watchdog_feeds: wd.feeds(),
        max_feed_gap_ms: wd.max_gap_ms(),
    })
}
