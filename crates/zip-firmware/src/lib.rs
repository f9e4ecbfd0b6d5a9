//! `zip-firmware` – Robot-side behaviour
//!
//! The rules the robot firmware enforces on its own, expressed as host-side
//! Rust so the bridge can be exercised end-to-end without hardware.
//!
//! # Modules
//!
//! - [`safe_mode`] – [`SafeModeTracker`][safe_mode::SafeModeTracker]:
//!   a magic-tagged failure counter kept in reset-retained storage that
//!   latches a fallback mode after repeated init failures, until one clean
//!   init clears it.
//! - [`self_test`] – [`run_self_test`][self_test::run_self_test]:
//!   the bring-up motor sweep, feeding the watchdog throughout.
//! - [`watchdog`] – the [`HardwareWatchdog`][watchdog::HardwareWatchdog]
//!   trait and a clock-driven [`SoftWatchdog`][watchdog::SoftWatchdog].
//! - [`motion`] – [`MotionController`][motion::MotionController]:
//!   differential mixing and the setpoint TTL that halts the motors when the
//!   host goes quiet.
//! - [`robot`] – [`SimulatedRobot`][robot::SimulatedRobot]: the firmware
//!   command loop behind a [`Transport`][zip_hal::Transport].

pub mod motion;
pub mod robot;
pub mod safe_mode;
pub mod watchdog;

pub use motion::MotionController;
pub use robot::{ManualMillis, MillisClock, RobotHandle, SimulatedRobot, SystemMillis};
pub use safe_mode::{FileStore, MemoryStore, RetainedStore, SafeModeError, SafeModeTracker};
pub use self_test::{run_self_test, Delay, MotorDriver, StatusIndicator};
pub use watchdog::{HardwareWatchdog, SoftWatchdog};
