//! `zip-bridge` – Host-side robot bridge
//!
//! Relays intermittent velocity commands from a controller to the robot
//! firmware as a continuous, bounded stream of setpoints, and reports link
//! health and firmware diagnostics back.  The firmware's setpoint TTL is the
//! safety backstop; the streamer is what keeps refreshing it.
//!
//! # Modules
//!
//! - [`bridge`] – [`RobotBridge`][bridge::RobotBridge], the upstream
//!   contract: start / update / stop, emergency stop, status, diagnostics.
//! - [`streamer`] – [`SetpointStreamer`][streamer::SetpointStreamer]: one
//!   timer, last-write-wins updates, a single stop frame on hard stop.
//! - [`link`] – [`SerialLink`][link::SerialLink]: connection state machine,
//!   handshake, byte counters and the pending-acknowledgement queue.
//! - [`health`] – [`BridgeMonitor`][health::BridgeMonitor]: derives the
//!   stable status and diagnostics shapes, degrading instead of failing.
//! - [`event_log`] – [`EventLog`][event_log::EventLog]: batched, ordered,
//!   non-blocking JSONL event log.
//! - [`scheduler`] – [`TimerSlot`][scheduler::TimerSlot] and
//!   [`PeriodicTask`][scheduler::PeriodicTask], cancel-before-rearm timers.
//! - [`keyed_store`] – [`KeyedStore`][keyed_store::KeyedStore] with
//!   injected [`Clock`][keyed_store::Clock], age and capacity eviction.
//! - [`rate_limit`] – per-client motion call limits on top of `governor`.
//! - [`config`] – [`BridgeConfig`][config::BridgeConfig].

pub mod bridge;
pub mod config;
pub mod event_log;
pub mod health;
pub mod keyed_store;
pub mod link;
pub mod rate_limit;
pub mod scheduler;
pub mod streamer;

pub use bridge::RobotBridge;
pub use config::BridgeConfig;
pub use event_log::{EventLog, FileSink, LogSink, NullSink, RecordingSink};
pub use health::{BridgeMonitor, LinkProbe};
pub use keyed_store::{Clock, KeyedStore, ManualClock, SystemClock};
pub use link::SerialLink;
pub use rate_limit::MotionRateLimiter;
pub use scheduler::{PeriodicTask, TimerSlot};
pub use streamer::{FrameSink, SetpointStreamer};
