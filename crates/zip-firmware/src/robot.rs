//! [`SimulatedRobot`]: the firmware's command loop behind a [`Transport`].
//!
//! Lines written by the host are decoded exactly as the firmware decodes
//! them, drive a [`MotionController`] and produce the same replies
//! (`R` at boot, `{hello_ok}`, `{<H>_ok}`, the diagnostics state and stats
//! lines).  Setpoints are fire-and-forget.  TTL expiry is evaluated every
//! time the host reads, so a host that stops streaming sees the motors halt.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tracing::debug;
use zip_hal::codec::{
    decode_command, encode_ok, encode_state_line, encode_stats_line, DecodeError, READY_MARKER,
    TAG_HELLO,
};
use zip_hal::{FirmwareCommand, Transport};
use zip_types::{FirmwareStats, MotionState, Setpoint, ZipError};

use crate::motion::MotionController;

// ─────────────────────────────────────────────────────────────────────────────
// Clock
// ─────────────────────────────────────────────────────────────────────────────

/// Milliseconds since boot, as `millis()` reports on the MCU.
pub trait MillisClock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall clock measured from construction.
#[derive(Debug)]
pub struct SystemMillis {
    boot: Instant,
}

impl SystemMillis {
    pub fn new() -> Self {
        Self {
            boot: Instant::now(),
        }
    }
}

impl Default for SystemMillis {
    fn default() -> Self {
        Self::new()
    }
}

impl MillisClock for SystemMillis {
    fn now_ms(&self) -> u64 {
        self.boot.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock for deterministic tests.  Clones share one time.
#[derive(Debug, Clone, Default)]
pub struct ManualMillis {
    now: Arc<AtomicU64>,
}

impl ManualMillis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl MillisClock for ManualMillis {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Firmware core
// ─────────────────────────────────────────────────────────────────────────────

struct RobotCore {
    clock: Arc<dyn MillisClock>,
    motion: MotionController,
    owner: char,
    resets: u32,
    stats: FirmwareStats,
    boot_ms: u64,
    outbound: VecDeque<String>,
    received: Vec<FirmwareCommand>,
    silent: bool,
    connected: bool,
}

impl RobotCore {
    fn boot(&mut self) {
        self.motion = MotionController::new();
        self.owner = 'I';
        self.stats = FirmwareStats::default();
        self.boot_ms = self.clock.now_ms();
        self.outbound.clear();
        self.emit(format!("{READY_MARKER}\n"));
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms().saturating_sub(self.boot_ms)
    }

    fn emit(&mut self, line: String) {
        if self.silent {
            return;
        }
        self.stats.tx_bytes += line.len() as u64;
        self.outbound.push_back(line.trim_end_matches('\n').to_string());
    }

    fn handle_line(&mut self, line: &str) {
        self.stats.rx_bytes += line.len() as u64;
        let now = self.now_ms();
        self.motion.tick(now);

        let cmd = match decode_command(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                match e {
                    DecodeError::Json(_) => self.stats.json_decode_errors += 1,
                    DecodeError::MissingCode => self.stats.parse_errors += 1,
                    DecodeError::UnknownCode(_) => self.stats.bad_commands += 1,
                }
                debug!(error = %e, "firmware rejected line");
                return;
            }
        };
        self.received.push(cmd.clone());

        match &cmd {
            FirmwareCommand::Setpoint(sp) => {
                self.owner = 'M';
                self.motion.set_setpoint(*sp, now);
            }
            FirmwareCommand::Stop { .. } => {
                self.owner = 'X';
                self.motion.stop();
                self.emit(encode_ok(cmd.tag()));
            }
            FirmwareCommand::Hello => self.emit(format!("{{{TAG_HELLO}_ok}}\n")),
            FirmwareCommand::Diagnostics => {
                let (left, right) = self.motion.outputs();
                let state_line = encode_state_line(
                    self.owner,
                    left,
                    right,
                    self.motion.driver_enabled(),
                    self.motion.state() as u8,
                    self.resets,
                );
                self.emit(state_line);
                let mut stats = self.stats;
                stats.uptime_ms = now;
                self.emit(encode_stats_line(&stats));
            }
            FirmwareCommand::Direct { left, right } => {
                self.owner = 'D';
                self.motion.set_direct(*left, *right);
                self.emit(encode_ok(cmd.tag()));
            }
        }
    }
}

fn lock(core: &Mutex<RobotCore>) -> MutexGuard<'_, RobotCore> {
    core.lock().unwrap_or_else(|p| p.into_inner())
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport + handle
// ─────────────────────────────────────────────────────────────────────────────

/// The simulated robot, seen from the host as a serial port.
pub struct SimulatedRobot {
    name: String,
    core: Arc<Mutex<RobotCore>>,
}

/// Test-side view of a [`SimulatedRobot`].
#[derive(Clone)]
pub struct RobotHandle {
    core: Arc<Mutex<RobotCore>>,
}

impl SimulatedRobot {
    /// Power on a robot.  The ready marker is queued immediately.
    pub fn new(clock: Arc<dyn MillisClock>) -> (Box<Self>, RobotHandle) {
        let mut core = RobotCore {
            clock,
            motion: MotionController::new(),
            owner: 'I',
            resets: 0,
            stats: FirmwareStats::default(),
            boot_ms: 0,
            outbound: VecDeque::new(),
            received: Vec::new(),
            silent: false,
            connected: true,
        };
        core.boot();
        let core = Arc::new(Mutex::new(core));
        let robot = Box::new(Self {
            name: "sim".to_string(),
            core: Arc::clone(&core),
        });
        (robot, RobotHandle { core })
    }
}

impl Transport for SimulatedRobot {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_line(&mut self, line: &str) -> Result<usize, ZipError> {
        let mut core = lock(&self.core);
        if !core.connected {
            return Err(ZipError::Transport {
                port: self.name.clone(),
                details: "device unplugged".to_string(),
            });
        }
        for part in line.split('\n').filter(|l| !l.trim().is_empty()) {
            core.handle_line(part);
        }
        Ok(line.len())
    }

    fn read_lines(&mut self) -> Result<(Vec<String>, usize), ZipError> {
        let mut core = lock(&self.core);
        let now = core.now_ms();
        core.motion.tick(now);
        let lines: Vec<String> = core.outbound.drain(..).collect();
        let bytes = lines.iter().map(|l| l.len() + 1).sum();
        Ok((lines, bytes))
    }

    fn close(&mut self) {
        lock(&self.core).connected = false;
    }
}

impl RobotHandle {
    /// Current `(left, right)` motor PWM after applying any TTL expiry.
    pub fn motors(&self) -> (i16, i16) {
        let mut core = lock(&self.core);
        let now = core.now_ms();
        core.motion.tick(now);
        core.motion.outputs()
    }

    pub fn motion_state(&self) -> MotionState {
        lock(&self.core).motion.state()
    }

    /// Raw owner code (`I`, `M`, `D` or `X`).
    pub fn owner_code(&self) -> char {
        lock(&self.core).owner
    }

    pub fn resets(&self) -> u32 {
        lock(&self.core).resets
    }

    pub fn stats(&self) -> FirmwareStats {
        lock(&self.core).stats
    }

    /// Every command accepted since power-on.
    pub fn received(&self) -> Vec<FirmwareCommand> {
        lock(&self.core).received.clone()
    }

    /// Setpoints accepted since power-on.
    pub fn setpoints(&self) -> Vec<Setpoint> {
        lock(&self.core)
            .received
            .iter()
            .filter_map(|c| match c {
                FirmwareCommand::Setpoint(sp) => Some(*sp),
                _ => None,
            })
            .collect()
    }

    pub fn stop_count(&self) -> usize {
        lock(&self.core)
            .received
            .iter()
            .filter(|c| c.is_stop())
            .count()
    }

    /// Soft/watchdog reset: motion halts, counters restart and `R` is sent.
    pub fn reset(&self) {
        let mut core = lock(&self.core);
        core.resets += 1;
        core.boot();
    }

    /// Stop answering (commands are still applied).
    pub fn set_silent(&self, silent: bool) {
        lock(&self.core).silent = silent;
    }

    /// Simulate the USB cable being pulled or replugged.
    pub fn set_connected(&self, connected: bool) {
        lock(&self.core).connected = connected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zip_hal::codec::{
        build_direct_command, build_setpoint_command, build_stop_command, parse_reply,
    };
    use zip_hal::Reply;

    fn send(robot: &mut SimulatedRobot, cmd: &FirmwareCommand) -> Result<usize, ZipError> {
        robot.write_line(&cmd.encode())
    }

    fn robot() -> (Box<SimulatedRobot>, RobotHandle, ManualMillis) {
        let clock = ManualMillis::new();
        let (robot, handle) = SimulatedRobot::new(Arc::new(clock.clone()));
        (robot, handle, clock)
    }

    fn replies(robot: &mut SimulatedRobot) -> Vec<Reply> {
        robot
            .read_lines()
            .unwrap()
            .0
            .iter()
            .map(|l| parse_reply(l))
            .collect()
    }

    #[test]
    fn boots_with_ready_marker_and_answers_hello() {
        let (mut robot, _, _) = robot();
        assert_eq!(replies(&mut robot), vec![Reply::Ready]);
        send(&mut robot, &FirmwareCommand::Hello).unwrap();
        assert_eq!(replies(&mut robot), vec![Reply::HelloOk]);
    }

    #[test]
    fn setpoints_are_silent_and_expire() {
        let (mut robot, handle, clock) = robot();
        replies(&mut robot);
        send(&mut robot, &build_setpoint_command(100, 0, 200)).unwrap();
        assert!(replies(&mut robot).is_empty());
        assert_eq!(handle.motors(), (100, 100));
        assert_eq!(handle.owner_code(), 'M');

        clock.advance(199);
        assert_eq!(handle.motors(), (100, 100));
        clock.advance(1);
        assert_eq!(handle.motors(), (0, 0));
        assert_eq!(handle.motion_state(), MotionState::Idle);
    }

    #[test]
    fn stop_is_acknowledged_and_disables_driver() {
        let (mut robot, handle, _) = robot();
        replies(&mut robot);
        send(&mut robot, &build_setpoint_command(80, 0, 300)).unwrap();
        send(&mut robot, &build_stop_command("test")).unwrap();
        assert_eq!(
            replies(&mut robot),
            vec![Reply::Ok {
                tag: Some("stop".to_string())
            }]
        );
        assert_eq!(handle.motors(), (0, 0));
        assert_eq!(handle.owner_code(), 'X');
        assert_eq!(handle.stop_count(), 1);
    }

    #[test]
    fn diagnostics_report_state_and_stats() {
        let (mut robot, _, clock) = robot();
        replies(&mut robot);
        send(&mut robot, &build_direct_command(-50, 70)).unwrap();
        replies(&mut robot);
        robot.write_line("garbage\n").unwrap();
        robot.write_line("{\"H\":\"x\"}\n").unwrap();
        robot.write_line("{\"N\":42}\n").unwrap();
        clock.advance(1_234);
        send(&mut robot, &FirmwareCommand::Diagnostics).unwrap();

        let got = replies(&mut robot);
        assert_eq!(got.len(), 2);
        let Reply::State(state) = got[0] else {
            panic!("expected state line, got {:?}", got[0]);
        };
        assert_eq!(state.owner, zip_types::Owner::Direct);
        assert_eq!((state.motor_left, state.motor_right), (-50, 70));
        assert!(state.standby);
        assert_eq!(state.state, MotionState::Direct as u8);

        let Reply::Stats(stats) = got[1] else {
            panic!("expected stats line, got {:?}", got[1]);
        };
        assert_eq!(stats.json_decode_errors, 1);
        assert_eq!(stats.parse_errors, 1);
        assert_eq!(stats.bad_commands, 1);
        assert_eq!(stats.uptime_ms, 1_234);
        assert!(stats.rx_bytes > 0);
    }

    #[test]
    fn reset_counts_and_halts() {
        let (mut robot, handle, _) = robot();
        send(&mut robot, &build_setpoint_command(100, 0, 300)).unwrap();
        handle.reset();
        assert_eq!(handle.resets(), 1);
        assert_eq!(handle.motors(), (0, 0));
        assert_eq!(replies(&mut robot), vec![Reply::Ready]);
    }

    #[test]
    fn unplugged_robot_refuses_writes() {
        let (mut robot, handle, _) = robot();
        handle.set_connected(false);
        assert!(send(&mut robot, &FirmwareCommand::Hello).is_err());
    }
}
