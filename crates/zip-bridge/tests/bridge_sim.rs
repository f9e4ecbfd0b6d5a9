//! End-to-end: `RobotBridge` driving the simulated firmware.

use std::sync::Arc;
use std::time::Duration;

use zip_bridge::{BridgeConfig, EventLog, RecordingSink, RobotBridge};
use zip_firmware::{ManualMillis, RobotHandle, SimulatedRobot};
use zip_types::{ConnectionState, LogEvent, LogEntry, MotionState, Owner};

fn config() -> BridgeConfig {
    BridgeConfig {
        port: "sim".to_string(),
        ..BridgeConfig::default()
    }
}

async fn connected(log: EventLog) -> (RobotBridge, RobotHandle, ManualMillis) {
    let clock = ManualMillis::new();
    let (robot, handle) = SimulatedRobot::new(Arc::new(clock.clone()));
    let bridge = RobotBridge::new(config(), log);
    bridge.attach(robot).await.expect("handshake with simulated robot");
    (bridge, handle, clock)
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn streaming_keeps_the_motors_alive() {
    let (bridge, robot, clock) = connected(EventLog::disabled()).await;
    assert_eq!(bridge.get_status().connection, ConnectionState::Ready);

    bridge.start(100, 0, Some(10.0), Some(200)).unwrap();
    assert_eq!(robot.motors(), (100, 100));

    sleep_ms(50).await;
    for _ in 0..10 {
        clock.advance(100);
        sleep_ms(100).await;
        assert_eq!(robot.motors(), (100, 100));
    }
    assert_eq!(robot.setpoints().len(), 11);
    assert_eq!(bridge.streamer_stats().frames_sent, 11);
}

#[tokio::test(start_paused = true)]
async fn firmware_halts_when_the_stream_goes_quiet() {
    let (bridge, robot, clock) = connected(EventLog::disabled()).await;
    bridge.start(80, 20, Some(10.0), Some(200)).unwrap();
    assert_eq!(robot.motors(), (60, 100));

    bridge.stop(false);
    assert_eq!(robot.stop_count(), 0);
    clock.advance(199);
    assert_eq!(robot.motors(), (60, 100));
    clock.advance(1);
    assert_eq!(robot.motors(), (0, 0));
    assert_eq!(robot.motion_state(), MotionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn hard_stop_reaches_the_firmware_once() {
    let (bridge, robot, _clock) = connected(EventLog::disabled()).await;
    bridge.start(120, -40, Some(20.0), None).unwrap();
    sleep_ms(120).await;
    assert!(bridge.stop(true));
    let setpoints = robot.setpoints().len();

    sleep_ms(500).await;
    assert_eq!(robot.stop_count(), 1);
    assert_eq!(robot.owner_code(), 'X');
    assert_eq!(robot.motors(), (0, 0));
    assert_eq!(robot.setpoints().len(), setpoints);
    assert_eq!(bridge.link().pending_depth(), 0);

    assert!(!bridge.stop(true));
    assert_eq!(robot.stop_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn latest_update_wins_on_the_wire() {
    let (bridge, robot, _clock) = connected(EventLog::disabled()).await;
    bridge.start(10, 0, Some(10.0), None).unwrap();
    sleep_ms(50).await;
    bridge.update(20, 0, None).unwrap();
    bridge.update(30, 5, None).unwrap();
    bridge.update(40, 10, Some(250)).unwrap();
    sleep_ms(100).await;

    let sent = robot.setpoints();
    assert_eq!(sent.len(), 2);
    assert_eq!((sent[1].v, sent[1].w, sent[1].ttl_ms), (40, 10, 250));
    assert_eq!(robot.motors(), (30, 50));
}

#[tokio::test(start_paused = true)]
async fn diagnostics_round_trip_through_the_firmware() {
    let (bridge, robot, clock) = connected(EventLog::disabled()).await;
    bridge.start(50, 20, None, None).unwrap();
    clock.advance(40);

    let report = bridge.get_diagnostics().await;
    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.owner, Some(Owner::Idle));
    assert_eq!(report.motor_left, Some(30));
    assert_eq!(report.motor_right, Some(70));
    assert_eq!(report.standby, Some(true));
    assert_eq!(report.state, Some(MotionState::Setpoint as u8));
    assert_eq!(report.resets, Some(0));
    let stats = report.stats.unwrap();
    assert!(stats.rx_bytes > 0);
    assert_eq!(stats.bad_commands, 0);

    bridge.stop(true);
    let report = bridge.get_diagnostics().await;
    assert_eq!(report.owner, Some(Owner::Stopped));
    assert_eq!(report.motor_left, Some(0));
    assert_eq!(robot.stop_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn firmware_reset_is_noticed_and_streaming_recovers() {
    let sink = RecordingSink::new();
    let (bridge, robot, clock) = connected(EventLog::new(Arc::new(sink.clone()))).await;
    bridge.start(90, 0, Some(10.0), None).unwrap();

    robot.reset();
    assert_eq!(robot.motors(), (0, 0));
    sleep_ms(150).await;
    clock.advance(10);
    assert_eq!(robot.motors(), (90, 90));
    assert_eq!(bridge.connection_state(), ConnectionState::Ready);

    let report = bridge.get_diagnostics().await;
    assert_eq!(report.resets, Some(1));

    bridge.shutdown().await;
    let resets = sink
        .entries()
        .iter()
        .filter(|e| {
            e.event == LogEvent::HandshakeStep
                && e.data.as_ref().is_some_and(|d| d["step"] == "firmware_reset")
        })
        .count();
    assert_eq!(resets, 1);
}

#[tokio::test(start_paused = true)]
async fn unplugged_robot_counts_failures_without_stopping() {
    let (bridge, robot, _clock) = connected(EventLog::disabled()).await;
    bridge.start(60, 0, Some(10.0), None).unwrap();
    robot.set_connected(false);
    sleep_ms(350).await;

    let stats = bridge.streamer_stats();
    assert_eq!(stats.frames_sent, 1);
    assert_eq!(stats.send_failures, 3);
    assert!(bridge.is_streaming());
    assert!(bridge.get_status().last_error.is_some());

    robot.set_connected(true);
    sleep_ms(100).await;
    assert_eq!(bridge.streamer_stats().frames_sent, 2);
}

#[tokio::test(start_paused = true)]
async fn emergency_stop_halts_an_idle_robot() {
    let sink = RecordingSink::new();
    let (bridge, robot, _clock) = connected(EventLog::new(Arc::new(sink.clone()))).await;
    bridge.link().send(&zip_hal::codec::build_direct_command(200, -200)).unwrap();
    assert_eq!(robot.motors(), (200, -200));

    bridge.emergency_stop("ctrl-c").unwrap();
    assert_eq!(robot.motors(), (0, 0));
    assert_eq!(robot.owner_code(), 'X');

    bridge.shutdown().await;
    assert!(sink.entries().iter().any(|e| e.event == LogEvent::EmergencyStop));
}

#[tokio::test]
async fn session_is_written_to_the_jsonl_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs").join("bridge.jsonl");
    let log = EventLog::open(&path).await.unwrap();
    let (bridge, _robot, _clock) = connected(log).await;

    bridge.start(10, 0, None, None).unwrap();
    bridge.update(20, 0, None).unwrap();
    bridge.get_status();
    bridge.stop(true);
    bridge.shutdown().await;

    let text = std::fs::read_to_string(&path).unwrap();
    let entries: Vec<LogEntry> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let events: Vec<LogEvent> = entries.iter().map(|e| e.event).collect();

    let position = |event| events.iter().position(|e| *e == event).unwrap();
    assert!(position(LogEvent::SerialOpen) < position(LogEvent::HandshakeStep));
    assert!(position(LogEvent::StreamStart) < position(LogEvent::StreamUpdate));
    assert!(position(LogEvent::StreamUpdate) < position(LogEvent::HealthCheck));
    assert!(position(LogEvent::HealthCheck) < position(LogEvent::StreamStop));
    assert_eq!(events.last(), Some(&LogEvent::SerialClose));
    assert!(entries.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert_eq!(bridge.event_log().pending(), 0);
    assert_eq!(bridge.event_log().dropped(), 0);
}
