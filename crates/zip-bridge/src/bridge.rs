//! Upstream contract.
//!
//! [`RobotBridge`] wires the link, the streamer, the rate limiter and the
//! health monitor together and is the only type orchestration talks to.
//! Motion calls are rate limited per client; `stop` and `emergency_stop`
//! never are.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};
use zip_hal::Transport;
use zip_types::{
    BridgeStatus, ConnectionState, DiagnosticsReport, LogEvent, StreamerConfig, StreamerStats,
    ZipError,
};

use crate::config::BridgeConfig;
use crate::event_log::EventLog;
use crate::health::BridgeMonitor;
use crate::keyed_store::{Clock, SystemClock};
use crate::link::SerialLink;
use crate::rate_limit::{DEFAULT_CLIENT, MotionRateLimiter};
use crate::streamer::SetpointStreamer;

pub struct RobotBridge {
    config: BridgeConfig,
    log: EventLog,
    link: SerialLink,
    streamer: SetpointStreamer,
    monitor: BridgeMonitor,
    limiter: MotionRateLimiter,
}

impl RobotBridge {
    /// A disconnected bridge.  Nothing is opened until [`RobotBridge::attach`]
    /// or [`RobotBridge::connect`].
    pub fn new(config: BridgeConfig, log: EventLog) -> Self {
        Self::with_clock(config, log, Arc::new(SystemClock))
    }

    /// Like [`RobotBridge::new`] with the rate limiter's clock injected.
    pub fn with_clock(config: BridgeConfig, log: EventLog, clock: Arc<dyn Clock>) -> Self {
        let link = SerialLink::new(
            config.port.clone(),
            config.baud,
            config.pending_timeout(),
            log.clone(),
        );
        let streamer = SetpointStreamer::new(
            Arc::new(link.clone()),
            log.clone(),
            config.streamer_defaults(),
        );
        let monitor = BridgeMonitor::new(
            Arc::new(link.clone()),
            log.clone(),
            config.port.clone(),
            config.baud,
            config.diagnostics_timeout(),
        );
        let limiter = MotionRateLimiter::new(
            config.rate_limit_hz,
            config.rate_limit_idle(),
            config.rate_limit_capacity,
            clock,
        );
        Self {
            config,
            log,
            link,
            streamer,
            monitor,
            limiter,
        }
    }

    /// Open the event log and the serial port named in `config`, then
    /// handshake.
    ///
    /// # Errors
    ///
    /// Fails if the log file or the port cannot be opened, or the firmware
    /// does not answer within the handshake timeout.
    pub async fn connect(config: BridgeConfig) -> Result<Self, ZipError> {
        let log = match &config.log_path {
            Some(path) => EventLog::open(path).await?,
            None => EventLog::disabled(),
        };
        let bridge = Self::new(config, log);
        bridge.link.open_serial()?;
        bridge.bring_up().await?;
        Ok(bridge)
    }

    /// Handshake over an already-open transport (simulator, test double).
    pub async fn attach(&self, transport: Box<dyn Transport>) -> Result<(), ZipError> {
        self.link.attach(transport);
        self.bring_up().await
    }

    async fn bring_up(&self) -> Result<(), ZipError> {
        self.link.handshake(self.config.handshake_timeout()).await?;
        self.link.start_poller(self.config.poll_interval());
        info!(port = %self.config.port, baud = self.config.baud, "bridge ready");
        Ok(())
    }

    fn admit(&self, client: &str, op: &str) -> Result<(), ZipError> {
        self.limiter.check(client).inspect_err(|e| {
            warn!(client, op, error = %e, "motion call rejected");
            self.log.record(
                LogEvent::RateLimit,
                Some(json!({ "client": client, "op": op, "limitHz": self.limiter.rate_hz() })),
            );
        })
    }

    // ── Motion ──────────────────────────────────────────────────────────────

    pub fn start(
        &self,
        forward: i32,
        turn: i32,
        rate_hz: Option<f64>,
        ttl_ms: Option<u32>,
    ) -> Result<StreamerConfig, ZipError> {
        self.start_as(DEFAULT_CLIENT, forward, turn, rate_hz, ttl_ms)
    }

    /// Start streaming on behalf of `client`.  Returns the clamped config
    /// actually applied.
    pub fn start_as(
        &self,
        client: &str,
        forward: i32,
        turn: i32,
        rate_hz: Option<f64>,
        ttl_ms: Option<u32>,
    ) -> Result<StreamerConfig, ZipError> {
        self.admit(client, "start")?;
        let applied = self.streamer.start(forward, turn, rate_hz, ttl_ms);
        self.link.set_streaming(true);
        Ok(applied)
    }

    pub fn update(&self, forward: i32, turn: i32, ttl_ms: Option<u32>) -> Result<(), ZipError> {
        self.update_as(DEFAULT_CLIENT, forward, turn, ttl_ms)
    }

    /// Replace the streamed setpoint on behalf of `client`.
    pub fn update_as(
        &self,
        client: &str,
        forward: i32,
        turn: i32,
        ttl_ms: Option<u32>,
    ) -> Result<(), ZipError> {
        self.admit(client, "update")?;
        self.streamer.update(forward, turn, ttl_ms);
        self.link.set_streaming(true);
        Ok(())
    }

    /// End the stream.  See [`SetpointStreamer::stop`].
    pub fn stop(&self, hard_stop: bool) -> bool {
        let was_streaming = self.streamer.stop(hard_stop);
        self.link.set_streaming(false);
        was_streaming
    }

    /// Cancel any stream and send the stop frame whether or not a stream
    /// was running.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the stop frame could not be written.
    pub fn emergency_stop(&self, reason: &str) -> Result<(), ZipError> {
        warn!(reason, "emergency stop");
        let result = self.streamer.halt(reason);
        self.link.set_streaming(false);
        self.log.record(
            LogEvent::EmergencyStop,
            Some(json!({ "reason": reason, "sent": result.is_ok() })),
        );
        result
    }

    // ── Health ──────────────────────────────────────────────────────────────

    pub fn get_status(&self) -> BridgeStatus {
        self.monitor.status()
    }

    pub async fn get_diagnostics(&self) -> DiagnosticsReport {
        self.monitor.diagnostics().await
    }

    pub fn streamer_stats(&self) -> StreamerStats {
        self.streamer.stats()
    }

    pub fn is_streaming(&self) -> bool {
        self.streamer.is_streaming()
    }

    /// Full link state, including the transitional states the status
    /// shape folds away.
    pub fn connection_state(&self) -> ConnectionState {
        self.link.connection_state()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn link(&self) -> &SerialLink {
        &self.link
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    /// Hard-stop any stream, close the port and flush the event log.
    pub async fn shutdown(&self) {
        self.stop(true);
        self.link.close();
        self.log.shutdown().await;
        info!(port = %self.config.port, "bridge shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::RecordingSink;
    use crate::keyed_store::ManualClock;
    use std::time::Duration;
    use zip_hal::{SimTransport, SimTransportHandle};

    fn config() -> BridgeConfig {
        BridgeConfig {
            port: "sim0".to_string(),
            rate_limit_hz: 3,
            ..BridgeConfig::default()
        }
    }

    async fn ready_bridge() -> (RobotBridge, SimTransportHandle, RecordingSink) {
        let sink = RecordingSink::new();
        let log = EventLog::new(Arc::new(sink.clone()));
        let bridge = RobotBridge::with_clock(config(), log, Arc::new(ManualClock::new()));
        let (transport, handle) = SimTransport::new("sim0");
        handle.push_inbound("R");
        bridge.attach(transport).await.unwrap();
        handle.clear_written();
        (bridge, handle, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_call_leaves_stream_untouched() {
        let (bridge, handle, sink) = ready_bridge().await;
        bridge.start(10, 0, None, None).unwrap();
        bridge.update(20, 0, None).unwrap();
        bridge.update(30, 0, None).unwrap();
        let err = bridge.update(99, 0, None).unwrap_err();
        assert!(matches!(err, ZipError::RateLimited(_)));

        assert!(bridge.update_as("other", 40, 0, None).is_ok());
        assert_eq!(handle.written_json().len(), 1);

        bridge.shutdown().await;
        let events: Vec<LogEvent> = sink.entries().iter().map(|e| e.event).collect();
        assert_eq!(events.iter().filter(|e| **e == LogEvent::RateLimit).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn status_reflects_streaming() {
        let (bridge, _, _) = ready_bridge().await;
        let status = bridge.get_status();
        assert_eq!(status.connection, ConnectionState::Ready);
        assert!(!status.streaming);

        bridge.start(10, 0, None, None).unwrap();
        assert!(bridge.get_status().streaming);
        bridge.stop(true);
        assert!(!bridge.get_status().streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_stop_when_idle_still_sends_stop() {
        let (bridge, handle, _) = ready_bridge().await;
        bridge.emergency_stop("operator").unwrap();
        let written = handle.written_json();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0]["N"], 201);
    }

    #[tokio::test]
    async fn disconnected_bridge_reports_degraded_diagnostics() {
        let bridge = RobotBridge::new(config(), EventLog::disabled());
        let status = bridge.get_status();
        assert_eq!(status.connection, ConnectionState::Disconnected);
        assert!(!status.connected);

        let report = bridge.get_diagnostics().await;
        assert!(!report.success);
        assert!(report.error.is_some());
    }

    #[tokio::test]
    async fn never_connected_bridge_reports_zeroed_status() {
        let bridge = RobotBridge::new(config(), EventLog::disabled());
        let status = bridge.get_status();
        assert_eq!((status.rx_bytes, status.tx_bytes, status.uptime_ms), (0, 0, 0));
        assert!(status.last_error.unwrap().contains("not open"));
    }

    #[tokio::test(start_paused = true)]
    async fn status_after_shutdown_is_degraded() {
        let (bridge, _, _) = ready_bridge().await;
        bridge.start(50, 0, None, None).unwrap();
        assert!(bridge.get_status().tx_bytes > 0);

        bridge.shutdown().await;
        let status = bridge.get_status();
        assert_eq!(status.connection, ConnectionState::Disconnected);
        assert!(!status.connected);
        assert!(!status.streaming);
        assert_eq!((status.rx_bytes, status.tx_bytes), (0, 0));
        assert!(status.last_error.unwrap().contains("closed"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_clients_age_out_of_the_limiter() {
        let sink = RecordingSink::new();
        let clock = ManualClock::new();
        let cfg = BridgeConfig {
            rate_limit_idle_secs: 10,
            ..config()
        };
        let bridge =
            RobotBridge::with_clock(cfg, EventLog::new(Arc::new(sink)), Arc::new(clock.clone()));
        let (transport, handle) = SimTransport::new("sim0");
        handle.push_inbound("R");
        bridge.attach(transport).await.unwrap();

        bridge.start_as("ws-1", 10, 0, None, None).unwrap();
        bridge.update_as("ws-2", 20, 0, None).unwrap();
        assert_eq!(bridge.limiter.tracked_clients(), 2);

        clock.advance(Duration::from_secs(11));
        bridge.update_as("ws-3", 30, 0, None).unwrap();
        assert_eq!(bridge.limiter.tracked_clients(), 1);
        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attach_leaves_link_in_error() {
        let bridge = RobotBridge::new(
            BridgeConfig {
                handshake_timeout_ms: 30,
                ..config()
            },
            EventLog::disabled(),
        );
        let (transport, _handle) = SimTransport::new("sim0");
        let err = bridge.attach(transport).await.unwrap_err();
        assert!(matches!(err, ZipError::Timeout(_)));
        assert_eq!(bridge.connection_state(), ConnectionState::Error);
        let status = bridge.get_status();
        assert_eq!(status.connection, ConnectionState::Connected);
        assert!(status.last_error.unwrap().contains("handshake"));
    }
}
