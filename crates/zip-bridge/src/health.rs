//! Health and diagnostics aggregation.
//!
//! Turns raw link snapshots and firmware replies into the stable
//! [`BridgeStatus`] and [`DiagnosticsReport`] shapes.  Neither call ever
//! fails: an unreachable bridge yields a fully populated, explicitly
//! degraded status, and a failed diagnostics request yields
//! `success = false` with every data field empty.  Callers branch on fields,
//! not on errors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;
use zip_types::{
    BridgeHealth, BridgeStatus, ConnectionState, DiagnosticsReport, LogEvent, RobotDiagnostics,
    ZipError,
};

use crate::event_log::EventLog;

/// Anything that can report link health and fetch firmware diagnostics.
#[async_trait]
pub trait LinkProbe: Send + Sync {
    /// Pull a snapshot.  `Err` means the bridge itself could not be reached.
    fn health(&self) -> Result<BridgeHealth, ZipError>;

    /// Ask the firmware for its diagnostics, waiting at most `timeout`.
    async fn diagnostics(&self, timeout: Duration) -> Result<RobotDiagnostics, ZipError>;
}

/// Derive the connection class from a snapshot.
///
/// Exactly one of `Ready`, `Connected` or `Disconnected` results: ready wins,
/// then an open serial port, otherwise disconnected.
pub fn classify_connection(health: &BridgeHealth) -> ConnectionState {
    if health.ready {
        ConnectionState::Ready
    } else if health.serial_open {
        ConnectionState::Connected
    } else {
        ConnectionState::Disconnected
    }
}

/// External status for a reachable bridge.
pub fn status_from_health(health: &BridgeHealth) -> BridgeStatus {
    let connection = classify_connection(health);
    BridgeStatus {
        connection,
        connected: connection != ConnectionState::Disconnected,
        port: health.port.clone(),
        baud: health.baud,
        streaming: health.streaming,
        rx_bytes: health.rx_bytes,
        tx_bytes: health.tx_bytes,
        pending_commands: health.pending_queue_depth,
        uptime_ms: health.uptime_ms,
        last_error: health.last_error.clone(),
    }
}

/// Degraded status for a bridge that could not be reached.  Counters are
/// zeroed and `last_error` carries the reason.
pub fn degraded_status(port: &str, baud: u32, error: &ZipError) -> BridgeStatus {
    BridgeStatus {
        connection: ConnectionState::Disconnected,
        connected: false,
        port: port.to_string(),
        baud,
        streaming: false,
        rx_bytes: 0,
        tx_bytes: 0,
        pending_commands: 0,
        uptime_ms: 0,
        last_error: Some(error.to_string()),
    }
}

/// Status and diagnostics front-end over a [`LinkProbe`].
pub struct BridgeMonitor {
    probe: Arc<dyn LinkProbe>,
    log: EventLog,
    port: String,
    baud: u32,
    diagnostics_timeout: Duration,
}

impl BridgeMonitor {
    pub fn new(
        probe: Arc<dyn LinkProbe>,
        log: EventLog,
        port: impl Into<String>,
        baud: u32,
        diagnostics_timeout: Duration,
    ) -> Self {
        Self {
            probe,
            log,
            port: port.into(),
            baud,
            diagnostics_timeout,
        }
    }

    /// Current status.  Logs one `health_check` event.
    pub fn status(&self) -> BridgeStatus {
        let status = match self.probe.health() {
            Ok(health) => status_from_health(&health),
            Err(e) => {
                debug!(error = %e, "bridge unreachable, reporting degraded status");
                degraded_status(&self.port, self.baud, &e)
            }
        };
        self.log.record(
            LogEvent::HealthCheck,
            Some(json!({
                "connection": status.connection,
                "streaming": status.streaming,
                "pendingCommands": status.pending_commands,
            })),
        );
        status
    }

    /// Firmware diagnostics, or a failed report explaining why not.
    pub async fn diagnostics(&self) -> DiagnosticsReport {
        let health = match self.probe.health() {
            Ok(health) => health,
            Err(e) => return DiagnosticsReport::failed(e.to_string()),
        };
        if !health.ready {
            return DiagnosticsReport::failed("bridge not ready");
        }
        match self.probe.diagnostics(self.diagnostics_timeout).await {
            Ok(diag) => DiagnosticsReport::from_diagnostics(diag),
            Err(e) => {
                debug!(error = %e, "diagnostics request failed");
                DiagnosticsReport::failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::RecordingSink;
    use zip_types::{FirmwareStats, Owner};

    struct FixedProbe {
        health: Result<BridgeHealth, ZipError>,
        diagnostics: Result<RobotDiagnostics, ZipError>,
    }

    #[async_trait]
    impl LinkProbe for FixedProbe {
        fn health(&self) -> Result<BridgeHealth, ZipError> {
            self.health.clone()
        }

        async fn diagnostics(&self, _timeout: Duration) -> Result<RobotDiagnostics, ZipError> {
            self.diagnostics.clone()
        }
    }

    fn health(serial_open: bool, ready: bool) -> BridgeHealth {
        BridgeHealth {
            serial_open,
            ready,
            port: "/dev/ttyUSB0".to_string(),
            baud: 115_200,
            rx_bytes: 10,
            tx_bytes: 20,
            pending_queue_depth: 1,
            uptime_ms: 500,
            ..BridgeHealth::default()
        }
    }

    fn diag() -> RobotDiagnostics {
        RobotDiagnostics {
            owner: Owner::Direct,
            motor_left: 10,
            motor_right: -10,
            standby: true,
            state: 3,
            resets: 1,
            stats: FirmwareStats::default(),
        }
    }

    fn monitor(probe: FixedProbe) -> (BridgeMonitor, RecordingSink, EventLog) {
        let sink = RecordingSink::new();
        let log = EventLog::new(Arc::new(sink.clone()));
        let monitor = BridgeMonitor::new(
            Arc::new(probe),
            log.clone(),
            "/dev/ttyUSB0",
            115_200,
            Duration::from_millis(100),
        );
        (monitor, sink, log)
    }

    #[test]
    fn classification_is_exclusive() {
        assert_eq!(classify_connection(&health(true, true)), ConnectionState::Ready);
        assert_eq!(classify_connection(&health(false, true)), ConnectionState::Ready);
        assert_eq!(classify_connection(&health(true, false)), ConnectionState::Connected);
        assert_eq!(classify_connection(&health(false, false)), ConnectionState::Disconnected);
    }

    #[test]
    fn status_copies_counters() {
        let status = status_from_health(&health(true, true));
        assert!(status.connected);
        assert_eq!(status.pending_commands, 1);
        assert_eq!(status.rx_bytes, 10);
        assert_eq!(status.uptime_ms, 500);
    }

    #[tokio::test]
    async fn unreachable_bridge_is_degraded_not_an_error() {
        let (monitor, sink, log) = monitor(FixedProbe {
            health: Err(ZipError::Unreachable("connection refused".into())),
            diagnostics: Ok(diag()),
        });
        let status = monitor.status();
        assert_eq!(status.connection, ConnectionState::Disconnected);
        assert!(!status.connected);
        assert_eq!(status.rx_bytes, 0);
        assert_eq!(status.tx_bytes, 0);
        assert_eq!(status.port, "/dev/ttyUSB0");
        assert!(status.last_error.unwrap().contains("connection refused"));

        log.shutdown().await;
        let events: Vec<LogEvent> = sink.entries().iter().map(|e| e.event).collect();
        assert_eq!(events, vec![LogEvent::HealthCheck]);
    }

    #[tokio::test]
    async fn diagnostics_require_ready() {
        let (monitor, _, _) = monitor(FixedProbe {
            health: Ok(health(true, false)),
            diagnostics: Ok(diag()),
        });
        let report = monitor.diagnostics().await;
        assert!(!report.success);
        assert!(report.error.is_some());
        assert!(report.motor_left.is_none());
        assert!(report.resets.is_none());
        assert!(report.stats.is_none());
    }

    #[tokio::test]
    async fn diagnostics_success_and_timeout() {
        let (ok, _, _) = monitor(FixedProbe {
            health: Ok(health(true, true)),
            diagnostics: Ok(diag()),
        });
        let report = ok.diagnostics().await;
        assert!(report.success);
        assert_eq!(report.owner, Some(Owner::Direct));
        assert_eq!(report.motor_right, Some(-10));

        let (slow, _, _) = monitor(FixedProbe {
            health: Ok(health(true, true)),
            diagnostics: Err(ZipError::Timeout("diagnostics".into())),
        });
        let report = slow.diagnostics().await;
        assert!(!report.success);
        assert!(report.error.unwrap().contains("diagnostics"));
    }
}
