use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Platform limits
// ─────────────────────────────────────────────────────────────────────────────

/// Symmetric bound for forward/turn commands and motor PWM values.
pub const PWM_MAX: i16 = 255;

/// Shortest setpoint lifetime the firmware accepts.
pub const TTL_MIN_MS: u32 = 150;

/// Longest setpoint lifetime the firmware accepts.
pub const TTL_MAX_MS: u32 = 300;

/// Lowest streaming cadence.  Non-positive requests are raised to this.
pub const MIN_RATE_HZ: f64 = 1.0;

/// Highest streaming cadence the firmware is rated for.
pub const MAX_RATE_HZ: f64 = 50.0;

/// Cadence used when the caller does not supply one.
pub const DEFAULT_RATE_HZ: f64 = 10.0;

/// Setpoint TTL used when the caller does not supply one.
pub const DEFAULT_TTL_MS: u32 = 200;

// ─────────────────────────────────────────────────────────────────────────────
// Motion
// ─────────────────────────────────────────────────────────────────────────────

/// Desired velocity target sent to the firmware.
///
/// `v` is the forward command and `w` the turn command, both already clamped
/// to `[-PWM_MAX, PWM_MAX]`.  A setpoint is replaced wholesale on every
/// update, never merged field by field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setpoint {
    pub v: i16,
    pub w: i16,
    pub ttl_ms: u32,
}

/// Cadence and default TTL of one streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamerConfig {
    pub rate_hz: f64,
    pub ttl_ms: u32,
}

impl StreamerConfig {
    /// Tick period derived from `rate_hz`.
    pub fn period(&self) -> std::time::Duration {
        std::time::Duration::from_micros((1_000_000.0 / self.rate_hz).round() as u64)
    }
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            rate_hz: DEFAULT_RATE_HZ,
            ttl_ms: DEFAULT_TTL_MS,
        }
    }
}

/// Per-session streaming counters.  Reset on every `start`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamerStats {
    /// Identifier of the current (or most recent) session.
    pub session_id: Option<Uuid>,
    /// Setpoint frames successfully handed to the transport.
    pub frames_sent: u64,
    /// Frames the transport refused.  Streaming continues regardless.
    pub send_failures: u64,
    pub stream_started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

/// Firmware motion state, as reported in the diagnostics `state` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum MotionState {
    #[default]
    Idle = 0,
    Setpoint = 1,
    Direct = 3,
}

// ─────────────────────────────────────────────────────────────────────────────
// Health & diagnostics
// ─────────────────────────────────────────────────────────────────────────────

/// Firmware's current command source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum Owner {
    #[default]
    Idle,
    Direct,
    Stopped,
}

impl Owner {
    /// Map a raw firmware owner code onto the closed enumeration.
    ///
    /// `"I"` → Idle, `"D"` → Direct, `"X"` → Stopped.  Anything else,
    /// including a missing code, is Idle.
    pub fn from_code(code: Option<&str>) -> Self {
        match code.map(str::trim) {
            Some("D") => Owner::Direct,
            Some("X") => Owner::Stopped,
            _ => Owner::Idle,
        }
    }
}

/// Link state between the bridge and the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Handshaking,
    Ready,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Ready => "ready",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Raw, pulled snapshot of the bridge link.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeHealth {
    pub serial_open: bool,
    pub ready: bool,
    pub port: String,
    pub baud: u32,
    pub streaming: bool,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub pending_queue_depth: usize,
    pub uptime_ms: u64,
    pub last_error: Option<String>,
}

/// External status shape returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub connection: ConnectionState,
    pub connected: bool,
    pub port: String,
    pub baud: u32,
    pub streaming: bool,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub pending_commands: usize,
    pub uptime_ms: u64,
    pub last_error: Option<String>,
}

/// Firmware-side counters reported alongside diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub json_decode_errors: u64,
    pub parse_errors: u64,
    pub bad_commands: u64,
    pub uptime_ms: u64,
}

/// Decoded firmware diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotDiagnostics {
    pub owner: Owner,
    pub motor_left: i16,
    pub motor_right: i16,
    pub standby: bool,
    pub state: u8,
    pub resets: u32,
    pub stats: FirmwareStats,
}

/// External diagnostics shape returned by `get_diagnostics`.
///
/// On failure `success` is false, `error` is set and every data field is
/// `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsReport {
    pub success: bool,
    pub error: Option<String>,
    pub owner: Option<Owner>,
    pub motor_left: Option<i16>,
    pub motor_right: Option<i16>,
    pub standby: Option<bool>,
    pub state: Option<u8>,
    pub resets: Option<u32>,
    pub stats: Option<FirmwareStats>,
}

impl DiagnosticsReport {
    pub fn from_diagnostics(diag: RobotDiagnostics) -> Self {
        Self {
            success: true,
            error: None,
            owner: Some(diag.owner),
            motor_left: Some(diag.motor_left),
            motor_right: Some(diag.motor_right),
            standby: Some(diag.standby),
            state: Some(diag.state),
            resets: Some(diag.resets),
            stats: Some(diag.stats),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            owner: None,
            motor_left: None,
            motor_right: None,
            standby: None,
            state: None,
            resets: None,
            stats: None,
        }
    }
}

/// JSON Schema of [`BridgeStatus`] for external consumers.
pub fn status_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(BridgeStatus)
}

/// JSON Schema of [`DiagnosticsReport`] for external consumers.
pub fn diagnostics_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(DiagnosticsReport)
}

// ─────────────────────────────────────────────────────────────────────────────
// Event log
// ─────────────────────────────────────────────────────────────────────────────

/// Closed set of events written to the JSONL event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    SerialOpen,
    SerialClose,
    SerialError,
    RxLine,
    TxCmd,
    WsConnect,
    WsDisconnect,
    WsMsg,
    PendingTimeout,
    HandshakeStep,
    StreamStart,
    StreamStop,
    StreamUpdate,
    RateLimit,
    HealthCheck,
    EmergencyStop,
    Error,
}

/// One line of the event log.  Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub event: LogEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl LogEntry {
    /// Stamp `event` with the current UTC time.
    pub fn new(event: LogEvent, data: Option<serde_json::Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
            data,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Global error type spanning transport failures, protocol violations and an
/// unreachable bridge.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ZipError {
    #[error("Transport Error on {port}: {details}")]
    Transport { port: String, details: String },

    #[error("Protocol Error: {0}")]
    Protocol(String),

    #[error("Bridge Unreachable: {0}")]
    Unreachable(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Rate Limited: {0}")]
    RateLimited(String),

    #[error("I/O Error: {0}")]
    Io(String),

    #[error("Configuration Error: {0}")]
    Config(String),
}

impl From<std::io::Error> for ZipError {
    fn from(e: std::io::Error) -> Self {
        ZipError::Io(e.to_string())
    }
}
