//! Firmware wire protocol codec.
//!
//! Commands travel as one compact JSON object per line:
//!
//! | Command | `N` | Fields |
//! |---|---|---|
//! | Hello | `0` | `H` |
//! | Diagnostics | `120` | `H` |
//! | Setpoint | `200` | `H`, `D1` (v), `D2` (w), `T` (ttl ms) |
//! | Stop | `201` | `H` only, no velocity fields |
//! | Direct PWM | `999` | `H`, `D1` (left), `D2` (right) |
//!
//! `N` is the sequence discriminator.  `200` is the data sequence and `201`
//! is reserved for the stop sequence; the firmware treats the two
//! differently.  Setpoints are fire-and-forget, every other command is
//! answered with `{<H>_ok}`.
//!
//! Nothing in this module logs, retries or keeps state.

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use zip_types::{
    FirmwareStats, Owner, RobotDiagnostics, Setpoint, MAX_RATE_HZ, MIN_RATE_HZ, PWM_MAX,
    TTL_MAX_MS, TTL_MIN_MS,
};

pub const CMD_HELLO: i64 = 0;
pub const CMD_DIAGNOSTICS: i64 = 120;
pub const CMD_SETPOINT: i64 = 200;
pub const CMD_STOP: i64 = 201;
pub const CMD_DIRECT: i64 = 999;

pub const TAG_HELLO: &str = "hello";
pub const TAG_DIAGNOSTICS: &str = "diag";
pub const TAG_SETPOINT: &str = "sp";
pub const TAG_STOP: &str = "stop";
pub const TAG_DIRECT: &str = "dm";

/// Ready marker the firmware prints once after every reset.
pub const READY_MARKER: &str = "R";

// ─────────────────────────────────────────────────────────────────────────────
// Clamps
// ─────────────────────────────────────────────────────────────────────────────

/// Clamp a forward/turn/PWM value into `[-PWM_MAX, PWM_MAX]`.
pub fn clamp_pwm(value: i32) -> i16 {
    value.clamp(-(PWM_MAX as i32), PWM_MAX as i32) as i16
}

/// Clamp a setpoint TTL into `[TTL_MIN_MS, TTL_MAX_MS]`.
pub fn clamp_ttl(ttl_ms: u32) -> u32 {
    ttl_ms.clamp(TTL_MIN_MS, TTL_MAX_MS)
}

/// Clamp a streaming cadence into `[MIN_RATE_HZ, MAX_RATE_HZ]`.
///
/// Non-positive and NaN requests become [`MIN_RATE_HZ`].
pub fn clamp_rate(rate_hz: f64) -> f64 {
    if rate_hz.is_nan() || rate_hz <= 0.0 {
        return MIN_RATE_HZ;
    }
    rate_hz.clamp(MIN_RATE_HZ, MAX_RATE_HZ)
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

/// A command addressed to the firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareCommand {
    /// Data sequence: keep driving at `v`/`w` for `ttl_ms`.
    Setpoint(Setpoint),
    /// Reserved stop sequence.  `reason` stays host-side.
    Stop { reason: String },
    Hello,
    Diagnostics,
    Direct { left: i16, right: i16 },
}

impl FirmwareCommand {
    /// The `N` discriminator for this command.
    pub fn code(&self) -> i64 {
        match self {
            FirmwareCommand::Setpoint(_) => CMD_SETPOINT,
            FirmwareCommand::Stop { .. } => CMD_STOP,
            FirmwareCommand::Hello => CMD_HELLO,
            FirmwareCommand::Diagnostics => CMD_DIAGNOSTICS,
            FirmwareCommand::Direct { .. } => CMD_DIRECT,
        }
    }

    /// The `H` tag echoed back in the firmware's acknowledgement.
    pub fn tag(&self) -> &'static str {
        match self {
            FirmwareCommand::Setpoint(_) => TAG_SETPOINT,
            FirmwareCommand::Stop { .. } => TAG_STOP,
            FirmwareCommand::Hello => TAG_HELLO,
            FirmwareCommand::Diagnostics => TAG_DIAGNOSTICS,
            FirmwareCommand::Direct { .. } => TAG_DIRECT,
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, FirmwareCommand::Stop { .. })
    }

    /// Setpoints are fire-and-forget; everything else is acknowledged.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, FirmwareCommand::Setpoint(_))
    }

    /// Serialise to a single newline-terminated wire line.
    pub fn encode(&self) -> String {
        let value = match self {
            FirmwareCommand::Setpoint(sp) => json!({
                "N": CMD_SETPOINT,
                "H": TAG_SETPOINT,
                "D1": sp.v,
                "D2": sp.w,
                "T": sp.ttl_ms,
            }),
            FirmwareCommand::Direct { left, right } => json!({
                "N": CMD_DIRECT,
                "H": TAG_DIRECT,
                "D1": left,
                "D2": right,
            }),
            other => json!({ "N": other.code(), "H": other.tag() }),
        };
        format!("{value}\n")
    }
}

/// Build a data-sequence frame with every field clamped.
pub fn build_setpoint_command(v: i32, w: i32, ttl_ms: u32) -> FirmwareCommand {
    FirmwareCommand::Setpoint(Setpoint {
        v: clamp_pwm(v),
        w: clamp_pwm(w),
        ttl_ms: clamp_ttl(ttl_ms),
    })
}

/// Build the reserved stop-sequence frame.
pub fn build_stop_command(reason: impl Into<String>) -> FirmwareCommand {
    FirmwareCommand::Stop {
        reason: reason.into(),
    }
}

/// Build a direct PWM frame with both sides clamped.
pub fn build_direct_command(left: i32, right: i32) -> FirmwareCommand {
    FirmwareCommand::Direct {
        left: clamp_pwm(left),
        right: clamp_pwm(right),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Firmware-side decoding
// ─────────────────────────────────────────────────────────────────────────────

/// Why an inbound command line was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The line is not a JSON object.
    #[error("malformed JSON: {0}")]
    Json(String),
    /// Valid JSON without a usable `N` field.
    #[error("missing command code")]
    MissingCode,
    /// `N` names no known command.
    #[error("unknown command code {0}")]
    UnknownCode(i64),
}

#[derive(Deserialize)]
struct WireCommand {
    #[serde(rename = "N")]
    n: Option<i64>,
    #[serde(rename = "H")]
    h: Option<String>,
    #[serde(rename = "D1")]
    d1: Option<i64>,
    #[serde(rename = "D2")]
    d2: Option<i64>,
    #[serde(rename = "T")]
    t: Option<u64>,
}

/// Decode one command line as the firmware sees it.  Fields are clamped the
/// same way the host clamps them; missing numeric fields read as zero.
pub fn decode_command(line: &str) -> Result<FirmwareCommand, DecodeError> {
    let wire: WireCommand =
        serde_json::from_str(line.trim()).map_err(|e| DecodeError::Json(e.to_string()))?;
    let code = wire.n.ok_or(DecodeError::MissingCode)?;
    let d1 = saturate_i32(wire.d1.unwrap_or(0));
    let d2 = saturate_i32(wire.d2.unwrap_or(0));
    match code {
        CMD_HELLO => Ok(FirmwareCommand::Hello),
        CMD_DIAGNOSTICS => Ok(FirmwareCommand::Diagnostics),
        CMD_SETPOINT => {
            let ttl = u32::try_from(wire.t.unwrap_or(0)).unwrap_or(u32::MAX);
            Ok(build_setpoint_command(d1, d2, ttl))
        }
        CMD_STOP => Ok(build_stop_command(wire.h.unwrap_or_default())),
        CMD_DIRECT => Ok(build_direct_command(d1, d2)),
        other => Err(DecodeError::UnknownCode(other)),
    }
}

fn saturate_i32(v: i64) -> i32 {
    v.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

// ─────────────────────────────────────────────────────────────────────────────
// Replies
// ─────────────────────────────────────────────────────────────────────────────

/// Compact motion state line emitted in answer to a diagnostics request:
/// `{<owner><left>,<right>,<standby>,<state>,<resets>}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateLine {
    pub owner: Owner,
    pub motor_left: i16,
    pub motor_right: i16,
    pub standby: bool,
    pub state: u8,
    pub resets: u32,
}

impl StateLine {
    pub fn with_stats(self, stats: FirmwareStats) -> RobotDiagnostics {
        RobotDiagnostics {
            owner: self.owner,
            motor_left: self.motor_left,
            motor_right: self.motor_right,
            standby: self.standby,
            state: self.state,
            resets: self.resets,
            stats,
        }
    }
}

/// A classified line received from the firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Post-reset ready marker.
    Ready,
    HelloOk,
    /// `{ok}` (untagged) or `{<tag>_ok}`.
    Ok { tag: Option<String> },
    State(StateLine),
    Stats(FirmwareStats),
    /// Anything else (boot banners, legacy replies).
    Other(String),
}

/// Classify a firmware line.  Never fails; unrecognised input is
/// [`Reply::Other`].
pub fn parse_reply(line: &str) -> Reply {
    let line = line.trim();
    if line == READY_MARKER {
        return Reply::Ready;
    }
    let Some(body) = line.strip_prefix('{').and_then(|l| l.strip_suffix('}')) else {
        return Reply::Other(line.to_string());
    };
    if body == "ok" {
        return Reply::Ok { tag: None };
    }
    if body == "hello_ok" {
        return Reply::HelloOk;
    }
    if let Some(stats) = body.strip_prefix("stats:") {
        return match parse_stats(stats) {
            Some(stats) => Reply::Stats(stats),
            None => Reply::Other(line.to_string()),
        };
    }
    if let Some(tag) = body.strip_suffix("_ok") {
        return Reply::Ok {
            tag: Some(tag.to_string()),
        };
    }
    match parse_state(body) {
        Some(state) => Reply::State(state),
        None => Reply::Other(line.to_string()),
    }
}

fn parse_state(body: &str) -> Option<StateLine> {
    let (code, rest) = match body.chars().next() {
        Some(c) if c.is_ascii_alphabetic() => (Some(&body[..1]), &body[1..]),
        _ => (None, body),
    };
    let fields: Vec<&str> = rest.split(',').map(str::trim).collect();
    let [left, right, standby, state, resets] = fields.as_slice() else {
        return None;
    };
    Some(StateLine {
        owner: Owner::from_code(code),
        motor_left: clamp_pwm(left.parse().ok()?),
        motor_right: clamp_pwm(right.parse().ok()?),
        standby: standby.parse::<u8>().ok()? != 0,
        state: state.parse().ok()?,
        resets: resets.parse().ok()?,
    })
}

fn parse_stats(body: &str) -> Option<FirmwareStats> {
    let mut stats = FirmwareStats::default();
    for pair in body.split(',') {
        let (key, value) = pair.split_once('=')?;
        let value: u64 = value.trim().parse().ok()?;
        match key.trim() {
            "rx" => stats.rx_bytes = value,
            "tx" => stats.tx_bytes = value,
            "jd" => stats.json_decode_errors = value,
            "pe" => stats.parse_errors = value,
            "bc" => stats.bad_commands = value,
            "ms" => stats.uptime_ms = value,
            _ => {}
        }
    }
    Some(stats)
}

/// `{<tag>_ok}` acknowledgement line.
pub fn encode_ok(tag: &str) -> String {
    if tag.is_empty() {
        "{ok}\n".to_string()
    } else {
        format!("{{{tag}_ok}}\n")
    }
}

/// Diagnostics state line.  `owner_code` is the raw firmware code and may
/// fall outside the host's closed set (e.g. `'M'` while streaming).
pub fn encode_state_line(
    owner_code: char,
    motor_left: i16,
    motor_right: i16,
    standby: bool,
    state: u8,
    resets: u32,
) -> String {
    format!(
        "{{{owner_code}{motor_left},{motor_right},{},{state},{resets}}}\n",
        u8::from(standby)
    )
}

/// Diagnostics counters line.
pub fn encode_stats_line(stats: &FirmwareStats) -> String {
    format!(
        "{{stats:rx={},tx={},jd={},pe={},bc={},ms={}}}\n",
        stats.rx_bytes,
        stats.tx_bytes,
        stats.json_decode_errors,
        stats.parse_errors,
        stats.bad_commands,
        stats.uptime_ms
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn wire(cmd: &FirmwareCommand) -> Value {
        serde_json::from_str(cmd.encode().trim_end()).unwrap()
    }

    #[test]
    fn out_of_range_velocities_are_clamped() {
        for (v, w) in [(1000, -1000), (256, -256), (i32::MAX, i32::MIN)] {
            match build_setpoint_command(v, w, 200) {
                FirmwareCommand::Setpoint(sp) => {
                    assert_eq!(sp.v, 255);
                    assert_eq!(sp.w, -255);
                }
                other => panic!("unexpected command {other:?}"),
            }
        }
    }

    #[test]
    fn clamping_is_idempotent() {
        for v in [-300, -255, -1, 0, 42, 255, 300] {
            let once = clamp_pwm(v);
            assert_eq!(clamp_pwm(once as i32), once);
        }
        for ttl in [0, 150, 220, 300, 10_000] {
            let once = clamp_ttl(ttl);
            assert_eq!(clamp_ttl(once), once);
        }
        for rate in [-5.0, 0.0, 0.5, 10.0, 50.0, 500.0] {
            let once = clamp_rate(rate);
            assert_eq!(clamp_rate(once), once);
        }
    }

    #[test]
    fn ttl_and_rate_bounds() {
        assert_eq!(clamp_ttl(10), TTL_MIN_MS);
        assert_eq!(clamp_ttl(5_000), TTL_MAX_MS);
        assert_eq!(clamp_ttl(250), 250);
        assert_eq!(clamp_rate(0.0), MIN_RATE_HZ);
        assert_eq!(clamp_rate(f64::NAN), MIN_RATE_HZ);
        assert_eq!(clamp_rate(f64::INFINITY), MAX_RATE_HZ);
        assert_eq!(clamp_rate(20.0), 20.0);
    }

    #[test]
    fn setpoint_frame_carries_data_sequence() {
        let json = wire(&build_setpoint_command(100, -20, 220));
        assert_eq!(json["N"], CMD_SETPOINT);
        assert_eq!(json["D1"], 100);
        assert_eq!(json["D2"], -20);
        assert_eq!(json["T"], 220);
    }

    #[test]
    fn stop_frame_has_no_velocity_fields() {
        let cmd = build_stop_command("operator");
        assert!(cmd.is_stop());
        let json = wire(&cmd);
        assert_eq!(json["N"], CMD_STOP);
        assert_eq!(json["H"], TAG_STOP);
        assert!(json.get("D1").is_none());
        assert!(json.get("D2").is_none());
        assert!(json.get("T").is_none());
    }

    #[test]
    fn encoded_lines_are_newline_terminated() {
        let line = build_setpoint_command(0, 0, 200).encode();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn only_setpoints_are_fire_and_forget() {
        assert!(!build_setpoint_command(1, 1, 200).expects_reply());
        assert!(build_stop_command("x").expects_reply());
        assert!(FirmwareCommand::Hello.expects_reply());
        assert!(FirmwareCommand::Diagnostics.expects_reply());
    }

    #[test]
    fn decode_distinguishes_setpoint_from_stop() {
        let sp = decode_command(r#"{"N":200,"H":"sp","D1":80,"D2":-10,"T":250}"#).unwrap();
        assert_eq!(
            sp,
            FirmwareCommand::Setpoint(Setpoint {
                v: 80,
                w: -10,
                ttl_ms: 250
            })
        );
        let stop = decode_command(r#"{"N":201,"H":"estop"}"#).unwrap();
        assert!(stop.is_stop());
    }

    #[test]
    fn decode_clamps_like_the_host() {
        let cmd = decode_command(r#"{"N":200,"D1":9000,"D2":-9000,"T":99999}"#).unwrap();
        assert_eq!(cmd, build_setpoint_command(255, -255, TTL_MAX_MS));
    }

    #[test]
    fn decode_errors_are_classified() {
        assert!(matches!(decode_command("{not json"), Err(DecodeError::Json(_))));
        assert_eq!(decode_command(r#"{"H":"x"}"#), Err(DecodeError::MissingCode));
        assert_eq!(decode_command(r#"{"N":42}"#), Err(DecodeError::UnknownCode(42)));
    }

    #[test]
    fn encoder_output_decodes_to_same_command() {
        let cmd = build_setpoint_command(-30, 60, 180);
        assert_eq!(decode_command(&cmd.encode()).unwrap(), cmd);
    }

    #[test]
    fn parse_acknowledgements() {
        assert_eq!(parse_reply("R"), Reply::Ready);
        assert_eq!(parse_reply("{hello_ok}"), Reply::HelloOk);
        assert_eq!(parse_reply("{ok}"), Reply::Ok { tag: None });
        assert_eq!(
            parse_reply("{stop_ok}\r"),
            Reply::Ok {
                tag: Some("stop".to_string())
            }
        );
    }

    #[test]
    fn parse_state_line() {
        let reply = parse_reply("{D-120,45,1,3,2}");
        assert_eq!(
            reply,
            Reply::State(StateLine {
                owner: Owner::Direct,
                motor_left: -120,
                motor_right: 45,
                standby: true,
                state: 3,
                resets: 2,
            })
        );
    }

    #[test]
    fn state_line_with_unknown_owner_is_idle() {
        let Reply::State(state) = parse_reply(&encode_state_line('M', 10, 10, true, 1, 1)) else {
            panic!("expected a state line");
        };
        assert_eq!(state.owner, Owner::Idle);

        let Reply::State(state) = parse_reply("{0,0,0,0,1}") else {
            panic!("expected a state line");
        };
        assert_eq!(state.owner, Owner::Idle);
    }

    #[test]
    fn parse_stats_line() {
        let stats = FirmwareStats {
            rx_bytes: 512,
            tx_bytes: 64,
            json_decode_errors: 1,
            parse_errors: 2,
            bad_commands: 3,
            uptime_ms: 9000,
        };
        assert_eq!(parse_reply(&encode_stats_line(&stats)), Reply::Stats(stats));
    }

    #[test]
    fn unrecognised_lines_are_other() {
        assert!(matches!(parse_reply("HW:abc imu=1"), Reply::Other(_)));
        assert!(matches!(parse_reply("{stats:rx=oops}"), Reply::Other(_)));
        assert!(matches!(parse_reply("{1,2}"), Reply::Other(_)));
    }
}
