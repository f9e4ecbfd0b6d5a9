//! Serial link to the firmware.
//!
//! [`SerialLink`] owns the [`Transport`], walks the connection state machine
//! (`Disconnected → Connecting → Connected → Handshaking → Ready`, or
//! `Error`), counts bytes in both directions and tracks request/response
//! commands until the firmware acknowledges them.  Setpoint frames are
//! fire-and-forget and never enter the pending queue.
//!
//! A background poller drains inbound lines and expires stale pending
//! commands.  Every transport call is bounded, so the link is safe to use
//! from the streaming timer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use zip_hal::codec::{parse_reply, Reply, StateLine};
use zip_hal::{FirmwareCommand, SerialTransport, Transport};
use zip_types::{
    BridgeHealth, ConnectionState, FirmwareStats, LogEvent, RobotDiagnostics, ZipError,
};

use crate::event_log::EventLog;
use crate::health::LinkProbe;
use crate::scheduler::TimerSlot;
use crate::streamer::FrameSink;

/// How often blocking waits (handshake, diagnostics) re-poll the transport.
const WAIT_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
struct PendingCommand {
    tag: String,
    code: i64,
    sent_at: Instant,
}

struct LinkState {
    transport: Option<Box<dyn Transport>>,
    state: ConnectionState,
    rx_bytes: u64,
    tx_bytes: u64,
    pending: VecDeque<PendingCommand>,
    opened_at: Option<Instant>,
    last_error: Option<String>,
    hello_acked: bool,
    ready_marker: bool,
    diag_state: Option<StateLine>,
    diag_stats: Option<FirmwareStats>,
}

struct Shared {
    port: String,
    baud: u32,
    pending_timeout: Duration,
    log: EventLog,
    streaming: AtomicBool,
    state: Mutex<LinkState>,
    poller: Mutex<TimerSlot>,
    diag_gate: tokio::sync::Mutex<()>,
}

/// Handle to the serial link.  Clones share one connection.
#[derive(Clone)]
pub struct SerialLink {
    shared: Arc<Shared>,
}

impl SerialLink {
    /// A disconnected link for `port` at `baud`.
    pub fn new(port: impl Into<String>, baud: u32, pending_timeout: Duration, log: EventLog) -> Self {
        Self {
            shared: Arc::new(Shared {
                port: port.into(),
                baud,
                pending_timeout,
                log,
                streaming: AtomicBool::new(false),
                state: Mutex::new(LinkState {
                    transport: None,
                    state: ConnectionState::Disconnected,
                    rx_bytes: 0,
                    tx_bytes: 0,
                    pending: VecDeque::new(),
                    opened_at: None,
                    last_error: None,
                    hello_acked: false,
                    ready_marker: false,
                    diag_state: None,
                    diag_stats: None,
                }),
                poller: Mutex::new(TimerSlot::new()),
                diag_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.shared.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn log(&self, event: LogEvent, data: serde_json::Value) {
        self.shared.log.record(event, Some(data));
    }

    pub fn port(&self) -> &str {
        &self.shared.port
    }

    pub fn baud(&self) -> u32 {
        self.shared.baud
    }

    /// Open the configured serial device.
    ///
    /// # Errors
    ///
    /// Returns [`ZipError::Transport`] and moves to `Error` if the port
    /// cannot be opened.
    pub fn open_serial(&self) -> Result<(), ZipError> {
        self.lock().state = ConnectionState::Connecting;
        match SerialTransport::open(&self.shared.port, self.shared.baud) {
            Ok(transport) => {
                self.attach(Box::new(transport));
                Ok(())
            }
            Err(e) => {
                let mut st = self.lock();
                st.state = ConnectionState::Error;
                st.last_error = Some(e.to_string());
                drop(st);
                warn!(port = %self.shared.port, error = %e, "serial open failed");
                self.log(
                    LogEvent::SerialError,
                    json!({ "port": self.shared.port, "error": e.to_string() }),
                );
                Err(e)
            }
        }
    }

    /// Take ownership of an already-open transport.  Resets all counters.
    pub fn attach(&self, transport: Box<dyn Transport>) {
        let name = transport.name().to_string();
        {
            let mut st = self.lock();
            if let Some(mut old) = st.transport.take() {
                old.close();
            }
            st.transport = Some(transport);
            st.state = ConnectionState::Connected;
            st.rx_bytes = 0;
            st.tx_bytes = 0;
            st.pending.clear();
            st.opened_at = Some(Instant::now());
            st.last_error = None;
            st.hello_acked = false;
            st.ready_marker = false;
        }
        info!(port = %self.shared.port, transport = %name, "serial link open");
        self.log(
            LogEvent::SerialOpen,
            json!({ "port": self.shared.port, "baud": self.shared.baud, "transport": name }),
        );
    }

    /// Say hello and wait for `{hello_ok}` or the firmware's ready marker.
    ///
    /// # Errors
    ///
    /// [`ZipError::Unreachable`] when no transport is attached,
    /// [`ZipError::Timeout`] when the firmware stays silent.
    pub async fn handshake(&self, timeout: Duration) -> Result<(), ZipError> {
        {
            let mut st = self.lock();
            if st.transport.is_none() {
                return Err(ZipError::Unreachable("serial port not open".to_string()));
            }
            st.state = ConnectionState::Handshaking;
            st.hello_acked = false;
        }
        self.log(LogEvent::HandshakeStep, json!({ "step": "hello" }));
        if let Err(e) = self.send(&FirmwareCommand::Hello) {
            self.fail(&e);
            return Err(e);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let _ = self.poll();
            {
                let mut st = self.lock();
                if st.hello_acked || st.ready_marker {
                    let via = if st.hello_acked { "hello_ok" } else { "ready_marker" };
                    st.state = ConnectionState::Ready;
                    resolve(&mut st.pending, Some("hello"));
                    drop(st);
                    info!(port = %self.shared.port, via, "firmware ready");
                    self.log(LogEvent::HandshakeStep, json!({ "step": "ready", "via": via }));
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                let e = ZipError::Timeout("firmware handshake".to_string());
                self.log(LogEvent::HandshakeStep, json!({ "step": "timeout" }));
                self.fail(&e);
                return Err(e);
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    fn fail(&self, e: &ZipError) {
        let mut st = self.lock();
        st.state = ConnectionState::Error;
        st.last_error = Some(e.to_string());
        drop(st);
        warn!(port = %self.shared.port, error = %e, "serial link error");
        self.log(LogEvent::SerialError, json!({ "error": e.to_string() }));
    }

    /// Write one command.  Commands that expect an acknowledgement enter the
    /// pending queue.  Returns the bytes written.
    pub fn send(&self, cmd: &FirmwareCommand) -> Result<usize, ZipError> {
        let line = cmd.encode();
        let result = {
            let mut st = self.lock();
            let Some(transport) = st.transport.as_mut() else {
                return Err(ZipError::Unreachable("serial port not open".to_string()));
            };
            match transport.write_line(&line) {
                Ok(n) => {
                    st.tx_bytes += n as u64;
                    if cmd.expects_reply() {
                        st.pending.push_back(PendingCommand {
                            tag: cmd.tag().to_string(),
                            code: cmd.code(),
                            sent_at: Instant::now(),
                        });
                    }
                    Ok(n)
                }
                Err(e) => {
                    st.last_error = Some(e.to_string());
                    Err(e)
                }
            }
        };
        match &result {
            Ok(_) => self.log(
                LogEvent::TxCmd,
                json!({ "N": cmd.code(), "H": cmd.tag(), "line": line.trim_end() }),
            ),
            Err(e) => self.log(
                LogEvent::SerialError,
                json!({ "N": cmd.code(), "error": e.to_string() }),
            ),
        }
        result
    }

    /// Drain and dispatch every line the firmware has sent.  Returns the
    /// number of lines handled.
    pub fn poll(&self) -> Result<usize, ZipError> {
        let (lines, reset_while_ready) = {
            let mut st = self.lock();
            let Some(transport) = st.transport.as_mut() else {
                return Ok(0);
            };
            let (lines, bytes) = match transport.read_lines() {
                Ok(read) => read,
                Err(e) => {
                    drop(st);
                    self.fail(&e);
                    return Err(e);
                }
            };
            st.rx_bytes += bytes as u64;
            let mut reset_while_ready = false;
            for line in &lines {
                match parse_reply(line) {
                    Reply::Ready => {
                        reset_while_ready |= st.state == ConnectionState::Ready;
                        st.ready_marker = true;
                    }
                    Reply::HelloOk => {
                        st.hello_acked = true;
                        resolve(&mut st.pending, Some("hello"));
                    }
                    Reply::Ok { tag } => resolve(&mut st.pending, tag.as_deref()),
                    Reply::State(state) => st.diag_state = Some(state),
                    Reply::Stats(stats) => {
                        st.diag_stats = Some(stats);
                        resolve(&mut st.pending, Some("diag"));
                    }
                    Reply::Other(other) => debug!(line = %other, "unrecognised firmware line"),
                }
            }
            (lines, reset_while_ready)
        };

        for line in &lines {
            self.log(LogEvent::RxLine, json!({ "line": line }));
        }
        if reset_while_ready {
            warn!(port = %self.shared.port, "firmware reset detected");
            self.log(LogEvent::HandshakeStep, json!({ "step": "firmware_reset" }));
        }
        Ok(lines.len())
    }

    /// Drop pending commands older than the configured timeout.
    pub fn expire_pending(&self) -> usize {
        let timeout = self.shared.pending_timeout;
        let now = Instant::now();
        let expired: Vec<PendingCommand> = {
            let mut st = self.lock();
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) = st
                .pending
                .drain(..)
                .partition(|p| now.saturating_duration_since(p.sent_at) >= timeout);
            st.pending = fresh;
            stale.into_iter().collect()
        };
        for p in &expired {
            warn!(tag = %p.tag, code = p.code, "command not acknowledged");
            self.log(
                LogEvent::PendingTimeout,
                json!({
                    "H": p.tag,
                    "N": p.code,
                    "ageMs": now.saturating_duration_since(p.sent_at).as_millis() as u64,
                }),
            );
        }
        expired.len()
    }

    /// Start the background poller.  Re-arming replaces the previous one.
    pub fn start_poller(&self, interval: Duration) {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        self.shared
            .poller
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .arm(interval, move || {
                if let Some(shared) = weak.upgrade() {
                    let link = SerialLink { shared };
                    let _ = link.poll();
                    link.expire_pending();
                }
            });
    }

    pub fn stop_poller(&self) {
        self.shared
            .poller
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .cancel();
    }

    /// Request firmware diagnostics (`N=120`) and wait for both reply lines.
    ///
    /// Requests are serialised: the firmware's reply lines carry no request
    /// id, so only one request may be outstanding at a time.
    pub async fn request_diagnostics(&self, timeout: Duration) -> Result<RobotDiagnostics, ZipError> {
        let _gate = self.shared.diag_gate.lock().await;
        if self.connection_state() != ConnectionState::Ready {
            return Err(ZipError::Unreachable("bridge not ready".to_string()));
        }
        {
            let mut st = self.lock();
            st.diag_state = None;
            st.diag_stats = None;
        }
        self.send(&FirmwareCommand::Diagnostics)?;

        let deadline = Instant::now() + timeout;
        loop {
            let _ = self.poll();
            {
                let mut st = self.lock();
                if let (Some(state), Some(stats)) = (st.diag_state, st.diag_stats) {
                    st.diag_state = None;
                    st.diag_stats = None;
                    return Ok(state.with_stats(stats));
                }
            }
            if Instant::now() >= deadline {
                return Err(ZipError::Timeout("diagnostics reply".to_string()));
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.shared.streaming.store(streaming, Ordering::SeqCst);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn pending_depth(&self) -> usize {
        self.lock().pending.len()
    }

    /// Pulled snapshot of the link.
    pub fn snapshot(&self) -> BridgeHealth {
        let st = self.lock();
        BridgeHealth {
            serial_open: st.transport.is_some(),
            ready: st.state == ConnectionState::Ready,
            port: self.shared.port.clone(),
            baud: self.shared.baud,
            streaming: self.shared.streaming.load(Ordering::SeqCst),
            rx_bytes: st.rx_bytes,
            tx_bytes: st.tx_bytes,
            pending_queue_depth: st.pending.len(),
            uptime_ms: st
                .opened_at
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0),
            last_error: st.last_error.clone(),
        }
    }

    /// Stop polling, release the transport and return to `Disconnected`.
    /// Counters are zeroed and `last_error` records the close.
    pub fn close(&self) {
        self.stop_poller();
        let was_open = {
            let mut st = self.lock();
            let was_open = match st.transport.take() {
                Some(mut transport) => {
                    transport.close();
                    true
                }
                None => false,
            };
            st.state = ConnectionState::Disconnected;
            st.pending.clear();
            st.opened_at = None;
            st.rx_bytes = 0;
            st.tx_bytes = 0;
            if was_open {
                st.last_error = Some("serial link closed".to_string());
            }
            was_open
        };
        if was_open {
            info!(port = %self.shared.port, "serial link closed");
            self.log(LogEvent::SerialClose, json!({ "port": self.shared.port }));
        }
    }
}

/// Acknowledge the oldest pending command with `tag`, or the oldest of all
/// for an untagged `{ok}`.
fn resolve(pending: &mut VecDeque<PendingCommand>, tag: Option<&str>) {
    let idx = match tag {
        Some(tag) => pending.iter().position(|p| p.tag == tag),
        None if pending.is_empty() => None,
        None => Some(0),
    };
    if let Some(idx) = idx {
        pending.remove(idx);
    }
}

impl FrameSink for SerialLink {
    fn send_frame(&self, cmd: &FirmwareCommand) -> Result<(), ZipError> {
        self.send(cmd).map(|_| ())
    }
}

#[async_trait]
impl LinkProbe for SerialLink {
    /// `Err` while no transport is attached: never opened, failed to open,
    /// or closed.
    fn health(&self) -> Result<BridgeHealth, ZipError> {
        let reason = {
            let st = self.lock();
            if st.transport.is_some() {
                None
            } else {
                Some(
                    st.last_error
                        .clone()
                        .unwrap_or_else(|| "serial port not open".to_string()),
                )
            }
        };
        match reason {
            None => Ok(self.snapshot()),
            Some(reason) => Err(ZipError::Unreachable(reason)),
        }
    }

    async fn diagnostics(&self, timeout: Duration) -> Result<RobotDiagnostics, ZipError> {
        self.request_diagnostics(timeout).await
    }
}
