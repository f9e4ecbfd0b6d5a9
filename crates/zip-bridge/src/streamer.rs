//! Setpoint streamer.
//!
//! The sole writer of periodic motion frames.  One [`TimerSlot`] drives the
//! cadence; [`SetpointStreamer::start`] re-arms it (never adds a second) and
//! sends the first frame immediately.  [`SetpointStreamer::update`] only
//! swaps the in-flight setpoint, so any number of updates between two ticks
//! produce exactly one frame carrying the last values.  A tick without an
//! update re-sends the previous setpoint, which is what keeps the
//! firmware's TTL from expiring.
//!
//! Frames are sent while holding the streamer lock and every tick checks the
//! session generation under that lock, so once [`SetpointStreamer::stop`]
//! returns no setpoint frame can follow it.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zip_hal::codec::{build_stop_command, clamp_pwm, clamp_rate, clamp_ttl};
use zip_hal::FirmwareCommand;
use zip_types::{LogEvent, Setpoint, StreamerConfig, StreamerStats, ZipError};

use crate::event_log::EventLog;
use crate::scheduler::TimerSlot;

/// Where motion frames go.  Must not block for long: it is called from the
/// timer with the streamer locked.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, cmd: &FirmwareCommand) -> Result<(), ZipError>;
}

struct Session {
    id: Uuid,
    config: StreamerConfig,
    setpoint: Setpoint,
    started: Instant,
}

#[derive(Default)]
struct StreamerState {
    session: Option<Session>,
    stats: StreamerStats,
    timer: TimerSlot,
    generation: u64,
}

impl StreamerState {
    fn refresh_duration(&mut self) {
        if let Some(session) = &self.session {
            self.stats.duration_ms = session.started.elapsed().as_millis() as u64;
        }
    }
}

/// Streams the current setpoint to a [`FrameSink`] at a fixed cadence.
pub struct SetpointStreamer {
    sink: Arc<dyn FrameSink>,
    log: EventLog,
    defaults: StreamerConfig,
    state: Arc<Mutex<StreamerState>>,
}

fn lock(state: &Mutex<StreamerState>) -> MutexGuard<'_, StreamerState> {
    state.lock().unwrap_or_else(|p| p.into_inner())
}

fn clamped_setpoint(v: i32, w: i32, ttl_ms: u32) -> Setpoint {
    Setpoint {
        v: clamp_pwm(v),
        w: clamp_pwm(w),
        ttl_ms: clamp_ttl(ttl_ms),
    }
}

fn send_locked(sink: &dyn FrameSink, st: &mut StreamerState, cmd: &FirmwareCommand) -> bool {
    st.refresh_duration();
    match sink.send_frame(cmd) {
        Ok(()) => {
            st.stats.frames_sent += 1;
            true
        }
        Err(e) => {
            st.stats.send_failures += 1;
            warn!(error = %e, failures = st.stats.send_failures, "frame send failed");
            false
        }
    }
}

fn tick(state: &Weak<Mutex<StreamerState>>, sink: &Arc<dyn FrameSink>, generation: u64) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let mut st = lock(&state);
    if st.generation != generation {
        return;
    }
    let Some(setpoint) = st.session.as_ref().map(|s| s.setpoint) else {
        return;
    };
    send_locked(sink.as_ref(), &mut st, &FirmwareCommand::Setpoint(setpoint));
}

impl SetpointStreamer {
    /// `defaults` supply the cadence and TTL when callers omit them.
    pub fn new(sink: Arc<dyn FrameSink>, log: EventLog, defaults: StreamerConfig) -> Self {
        Self {
            sink,
            log,
            defaults,
            state: Arc::new(Mutex::new(StreamerState::default())),
        }
    }

    /// Begin (or restart) streaming `v`/`w`.
    ///
    /// Rate and TTL are clamped.  Stats reset, the first frame goes out
    /// before this returns and the timer is re-armed at the new period.
    /// Returns the applied config.
    pub fn start(&self, v: i32, w: i32, rate_hz: Option<f64>, ttl_ms: Option<u32>) -> StreamerConfig {
        let config = StreamerConfig {
            rate_hz: clamp_rate(rate_hz.unwrap_or(self.defaults.rate_hz)),
            ttl_ms: clamp_ttl(ttl_ms.unwrap_or(self.defaults.ttl_ms)),
        };
        let setpoint = clamped_setpoint(v, w, config.ttl_ms);
        let id = Uuid::new_v4();

        let mut st = lock(&self.state);
        let restarted = st.session.is_some();
        st.generation += 1;
        let generation = st.generation;
        st.session = Some(Session {
            id,
            config,
            setpoint,
            started: Instant::now(),
        });
        st.stats = StreamerStats {
            session_id: Some(id),
            stream_started_at: Some(Utc::now()),
            ..StreamerStats::default()
        };

        send_locked(self.sink.as_ref(), &mut st, &FirmwareCommand::Setpoint(setpoint));

        let weak = Arc::downgrade(&self.state);
        let sink = Arc::clone(&self.sink);
        st.timer
            .arm(config.period(), move || tick(&weak, &sink, generation));
        drop(st);

        info!(
            session = %id,
            v = setpoint.v,
            w = setpoint.w,
            rate_hz = config.rate_hz,
            ttl_ms = config.ttl_ms,
            restarted,
            "stream started"
        );
        self.log.record(
            LogEvent::StreamStart,
            Some(json!({
                "session": id,
                "v": setpoint.v,
                "w": setpoint.w,
                "rateHz": config.rate_hz,
                "ttlMs": config.ttl_ms,
                "restarted": restarted,
            })),
        );
        config
    }

    /// Replace the in-flight setpoint.  No frame is sent; the next tick
    /// carries the new values.
    ///
    /// On a stopped streamer this starts a new session at the default rate
    /// (the previous session's rate is not remembered) with `ttl_ms` as the
    /// TTL override.  Returns `true` in that case.
    pub fn update(&self, v: i32, w: i32, ttl_ms: Option<u32>) -> bool {
        let mut st = lock(&self.state);
        let Some(session) = st.session.as_mut() else {
            drop(st);
            debug!("update on stopped streamer, starting a new session");
            self.start(v, w, None, ttl_ms);
            return true;
        };
        let ttl = clamp_ttl(ttl_ms.unwrap_or(session.config.ttl_ms));
        let setpoint = clamped_setpoint(v, w, ttl);
        session.setpoint = setpoint;
        let id = session.id;
        drop(st);

        debug!(session = %id, v = setpoint.v, w = setpoint.w, ttl_ms = ttl, "stream updated");
        self.log.record(
            LogEvent::StreamUpdate,
            Some(json!({ "session": id, "v": setpoint.v, "w": setpoint.w, "ttlMs": ttl })),
        );
        false
    }

    /// Disarm the timer and end the session.
    ///
    /// With `hard_stop`, exactly one stop frame follows.  Calling this on a
    /// stopped streamer does nothing and returns `false`.
    pub fn stop(&self, hard_stop: bool) -> bool {
        let mut st = lock(&self.state);
        st.timer.cancel();
        st.generation += 1;
        st.refresh_duration();
        let Some(session) = st.session.take() else {
            return false;
        };
        let stop_sent = hard_stop
            && send_locked(self.sink.as_ref(), &mut st, &build_stop_command("stop"));
        let stats = st.stats.clone();
        drop(st);

        info!(
            session = %session.id,
            frames = stats.frames_sent,
            failures = stats.send_failures,
            duration_ms = stats.duration_ms,
            hard_stop,
            "stream stopped"
        );
        self.log.record(
            LogEvent::StreamStop,
            Some(json!({
                "session": session.id,
                "hardStop": hard_stop,
                "stopSent": stop_sent,
                "framesSent": stats.frames_sent,
                "sendFailures": stats.send_failures,
                "durationMs": stats.duration_ms,
            })),
        );
        true
    }

    /// End any session and send the stop frame regardless of whether one
    /// was active.
    pub fn halt(&self, reason: &str) -> Result<(), ZipError> {
        let mut st = lock(&self.state);
        st.timer.cancel();
        st.generation += 1;
        st.refresh_duration();
        let ended = st.session.take().map(|s| s.id);
        let result = self.sink.send_frame(&build_stop_command(reason));
        match &result {
            Ok(()) => st.stats.frames_sent += 1,
            Err(_) => st.stats.send_failures += 1,
        }
        drop(st);
        if let Some(id) = ended {
            self.log.record(
                LogEvent::StreamStop,
                Some(json!({ "session": id, "hardStop": true, "reason": reason })),
            );
        }
        result
    }

    pub fn is_streaming(&self) -> bool {
        lock(&self.state).session.is_some()
    }

    /// Config of the live session.
    pub fn config(&self) -> Option<StreamerConfig> {
        lock(&self.state).session.as_ref().map(|s| s.config)
    }

    /// Setpoint the next tick will send.
    pub fn current_setpoint(&self) -> Option<Setpoint> {
        lock(&self.state).session.as_ref().map(|s| s.setpoint)
    }

    /// Counters of the current (or last) session.
    pub fn stats(&self) -> StreamerStats {
        let mut st = lock(&self.state);
        st.refresh_duration();
        st.stats.clone()
    }

    /// Timer re-arms since creation.
    pub fn timer_arms(&self) -> u64 {
        lock(&self.state).timer.arm_count()
    }
}

impl Drop for SetpointStreamer {
    fn drop(&mut self) {
        lock(&self.state).timer.cancel();
    }
}
