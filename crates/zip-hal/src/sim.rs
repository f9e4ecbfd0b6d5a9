//! In-process [`Transport`] test double.
//!
//! [`SimTransport`] records every written line and replays lines queued via
//! its [`SimTransportHandle`].  The handle stays with the test after the
//! transport has been moved into the code under test.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use zip_types::ZipError;

use crate::transport::Transport;

#[derive(Debug, Default)]
struct SimState {
    written: Vec<String>,
    inbound: VecDeque<String>,
    fail_writes: bool,
    closed: bool,
}

/// Recording transport.  Writes succeed unless failure is toggled on.
pub struct SimTransport {
    name: String,
    state: Arc<Mutex<SimState>>,
}

/// Test-side view of a [`SimTransport`].
#[derive(Clone)]
pub struct SimTransportHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimTransport {
    /// Create a transport and the handle used to observe and drive it.
    pub fn new(name: &str) -> (Box<Self>, SimTransportHandle) {
        let state = Arc::new(Mutex::new(SimState::default()));
        let transport = Box::new(Self {
            name: name.to_string(),
            state: Arc::clone(&state),
        });
        (transport, SimTransportHandle { state })
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Transport for SimTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_line(&mut self, line: &str) -> Result<usize, ZipError> {
        let mut state = lock(&self.state);
        if state.closed || state.fail_writes {
            return Err(ZipError::Transport {
                port: self.name.clone(),
                details: "simulated write failure".to_string(),
            });
        }
        state.written.push(line.trim_end_matches('\n').to_string());
        Ok(line.len())
    }

    fn read_lines(&mut self) -> Result<(Vec<String>, usize), ZipError> {
        let mut state = lock(&self.state);
        let lines: Vec<String> = state.inbound.drain(..).collect();
        let bytes = lines.iter().map(|l| l.len() + 1).sum();
        Ok((lines, bytes))
    }

    fn close(&mut self) {
        lock(&self.state).closed = true;
    }
}

impl SimTransportHandle {
    /// Every line written so far, without terminators.
    pub fn written(&self) -> Vec<String> {
        lock(&self.state).written.clone()
    }

    /// Written lines parsed as JSON; non-JSON lines are skipped.
    pub fn written_json(&self) -> Vec<serde_json::Value> {
        lock(&self.state)
            .written
            .iter()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    pub fn clear_written(&self) {
        lock(&self.state).written.clear();
    }

    /// Queue a line for the next `read_lines`.
    pub fn push_inbound(&self, line: &str) {
        lock(&self.state).inbound.push_back(line.to_string());
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_writes_and_replays_inbound() {
        let (mut transport, handle) = SimTransport::new("sim");
        assert_eq!(transport.write_line("{\"N\":0}\n").unwrap(), 8);
        assert_eq!(handle.written(), vec!["{\"N\":0}"]);

        handle.push_inbound("{hello_ok}");
        let (lines, bytes) = transport.read_lines().unwrap();
        assert_eq!(lines, vec!["{hello_ok}"]);
        assert_eq!(bytes, 11);
        assert!(transport.read_lines().unwrap().0.is_empty());
    }

    #[test]
    fn failure_toggle_and_close() {
        let (mut transport, handle) = SimTransport::new("sim");
        handle.set_fail_writes(true);
        assert!(transport.write_line("x\n").is_err());
        handle.set_fail_writes(false);
        assert!(transport.write_line("x\n").is_ok());

        transport.close();
        assert!(handle.is_closed());
        assert!(transport.write_line("x\n").is_err());
    }
}
