//! UART transport backed by the `serialport` crate.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info};
use zip_types::ZipError;

use crate::transport::{LineBuffer, Transport};

/// Upper bound on a single read or write.  Keeps a wedged device from
/// stalling the streaming timer.
pub const IO_TIMEOUT: Duration = Duration::from_millis(20);

/// 8N1 serial link to the firmware.
pub struct SerialTransport {
    path: String,
    port: Option<Box<dyn SerialPort>>,
    lines: LineBuffer,
}

impl SerialTransport {
    /// Open `path` at `baud` (the firmware runs at 115200).
    ///
    /// # Errors
    ///
    /// Returns [`ZipError::Transport`] if the port cannot be opened.
    pub fn open(path: &str, baud: u32) -> Result<Self, ZipError> {
        let port = serialport::new(path, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(IO_TIMEOUT)
            .open()
            .map_err(|e| transport_error(path, e))?;

        info!(port = path, baud, "serial port opened");
        Ok(Self {
            path: path.to_string(),
            port: Some(port),
            lines: LineBuffer::new(),
        })
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, ZipError> {
        let path = &self.path;
        self.port.as_mut().ok_or_else(|| ZipError::Transport {
            port: path.clone(),
            details: "port closed".to_string(),
        })
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.path
    }

    fn write_line(&mut self, line: &str) -> Result<usize, ZipError> {
        let path = self.path.clone();
        let port = self.port_mut()?;
        port.write_all(line.as_bytes())
            .and_then(|()| port.flush())
            .map_err(|e| transport_error(&path, e))?;
        Ok(line.len())
    }

    fn read_lines(&mut self) -> Result<(Vec<String>, usize), ZipError> {
        let path = self.path.clone();
        let port = self.port_mut()?;
        let available = port
            .bytes_to_read()
            .map_err(|e| transport_error(&path, e))? as usize;
        if available == 0 {
            return Ok((Vec::new(), 0));
        }

        let mut buf = vec![0u8; available];
        let n = match port.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => 0,
            Err(e) => return Err(transport_error(&path, e)),
        };
        Ok((self.lines.push(&buf[..n]), n))
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(port = %self.path, "serial port closed");
        }
    }
}

fn transport_error(path: &str, e: impl std::fmt::Display) -> ZipError {
    ZipError::Transport {
        port: path.to_string(),
        details: e.to_string(),
    }
}
