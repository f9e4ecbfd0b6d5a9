//! Line-oriented [`Transport`] trait.
//!
//! The firmware speaks newline-delimited text in both directions.  A
//! transport moves whole lines: writes are bounded (a slow or dead device
//! yields an error, never a hang) and reads are non-blocking drains of
//! whatever complete lines have arrived.

use zip_types::ZipError;

/// Longest line accepted from the device.  Longer input is discarded up to
/// the next newline.
pub const MAX_LINE_LEN: usize = 256;

/// A bidirectional, line-oriented link to the robot firmware.
pub trait Transport: Send {
    /// Human-readable endpoint name, e.g. `"/dev/ttyUSB0"` or `"sim"`.
    fn name(&self) -> &str;

    /// Write one line.  `line` must already carry its trailing `'\n'`.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`ZipError::Transport`] if the device refuses the write or
    /// does not accept it within the transport's bounded timeout.
    fn write_line(&mut self, line: &str) -> Result<usize, ZipError>;

    /// Drain every complete line received so far, without waiting.
    ///
    /// Returns the lines (without terminators) and the raw byte count read.
    fn read_lines(&mut self) -> Result<(Vec<String>, usize), ZipError>;

    /// Release the underlying device.  Further writes fail.
    fn close(&mut self);
}

/// Splits a raw byte stream into lines.
///
/// `'\r'` is ignored, `'\n'` terminates a line and empty lines are dropped.
/// A line that grows past [`MAX_LINE_LEN`] is discarded whole and counted in
/// [`LineBuffer::overflows`].
#[derive(Debug, Default)]
pub struct LineBuffer {
    current: Vec<u8>,
    discarding: bool,
    overflows: u64,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed `bytes` and return every line they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            match b {
                b'\n' => {
                    if !self.discarding && !self.current.is_empty() {
                        lines.push(String::from_utf8_lossy(&self.current).into_owned());
                    }
                    self.current.clear();
                    self.discarding = false;
                }
                b'\r' => {}
                _ if self.discarding => {}
                _ if self.current.len() >= MAX_LINE_LEN => {
                    self.current.clear();
                    self.discarding = true;
                    self.overflows += 1;
                }
                _ => self.current.push(b),
            }
        }
        lines
    }

    /// Number of over-long lines discarded so far.
    pub fn overflows(&self) -> u64 {
        self.overflows
    }
}
