//! `zip-hal` – Wire protocol and transports
//!
//! Everything that touches bytes on the way to the robot firmware lives here.
//! Higher layers talk to the [`Transport`] trait and never see a serial port
//! directly, so the bridge runs unchanged against real hardware or the
//! in-process simulation.
//!
//! # Modules
//!
//! - [`codec`] – pure, stateless mapping between numeric inputs and
//!   [`FirmwareCommand`][codec::FirmwareCommand] wire lines, plus parsing of
//!   firmware replies.  Every numeric field is clamped, never rejected.
//! - [`transport`] – the line-oriented [`Transport`] trait and the
//!   [`LineBuffer`][transport::LineBuffer] used to split raw byte streams.
//! - [`serial`] – [`SerialTransport`][serial::SerialTransport], a
//!   `serialport`-backed UART transport with bounded writes.
//! - [`sim`] – [`SimTransport`][sim::SimTransport], a recording test double.

pub mod codec;
pub mod serial;
pub mod sim;
pub mod transport;

pub use codec::{FirmwareCommand, Reply, StateLine};
pub use serial::SerialTransport;
pub use sim::{SimTransport, SimTransportHandle};
pub use transport::{LineBuffer, Transport};
