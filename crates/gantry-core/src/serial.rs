//! Serial port abstractions for the motion driver.
//!
//! # Types
//!
//! - [`SerialPortIO`]: blocking byte stream that can report how many bytes are
//!   waiting, which is all a line-oriented controller protocol needs
//! - [`DynSerial`]: type-erased boxed serial port
//! - [`LineBuffer`]: accumulates non-blocking reads into complete lines
//!
//! # Utilities
//!
//! - [`open_serial`]: open a port with 8N1 framing and no flow control
//!
//! # Example
//!
//! ```rust,ignore
//! use gantry_core::serial::{open_serial, LineBuffer};
//! use std::time::Duration;
//!
//! let mut port = open_serial("/dev/ttyUSB0", 115200, Duration::from_secs(2), "GRBL")?;
//! port.write_all(b"$H\n")?;
//! let mut lines = LineBuffer::default();
//! for line in lines.drain(port.as_mut())? {
//!     tracing::debug!(%line, "controller");
//! }
//! ```

use crate::error::{AppResult, GantryError};
use std::io::{self, Read, Write};
use std::time::Duration;

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Blocking serial I/O with a query for buffered input.
///
/// Implemented for real hardware (`Box<dyn serialport::SerialPort>`) and for
/// in-process simulators used by tests.
pub trait SerialPortIO: Read + Write + Send {
    /// Number of bytes that can be read without blocking.
    fn bytes_available(&mut self) -> io::Result<usize>;
}

impl SerialPortIO for Box<dyn serialport::SerialPort> {
    fn bytes_available(&mut self) -> io::Result<usize> {
        self.bytes_to_read()
            .map(|n| n as usize)
            .map_err(io::Error::from)
    }
}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Open a serial port with standard settings: 8N1, no flow control.
///
/// `device_name` is only used to make the error message readable.
///
/// # Errors
///
/// Returns [`GantryError::Connection`] if the port cannot be opened.
pub fn open_serial(
    port_path: &str,
    baud_rate: u32,
    timeout: Duration,
    device_name: &str,
) -> AppResult<DynSerial> {
    let port = serialport::new(port_path, baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(timeout)
        .open()
        .map_err(|e| {
            GantryError::Connection(format!(
                "Failed to open {} serial port: {}: {}",
                device_name, port_path, e
            ))
        })?;
    Ok(Box::new(port))
}

// =============================================================================
// Line Assembly
// =============================================================================

/// Accumulates bytes from a serial port and yields complete text lines.
///
/// A trailing partial line stays buffered until its newline arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Read everything currently waiting on `port` and return complete lines.
    ///
    /// Lines are trimmed of surrounding whitespace (including `\r`); blank
    /// lines are dropped. Never blocks waiting for more input.
    pub fn drain(&mut self, port: &mut dyn SerialPortIO) -> io::Result<Vec<String>> {
        let mut buf = [0u8; 256];
        loop {
            let waiting = port.bytes_available()?;
            if waiting == 0 {
                break;
            }
            let want = waiting.min(buf.len());
            let n = port.read(&mut buf[..want])?;
            if n == 0 {
                break;
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
        Ok(self.take_lines())
    }

    fn take_lines(&mut self) -> Vec<String> {
        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        String::from_utf8_lossy(&complete)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }
}
