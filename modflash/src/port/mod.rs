//! Port abstraction for serial communication with modules.
//!
//! The protocol layer is written against the `Port` trait so that the same
//! updater state machine runs over a real serial port (`NativePort`) or the
//! in-process device simulator (`crate::sim::SimPort`).
//!
//! ```text
//! +------------------+     +------------------+
//! |  Updater / Link  |     |  Updater / Link  |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! |    Port Trait    |     |    Port Trait    |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! | Native SerialPort|     |  SimPort (tests) |
//! |   (serialport)   |     |                  |
//! +------------------+     +------------------+
//! ```
//!
//! A module link is always 921600 baud, 8N1, with a short read timeout: the
//! protocol polls for frames rather than blocking on them.

pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Baud rate of the module bootloader link.
pub const MODULE_BAUD: u32 = 921_600;

/// Read timeout used while polling for frames.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read timeout.
    pub timeout: Duration,
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: READ_TIMEOUT,
        }
    }

    /// Configuration for a module link (921600 baud, 100 ms read timeout).
    pub fn module(port_name: impl Into<String>) -> Self {
        Self::new(port_name, MODULE_BAUD)
    }

    /// Set the read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Unified port trait for serial communication.
///
/// Besides plain byte I/O the updater needs one unusual capability: the
/// bootloader handoff closes the port, waits for the module to re-enumerate,
/// and reopens the same port name. `close` and `reopen` model that cycle.
pub trait Port: Read + Write + Send {
    /// Set the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current read timeout.
    fn timeout(&self) -> Duration;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Clear input/output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Whether the port currently holds an open handle.
    fn is_open(&self) -> bool;

    /// Close the port, keeping the name for a later `reopen`.
    fn close(&mut self) -> Result<()>;

    /// Reopen a previously closed port under the same name and settings.
    fn reopen(&mut self) -> Result<()>;
}

pub use native::NativePort;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_module_defaults() {
        let config = SerialConfig::module("/dev/ttyUSB0");
        assert_eq!(config.port_name, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, MODULE_BAUD);
        assert_eq!(config.timeout, READ_TIMEOUT);
    }

    #[test]
    fn test_serial_config_builder() {
        let config = SerialConfig::new("COM3", 115_200).with_timeout(Duration::from_secs(1));
        assert_eq!(config.port_name, "COM3");
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.timeout, Duration::from_secs(1));
    }
}
