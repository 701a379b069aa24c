//! Native serial port implementation using the `serialport` crate.

use {
    crate::{
        error::Result,
        port::{Port, SerialConfig},
    },
    log::trace,
    serialport::ClearBuffer,
    std::{
        io::{Read, Write},
        time::Duration,
    },
};

/// Native serial port implementation.
///
/// The handle is kept in an `Option` so that `close` can drop it while the
/// name and settings stay around for `reopen` during the bootloader handoff.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    config: SerialConfig,
}

impl NativePort {
    /// Open a serial port with the given configuration (8N1, no flow control).
    pub fn open(config: SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .open()?;

        Ok(Self {
            port: Some(port),
            config,
        })
    }

    /// Open a module link (921600 baud, 100 ms read timeout).
    pub fn open_module(port_name: &str) -> Result<Self> {
        Self::open(SerialConfig::module(port_name))
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.set_timeout(timeout)?;
        }
        self.config.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }

    fn name(&self) -> &str {
        &self.config.port_name
    }

    fn clear_buffers(&mut self) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.clear(ClearBuffer::All)?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn close(&mut self) -> Result<()> {
        trace!("closing {}", self.config.port_name);
        // Take ownership of the handle and let it drop (close)
        self.port.take();
        Ok(())
    }

    fn reopen(&mut self) -> Result<()> {
        trace!("reopening {}", self.config.port_name);
        let port = serialport::new(&self.config.port_name, self.config.baud_rate)
            .timeout(self.config.timeout)
            .open()?;
        self.port = Some(port);
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.read(buf))
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(std::io::Write::flush)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn test_open_missing_port_fails() {
        let result = NativePort::open_module("/dev/modflash-test-nonexistent");
        assert!(result.is_err());
    }

    #[test]
    fn test_closed_port_reads_not_connected() {
        // A NativePort that was never opened cannot exist, so build the
        // closed state by hand through the struct fields.
        let mut port = NativePort {
            port: None,
            config: SerialConfig::module("fake"),
        };
        assert!(!port.is_open());

        let mut buf = [0u8; 4];
        let err = port.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);

        let err = port.write(&[0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }
}
