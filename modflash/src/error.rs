//! Error types for modflash.

use std::io;
use thiserror::Error;

/// Result type for modflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for modflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Malformed wire frame.
    #[error("Malformed frame: {0}")]
    Frame(String),

    /// No module port is connected.
    #[error("No module port is connected")]
    NoPortConnected,

    /// Firmware image missing or unreadable.
    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),

    /// Invalid firmware version string.
    #[error("Invalid version {0:?}")]
    InvalidVersion(String),

    /// Invalid firmware version catalog.
    #[error("Invalid version catalog: {0}")]
    InvalidCatalog(String),

    /// Firmware update failed.
    #[error("Update failed: {0}")]
    Update(String),
}
