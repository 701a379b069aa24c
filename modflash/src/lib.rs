//! # modflash
//!
//! A library for updating the application firmware of USB-serial robotics
//! modules (network and camera modules).
//!
//! Each module exposes a bootloader protocol framed as JSON packets over a
//! 921600-baud serial link. This crate provides:
//!
//! - The wire frame codec and bootloader command vocabulary
//! - The streaming CRC-32 page checksum
//! - The per-module update state machine (identify, bootloader handoff,
//!   page erase/write/verify loop, end-flash trailer, reboot)
//! - A supervisor that updates many modules concurrently, one worker per port
//! - Serial port discovery and an in-process device simulator for tests
//!
//! ## Example
//!
//! ```rust,no_run
//! use modflash::{MultiUpdater, NativePort, NullSink, SerialConfig, VersionCatalog};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let catalog = VersionCatalog::from_file("catalog.json")?;
//!     let ports: Vec<String> = modflash::discover_module_ports()
//!         .into_iter()
//!         .map(|p| p.name)
//!         .collect();
//!
//!     let mut supervisor = MultiUpdater::new("/var/lib/modflash/firmware");
//!     let outcomes = supervisor.run(
//!         &ports,
//!         |name| NativePort::open(SerialConfig::module(name)),
//!         &catalog,
//!         &mut NullSink,
//!     )?;
//!
//!     for outcome in outcomes {
//!         println!("{}: {}", outcome.port, if outcome.ok { "ok" } else { "failed" });
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod device;
pub mod error;
pub mod host;
pub mod image;
pub mod link;
pub mod port;
pub mod protocol;
pub mod sim;
pub mod supervisor;
pub mod updater;

// Re-exports for convenience
pub use {
    catalog::{AppVersion, VersionCatalog},
    device::{module_id, ModuleKind, Version},
    error::{Error, Result},
    host::{detect_ports, discover_module_ports, DetectedPort, DeviceKind},
    image::FirmwareImage,
    link::PacketLink,
    port::{NativePort, Port, SerialConfig, MODULE_BAUD},
    protocol::{Packet, BROADCAST_ID},
    supervisor::{
        MultiUpdater, NullSink, UpdateEventSink, UpdateOutcome, MAX_CONCURRENT_UPDATES,
    },
    updater::{ModuleUpdater, UpdaterStatus, UpdaterTiming},
};
