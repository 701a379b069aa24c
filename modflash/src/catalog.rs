//! Firmware version catalog and on-disk image layout.
//!
//! The catalog names the application firmware version to install per module
//! kind. It arrives as JSON and is forwarded verbatim to every worker:
//!
//! ```json
//! { "network": { "app": "1.2.3" }, "camera": { "app": "1.0.1" } }
//! ```
//!
//! Images live under the firmware root as
//! `<root>/<kind>/e103/<version>/<kind>.bin`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::device::ModuleKind;
use crate::error::{Error, Result};

/// Firmware versions selected per application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppVersion {
    /// Application firmware version string (may carry a `v` prefix and a
    /// `-suffix`; both are stripped when packing).
    pub app: String,
}

/// Version catalog mapping module kinds to firmware versions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionCatalog {
    /// Network module firmware.
    pub network: AppVersion,
    /// Camera module firmware.
    pub camera: AppVersion,
}

impl VersionCatalog {
    /// Parse a catalog from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::InvalidCatalog(e.to_string()))
    }

    /// Load a catalog from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// The application version selected for a module kind. Unknown kinds are
    /// updated as network modules, consistent with the identify fallback.
    pub fn app_version(&self, kind: ModuleKind) -> &str {
        match kind {
            ModuleKind::Camera => &self.camera.app,
            ModuleKind::Network | ModuleKind::Other => &self.network.app,
        }
    }

    /// Path of the firmware image for a module kind under `root`.
    pub fn bin_path(&self, root: &Path, kind: ModuleKind) -> PathBuf {
        root.join(kind.as_str())
            .join("e103")
            .join(self.app_version(kind))
            .join(format!("{}.bin", kind.as_str()))
    }
}
