//! Host-side serial port discovery and classification.

use log::{debug, trace};

/// Known USB device kinds a module may enumerate as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// The module's native USB CDC interface.
    Module,
    /// Silicon Labs CP210x USB-to-Serial bridge (used on older carriers).
    Cp210x,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs for module links.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (0x2FDE, &[0x0002, 0x0003], DeviceKind::Module),
    (0x10C4, &[0xEA60, 0xEA70], DeviceKind::Cp210x),
];

impl DeviceKind {
    /// Classify a VID/PID combination.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        for (known_vid, pids, device) in KNOWN_USB_DEVICES {
            if vid == *known_vid && (pids.is_empty() || pids.contains(&pid)) {
                return *device;
            }
        }
        Self::Unknown
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Module => "Module",
            Self::Cp210x => "CP210x",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether this is a recognized module link.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Discovered serial port information.
#[derive(Debug, Clone)]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

/// Detect all available serial ports with metadata.
pub fn detect_ports() -> Vec<DetectedPort> {
    let mut result = Vec::new();

    match serialport::available_ports() {
        Ok(ports) => {
            for port_info in ports {
                let mut detected = DetectedPort {
                    name: port_info.port_name.clone(),
                    device: DeviceKind::Unknown,
                    vid: None,
                    pid: None,
                    manufacturer: None,
                    product: None,
                    serial: None,
                };

                if let serialport::SerialPortType::UsbPort(usb_info) = port_info.port_type {
                    detected.vid = Some(usb_info.vid);
                    detected.pid = Some(usb_info.pid);
                    detected.manufacturer = usb_info.manufacturer;
                    detected.product = usb_info.product;
                    detected.serial = usb_info.serial_number;
                    detected.device = DeviceKind::from_vid_pid(usb_info.vid, usb_info.pid);

                    trace!(
                        "found USB port: {} (VID: {:04X}, PID: {:04X}, device: {:?})",
                        port_info.port_name,
                        usb_info.vid,
                        usb_info.pid,
                        detected.device
                    );
                }

                result.push(detected);
            }
        }
        Err(e) => {
            debug!("failed to enumerate serial ports: {e}");
        }
    }

    result
}

/// Detect ports that look like connected modules.
pub fn discover_module_ports() -> Vec<DetectedPort> {
    detect_ports()
        .into_iter()
        .filter(|p| p.device.is_known())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_kind_from_vid_pid() {
        assert_eq!(DeviceKind::from_vid_pid(0x2FDE, 0x0002), DeviceKind::Module);
        assert_eq!(DeviceKind::from_vid_pid(0x10C4, 0xEA60), DeviceKind::Cp210x);
        assert_eq!(DeviceKind::from_vid_pid(0x1234, 0x5678), DeviceKind::Unknown);
    }

    #[test]
    fn test_device_kind_is_known() {
        assert!(DeviceKind::Module.is_known());
        assert!(DeviceKind::Cp210x.is_known());
        assert!(!DeviceKind::Unknown.is_known());
    }

    #[test]
    fn test_detect_ports_does_not_panic() {
        let _ = detect_ports();
    }
}
