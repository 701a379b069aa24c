//! Bootloader command vocabulary: request builders and reply parsers.
//!
//! ## Opcodes
//!
//! | Opcode | Direction | Meaning                                  |
//! |--------|-----------|------------------------------------------|
//! | `0x28` | host → M  | Request uuid                             |
//! | `0x05` | M → host  | UUID + version report                    |
//! | `0x0A` | M → host  | Warning / bootloader notice              |
//! | `0x09` | host → M  | Set module state                         |
//! | `0xA4` | host → M  | Set network module state (app handoff)   |
//! | `0x0B` | host → M  | Firmware data chunk (sid = sequence)     |
//! | `0x0D` | host → M  | Firmware command (erase or crc)          |
//! | `0x0C` | M → host  | Firmware command response                |

use byteorder::{LittleEndian, WriteBytesExt};

use crate::protocol::frame::{Packet, BROADCAST_ID};

/// Opcode constants of the bootloader dialect.
pub mod opcode {
    /// Request uuid (broadcast probe).
    pub const REQUEST_UUID: u8 = 0x28;
    /// UUID + version report.
    pub const UUID_REPORT: u8 = 0x05;
    /// Warning / bootloader notice.
    pub const WARNING: u8 = 0x0A;
    /// Set module state.
    pub const SET_MODULE_STATE: u8 = 0x09;
    /// Set network module state (application-side bootloader handoff).
    pub const SET_NETWORK_MODULE_STATE: u8 = 0xA4;
    /// Firmware data chunk.
    pub const FIRMWARE_DATA: u8 = 0x0B;
    /// Firmware command (erase or crc).
    pub const FIRMWARE_COMMAND: u8 = 0x0D;
    /// Firmware command response.
    pub const FIRMWARE_RESPONSE: u8 = 0x0C;
}

/// Warning type announcing the bootloader is ready for firmware data.
pub const WARNING_READY: u8 = 2;

/// Module run states used during an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModuleState {
    /// Normal operation.
    Run = 0,
    /// Warning state (bootloader resident).
    Warning = 1,
    /// Execution paused.
    ForcedPause = 2,
    /// Enter the bootloader to accept new firmware.
    UpdateFirmware = 3,
    /// Bootloader acknowledged, start streaming.
    UpdateFirmwareReady = 4,
    /// Reboot into the application.
    Reboot = 6,
}

/// Plug-and-play state byte. Always `Off` while updating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PnpState {
    /// PnP announcements enabled.
    On = 1,
    /// PnP announcements disabled.
    Off = 2,
}

/// Firmware command sub-opcode, carried in the high byte of the sid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FirmwareOp {
    /// Verify the current page against a CRC-32.
    Crc = 1,
    /// Erase pages starting at the given address.
    Erase = 2,
}

/// Stream state reported in a firmware command response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    /// No error.
    NoError = 0,
    /// Bootloader ready for data.
    UpdateReady = 1,
    /// Flash write failed.
    WriteFail = 2,
    /// Flash verify failed.
    VerifyFail = 3,
    /// Page CRC mismatch.
    CrcError = 4,
    /// Page CRC verified.
    CrcComplete = 5,
    /// Page erase failed.
    EraseError = 6,
    /// Page erase finished.
    EraseComplete = 7,
}

impl StreamState {
    /// Decode a stream state byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NoError),
            1 => Some(Self::UpdateReady),
            2 => Some(Self::WriteFail),
            3 => Some(Self::VerifyFail),
            4 => Some(Self::CrcError),
            5 => Some(Self::CrcComplete),
            6 => Some(Self::EraseError),
            7 => Some(Self::EraseComplete),
            _ => None,
        }
    }
}

/// Build the broadcast uuid probe.
pub fn request_uuid() -> Packet {
    Packet::new(
        opcode::REQUEST_UUID,
        BROADCAST_ID,
        BROADCAST_ID,
        vec![0xFF, 0xFF],
    )
}

/// Build a set-module-state command.
pub fn set_module_state(did: u16, state: ModuleState, pnp: PnpState) -> Packet {
    Packet::new(
        opcode::SET_MODULE_STATE,
        0,
        did,
        vec![state as u8, pnp as u8],
    )
}

/// Build the application-side handoff command that drops a network or camera
/// module into its bootloader.
pub fn set_network_module_state(did: u16, state: ModuleState, pnp: PnpState) -> Packet {
    Packet::new(
        opcode::SET_NETWORK_MODULE_STATE,
        0,
        did,
        vec![state as u8, pnp as u8],
    )
}

/// Build one 8-byte firmware data chunk. `seq` is the chunk index within the
/// current page and rides in the sid field.
pub fn firmware_data(did: u16, seq: u16, chunk: &[u8]) -> Packet {
    Packet::new(opcode::FIRMWARE_DATA, seq, did, chunk.to_vec())
}

/// Build an erase or crc firmware command.
///
/// The 12-bit sid is split: the high nibble-byte carries the sub-opcode, the
/// low byte is fixed at 1. The payload is `crc_val:4 LE | page_addr:4 LE`;
/// for erase commands the crc field is repurposed as a page count.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn firmware_command(did: u16, op: FirmwareOp, crc_val: u32, page_addr: u32) -> Packet {
    let sid = ((op as u16) << 8) | 1;

    let mut data = Vec::with_capacity(8);
    data.write_u32::<LittleEndian>(crc_val).unwrap();
    data.write_u32::<LittleEndian>(page_addr).unwrap();

    Packet::new(opcode::FIRMWARE_COMMAND, sid, did, data)
}

/// Little-endian integer from a short byte field.
fn le_field(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

/// Parsed `0x05` uuid report: `uuid:6 LE | version:2 LE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UuidReport {
    /// 48-bit module uuid.
    pub uuid: u64,
    /// Packed firmware version of the running application.
    pub version: u16,
}

impl UuidReport {
    /// Parse a uuid report, if this packet is one.
    pub fn parse(pkt: &Packet) -> Option<Self> {
        if pkt.cmd != opcode::UUID_REPORT || pkt.data.len() < 8 {
            return None;
        }
        Some(Self {
            uuid: le_field(&pkt.data[..6]),
            version: u16::from_le_bytes([pkt.data[6], pkt.data[7]]),
        })
    }
}

/// Parsed `0x0A` warning notice: `uuid:6 LE | warning_type:1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Warning {
    /// 48-bit module uuid.
    pub uuid: u64,
    /// Warning discriminator; [`WARNING_READY`] means "send firmware".
    pub warning_type: u8,
}

impl Warning {
    /// Parse a warning notice, if this packet is one.
    pub fn parse(pkt: &Packet) -> Option<Self> {
        if pkt.cmd != opcode::WARNING || pkt.data.len() < 7 {
            return None;
        }
        Some(Self {
            uuid: le_field(&pkt.data[..6]),
            warning_type: pkt.data[6],
        })
    }
}

/// Parsed `0x0C` firmware command response: `dummy:4 | stream_state:1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandResponse {
    /// Reported stream state, `None` for values outside the known range.
    pub stream_state: Option<StreamState>,
}

impl CommandResponse {
    /// Parse a firmware command response, if this packet is one.
    pub fn parse(pkt: &Packet) -> Option<Self> {
        if pkt.cmd != opcode::FIRMWARE_RESPONSE || pkt.data.len() < 5 {
            return None;
        }
        Some(Self {
            stream_state: StreamState::from_u8(pkt.data[4]),
        })
    }
}

/// Build a `0x0C` response payload (used by the device simulator).
pub fn firmware_response(did: u16, state: StreamState) -> Packet {
    Packet::new(
        opcode::FIRMWARE_RESPONSE,
        0,
        did,
        vec![0, 0, 0, 0, state as u8],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_uuid_shape() {
        let pkt = request_uuid();
        assert_eq!(pkt.cmd, 0x28);
        assert_eq!(pkt.sid, BROADCAST_ID);
        assert_eq!(pkt.did, BROADCAST_ID);
        assert_eq!(pkt.data, vec![0xFF, 0xFF]);
    }

    #[test]
    fn test_set_module_state_payload() {
        let pkt = set_module_state(0x123, ModuleState::Reboot, PnpState::Off);
        assert_eq!(pkt.cmd, 0x09);
        assert_eq!(pkt.sid, 0);
        assert_eq!(pkt.did, 0x123);
        assert_eq!(pkt.data, vec![6, 2]);
    }

    #[test]
    fn test_handoff_opcode() {
        let pkt = set_network_module_state(0xABC, ModuleState::UpdateFirmware, PnpState::Off);
        assert_eq!(pkt.cmd, 0xA4);
        assert_eq!(pkt.data, vec![3, 2]);
    }

    #[test]
    fn test_firmware_command_encoding() {
        let pkt = firmware_command(0x042, FirmwareOp::Crc, 0xDDCC_BBAA, 0x0800_8800);
        assert_eq!(pkt.cmd, 0x0D);
        assert_eq!(pkt.sid, (1 << 8) | 1);
        assert_eq!(pkt.did, 0x042);
        assert_eq!(pkt.data[..4], [0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(pkt.data[4..], [0x00, 0x88, 0x00, 0x08]);
    }

    #[test]
    fn test_firmware_command_erase_sid() {
        let pkt = firmware_command(0xFFF, FirmwareOp::Erase, 2, 0x0801_F800);
        assert_eq!(pkt.sid, (2 << 8) | 1);
        // The erase sub-command carries a page count in the crc field.
        assert_eq!(pkt.data[..4], [0x02, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_uuid_report_parse() {
        let mut data = vec![0x78, 0x56, 0x34, 0x12, 0x00, 0x20];
        data.extend_from_slice(&0x2203u16.to_le_bytes());
        let pkt = Packet::new(opcode::UUID_REPORT, 0, 0, data);

        let report = UuidReport::parse(&pkt).unwrap();
        assert_eq!(report.uuid, 0x2000_1234_5678);
        assert_eq!(report.version, 0x2203);
    }

    #[test]
    fn test_uuid_report_rejects_other_opcodes() {
        let pkt = Packet::new(opcode::WARNING, 0, 0, vec![0; 8]);
        assert!(UuidReport::parse(&pkt).is_none());
    }

    #[test]
    fn test_warning_parse() {
        let pkt = Packet::new(opcode::WARNING, 0, 0, vec![0x01, 0, 0, 0, 0, 0, 2]);
        let warning = Warning::parse(&pkt).unwrap();
        assert_eq!(warning.uuid, 1);
        assert_eq!(warning.warning_type, WARNING_READY);
    }

    #[test]
    fn test_command_response_parse() {
        let pkt = firmware_response(0, StreamState::EraseComplete);
        let resp = CommandResponse::parse(&pkt).unwrap();
        assert_eq!(resp.stream_state, Some(StreamState::EraseComplete));
    }

    #[test]
    fn test_command_response_unknown_state() {
        let pkt = Packet::new(opcode::FIRMWARE_RESPONSE, 0, 0, vec![0, 0, 0, 0, 99]);
        let resp = CommandResponse::parse(&pkt).unwrap();
        assert_eq!(resp.stream_state, None);
    }

    #[test]
    fn test_command_response_short_payload() {
        let pkt = Packet::new(opcode::FIRMWARE_RESPONSE, 0, 0, vec![0, 0, 0]);
        assert!(CommandResponse::parse(&pkt).is_none());
    }

    #[test]
    fn test_le_field() {
        assert_eq!(le_field(&[0x01, 0x02]), 0x0201);
        assert_eq!(le_field(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]), 0xFFFF_FFFF_FFFF);
    }
}
