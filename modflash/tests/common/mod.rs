//! Shared fixtures for the simulator-backed integration tests.

// Each test binary uses its own subset of these helpers.
#![allow(dead_code)]

use std::fs;

use modflash::image::PAGE_SIZE;
use modflash::protocol::bootloader::opcode;
use modflash::{Packet, VersionCatalog};
use tempfile::TempDir;

/// A firmware image of `total` bytes with no blank pages.
pub fn image_bytes(total: usize) -> Vec<u8> {
    (0..total).map(|i| (i % 251) as u8 | 0x01).collect()
}

/// Blank out the page at `index` pages into the image.
pub fn blank_page(image: &mut [u8], index: usize) {
    image[index * PAGE_SIZE..(index + 1) * PAGE_SIZE].fill(0);
}

/// Build a firmware tree holding the same image for both module kinds.
pub fn firmware_tree(version: &str, image: &[u8]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for kind in ["network", "camera"] {
        let bin_dir = dir.path().join(kind).join("e103").join(version);
        fs::create_dir_all(&bin_dir).unwrap();
        fs::write(bin_dir.join(format!("{kind}.bin")), image).unwrap();
    }
    dir
}

/// Catalog selecting `version` for both module kinds.
pub fn catalog(version: &str) -> VersionCatalog {
    VersionCatalog::from_json(&format!(
        r#"{{"network":{{"app":"{version}"}},"camera":{{"app":"{version}"}}}}"#
    ))
    .unwrap()
}

/// The page address carried by an erase/crc command.
pub fn command_addr(pkt: &Packet) -> u32 {
    u32::from_le_bytes(pkt.data[4..8].try_into().unwrap())
}

pub fn is_erase(pkt: &Packet) -> bool {
    pkt.cmd == opcode::FIRMWARE_COMMAND && (pkt.sid >> 8) == 2
}

pub fn is_crc(pkt: &Packet) -> bool {
    pkt.cmd == opcode::FIRMWARE_COMMAND && (pkt.sid >> 8) == 1
}

pub fn is_data(pkt: &Packet) -> bool {
    pkt.cmd == opcode::FIRMWARE_DATA
}

/// Erase attempts recorded for one page address.
pub fn erase_attempts(log: &[Packet], addr: u32) -> usize {
    log.iter()
        .filter(|p| is_erase(p) && command_addr(p) == addr)
        .count()
}

/// CRC attempts recorded for one page address.
pub fn crc_attempts(log: &[Packet], addr: u32) -> usize {
    log.iter()
        .filter(|p| is_crc(p) && command_addr(p) == addr)
        .count()
}

/// The 16 trailer bytes reassembled from the two data chunks following the
/// last trailer erase.
pub fn trailer_bytes(log: &[Packet], trailer_addr: u32) -> Vec<u8> {
    let last_erase = log
        .iter()
        .rposition(|p| is_erase(p) && command_addr(p) == trailer_addr)
        .expect("no trailer erase recorded");
    log[last_erase + 1..]
        .iter()
        .filter(|p| is_data(p))
        .take(2)
        .flat_map(|p| p.data.iter().copied())
        .collect()
}
