//! In-process module simulator.
//!
//! `SimPort` speaks the bootloader protocol from the device side behind the
//! same [`Port`] trait the native serial port implements, so the full updater
//! state machine and the supervisor can be exercised without hardware. The
//! simulator actually verifies page CRCs with the shared CRC engine and can
//! inject erase and CRC faults per page address.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::trace;

use crate::error::Result;
use crate::image::{FLASH_BASE, PAGE_OFFSET, PAGE_SIZE};
use crate::port::Port;
use crate::protocol::bootloader::{
    firmware_response, opcode, ModuleState, StreamState, WARNING_READY,
};
use crate::protocol::crc::crc64_step;
use crate::protocol::frame::Packet;

/// Flash address of the page at `index` pages into the image.
pub fn page_addr(index: usize) -> u32 {
    FLASH_BASE + (index * PAGE_SIZE) as u32 + PAGE_OFFSET
}

/// Scripted behavior of a simulated module.
#[derive(Debug, Clone)]
pub struct SimBehavior {
    /// 48-bit uuid reported by the module.
    pub uuid: u64,
    /// Packed firmware version reported while the application runs.
    pub version: u16,
    /// Whether the application answers the uuid probe.
    pub respond_identify: bool,
    /// Whether the bootloader announces itself with warnings.
    pub send_warnings: bool,
    /// Page addresses whose erase always fails.
    pub erase_nak_addrs: HashSet<u32>,
    /// Page addresses with a number of injected CRC failures.
    pub flaky_crc: HashMap<u32, u32>,
}

impl SimBehavior {
    /// A well-behaved network module.
    pub fn network(uuid: u64) -> Self {
        debug_assert_eq!(uuid >> 32, 0x0000);
        Self {
            uuid,
            version: 0x2203,
            respond_identify: true,
            send_warnings: true,
            erase_nak_addrs: HashSet::new(),
            flaky_crc: HashMap::new(),
        }
    }

    /// A well-behaved camera module.
    pub fn camera(uuid: u64) -> Self {
        debug_assert_eq!(uuid >> 32, 0x2000);
        Self {
            uuid,
            ..Self::network(uuid & 0xFFFF_FFFF)
        }
    }

    /// Stay silent during identify.
    #[must_use]
    pub fn silent_identify(mut self) -> Self {
        self.respond_identify = false;
        self
    }

    /// Never announce the bootloader.
    #[must_use]
    pub fn no_warnings(mut self) -> Self {
        self.send_warnings = false;
        self
    }

    /// Always NAK erases of the page at `addr`.
    #[must_use]
    pub fn nak_erase_at(mut self, addr: u32) -> Self {
        self.erase_nak_addrs.insert(addr);
        self
    }

    /// Fail the next `count` CRC checks of the page at `addr`.
    #[must_use]
    pub fn flaky_crc_at(mut self, addr: u32, count: u32) -> Self {
        self.flaky_crc.insert(addr, count);
        self
    }
}

/// Simulated serial port with a module on the other end.
pub struct SimPort {
    name: String,
    behavior: SimBehavior,
    open: bool,
    in_bootloader: bool,
    pending: String,
    tx: VecDeque<u8>,
    page_chunks: Vec<Vec<u8>>,
    log: Arc<Mutex<Vec<Packet>>>,
}

impl SimPort {
    /// Create a simulated port.
    pub fn new(name: impl Into<String>, behavior: SimBehavior) -> Self {
        Self {
            name: name.into(),
            behavior,
            open: true,
            in_bootloader: false,
            pending: String::new(),
            tx: VecDeque::new(),
            page_chunks: Vec::new(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every packet the host has sent, in order. Grab the handle before
    /// moving the port into an updater.
    pub fn log(&self) -> Arc<Mutex<Vec<Packet>>> {
        Arc::clone(&self.log)
    }

    fn module_id(&self) -> u16 {
        crate::device::module_id(self.behavior.uuid)
    }

    fn emit(&mut self, pkt: &Packet) {
        self.tx.extend(pkt.encode().into_bytes());
    }

    fn emit_warning(&mut self, warning_type: u8) {
        let mut data = self.behavior.uuid.to_le_bytes()[..6].to_vec();
        data.push(warning_type);
        let pkt = Packet::new(opcode::WARNING, self.module_id(), 0, data);
        self.emit(&pkt);
    }

    fn emit_uuid_report(&mut self) {
        let mut data = self.behavior.uuid.to_le_bytes()[..6].to_vec();
        data.extend_from_slice(&self.behavior.version.to_le_bytes());
        let pkt = Packet::new(opcode::UUID_REPORT, self.module_id(), 0, data);
        self.emit(&pkt);
    }

    fn pump(&mut self) {
        while let Some(start) = self.pending.find('{') {
            let Some(end) = self.pending[start..].find('}') else {
                // keep the partial frame for the next write
                self.pending.drain(..start);
                return;
            };
            let rest = self.pending.split_off(start + end + 1);
            let frame = self.pending[start..].to_string();
            self.pending = rest;
            match Packet::decode(&frame) {
                Ok(pkt) => self.handle(pkt),
                Err(e) => trace!("sim {}: dropping frame: {e}", self.name),
            }
        }
        self.pending.clear();
    }

    fn handle(&mut self, pkt: Packet) {
        self.log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(pkt.clone());

        match pkt.cmd {
            opcode::REQUEST_UUID => {
                if self.behavior.respond_identify && !self.in_bootloader {
                    self.emit_uuid_report();
                }
            }
            opcode::SET_NETWORK_MODULE_STATE => {
                if pkt.data.first() == Some(&(ModuleState::UpdateFirmware as u8)) {
                    self.in_bootloader = true;
                }
            }
            opcode::SET_MODULE_STATE => {
                if pkt.data.first() == Some(&(ModuleState::UpdateFirmwareReady as u8))
                    && self.in_bootloader
                    && self.behavior.send_warnings
                {
                    self.emit_warning(WARNING_READY);
                }
            }
            opcode::FIRMWARE_DATA => {
                self.page_chunks.push(pkt.data);
            }
            opcode::FIRMWARE_COMMAND => {
                self.handle_firmware_command(&pkt);
            }
            _ => {}
        }
    }

    fn handle_firmware_command(&mut self, pkt: &Packet) {
        if pkt.data.len() < 8 {
            return;
        }
        #[allow(clippy::unwrap_used)] // Slice length checked above
        let crc_val = u32::from_le_bytes(pkt.data[..4].try_into().unwrap());
        #[allow(clippy::unwrap_used)]
        let addr = u32::from_le_bytes(pkt.data[4..8].try_into().unwrap());
        let sub_cmd = (pkt.sid >> 8) as u8;

        let state = match sub_cmd {
            2 => {
                if self.behavior.erase_nak_addrs.contains(&addr) {
                    StreamState::EraseError
                } else {
                    self.page_chunks.clear();
                    StreamState::EraseComplete
                }
            }
            1 => {
                if let Some(count) = self.behavior.flaky_crc.get_mut(&addr) {
                    if *count > 0 {
                        *count -= 1;
                        self.respond(StreamState::CrcError);
                        return;
                    }
                }
                let computed = self
                    .page_chunks
                    .iter()
                    .fold(0u32, |crc, chunk| crc64_step(chunk, crc));
                if computed == crc_val {
                    StreamState::CrcComplete
                } else {
                    StreamState::CrcError
                }
            }
            _ => return,
        };
        self.respond(state);
    }

    fn respond(&mut self, state: StreamState) {
        let pkt = firmware_response(self.module_id(), state);
        self.emit(&pkt);
    }
}

impl Read for SimPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if !self.open {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "port closed",
            ));
        }
        match self.tx.pop_front() {
            Some(byte) => {
                buf[0] = byte;
                Ok(1)
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no data",
            )),
        }
    }
}

impl Write for SimPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if !self.open {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "port closed",
            ));
        }
        self.pending.push_str(&String::from_utf8_lossy(buf));
        self.pump();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Port for SimPort {
    fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn timeout(&self) -> Duration {
        Duration::ZERO
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.tx.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        self.tx.clear();
        self.pending.clear();
        Ok(())
    }

    fn reopen(&mut self) -> Result<()> {
        self.open = true;
        // The bootloader announces itself once the host reconnects.
        if self.in_bootloader && self.behavior.send_warnings {
            self.emit_warning(1);
        }
        Ok(())
    }
}
