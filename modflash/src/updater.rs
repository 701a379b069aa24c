//! Per-module firmware update state machine.
//!
//! One updater owns one serial link and drives a single module through the
//! whole update: identify, bootloader handoff, warning wait, the page
//! erase/write/crc loop, the end-flash trailer and the final reboot. The
//! shared [`UpdaterStatus`] record is the only thing the outside world sees;
//! the worker writes it, the supervisor reads it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::catalog::VersionCatalog;
use crate::device::{ModuleKind, Version};
use crate::error::{Error, Result};
use crate::image::{
    self, end_flash_block, FirmwareImage, ERASE_PAGE_COUNT, FLASH_BASE, PAGE_OFFSET, PAGE_SIZE,
    TRAILER_ADDR,
};
use crate::link::PacketLink;
use crate::port::Port;
use crate::protocol::bootloader::{
    firmware_command, firmware_data, request_uuid, set_module_state, set_network_module_state,
    CommandResponse, FirmwareOp, ModuleState, PnpState, StreamState, UuidReport, Warning,
    WARNING_READY,
};
use crate::protocol::crc::crc64_step;
use crate::protocol::frame::{Packet, BROADCAST_ID};

/// Erase retries per page before the update fails.
const ERASE_RETRY_LIMIT: u32 = 2;

/// CRC retries per page before the update fails.
const CRC_RETRY_LIMIT: u32 = 2;

/// Extra erase attempts for the trailer page.
const TRAILER_ERASE_RETRIES: u32 = 5;

/// Full erase/write/crc repeats for the trailer before giving up.
const TRAILER_SEQUENCE_RETRIES: u32 = 10;

/// Consecutive empty reads that end the warning wait.
const MAX_EMPTY_WARNING_READS: u32 = 5;

/// Timing knobs of the update state machine.
///
/// Defaults are the values the module firmware was qualified against; tests
/// use [`UpdaterTiming::fast`] to run the same state machine against the
/// simulator without real-time sleeps.
#[derive(Debug, Clone)]
pub struct UpdaterTiming {
    /// Interval between uuid probes.
    pub identify_resend: Duration,
    /// Overall identify deadline before falling back to the broadcast id.
    pub identify_timeout: Duration,
    /// Pause after sending the bootloader handoff.
    pub handoff_delay: Duration,
    /// How long the port stays closed while the module re-enumerates.
    pub handoff_close: Duration,
    /// Settle time after reopening the port.
    pub handoff_reopen: Duration,
    /// Overall deadline for the bootloader warning.
    pub warning_timeout: Duration,
    /// Single read window while waiting for the warning.
    pub warning_read: Duration,
    /// Pause between warning polls.
    pub warning_poll: Duration,
    /// Deadline for each firmware command response.
    pub response_timeout: Duration,
    /// Pacing between 8-byte data chunks.
    pub chunk_delay: Duration,
    /// Pause after a page is written and verified.
    pub page_delay: Duration,
    /// Pause when a blank page is skipped.
    pub blank_page_delay: Duration,
    /// Wait after broadcasting the reboot.
    pub reboot_delay: Duration,
}

impl Default for UpdaterTiming {
    fn default() -> Self {
        Self {
            identify_resend: Duration::from_millis(200),
            identify_timeout: Duration::from_secs(3),
            handoff_delay: Duration::from_millis(200),
            handoff_close: Duration::from_secs(5),
            handoff_reopen: Duration::from_secs(2),
            warning_timeout: Duration::from_secs(10),
            warning_read: Duration::from_secs(2),
            warning_poll: Duration::from_millis(10),
            response_timeout: Duration::from_secs(5),
            chunk_delay: Duration::from_millis(1),
            page_delay: Duration::from_millis(10),
            blank_page_delay: Duration::from_millis(20),
            reboot_delay: Duration::from_secs(1),
        }
    }
}

impl UpdaterTiming {
    /// Timing for simulator-backed tests: short deadlines, no pacing sleeps.
    pub fn fast() -> Self {
        Self {
            identify_resend: Duration::from_millis(5),
            identify_timeout: Duration::from_millis(40),
            handoff_delay: Duration::ZERO,
            handoff_close: Duration::ZERO,
            handoff_reopen: Duration::ZERO,
            warning_timeout: Duration::from_millis(100),
            warning_read: Duration::from_millis(10),
            warning_poll: Duration::ZERO,
            response_timeout: Duration::from_millis(50),
            chunk_delay: Duration::ZERO,
            page_delay: Duration::ZERO,
            blank_page_delay: Duration::ZERO,
            reboot_delay: Duration::ZERO,
        }
    }
}

const UUID_UNSET: u64 = u64::MAX;

/// Shared per-worker state record.
///
/// Written only by the owning worker thread, read by the supervisor. Every
/// field is either atomic or behind a mutex, and the interesting ones are
/// monotone: `uuid` goes unset-to-set once, `progress` only grows,
/// `update_error` leaves zero exactly once.
#[derive(Debug)]
pub struct UpdaterStatus {
    uuid: AtomicU64,
    module_id: AtomicU16,
    is_network: AtomicBool,
    progress: AtomicU8,
    update_error: AtomicI8,
    has_update_error: AtomicBool,
    error_message: Mutex<String>,
}

impl Default for UpdaterStatus {
    fn default() -> Self {
        Self {
            uuid: AtomicU64::new(UUID_UNSET),
            module_id: AtomicU16::new(BROADCAST_ID),
            is_network: AtomicBool::new(true),
            progress: AtomicU8::new(0),
            update_error: AtomicI8::new(0),
            has_update_error: AtomicBool::new(false),
            error_message: Mutex::new(String::new()),
        }
    }
}

impl UpdaterStatus {
    /// The module uuid, once known.
    pub fn uuid(&self) -> Option<u64> {
        match self.uuid.load(Ordering::SeqCst) {
            UUID_UNSET => None,
            uuid => Some(uuid),
        }
    }

    /// The 12-bit id used to address the module (broadcast until identified).
    pub fn module_id(&self) -> u16 {
        self.module_id.load(Ordering::SeqCst)
    }

    /// Whether the module identified as a network module (the default).
    pub fn is_network(&self) -> bool {
        self.is_network.load(Ordering::SeqCst)
    }

    /// Update progress, 0..=100. Never decreases.
    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::SeqCst)
    }

    /// Overall outcome: 0 while running, +1 success, -1 failure.
    pub fn update_error(&self) -> i8 {
        self.update_error.load(Ordering::SeqCst)
    }

    /// Whether any fatal error was recorded during the run.
    pub fn has_update_error(&self) -> bool {
        self.has_update_error.load(Ordering::SeqCst)
    }

    /// The failure message, empty while none was recorded.
    pub fn error_message(&self) -> String {
        self.error_message
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn set_uuid(&self, uuid: u64) {
        self.uuid.store(uuid, Ordering::SeqCst);
        self.module_id
            .store(crate::device::module_id(uuid), Ordering::SeqCst);
    }

    fn set_module_id(&self, id: u16) {
        self.module_id.store(id, Ordering::SeqCst);
    }

    fn set_is_network(&self, is_network: bool) {
        self.is_network.store(is_network, Ordering::SeqCst);
    }

    fn publish_progress(&self, percent: u8) {
        self.progress.fetch_max(percent, Ordering::SeqCst);
    }

    fn record_failure(&self, message: String) {
        warn!("update error: {message}");
        *self
            .error_message
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = message;
        self.has_update_error.store(true, Ordering::SeqCst);
    }

    fn finish(&self, outcome: i8) {
        self.update_error.store(outcome, Ordering::SeqCst);
    }
}

/// Firmware updater for a single module behind one serial port.
pub struct ModuleUpdater<P: Port> {
    link: PacketLink<P>,
    timing: UpdaterTiming,
    status: Arc<UpdaterStatus>,
    firmware_root: PathBuf,
}

impl<P: Port> ModuleUpdater<P> {
    /// Create an updater over an open port. Firmware images are resolved
    /// under `firmware_root` via the version catalog.
    pub fn new(port: P, firmware_root: impl Into<PathBuf>) -> Self {
        Self {
            link: PacketLink::new(port),
            timing: UpdaterTiming::default(),
            status: Arc::new(UpdaterStatus::default()),
            firmware_root: firmware_root.into(),
        }
    }

    /// Replace the timing profile.
    #[must_use]
    pub fn with_timing(mut self, timing: UpdaterTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Shared handle onto this worker's state record.
    pub fn status(&self) -> Arc<UpdaterStatus> {
        Arc::clone(&self.status)
    }

    /// Run the full update. The outcome is also published through the status
    /// record (`update_error` +1/-1); the transport is closed on every exit
    /// path.
    pub fn run(&mut self, catalog: &VersionCatalog) -> Result<()> {
        let outcome = self.run_phases(catalog);
        let _ = self.link.close();

        if self.status.has_update_error() {
            self.status.finish(-1);
            // Early aborts carry their own error; page-loop and trailer
            // failures surface the recorded message.
            Err(match outcome {
                Err(e) => e,
                Ok(()) => Error::Update(self.status.error_message()),
            })
        } else {
            self.status.finish(1);
            Ok(())
        }
    }

    fn run_phases(&mut self, catalog: &VersionCatalog) -> Result<()> {
        self.identify();

        if let Err(e) = self.enter_bootloader() {
            self.status
                .record_failure(format!("Bootloader handoff failed: {e}"));
            return Err(e);
        }

        if !self.wait_for_warning() {
            self.status.record_failure("Warning timeout".into());
            return Err(Error::Update("Warning timeout".into()));
        }

        let kind = if self.status.is_network() {
            ModuleKind::Network
        } else {
            ModuleKind::Camera
        };

        let version = match catalog.app_version(kind).parse::<Version>() {
            Ok(version) => version,
            Err(e) => {
                self.status.record_failure(e.to_string());
                return Err(e);
            }
        };

        let bin_path = catalog.bin_path(&self.firmware_root, kind);
        let image = match FirmwareImage::from_file(&bin_path) {
            Ok(image) => image,
            Err(e) => {
                let e = Error::InvalidImage(format!("{}: {e}", bin_path.display()));
                self.status.record_failure(e.to_string());
                return Err(e);
            }
        };

        info!(
            "updating {kind} ({}) to v{version}",
            self.status.module_id()
        );
        self.stream_firmware(&image, kind);
        let _ = self.write_trailer(version.packed());
        self.reboot();
        Ok(())
    }

    /// Phase 1: probe for the module uuid, falling back to the broadcast id.
    fn identify(&mut self) {
        let deadline = Instant::now() + self.timing.identify_timeout;

        while Instant::now() < deadline {
            self.link.send(&request_uuid());

            let window = Instant::now() + self.timing.identify_resend;
            loop {
                let remaining = window
                    .min(deadline)
                    .saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let Some(pkt) = self.link.recv(remaining) else {
                    break;
                };

                if let Some(report) = UuidReport::parse(&pkt) {
                    let kind = ModuleKind::from_uuid(report.uuid);
                    if kind.is_updatable() {
                        info!(
                            "found {kind} module {:#014X} running v{}",
                            report.uuid,
                            Version::from_packed(report.version)
                        );
                        self.adopt(report.uuid, kind);
                        return;
                    }
                } else if let Some(warning) = Warning::parse(&pkt) {
                    let kind = ModuleKind::from_uuid(warning.uuid);
                    if kind.is_updatable() {
                        debug!("module {:#014X} already in bootloader", warning.uuid);
                        self.adopt(warning.uuid, kind);
                        return;
                    }
                }
            }
        }

        debug!(
            "no identify response on {}; using broadcast id",
            self.link.port().name()
        );
        self.status.set_module_id(BROADCAST_ID);
    }

    fn adopt(&mut self, uuid: u64, kind: ModuleKind) {
        self.status.set_uuid(uuid);
        self.status.set_is_network(kind == ModuleKind::Network);
    }

    /// Phase 2: drop the module into its bootloader and cycle the port while
    /// it re-enumerates.
    fn enter_bootloader(&mut self) -> Result<()> {
        let did = self.status.module_id();
        debug!("switching module {did:#05X} to bootloader");
        self.link.send(&set_network_module_state(
            did,
            ModuleState::UpdateFirmware,
            PnpState::Off,
        ));
        thread::sleep(self.timing.handoff_delay);

        self.link.close()?;
        thread::sleep(self.timing.handoff_close);
        self.link.reopen()?;
        thread::sleep(self.timing.handoff_reopen);
        Ok(())
    }

    /// Phase 3: wait for the bootloader's "ready for firmware" warning,
    /// nudging it with `UpdateFirmwareReady` until warning type 2 arrives.
    fn wait_for_warning(&mut self) -> bool {
        let deadline = Instant::now() + self.timing.warning_timeout;
        let mut empty_reads = 0u32;

        loop {
            let Some(text) = self.link.wait_for_json(self.timing.warning_read) else {
                empty_reads += 1;
                if empty_reads >= MAX_EMPTY_WARNING_READS || Instant::now() > deadline {
                    return false;
                }
                continue;
            };
            if Instant::now() > deadline {
                return false;
            }
            empty_reads = 0;

            let pkt = match Packet::decode(&text) {
                Ok(pkt) => pkt,
                Err(e) => {
                    debug!("frame parse error: {e}");
                    continue;
                }
            };

            if let Some(warning) = Warning::parse(&pkt) {
                let kind = ModuleKind::from_uuid(warning.uuid);
                if kind.is_updatable() {
                    if self.status.uuid().is_none() {
                        self.adopt(warning.uuid, kind);
                    } else {
                        self.status.set_is_network(kind == ModuleKind::Network);
                    }

                    if warning.warning_type == WARNING_READY {
                        return true;
                    }
                    self.link.send(&set_module_state(
                        self.status.module_id(),
                        ModuleState::UpdateFirmwareReady,
                        PnpState::Off,
                    ));
                }
            }

            thread::sleep(self.timing.warning_poll);
        }
    }

    /// Phase 4: the page loop. Failures are recorded in the status record;
    /// the trailer and reboot still follow.
    fn stream_firmware(&mut self, image: &FirmwareImage, kind: ModuleKind) {
        let module_id = self.status.module_id();
        let bin_end = image.bin_end();
        let mut page_begin = image.bin_begin();
        let mut erase_errors = 0u32;
        let mut crc_errors = 0u32;

        while page_begin < bin_end {
            self.status
                .publish_progress((100 * page_begin / bin_end) as u8);

            let page = image.page(page_begin);
            if image::is_blank(page) {
                page_begin += PAGE_SIZE;
                thread::sleep(self.timing.blank_page_delay);
                continue;
            }

            let page_addr = FLASH_BASE + page_begin as u32 + PAGE_OFFSET;

            if !self.page_command(FirmwareOp::Erase, ERASE_PAGE_COUNT, page_addr) {
                erase_errors += 1;
                if erase_errors > ERASE_RETRY_LIMIT {
                    self.status
                        .record_failure(format!("{kind} ({module_id}) erase flash failed."));
                    break;
                }
                continue; // retry the same page
            }
            erase_errors = 0;

            let mut checksum = 0u32;
            for (seq, chunk) in page.chunks(8).enumerate() {
                if page_begin + seq * 8 >= image.bin_size() {
                    break;
                }
                self.link
                    .send(&firmware_data(module_id, seq as u16, chunk));
                checksum = crc64_step(chunk, checksum);
                thread::sleep(self.timing.chunk_delay);
            }

            if !self.page_command(FirmwareOp::Crc, checksum, page_addr) {
                crc_errors += 1;
                if crc_errors > CRC_RETRY_LIMIT {
                    self.status.record_failure("Check crc failed.".into());
                    break;
                }
                continue; // rewrite the same page
            }
            crc_errors = 0;

            page_begin += PAGE_SIZE;
            thread::sleep(self.timing.page_delay);
        }
    }

    /// Phase 5: write the end-flash trailer recording the verify header and
    /// the new version.
    fn write_trailer(&mut self, version: u16) -> Result<()> {
        self.status.publish_progress(99);

        let block = end_flash_block(version, self.status.has_update_error());
        let module_id = self.status.module_id();
        let mut sequence_retries = 0u32;

        loop {
            let mut erased = false;
            for _ in 0..=TRAILER_ERASE_RETRIES {
                if self.page_command(FirmwareOp::Erase, ERASE_PAGE_COUNT, TRAILER_ADDR) {
                    erased = true;
                    break;
                }
            }
            if !erased {
                self.status.record_failure("End erase error".into());
                return Err(Error::Update("End erase error".into()));
            }

            let mut checksum = 0u32;
            for (seq, chunk) in block.chunks(8).enumerate() {
                self.link
                    .send(&firmware_data(module_id, seq as u16, chunk));
                checksum = crc64_step(chunk, checksum);
                thread::sleep(self.timing.chunk_delay);
            }

            if self.page_command(FirmwareOp::Crc, checksum, TRAILER_ADDR) {
                debug!("end flash written for module {module_id:#05X}");
                return Ok(());
            }

            sequence_retries += 1;
            if sequence_retries > TRAILER_SEQUENCE_RETRIES {
                self.status.record_failure("End crc error".into());
                return Err(Error::Update("End crc error".into()));
            }
        }
    }

    /// Phase 6: broadcast the reboot and close down.
    fn reboot(&mut self) {
        self.link.send(&set_module_state(
            BROADCAST_ID,
            ModuleState::Reboot,
            PnpState::Off,
        ));
        thread::sleep(self.timing.reboot_delay);
        self.status.publish_progress(100);
    }

    /// Send one erase/crc command and await its response. One attempt: the
    /// retry budgets live with the callers.
    fn page_command(&mut self, op: FirmwareOp, crc_val: u32, page_addr: u32) -> bool {
        let module_id = self.status.module_id();
        self.link
            .send(&firmware_command(module_id, op, crc_val, page_addr));
        self.await_response(op)
    }

    /// Wait for a `0x0C` response settling this command: the matching
    /// complete state succeeds, either error state fails, anything else is
    /// ignored until the deadline.
    fn await_response(&mut self, op: FirmwareOp) -> bool {
        let deadline = Instant::now() + self.timing.response_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let Some(pkt) = self.link.recv(remaining) else {
                return false;
            };
            let Some(CommandResponse { stream_state }) = CommandResponse::parse(&pkt) else {
                continue;
            };

            match stream_state {
                Some(StreamState::EraseComplete) if op == FirmwareOp::Erase => return true,
                Some(StreamState::CrcComplete) if op == FirmwareOp::Crc => return true,
                Some(StreamState::EraseError | StreamState::CrcError) => return false,
                _ => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_defaults() {
        let status = UpdaterStatus::default();
        assert_eq!(status.uuid(), None);
        assert_eq!(status.module_id(), BROADCAST_ID);
        assert!(status.is_network());
        assert_eq!(status.progress(), 0);
        assert_eq!(status.update_error(), 0);
        assert!(!status.has_update_error());
        assert_eq!(status.error_message(), "");
    }

    #[test]
    fn test_status_uuid_sets_module_id() {
        let status = UpdaterStatus::default();
        status.set_uuid(0x2000_1234_5678);
        assert_eq!(status.uuid(), Some(0x2000_1234_5678));
        assert_eq!(status.module_id(), 0x678);
    }

    #[test]
    fn test_status_progress_is_monotone() {
        let status = UpdaterStatus::default();
        status.publish_progress(40);
        status.publish_progress(10);
        assert_eq!(status.progress(), 40);
        status.publish_progress(100);
        assert_eq!(status.progress(), 100);
    }

    #[test]
    fn test_status_failure_record() {
        let status = UpdaterStatus::default();
        status.record_failure("Check crc failed.".into());
        assert!(status.has_update_error());
        assert_eq!(status.error_message(), "Check crc failed.");
        status.finish(-1);
        assert_eq!(status.update_error(), -1);
    }

    #[test]
    fn test_default_timing_matches_protocol() {
        let timing = UpdaterTiming::default();
        assert_eq!(timing.identify_timeout, Duration::from_secs(3));
        assert_eq!(timing.warning_timeout, Duration::from_secs(10));
        assert_eq!(timing.response_timeout, Duration::from_secs(5));
        assert_eq!(timing.handoff_close, Duration::from_secs(5));
    }
}
