//! Firmware image handling and target flash layout.
//!
//! A module firmware image is a raw `.bin` of the application flash. The
//! first page holds the vector table and is never streamed; it is only ever
//! touched through the end-flash trailer mechanism. The image is written in
//! 2 KiB pages, truncated to a whole number of pages.

use std::fs;
use std::path::Path;

use log::debug;

use crate::error::Result;

/// Flash erase/program unit of the target MCU.
pub const PAGE_SIZE: usize = 0x800;

/// Base address of the target flash.
pub const FLASH_BASE: u32 = 0x0800_0000;

/// Logical offset added to page addresses when streaming the application.
pub const PAGE_OFFSET: u32 = 0x8800;

/// Address of the end-flash trailer page.
pub const TRAILER_ADDR: u32 = 0x0801_F800;

/// Application entry address recorded in the trailer.
pub const BOOT_ENTRY: u32 = 0x0800_9000;

/// Page count passed in the crc field of erase commands.
pub const ERASE_PAGE_COUNT: u32 = 2;

/// Size of the end-flash trailer block.
pub const END_FLASH_LEN: usize = 16;

/// Trailer verify header for a clean update.
pub const VERIFY_OK: u8 = 0xAA;

/// Trailer verify header marking the firmware invalid.
pub const VERIFY_FAILED: u8 = 0xFF;

/// A firmware image loaded into memory.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
}

impl FirmwareImage {
    /// Load an image from a `.bin` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        debug!("loaded firmware image {} ({} bytes)", path.display(), data.len());
        Ok(Self::from_bytes(data))
    }

    /// Wrap raw image bytes.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Exact size of the image in bytes.
    ///
    /// This is the file length, not any allocation size; the final partial
    /// chunk boundary in the page loop depends on it.
    pub fn bin_size(&self) -> usize {
        self.data.len()
    }

    /// First streamed offset. The initial page (vector table) is skipped.
    pub fn bin_begin(&self) -> usize {
        PAGE_SIZE
    }

    /// End of the streamed region: the image truncated to a page multiple.
    /// Images not reaching past the first page stream nothing.
    pub fn bin_end(&self) -> usize {
        let size = self.bin_size();
        if size <= PAGE_SIZE {
            return PAGE_SIZE;
        }
        size - ((size - PAGE_SIZE) % PAGE_SIZE)
    }

    /// The page starting at `page_begin`. Callers stay within
    /// `[bin_begin, bin_end)`.
    pub fn page(&self, page_begin: usize) -> &[u8] {
        &self.data[page_begin..page_begin + PAGE_SIZE]
    }
}

/// Whether a page is entirely zero. Blank pages are skipped: no erase, no
/// write, no crc.
pub fn is_blank(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

/// Build the 16-byte end-flash trailer block.
///
/// Byte 0 is the verify header (`0xAA` clean, `0xFF` after any update
/// error), bytes 6-7 the packed version little-endian, bytes 12-15 the boot
/// entry address little-endian. Everything else stays zero.
pub fn end_flash_block(version: u16, failed: bool) -> [u8; END_FLASH_LEN] {
    let mut block = [0u8; END_FLASH_LEN];
    block[0] = if failed { VERIFY_FAILED } else { VERIFY_OK };
    block[6..8].copy_from_slice(&version.to_le_bytes());
    block[12..16].copy_from_slice(&BOOT_ENTRY.to_le_bytes());
    block
}
