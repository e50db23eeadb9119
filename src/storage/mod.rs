// SPDX-License-Identifier: GPL-3.0-only

//! Non-volatile storage access
//!
//! Calibration and configuration blobs live in an EEPROM or flash device
//! reachable over I²C, over SPI through the USB bridge, or over SPI through
//! the imager's gateway. The access implementations below share two traits:
//! random reads and full-image overwrites. Sector-granular writes are a
//! separate trait because only sectored flash devices support them.

pub mod formats;
pub mod i2c_eeprom;
pub mod spi_flash;
pub mod spi_gateway;

use crate::errors::CoreResult;
use std::time::Duration;

/// Random-access reads from a storage device
pub trait StorageReadRandom {
    /// Fill `buffer` with data starting at `start_addr`
    fn read_storage(&mut self, start_addr: usize, buffer: &mut [u8]) -> CoreResult<()>;
}

/// Overwrite of the full image, starting at offset zero
pub trait StorageWriteFullOverwrite {
    fn write_storage(&mut self, buffer: &[u8]) -> CoreResult<()>;
}

/// Sector-granular writes for devices that erase in sectors
pub trait StorageWriteSectorBased {
    fn sector_size(&self) -> usize;
    /// Erase the covered sectors and program `buffer` starting at
    /// `start_addr`, which must be sector-aligned
    fn write_sector_based(&mut self, start_addr: usize, buffer: &[u8]) -> CoreResult<()>;
}

/// Geometry and timing of a storage device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashMemoryConfig {
    /// Usable image size in bytes; 0 means unknown, disabling bounds checks
    pub image_size: usize,
    /// Write page size in bytes; 0 for byte-granular devices
    pub page_size: usize,
    /// Erase sector size in bytes; 0 for devices without erase
    pub sector_size: usize,
    /// Start of the accessible window within the physical device
    pub access_offset: usize,
    /// Settle time after each page write
    pub write_time: Duration,
}

impl Default for FlashMemoryConfig {
    fn default() -> Self {
        Self {
            image_size: 0,
            page_size: 0,
            sector_size: 0,
            access_offset: 0,
            write_time: Duration::ZERO,
        }
    }
}

impl FlashMemoryConfig {
    pub fn with_image_size(mut self, image_size: usize) -> Self {
        self.image_size = image_size;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_sector_size(mut self, sector_size: usize) -> Self {
        self.sector_size = sector_size;
        self
    }

    pub fn with_access_offset(mut self, access_offset: usize) -> Self {
        self.access_offset = access_offset;
        self
    }

    pub fn with_write_time(mut self, write_time: Duration) -> Self {
        self.write_time = write_time;
        self
    }
}

/// In-memory storage image; backs filesystem fallbacks and tests
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    pub data: Vec<u8>,
}

impl MemoryStorage {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl StorageReadRandom for MemoryStorage {
    fn read_storage(&mut self, start_addr: usize, buffer: &mut [u8]) -> CoreResult<()> {
        let end = start_addr + buffer.len();
        if end > self.data.len() {
            return Err(crate::errors::CoreError::OutOfBounds(format!(
                "read of {} bytes at {start_addr} exceeds image of {}",
                buffer.len(),
                self.data.len()
            )));
        }
        buffer.copy_from_slice(&self.data[start_addr..end]);
        Ok(())
    }
}

impl StorageWriteFullOverwrite for MemoryStorage {
    fn write_storage(&mut self, buffer: &[u8]) -> CoreResult<()> {
        if self.data.len() < buffer.len() {
            self.data.resize(buffer.len(), 0);
        }
        self.data[..buffer.len()].copy_from_slice(buffer);
        Ok(())
    }
}
