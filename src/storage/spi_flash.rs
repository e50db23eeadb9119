// SPDX-License-Identifier: GPL-3.0-only

//! Generic SPI NOR flash storage
//!
//! Supports the near-universal command set of small NOR devices: read,
//! write-enable, page program, 4 KiB sector erase and status. Addresses are
//! 24 bits, which also bounds the supportable image size.

use crate::errors::{CoreError, CoreResult};
use crate::storage::{
    FlashMemoryConfig, StorageReadRandom, StorageWriteFullOverwrite, StorageWriteSectorBased,
};
use std::time::Duration;

/// Full-duplex SPI transfers to a selected slave.
///
/// The MOSI payload starts with a command byte; read and write commands
/// carry a 24-bit big-endian address. Implementations hold the bus and chip
/// select for the duration of one call.
pub trait SpiBusAccess {
    /// Route subsequent transfers to the given slave
    fn select_device(&mut self, device: u8) -> CoreResult<()>;
    fn write_spi(&mut self, mosi: &[u8]) -> CoreResult<()>;
    /// Send `mosi`, then clock `miso.len()` further bytes into `miso`
    fn read_spi(&mut self, mosi: &[u8], miso: &mut [u8]) -> CoreResult<()>;
    /// Largest read payload per transfer
    fn maximum_receive_size(&self) -> usize;
    /// Largest MOSI payload per transfer, command and address included
    fn maximum_write_size(&self) -> usize;
}

/// Command set of the expected storage devices
mod command {
    pub const WRITE: u8 = 0x02;
    pub const READ: u8 = 0x03;
    pub const STATUS: u8 = 0x05;
    pub const WRITE_ENABLE: u8 = 0x06;
    pub const ERASE_SECTOR: u8 = 0x20;
}

/// These chips take 24-bit data addresses, which limits the image size
const MAX_IMAGE_SIZE: usize = 1 << 24;

/// One page can be programmed per write
const BYTES_PER_WRITE: usize = 256;

/// The memory is assumed to erase in 4096-byte sectors
const BYTES_PER_SECTOR: usize = 4096;

/// Delays between status polls, in milliseconds.
///
/// Reference times from datasheets: a typical page program takes under a
/// millisecond (5 ms max); sector erases range from 45 ms typical to
/// seconds max, hence the exponential start and the long plateau.
const POLL_PATTERN_MS: [u64; 16] = [
    0, 1, 1, 3, 5, 40, 100, 150, 150, 150, 150, 150, 1000, 1000, 1000, 1000,
];

const STATUS_BUSY_FLAG: u8 = 0x01;

fn push_be24(buffer: &mut Vec<u8>, addr: u32) {
    buffer.push((addr >> 16) as u8);
    buffer.push((addr >> 8) as u8);
    buffer.push(addr as u8);
}

/// NOR flash behind an [`SpiBusAccess`]
pub struct SpiGenericFlash<A> {
    access: A,
    device: u8,
    access_offset: usize,
    image_size: usize,
}

impl<A: SpiBusAccess> SpiGenericFlash<A> {
    pub fn new(config: FlashMemoryConfig, access: A, device: u8) -> CoreResult<Self> {
        if config.image_size > MAX_IMAGE_SIZE {
            return Err(CoreError::Logic(
                "SPI flash only supports a 24-bit address space".to_string(),
            ));
        }
        let image_size = if config.image_size == 0 {
            MAX_IMAGE_SIZE
        } else {
            config.image_size
        };
        if config.page_size != 0 && config.page_size != BYTES_PER_WRITE {
            return Err(CoreError::NotImplemented(
                "only the hardcoded page size is supported".to_string(),
            ));
        }
        Ok(Self {
            access,
            device,
            access_offset: config.access_offset,
            image_size,
        })
    }

    /// Access to the underlying bus, for callers that layer this driver on
    /// top of another transport
    pub fn bus_access_mut(&mut self) -> &mut A {
        &mut self.access
    }

    fn read_block(&mut self, start_addr: u32, buffer: &mut [u8]) -> CoreResult<()> {
        let mut mosi = Vec::with_capacity(4);
        mosi.push(command::READ);
        push_be24(&mut mosi, start_addr);
        self.access.read_spi(&mosi, buffer)
    }

    fn write_block(&mut self, start_addr: u32, buffer: &[u8]) -> CoreResult<()> {
        self.access.write_spi(&[command::WRITE_ENABLE])?;

        let mut mosi = Vec::with_capacity(4 + buffer.len());
        mosi.push(command::WRITE);
        push_be24(&mut mosi, start_addr);
        mosi.extend_from_slice(buffer);
        self.access.write_spi(&mosi)?;

        self.wait_for_write_complete()
    }

    fn erase_sector(&mut self, sector_addr: u32) -> CoreResult<()> {
        self.access.write_spi(&[command::WRITE_ENABLE])?;

        let mut mosi = Vec::with_capacity(4);
        mosi.push(command::ERASE_SECTOR);
        push_be24(&mut mosi, sector_addr);
        self.access.write_spi(&mosi)?;

        self.wait_for_write_complete()
    }

    /// Poll the status register until the busy bit clears
    fn wait_for_write_complete(&mut self) -> CoreResult<()> {
        for delay_ms in POLL_PATTERN_MS {
            if delay_ms != 0 {
                std::thread::sleep(Duration::from_millis(delay_ms));
            }
            let mut status = [0u8; 1];
            self.access.read_spi(&[command::STATUS], &mut status)?;
            if status[0] & STATUS_BUSY_FLAG == 0 {
                return Ok(());
            }
        }
        Err(CoreError::Timeout("SPI flash device still busy".to_string()))
    }
}

impl<A: SpiBusAccess> StorageReadRandom for SpiGenericFlash<A> {
    fn read_storage(&mut self, start_addr: usize, buffer: &mut [u8]) -> CoreResult<()> {
        self.access.select_device(self.device)?;

        let start_addr = start_addr + self.access_offset;
        if !buffer.is_empty() && start_addr + buffer.len() - 1 > self.image_size {
            return Err(CoreError::OutOfBounds(
                "read exceeds storage size".to_string(),
            ));
        }

        let block_size = self.access.maximum_receive_size();
        let mut offset = 0;
        while offset + block_size <= buffer.len() {
            let (head, _) = buffer[offset..].split_at_mut(block_size);
            self.read_block((start_addr + offset) as u32, head)?;
            offset += block_size;
        }
        if offset < buffer.len() {
            self.read_block((start_addr + offset) as u32, &mut buffer[offset..])?;
        }
        Ok(())
    }
}

impl<A: SpiBusAccess> StorageWriteSectorBased for SpiGenericFlash<A> {
    fn sector_size(&self) -> usize {
        BYTES_PER_SECTOR
    }

    /// Erase every covered sector, then program page by page.
    ///
    /// Both erase and program are preceded by a write-enable and followed by
    /// a busy poll.
    fn write_sector_based(&mut self, start_addr: usize, buffer: &[u8]) -> CoreResult<()> {
        self.access.select_device(self.device)?;

        let start_addr = start_addr + self.access_offset;
        if start_addr % BYTES_PER_SECTOR != 0 {
            return Err(CoreError::Logic(
                "write does not start on a sector boundary".to_string(),
            ));
        }
        if !buffer.is_empty() && start_addr + buffer.len() - 1 > self.image_size {
            return Err(CoreError::OutOfBounds(
                "write exceeds storage size".to_string(),
            ));
        }

        let mut sector_addr = start_addr;
        while sector_addr < start_addr + buffer.len() {
            self.erase_sector(sector_addr as u32)?;
            sector_addr += BYTES_PER_SECTOR;
        }

        let mut offset = 0;
        while offset < buffer.len() {
            let end = (offset + BYTES_PER_WRITE).min(buffer.len());
            self.write_block((start_addr + offset) as u32, &buffer[offset..end])?;
            offset = end;
        }
        Ok(())
    }
}

impl<A: SpiBusAccess> StorageWriteFullOverwrite for SpiGenericFlash<A> {
    fn write_storage(&mut self, buffer: &[u8]) -> CoreResult<()> {
        self.write_sector_based(0, buffer)
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockSpiFlash;
    use super::*;

    fn flash(image_size: usize) -> SpiGenericFlash<MockSpiFlash> {
        let config = FlashMemoryConfig::default().with_image_size(image_size);
        SpiGenericFlash::new(config, MockSpiFlash::new(1 << 20), 0).expect("config accepted")
    }

    #[test]
    fn test_sector_write_layout() {
        let mut flash = flash(1 << 20);
        let pattern: Vec<u8> = (0..2100u32).map(|i| i as u8).collect();
        flash.write_sector_based(0, &pattern).expect("write");

        // 2100 bytes spanning two sectors: erase both, then program
        // 8 full pages and a 52-byte tail
        assert_eq!(flash.access.erases(), vec![0x0000, 0x1000]);
        let programs = flash.access.programs();
        assert_eq!(programs.len(), 9);
        for (i, (addr, len)) in programs.iter().take(8).enumerate() {
            assert_eq!(*addr, (i * 256) as u32);
            assert_eq!(*len, 256);
        }
        assert_eq!(programs[8], (2048, 52));
    }

    #[test]
    fn test_write_read_round_trip() {
        let mut flash = flash(1 << 20);
        let pattern: Vec<u8> = (0..5000u32).map(|i| (i % 241) as u8).collect();
        flash.write_sector_based(0x2000, &pattern).expect("write");
        let mut back = vec![0u8; pattern.len()];
        flash.read_storage(0x2000, &mut back).expect("read");
        assert_eq!(back, pattern);
    }

    #[test]
    fn test_unaligned_write_is_rejected() {
        let mut flash = flash(1 << 20);
        assert!(matches!(
            flash.write_sector_based(0x100, &[0u8; 16]),
            Err(CoreError::Logic(_))
        ));
    }

    #[test]
    fn test_bounds_checks() {
        let mut flash = flash(0x2000);
        let mut buffer = vec![0u8; 0x1000];
        assert!(flash.read_storage(0x1000, &mut buffer).is_ok());
        assert!(matches!(
            flash.read_storage(0x1002, &mut buffer),
            Err(CoreError::OutOfBounds(_))
        ));
        assert!(matches!(
            flash.write_sector_based(0x2000, &[0u8; 16]),
            Err(CoreError::OutOfBounds(_))
        ));
    }

    #[test]
    fn test_oversized_image_is_rejected() {
        let config = FlashMemoryConfig::default().with_image_size((1 << 24) + 1);
        assert!(matches!(
            SpiGenericFlash::new(config, MockSpiFlash::new(16), 0),
            Err(CoreError::Logic(_))
        ));
    }

    #[test]
    fn test_access_offset_applies_to_reads() {
        let mut flash = {
            let config = FlashMemoryConfig::default()
                .with_image_size(1 << 20)
                .with_access_offset(0x1000);
            SpiGenericFlash::new(config, MockSpiFlash::new(1 << 20), 0).expect("config")
        };
        flash.access.cells[0x1000..0x1004].copy_from_slice(&[1, 2, 3, 4]);
        let mut buffer = vec![0u8; 4];
        flash.read_storage(0, &mut buffer).expect("read");
        assert_eq!(buffer, vec![1, 2, 3, 4]);
    }
}
