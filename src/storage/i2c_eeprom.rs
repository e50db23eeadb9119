// SPDX-License-Identifier: GPL-3.0-only

//! I²C EEPROM storage
//!
//! EEPROMs larger than 64 KiB spill their high address bits into the I²C
//! device address. Reads split at the bus master's maximum transfer size;
//! writes additionally align to the EEPROM page size and wait the device's
//! write time between pages.

use crate::errors::{CoreError, CoreResult};
use crate::storage::{FlashMemoryConfig, StorageReadRandom, StorageWriteFullOverwrite};
use std::time::Duration;
use tracing::error;

/// Register-address width on the I²C bus, sent big-endian
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2cAddressMode {
    NoAddress,
    EightBit,
    SixteenBit,
}

/// Raw I²C transfers as provided by the bridge
pub trait I2cBusAccess {
    fn read_i2c(
        &mut self,
        dev_addr: u8,
        addr_mode: I2cAddressMode,
        reg_addr: u16,
        buffer: &mut [u8],
    ) -> CoreResult<()>;

    fn write_i2c(
        &mut self,
        dev_addr: u8,
        addr_mode: I2cAddressMode,
        reg_addr: u16,
        buffer: &[u8],
    ) -> CoreResult<()>;

    /// Largest payload a single transfer may carry
    fn maximum_data_size(&self) -> usize;
}

/// Abort a write when errors exceed bytes-written divided by this ratio
const RETRY_FAIL_RATIO: usize = 100;

/// EEPROM behind an [`I2cBusAccess`]
pub struct StorageI2cEeprom<A> {
    access: A,
    dev_addr: u8,
    /// Bytes that can be written at once; every write must stay within one
    /// EEPROM page, which is satisfied by starting writes on multiples of
    /// this size
    write_size: usize,
    write_time: Duration,
    image_size: usize,
}

impl<A: I2cBusAccess> StorageI2cEeprom<A> {
    pub fn new(config: FlashMemoryConfig, access: A, dev_addr: u8) -> CoreResult<Self> {
        if config.access_offset != 0 {
            return Err(CoreError::NotImplemented(
                "access offsets are not supported on I2C EEPROMs".to_string(),
            ));
        }
        let write_size = if config.page_size == 0 {
            1
        } else {
            config.page_size
        };
        Ok(Self {
            access,
            dev_addr,
            write_size,
            write_time: config.write_time,
            image_size: config.image_size,
        })
    }

    fn read_block(&mut self, start_addr: u32, buffer: &mut [u8]) -> CoreResult<()> {
        let address_top = (start_addr >> 16) as u8;
        let address_low = start_addr as u16;
        self.access.read_i2c(
            self.dev_addr | address_top,
            I2cAddressMode::SixteenBit,
            address_low,
            buffer,
        )
    }

    fn write_page(&mut self, start_addr: u32, buffer: &[u8]) -> CoreResult<()> {
        let address_top = (start_addr >> 16) as u8;
        let address_low = start_addr as u16;
        self.access.write_i2c(
            self.dev_addr | address_top,
            I2cAddressMode::SixteenBit,
            address_low,
            buffer,
        )
    }
}

impl<A: I2cBusAccess> StorageReadRandom for StorageI2cEeprom<A> {
    fn read_storage(&mut self, start_addr: usize, buffer: &mut [u8]) -> CoreResult<()> {
        if self.image_size > 0 && start_addr + buffer.len() > self.image_size {
            return Err(CoreError::OutOfBounds("read beyond image size".to_string()));
        }

        let block_size = self.access.maximum_data_size().min(buffer.len());
        if block_size == 0 {
            return Ok(());
        }

        let mut offset = 0;
        while offset + block_size <= buffer.len() {
            let (head, _) = buffer[offset..].split_at_mut(block_size);
            self.read_block((start_addr + offset) as u32, head)?;
            offset += block_size;
        }
        // final partial block
        if offset < buffer.len() {
            self.read_block((start_addr + offset) as u32, &mut buffer[offset..])?;
        }
        Ok(())
    }
}

impl<A: I2cBusAccess> StorageWriteFullOverwrite for StorageI2cEeprom<A> {
    /// Overwrite the image, page by page.
    ///
    /// A failing page write is retried; the whole operation aborts once the
    /// error count exceeds one percent of the bytes written so far. A
    /// failure on the very first page aborts immediately, before any data
    /// has been destroyed.
    fn write_storage(&mut self, buffer: &[u8]) -> CoreResult<()> {
        if self.image_size > 0 && buffer.len() > self.image_size {
            return Err(CoreError::OutOfBounds(
                "write beyond image size".to_string(),
            ));
        }

        let write_size = self.write_size.min(self.access.maximum_data_size());
        let mut error_count = 0usize;

        let mut offset = 0usize;
        while offset < buffer.len() {
            // settle time for the previous page write
            if offset > 0 && self.write_time != Duration::ZERO {
                std::thread::sleep(self.write_time);
            }

            let end = (offset + write_size).min(buffer.len());
            match self.write_page(offset as u32, &buffer[offset..end]) {
                Ok(()) => offset = end,
                Err(e) if matches!(e, CoreError::Runtime(_)) => {
                    error_count += 1;

                    if offset == 0 {
                        // Possibly the wrong I2C address; quitting before the
                        // first page leaves the old data usable.
                        error!("write failed on the first page");
                        return Err(CoreError::Runtime(
                            "write failed on the first page".to_string(),
                        ));
                    }
                    if error_count > offset / RETRY_FAIL_RATIO {
                        error!(
                            errors = error_count,
                            bytes = offset,
                            "write failed, giving up with partial data written"
                        );
                        return Err(CoreError::Runtime(
                            "write failed after retries, some bytes written".to_string(),
                        ));
                    }
                    error!(error = %e, page_offset = offset, "page write failed, retrying");
                    // retry the same page
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Records transfer sizes and simulates a 128 KiB EEPROM whose high
    /// address bit spills into the device address
    struct MockEeprom {
        dev_addr: u8,
        cells: Vec<u8>,
        reads: Vec<usize>,
        writes: Vec<usize>,
        /// Errors injected into upcoming writes (true = fail)
        write_faults: VecDeque<bool>,
        max_data_size: usize,
    }

    impl MockEeprom {
        fn new(dev_addr: u8) -> Self {
            Self {
                dev_addr,
                cells: vec![0u8; 0x20000],
                reads: Vec::new(),
                writes: Vec::new(),
                write_faults: VecDeque::new(),
                max_data_size: 4096,
            }
        }

        fn offset(&self, dev_addr: u8, reg_addr: u16) -> usize {
            assert_eq!(self.dev_addr, dev_addr & !0x01);
            (usize::from(dev_addr & 0x01) << 16) | usize::from(reg_addr)
        }
    }

    impl I2cBusAccess for MockEeprom {
        fn read_i2c(
            &mut self,
            dev_addr: u8,
            _addr_mode: I2cAddressMode,
            reg_addr: u16,
            buffer: &mut [u8],
        ) -> CoreResult<()> {
            self.reads.push(buffer.len());
            let offset = self.offset(dev_addr, reg_addr);
            buffer.copy_from_slice(&self.cells[offset..offset + buffer.len()]);
            Ok(())
        }

        fn write_i2c(
            &mut self,
            dev_addr: u8,
            _addr_mode: I2cAddressMode,
            reg_addr: u16,
            buffer: &[u8],
        ) -> CoreResult<()> {
            if self.write_faults.pop_front().unwrap_or(false) {
                return Err(CoreError::Runtime("injected write fault".to_string()));
            }
            self.writes.push(buffer.len());
            let offset = self.offset(dev_addr, reg_addr);
            self.cells[offset..offset + buffer.len()].copy_from_slice(buffer);
            Ok(())
        }

        fn maximum_data_size(&self) -> usize {
            self.max_data_size
        }
    }

    fn storage(config: FlashMemoryConfig) -> StorageI2cEeprom<MockEeprom> {
        StorageI2cEeprom::new(config, MockEeprom::new(0x56), 0x56).expect("config accepted")
    }

    #[test]
    fn test_read_splits_at_bus_maximum() {
        let mut storage =
            storage(FlashMemoryConfig::default().with_image_size(0x20000).with_page_size(256));
        let mut buffer = vec![0u8; 10000];
        storage.read_storage(0, &mut buffer).expect("read");
        // 10000 bytes with a 4096-byte bus maximum
        assert_eq!(storage.access.reads, vec![4096, 4096, 1808]);
    }

    #[test]
    fn test_read_round_trips_data() {
        let mut storage =
            storage(FlashMemoryConfig::default().with_image_size(0x20000).with_page_size(256));
        let pattern: Vec<u8> = (0..10000u32).map(|i| (i % 251) as u8).collect();
        storage.write_storage(&pattern).expect("write");
        let mut back = vec![0u8; pattern.len()];
        storage.read_storage(0, &mut back).expect("read");
        assert_eq!(back, pattern);
    }

    #[test]
    fn test_write_is_page_sized() {
        let mut storage =
            storage(FlashMemoryConfig::default().with_image_size(0x20000).with_page_size(256));
        storage.write_storage(&vec![0xAA; 600]).expect("write");
        assert_eq!(storage.access.writes, vec![256, 256, 88]);
    }

    #[test]
    fn test_read_beyond_image_size() {
        let mut storage =
            storage(FlashMemoryConfig::default().with_image_size(0x100).with_page_size(256));
        let mut buffer = vec![0u8; 0x101];
        assert!(matches!(
            storage.read_storage(0, &mut buffer),
            Err(CoreError::OutOfBounds(_))
        ));
        // and an offset read that crosses the end
        let mut buffer = vec![0u8; 2];
        assert!(matches!(
            storage.read_storage(0xFF, &mut buffer),
            Err(CoreError::OutOfBounds(_))
        ));
    }

    #[test]
    fn test_access_offset_is_not_implemented() {
        let config = FlashMemoryConfig::default()
            .with_image_size(0x20000)
            .with_access_offset(0x10000);
        assert!(matches!(
            StorageI2cEeprom::new(config, MockEeprom::new(0x56), 0x56),
            Err(CoreError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_first_page_failure_aborts_immediately() {
        let mut storage =
            storage(FlashMemoryConfig::default().with_image_size(0x20000).with_page_size(256));
        storage.access.write_faults.push_back(true);
        let result = storage.write_storage(&vec![0u8; 1024]);
        assert!(matches!(result, Err(CoreError::Runtime(_))));
        // nothing was written
        assert!(storage.access.writes.is_empty());
    }

    #[test]
    fn test_later_page_failure_is_retried() {
        let mut storage =
            storage(FlashMemoryConfig::default().with_image_size(0x20000).with_page_size(256));
        // first page fine, second page fails once then succeeds
        storage.access.write_faults.push_back(false);
        storage.access.write_faults.push_back(true);
        let pattern: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
        storage.write_storage(&pattern).expect("write");
        assert_eq!(storage.access.writes, vec![256, 256, 256, 256]);
        let mut back = vec![0u8; pattern.len()];
        storage.read_storage(0, &mut back).expect("read");
        assert_eq!(back, pattern);
    }

    #[test]
    fn test_high_address_bit_spills_into_device_address() {
        let mut storage =
            storage(FlashMemoryConfig::default().with_image_size(0x20000).with_page_size(256));
        // fill the EEPROM; the top half is addressed via dev_addr | 1
        let pattern = vec![0x5A; 0x20000];
        storage.write_storage(&pattern).expect("write");
        assert_eq!(storage.access.cells[0x1FFFF], 0x5A);
        assert_eq!(storage.access.cells[0x0FFFF], 0x5A);
    }
}
