// SPDX-License-Identifier: GPL-3.0-only

//! SPI bus access through the imager's gateway
//!
//! Second-generation imagers expose their external flash over an on-chip
//! SPI master driven by the iSM. The host stages the MOSI payload in pixel
//! memory, writes the transfer geometry to the gateway registers, triggers,
//! and polls the status register. This makes the attached flash reachable
//! with the ordinary [`SpiBusAccess`] commands, so the generic flash driver
//! works unchanged on top.

use crate::errors::{CoreError, CoreResult};
use crate::registers::{RegisterAccess, RegisterIo};
use crate::storage::spi_flash::SpiBusAccess;
use std::time::Duration;

/// Gateway register block of one imager family
#[derive(Debug, Clone, Copy)]
pub struct GatewayRegisters {
    pub spi_cfg: u16,
    /// Source of the MOSI bytes
    pub spi_wr_addr: u16,
    /// Destination of the received bytes
    pub spi_rd_addr: u16,
    pub spi_len: u16,
    pub spi_trig: u16,
    pub spi_status: u16,
    /// Start of the pixel memory used as staging area
    pub pix_mem: u16,
    /// Start of the use-case configuration container
    pub cfg_cnt: u16,
}

/// Gateway register block of the Aura200 family
pub const AURA200_GATEWAY: GatewayRegisters = GatewayRegisters {
    spi_cfg: 0xB380,
    spi_wr_addr: 0xB381,
    spi_rd_addr: 0xB382,
    spi_len: 0xB383,
    spi_trig: 0xB384,
    spi_status: 0xB385,
    pix_mem: 0xC000,
    cfg_cnt: 0x9100,
};

/// SPI enable bit of the gateway's configuration register
pub const SPI_ENABLE: u16 = 1 << 14;
/// Run the SPI clock at sys_clock / 8
pub const SPI_CLOCK_DIV_8: u16 = 2;
/// Trigger value starting a transfer
pub const SPI_TRIGGER: u16 = 2;
/// Status value once the transfer finished
pub const SPI_DONE: u16 = 1;
/// Flag bits carried in the upper bits of the length register
pub const SPI_LEN_FLAGS: u16 = 0x07 << 13;

/// Worst case for clocking command, address and one full payload over the
/// imager's SPI at sys_clock/8; slept unconditionally before the first
/// status poll
pub const TIME_BLOCK_TRANSFER: Duration = Duration::from_micros(150);

/// Sleep between status poll retries
pub const POLLING_INTERVAL: Duration = Duration::from_millis(10);

/// Hardware limit for one transfer's payload, in bytes
const MAX_PAYLOAD_BYTES: usize = 256;

/// Pack bytes into the imager's 16-bit words, first byte in the high half
pub(crate) fn pack_words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|pair| {
            let high = u16::from(pair[0]) << 8;
            let low = pair.get(1).map(|b| u16::from(*b)).unwrap_or(0);
            high | low
        })
        .collect()
}

/// Unpack the imager's 16-bit words back into bytes
pub(crate) fn unpack_words(words: &[u16], bytes: &mut [u8]) {
    for (i, byte) in bytes.iter_mut().enumerate() {
        let word = words[i / 2];
        *byte = if i % 2 == 0 {
            (word >> 8) as u8
        } else {
            word as u8
        };
    }
}

/// [`SpiBusAccess`] implementation backed by the imager gateway
pub struct SpiGatewayBusAccess<B> {
    access: RegisterAccess<B>,
    regs: GatewayRegisters,
    configured: bool,
}

impl<B: RegisterIo> SpiGatewayBusAccess<B> {
    pub fn new(access: RegisterAccess<B>, regs: GatewayRegisters) -> Self {
        Self {
            access,
            regs,
            configured: false,
        }
    }

    pub fn into_inner(self) -> RegisterAccess<B> {
        self.access
    }

    pub fn register_access_mut(&mut self) -> &mut RegisterAccess<B> {
        &mut self.access
    }

    fn ensure_configured(&mut self) -> CoreResult<()> {
        if !self.configured {
            self.access
                .write(self.regs.spi_cfg, SPI_ENABLE | SPI_CLOCK_DIV_8)?;
            self.configured = true;
        }
        Ok(())
    }

    /// Stage the MOSI payload, program the geometry and run one transfer
    fn transfer(&mut self, mosi: &[u8], receive_len: usize) -> CoreResult<()> {
        if mosi.is_empty() {
            return Err(CoreError::Logic("empty SPI command".to_string()));
        }
        if mosi.len() + receive_len > MAX_PAYLOAD_BYTES + 4 {
            return Err(CoreError::InvalidValue(format!(
                "transfer of {} bytes exceeds the gateway limit",
                mosi.len() + receive_len
            )));
        }
        self.ensure_configured()?;

        let words = pack_words(mosi);
        let addresses: Vec<u16> = (0..words.len() as u16)
            .map(|i| self.regs.pix_mem + i)
            .collect();
        self.access.write_registers(&addresses, &words)?;
        self.access.write(self.regs.spi_wr_addr, self.regs.pix_mem)?;
        self.access.write(self.regs.spi_rd_addr, self.receive_area())?;

        // spi_len == 0 means one byte on the wire
        let total = (mosi.len() + receive_len - 1) as u16;
        self.access
            .write(self.regs.spi_len, SPI_LEN_FLAGS | total)?;
        self.access.write(self.regs.spi_trig, SPI_TRIGGER)?;

        self.access.poll_until(
            self.regs.spi_status,
            SPI_DONE,
            TIME_BLOCK_TRANSFER,
            POLLING_INTERVAL,
        )
    }

    fn receive_area(&self) -> u16 {
        // received bytes land behind the largest possible staging area
        self.regs.pix_mem + ((MAX_PAYLOAD_BYTES + 4) / 2) as u16
    }
}

impl<B: RegisterIo> SpiBusAccess for SpiGatewayBusAccess<B> {
    fn select_device(&mut self, _device: u8) -> CoreResult<()> {
        // the gateway reaches exactly one slave, behind the imager's own
        // chip select
        Ok(())
    }

    fn write_spi(&mut self, mosi: &[u8]) -> CoreResult<()> {
        self.transfer(mosi, 0)
    }

    fn read_spi(&mut self, mosi: &[u8], miso: &mut [u8]) -> CoreResult<()> {
        self.transfer(mosi, miso.len())?;

        let word_count = miso.len().div_ceil(2);
        let addresses: Vec<u16> = (0..word_count as u16)
            .map(|i| self.receive_area() + i)
            .collect();
        let mut words = vec![0u16; word_count];
        self.access.read_registers(&addresses, &mut words)?;
        unpack_words(&words, miso);
        Ok(())
    }

    fn maximum_receive_size(&self) -> usize {
        MAX_PAYLOAD_BYTES
    }

    fn maximum_write_size(&self) -> usize {
        MAX_PAYLOAD_BYTES + 4
    }
}
