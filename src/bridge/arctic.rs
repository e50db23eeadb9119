// SPDX-License-Identifier: GPL-3.0-only

//! Vendor control channel of the Arctic bridge firmware
//!
//! Every control operation is a vendor request with (bRequest, wValue,
//! wIndex, wLength). The firmware records the outcome of the last command;
//! each set or get is followed by an error-status read, and a USB stall is
//! the firmware's way of flagging a failed command. The channel lock is
//! held across the whole composite (command plus status check) so a
//! concurrent command cannot steal the status.

use crate::errors::{CoreError, CoreResult};
use crate::storage::{StorageReadRandom, StorageWriteFullOverwrite};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info};

/// Vendor request codes understood by the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VendorRequest {
    /// Firmware version and feature flags
    VersionAndSupport = 0x00,
    /// Error flag and code of the last command
    ErrorDetails = 0x01,
    /// Select the SPI slave for subsequent flash requests
    SpiSelectDevice = 0x10,
    /// Read or write flash pages through the firmware
    SpiPages = 0x11,
    /// Erase a flash sector; reading back returns the busy state
    SpiErase = 0x12,
}

/// Transport-level failure of a single vendor transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorError {
    /// The firmware stalled the request to signal a command error
    Stall,
    /// The device is gone
    Disconnected,
    /// Any other transport failure
    Io(String),
}

/// Platform USB access to the vendor interface
pub trait VendorAccess: Send {
    fn vendor_set(
        &mut self,
        request: u8,
        w_value: u16,
        w_index: u16,
        data: &[u8],
    ) -> Result<(), VendorError>;

    fn vendor_get(
        &mut self,
        request: u8,
        w_value: u16,
        w_index: u16,
        data: &mut [u8],
    ) -> Result<(), VendorError>;
}

/// Firmware version triple from VERSION_AND_SUPPORT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArcticVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u32,
}

impl std::fmt::Display for ArcticVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Error-checked command wrapper around a [`VendorAccess`]
pub struct ArcticController<A> {
    access: Mutex<A>,
    firmware_version: ArcticVersion,
}

impl<A: VendorAccess> ArcticController<A> {
    /// Probes the firmware immediately; the transport must already be
    /// connected.
    pub fn new(access: A) -> CoreResult<Self> {
        let mut controller = Self {
            access: Mutex::new(access),
            firmware_version: ArcticVersion::default(),
        };
        controller.firmware_version = controller.read_firmware_version()?;
        info!(version = %controller.firmware_version, "arctic firmware probed");
        Ok(controller)
    }

    pub fn firmware_version(&self) -> ArcticVersion {
        self.firmware_version
    }

    /// Key/value description of the connected bridge
    pub fn bridge_info(&self) -> Vec<(String, String)> {
        vec![
            ("BRIDGE_TYPE".to_string(), "Arctic".to_string()),
            (
                "ARCTIC_FIRMWARE_VERSION".to_string(),
                self.firmware_version.to_string(),
            ),
        ]
    }

    fn lock(&self) -> MutexGuard<'_, A> {
        self.access.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Vendor set with the trailing error-status check
    pub fn checked_set(
        &self,
        request: VendorRequest,
        w_value: u16,
        w_index: u16,
        data: &[u8],
    ) -> CoreResult<()> {
        let mut access = self.lock();
        match access.vendor_set(request as u8, w_value, w_index, data) {
            Ok(()) => Self::check_error(&mut access, request, false),
            Err(VendorError::Stall) => Self::check_error(&mut access, request, true),
            Err(e) => Err(Self::transport_error(e)),
        }
    }

    /// Vendor get with the trailing error-status check
    pub fn checked_get(
        &self,
        request: VendorRequest,
        w_value: u16,
        w_index: u16,
        data: &mut [u8],
    ) -> CoreResult<()> {
        let mut access = self.lock();
        match access.vendor_get(request as u8, w_value, w_index, data) {
            Ok(()) => Self::check_error(&mut access, request, false),
            Err(VendorError::Stall) => Self::check_error(&mut access, request, true),
            Err(e) => Err(Self::transport_error(e)),
        }
    }

    fn transport_error(e: VendorError) -> CoreError {
        match e {
            VendorError::Disconnected => CoreError::Disconnected,
            VendorError::Stall => CoreError::Runtime("unexpected stall".to_string()),
            VendorError::Io(msg) => CoreError::Runtime(msg),
        }
    }

    /// Read the firmware's error record for the command just issued.
    ///
    /// `assume_error` is set when the command itself stalled: the status is
    /// read and an error returned even if the flag word reads clean.
    fn check_error(access: &mut A, request: VendorRequest, assume_error: bool) -> CoreResult<()> {
        let mut raw = [0u8; 4];
        access
            .vendor_get(VendorRequest::ErrorDetails as u8, 0, 0, &mut raw)
            .map_err(Self::transport_error)?;
        let flag = u16::from_le_bytes([raw[0], raw[1]]);
        let code = u16::from_le_bytes([raw[2], raw[3]]);

        if flag != 0 || assume_error {
            error!(request = ?request, code, "firmware reported a command error");
            return Err(CoreError::FirmwareDetected {
                request: request as u8,
                code,
            });
        }
        Ok(())
    }

    fn read_firmware_version(&mut self) -> CoreResult<ArcticVersion> {
        let mut raw = [0u8; 8];
        self.checked_get(VendorRequest::VersionAndSupport, 0, 0, &mut raw)?;
        Ok(ArcticVersion {
            major: u16::from_le_bytes([raw[0], raw[1]]),
            minor: u16::from_le_bytes([raw[2], raw[3]]),
            patch: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        })
    }
}

/// Abort a write when errors exceed bytes-written divided by this ratio
const RETRY_FAIL_RATIO: usize = 100;

/// SPI flash behind the bridge firmware's paged requests.
///
/// The firmware implements the erase and page-program sequences itself;
/// the host addresses pages through wValue/wIndex and polls the erase
/// request for the busy state.
pub struct ArcticFlashStorage<A> {
    controller: Arc<ArcticController<A>>,
    device: u8,
    image_size: usize,
    page_size: usize,
    sector_size: usize,
    access_offset: usize,
}

impl<A: VendorAccess> ArcticFlashStorage<A> {
    pub fn new(
        controller: Arc<ArcticController<A>>,
        config: crate::storage::FlashMemoryConfig,
        device: u8,
    ) -> CoreResult<Self> {
        if config.sector_size != 0 && config.access_offset % config.sector_size != 0 {
            return Err(CoreError::NotImplemented(
                "offset access is only supported on sector boundaries".to_string(),
            ));
        }
        Ok(Self {
            controller,
            device,
            image_size: config.image_size,
            page_size: if config.page_size == 0 {
                256
            } else {
                config.page_size
            },
            sector_size: config.sector_size,
            access_offset: config.access_offset,
        })
    }

    fn select_device(&self) -> CoreResult<()> {
        self.controller
            .checked_set(VendorRequest::SpiSelectDevice, u16::from(self.device), 0, &[])
    }

    fn split_address(addr: usize) -> (u16, u16) {
        ((addr >> 16) as u16, addr as u16)
    }

    fn erase_sector(&self, addr: usize) -> CoreResult<()> {
        let (high, low) = Self::split_address(addr);
        self.controller
            .checked_set(VendorRequest::SpiErase, high, low, &[])?;
        // the erase runs in the firmware; poll until it reports idle
        loop {
            let mut busy = [1u8; 1];
            self.controller
                .checked_get(VendorRequest::SpiErase, 0, 0, &mut busy)?;
            if busy[0] == 0 {
                return Ok(());
            }
        }
    }
}

impl<A: VendorAccess> StorageReadRandom for ArcticFlashStorage<A> {
    fn read_storage(&mut self, start_addr: usize, buffer: &mut [u8]) -> CoreResult<()> {
        self.select_device()?;
        let start_addr = start_addr + self.access_offset;
        if self.image_size > 0
            && !buffer.is_empty()
            && start_addr + buffer.len() - 1 > self.image_size
        {
            return Err(CoreError::OutOfBounds(
                "read exceeds storage size".to_string(),
            ));
        }

        let block_size = self.page_size;
        let mut offset = 0;
        while offset < buffer.len() {
            let end = (offset + block_size).min(buffer.len());
            let (high, low) = Self::split_address(start_addr + offset);
            self.controller
                .checked_get(VendorRequest::SpiPages, high, low, &mut buffer[offset..end])?;
            offset = end;
        }
        Ok(())
    }
}

impl<A: VendorAccess> StorageWriteFullOverwrite for ArcticFlashStorage<A> {
    fn write_storage(&mut self, buffer: &[u8]) -> CoreResult<()> {
        if self.image_size > 0
            && !buffer.is_empty()
            && self.access_offset + buffer.len() - 1 > self.image_size
        {
            return Err(CoreError::OutOfBounds(
                "write exceeds storage size".to_string(),
            ));
        }
        if self.sector_size == 0 {
            return Err(CoreError::InvalidValue(
                "this memory is configured read-only".to_string(),
            ));
        }
        self.select_device()?;

        // erase first; a failure on the very first sector leaves the old
        // data intact
        let mut sector = 0usize;
        while sector < buffer.len() {
            if let Err(e) = self.erase_sector(sector + self.access_offset) {
                if sector == 0 {
                    error!("erase failed on the first sector");
                    return Err(e);
                }
                error!(sector, "erase failed after the first sector");
                return Err(CoreError::Runtime(
                    "erase failed, some sectors erased".to_string(),
                ));
            }
            sector += self.sector_size;
        }

        let mut error_count = 0usize;
        let mut offset = 0usize;
        while offset < buffer.len() {
            let end = (offset + self.page_size).min(buffer.len());
            let (high, low) = Self::split_address(offset + self.access_offset);
            match self
                .controller
                .checked_set(VendorRequest::SpiPages, high, low, &buffer[offset..end])
            {
                Ok(()) => offset = end,
                Err(e) => {
                    error_count += 1;
                    if error_count > offset / RETRY_FAIL_RATIO {
                        error!(
                            errors = error_count,
                            bytes = offset,
                            "write failed, giving up with partial data written"
                        );
                        return Err(e);
                    }
                    debug!(error = %e, page_offset = offset, "page write failed, retrying");
                }
            }
        }
        Ok(())
    }
}
