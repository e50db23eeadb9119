// SPDX-License-Identifier: GPL-3.0-only

//! On-flash data formats
//!
//! Two format families are in the field. The legacy format keeps a small
//! header at a fixed offset from the end of the flash, pointing at the
//! calibration blob. The Zwetschge format is structured: a table of contents
//! references CRC-checked blocks for the calibration data, the imager
//! register maps and the use-case list, which together configure a
//! flash-defined module.

use crate::config::StorageConfig;
use crate::errors::{CoreError, CoreResult};
use crate::registers::{TimedRegisterEntry, TimedRegisterList};
use crate::storage::{MemoryStorage, StorageReadRandom, StorageWriteSectorBased};
use crate::usecase::UseCaseIdentifier;
use crc::crc32;
use tracing::{info, warn};

/// CRC32 with the standard polynomial, as stored alongside every block
pub fn checksum(data: &[u8]) -> u32 {
    crc32::checksum_ieee(data)
}

/// Render a serial number in the customary grouped decimal form
pub fn render_serial(serial: u32) -> String {
    let digits = format!("{serial:016}");
    format!(
        "{}-{}-{}-{}-{}-{}",
        &digits[0..4],
        &digits[4..6],
        &digits[6..8],
        &digits[8..12],
        &digits[12..14],
        &digits[14..16]
    )
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_u24_le(bytes: &[u8]) -> u32 {
    u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16)
}

fn read_u16_le(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

fn push_u24_le(buffer: &mut Vec<u8>, value: u32) {
    buffer.push(value as u8);
    buffer.push((value >> 8) as u8);
    buffer.push((value >> 16) as u8);
}

// ---------------------------------------------------------------------------
// Legacy format
// ---------------------------------------------------------------------------

/// Magic bytes opening the legacy trailing header
pub const PICO_LEGACY_MAGIC: &[u8; 6] = b"PMDTEC";

/// Size of the legacy header: magic, padding and five 32-bit fields
const PICO_HEADER_SIZE: usize = 28;

/// Header version written by this implementation
const PICO_HEADER_VERSION: u32 = 100;

/// Parsed legacy header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PicoLegacyHeader {
    pub header_version: u32,
    pub serial_number: u32,
    pub hardware_revision: u32,
    pub calibration_address: u32,
    pub calibration_size: u32,
}

/// Legacy-format storage: header at a fixed offset from the end of flash
pub struct StorageFormatPicoLegacy<S> {
    storage: S,
    image_size: usize,
}

impl<S: StorageReadRandom> StorageFormatPicoLegacy<S> {
    pub fn new(storage: S, image_size: usize) -> CoreResult<Self> {
        if image_size < PICO_HEADER_SIZE {
            return Err(CoreError::InvalidValue(
                "image too small for the trailing header".to_string(),
            ));
        }
        Ok(Self {
            storage,
            image_size,
        })
    }

    pub fn read_header(&mut self) -> CoreResult<PicoLegacyHeader> {
        let mut raw = [0u8; PICO_HEADER_SIZE];
        self.storage
            .read_storage(self.image_size - PICO_HEADER_SIZE, &mut raw)?;

        if &raw[0..6] != PICO_LEGACY_MAGIC {
            return Err(CoreError::Runtime(
                "no calibration header found in flash".to_string(),
            ));
        }
        Ok(PicoLegacyHeader {
            header_version: read_u32_le(&raw[8..]),
            serial_number: read_u32_le(&raw[12..]),
            hardware_revision: read_u32_le(&raw[16..]),
            calibration_address: read_u32_le(&raw[20..]),
            calibration_size: read_u32_le(&raw[24..]),
        })
    }

    pub fn calibration_data(&mut self) -> CoreResult<Vec<u8>> {
        let header = self.read_header()?;
        let address = header.calibration_address as usize;
        let size = header.calibration_size as usize;
        if address + size > self.image_size {
            return Err(CoreError::OutOfBounds(
                "calibration block exceeds the image".to_string(),
            ));
        }
        let mut data = vec![0u8; size];
        self.storage.read_storage(address, &mut data)?;
        Ok(data)
    }

    /// The module identifier is the hardware revision, as stored
    /// (little-endian byte order)
    pub fn module_identifier(&mut self) -> CoreResult<[u8; 4]> {
        let header = self.read_header()?;
        Ok(header.hardware_revision.to_le_bytes())
    }

    pub fn module_serial(&mut self) -> CoreResult<String> {
        let header = self.read_header()?;
        Ok(render_serial(header.serial_number))
    }
}

impl<S: StorageReadRandom + StorageWriteSectorBased> StorageFormatPicoLegacy<S> {
    /// Replace the calibration blob, rebuilding the trailing header.
    ///
    /// Serial number and hardware revision are preserved from the existing
    /// header when one is present.
    pub fn write_calibration_data(&mut self, calibration: &[u8]) -> CoreResult<()> {
        let (serial_number, hardware_revision) = match self.read_header() {
            Ok(header) => (header.serial_number, header.hardware_revision),
            Err(_) => (0, 0),
        };

        let region_size = calibration.len() + PICO_HEADER_SIZE;
        if region_size > self.image_size {
            return Err(CoreError::OutOfBounds(
                "calibration does not fit the image".to_string(),
            ));
        }
        let region_start = self.image_size - region_size;
        let calibration_address = region_start as u32;

        let mut image = Vec::with_capacity(region_size);
        image.extend_from_slice(calibration);
        image.extend_from_slice(PICO_LEGACY_MAGIC);
        image.extend_from_slice(&[0u8; 2]);
        image.extend_from_slice(&PICO_HEADER_VERSION.to_le_bytes());
        image.extend_from_slice(&serial_number.to_le_bytes());
        image.extend_from_slice(&hardware_revision.to_le_bytes());
        image.extend_from_slice(&calibration_address.to_le_bytes());
        image.extend_from_slice(&(calibration.len() as u32).to_le_bytes());

        // writes are sector granular; preserve the bytes between the sector
        // boundary and the region start
        let sector_size = self.storage.sector_size();
        if sector_size == 0 {
            return Err(CoreError::InvalidValue(
                "storage reports no erase sectors".to_string(),
            ));
        }
        let sector_start = region_start - region_start % sector_size;
        let mut full = vec![0u8; region_start - sector_start];
        self.storage.read_storage(sector_start, &mut full)?;
        full.extend_from_slice(&image);

        info!(
            bytes = calibration.len(),
            address = calibration_address,
            "writing calibration"
        );
        self.storage.write_sector_based(sector_start, &full)
    }
}

// ---------------------------------------------------------------------------
// Zwetschge format
// ---------------------------------------------------------------------------

/// Magic bytes opening a Zwetschge image
pub const ZWETSCHGE_MAGIC: &[u8; 9] = b"ZWETSCHGE";

/// Format version understood by this reader
const ZWETSCHGE_VERSION: u8 = 1;

/// Image header: magic, version byte, 24-bit table-of-contents offset
const ZWETSCHGE_HEADER_SIZE: usize = 13;

/// Entries of the table of contents, in storage order
const TOC_ENTRY_COUNT: usize = 3;

/// One table-of-contents reference: 24-bit address, 24-bit size and the
/// CRC32 of the referenced block's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TocEntry {
    pub address: u32,
    pub size: u32,
    pub crc: u32,
}

/// Parsed table of contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOfContents {
    pub module_identifier: [u8; 16],
    pub serial_number: u32,
    pub calibration: TocEntry,
    pub register_maps: TocEntry,
    pub use_case_list: TocEntry,
}

impl TableOfContents {
    pub fn serial(&self) -> String {
        render_serial(self.serial_number)
    }
}

/// Register maps a flash-defined imager needs beyond its use cases
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImagerRegisterMaps {
    pub init: TimedRegisterList,
    pub start: TimedRegisterList,
    pub stop: TimedRegisterList,
}

/// One use case as referenced from flash
#[derive(Debug, Clone, PartialEq)]
pub struct FlashUseCase {
    pub identifier: UseCaseIdentifier,
    pub name: String,
    pub width: u16,
    pub height: u16,
    /// Start of this use case's register data in flash
    pub flash_address: u32,
    /// Size of the register data in bytes
    pub flash_size: u32,
}

/// Everything the module factory needs from a Zwetschge image, calibration
/// excluded (reading that is deferred because it is large)
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalConfig {
    pub module_identifier: [u8; 16],
    pub serial: String,
    pub register_maps: ImagerRegisterMaps,
    pub use_cases: Vec<FlashUseCase>,
}

/// Zwetschge image reader over any random-access storage
pub struct ZwetschgeReader<S> {
    storage: S,
    config: StorageConfig,
}

impl<S: StorageReadRandom> ZwetschgeReader<S> {
    pub fn new(storage: S, config: StorageConfig) -> Self {
        Self { storage, config }
    }

    pub fn table_of_contents(&mut self) -> CoreResult<TableOfContents> {
        let mut header = [0u8; ZWETSCHGE_HEADER_SIZE];
        self.storage.read_storage(0, &mut header)?;
        if &header[0..9] != ZWETSCHGE_MAGIC {
            return Err(CoreError::Runtime(
                "flash does not hold a Zwetschge image".to_string(),
            ));
        }
        if header[9] != ZWETSCHGE_VERSION {
            return Err(CoreError::NotImplemented(format!(
                "Zwetschge format version {} is not supported",
                header[9]
            )));
        }
        let toc_offset = read_u24_le(&header[10..]) as usize;

        let mut raw = vec![0u8; 16 + 4 + TOC_ENTRY_COUNT * 10];
        self.storage.read_storage(toc_offset, &mut raw)?;

        let mut module_identifier = [0u8; 16];
        module_identifier.copy_from_slice(&raw[0..16]);
        let serial_number = read_u32_le(&raw[16..]);

        let entry = |raw: &[u8], index: usize| {
            let base = 20 + index * 10;
            TocEntry {
                address: read_u24_le(&raw[base..]),
                size: read_u24_le(&raw[base + 3..]),
                crc: read_u32_le(&raw[base + 6..]),
            }
        };

        Ok(TableOfContents {
            module_identifier,
            serial_number,
            calibration: entry(&raw, 0),
            register_maps: entry(&raw, 1),
            use_case_list: entry(&raw, 2),
        })
    }

    /// Read a referenced block and verify both its length prefix and its
    /// checksum against the table of contents
    fn read_block(&mut self, entry: &TocEntry) -> CoreResult<Vec<u8>> {
        let mut prefix = [0u8; 4];
        self.storage.read_storage(entry.address as usize, &mut prefix)?;
        let payload_len = read_u32_le(&prefix) as usize;
        if payload_len != entry.size as usize {
            return Err(CoreError::Runtime(format!(
                "block length {} does not match the table of contents ({})",
                payload_len, entry.size
            )));
        }

        let mut payload = vec![0u8; payload_len + 4];
        self.storage
            .read_storage(entry.address as usize + 4, &mut payload)?;
        let stored_crc = read_u32_le(&payload[payload_len..]);
        payload.truncate(payload_len);

        let computed = checksum(&payload);
        if computed != stored_crc || computed != entry.crc {
            return Err(CoreError::Runtime(format!(
                "block checksum mismatch: computed {computed:#010x}, stored {stored_crc:#010x}"
            )));
        }
        Ok(payload)
    }

    /// Read the calibration blob.
    ///
    /// A zero CRC in the table of contents marks a miswritten flash; when
    /// the filesystem fallback is enabled, `<serial>.zwetschge` in the
    /// configured directory is consulted instead.
    pub fn calibration_data(&mut self) -> CoreResult<Vec<u8>> {
        let toc = self.table_of_contents()?;
        if toc.calibration.crc == 0 {
            return self.calibration_from_fallback(&toc);
        }
        self.read_block(&toc.calibration)
    }

    fn calibration_from_fallback(&mut self, toc: &TableOfContents) -> CoreResult<Vec<u8>> {
        if !self.config.filesystem_fallback {
            return Err(CoreError::Runtime(
                "calibration checksum is zero and the filesystem fallback is disabled".to_string(),
            ));
        }
        let filename = self
            .config
            .fallback_dir
            .join(format!("{}.zwetschge", toc.serial()));
        warn!(file = %filename.display(), "calibration checksum is zero, trying filesystem fallback");

        let bytes = std::fs::read(&filename)
            .map_err(|_| CoreError::ImagerConfigNotFound {
                filename: filename.clone(),
            })?;
        let mut fallback = ZwetschgeReader::new(
            MemoryStorage::new(bytes),
            StorageConfig {
                filesystem_fallback: false,
                ..self.config.clone()
            },
        );
        fallback.calibration_data()
    }

    pub fn register_maps(&mut self) -> CoreResult<ImagerRegisterMaps> {
        let toc = self.table_of_contents()?;
        let payload = self.read_block(&toc.register_maps)?;
        let mut offset = 0usize;
        let mut parse_list = || -> CoreResult<TimedRegisterList> {
            if offset + 2 > payload.len() {
                return Err(CoreError::Runtime(
                    "truncated register map table".to_string(),
                ));
            }
            let count = read_u16_le(&payload[offset..]) as usize;
            offset += 2;
            let mut list = Vec::with_capacity(count);
            for _ in 0..count {
                if offset + 8 > payload.len() {
                    return Err(CoreError::Runtime(
                        "truncated register map table".to_string(),
                    ));
                }
                list.push(TimedRegisterEntry {
                    address: read_u16_le(&payload[offset..]),
                    value: read_u16_le(&payload[offset + 2..]),
                    sleep_micros: read_u32_le(&payload[offset + 4..]),
                });
                offset += 8;
            }
            Ok(list)
        };

        Ok(ImagerRegisterMaps {
            init: parse_list()?,
            start: parse_list()?,
            stop: parse_list()?,
        })
    }

    pub fn use_case_list(&mut self) -> CoreResult<Vec<FlashUseCase>> {
        let toc = self.table_of_contents()?;
        let payload = self.read_block(&toc.use_case_list)?;
        if payload.len() < 2 {
            return Err(CoreError::Runtime("truncated use-case list".to_string()));
        }
        let count = read_u16_le(&payload[0..]) as usize;
        let mut offset = 2usize;
        let mut use_cases = Vec::with_capacity(count);
        for _ in 0..count {
            if offset + 27 > payload.len() {
                return Err(CoreError::Runtime("truncated use-case list".to_string()));
            }
            let mut id = [0u8; 16];
            id.copy_from_slice(&payload[offset..offset + 16]);
            let width = read_u16_le(&payload[offset + 16..]);
            let height = read_u16_le(&payload[offset + 18..]);
            let flash_address = read_u24_le(&payload[offset + 20..]);
            let flash_size = read_u24_le(&payload[offset + 23..]);
            let name_len = payload[offset + 26] as usize;
            offset += 27;
            if offset + name_len > payload.len() {
                return Err(CoreError::Runtime("truncated use-case list".to_string()));
            }
            let name = String::from_utf8_lossy(&payload[offset..offset + name_len]).into_owned();
            offset += name_len;

            use_cases.push(FlashUseCase {
                identifier: UseCaseIdentifier::new(id),
                name,
                width,
                height,
                flash_address,
                flash_size,
            });
        }
        Ok(use_cases)
    }

    /// The parts of the image the module factory needs up front; the
    /// calibration read stays deferred
    pub fn read_external_config(&mut self) -> CoreResult<ExternalConfig> {
        let toc = self.table_of_contents()?;
        Ok(ExternalConfig {
            module_identifier: toc.module_identifier,
            serial: toc.serial(),
            register_maps: self.register_maps()?,
            use_cases: self.use_case_list()?,
        })
    }
}

/// Builder assembling a Zwetschge image in memory.
///
/// Flash provisioning tools use this; the capture core itself only reads.
#[derive(Debug, Default)]
pub struct ZwetschgeImageBuilder {
    pub module_identifier: [u8; 16],
    pub serial_number: u32,
    pub calibration: Vec<u8>,
    /// Write a zero CRC for the calibration entry, simulating a miswritten
    /// flash
    pub zero_calibration_crc: bool,
    pub register_maps: ImagerRegisterMaps,
    pub use_cases: Vec<FlashUseCase>,
    /// Raw register words placed at each use case's flash address
    pub use_case_payloads: Vec<Vec<u8>>,
}

impl ZwetschgeImageBuilder {
    fn encode_register_maps(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        for list in [
            &self.register_maps.init,
            &self.register_maps.start,
            &self.register_maps.stop,
        ] {
            payload.extend_from_slice(&(list.len() as u16).to_le_bytes());
            for entry in list {
                payload.extend_from_slice(&entry.address.to_le_bytes());
                payload.extend_from_slice(&entry.value.to_le_bytes());
                payload.extend_from_slice(&entry.sleep_micros.to_le_bytes());
            }
        }
        payload
    }

    fn encode_use_case_list(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(self.use_cases.len() as u16).to_le_bytes());
        for use_case in &self.use_cases {
            payload.extend_from_slice(use_case.identifier.data());
            payload.extend_from_slice(&use_case.width.to_le_bytes());
            payload.extend_from_slice(&use_case.height.to_le_bytes());
            push_u24_le(&mut payload, use_case.flash_address);
            push_u24_le(&mut payload, use_case.flash_size);
            payload.push(use_case.name.len() as u8);
            payload.extend_from_slice(use_case.name.as_bytes());
        }
        payload
    }

    fn append_block(image: &mut Vec<u8>, payload: &[u8]) -> TocEntry {
        let address = image.len() as u32;
        let crc = checksum(payload);
        image.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        image.extend_from_slice(payload);
        image.extend_from_slice(&crc.to_le_bytes());
        TocEntry {
            address,
            size: payload.len() as u32,
            crc,
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let toc_offset = ZWETSCHGE_HEADER_SIZE as u32;
        let toc_size = 16 + 4 + TOC_ENTRY_COUNT * 10;

        let mut image = Vec::new();
        image.extend_from_slice(ZWETSCHGE_MAGIC);
        image.push(ZWETSCHGE_VERSION);
        push_u24_le(&mut image, toc_offset);
        image.resize(ZWETSCHGE_HEADER_SIZE + toc_size, 0);

        let mut calibration_entry = Self::append_block(&mut image, &self.calibration);
        if self.zero_calibration_crc {
            calibration_entry.crc = 0;
        }
        let register_maps_entry = Self::append_block(&mut image, &self.encode_register_maps());
        let use_case_entry = Self::append_block(&mut image, &self.encode_use_case_list());

        for (use_case, payload) in self.use_cases.iter().zip(&self.use_case_payloads) {
            let address = use_case.flash_address as usize;
            if image.len() < address + payload.len() {
                image.resize(address + payload.len(), 0xFF);
            }
            image[address..address + payload.len()].copy_from_slice(payload);
        }

        // back-fill the table of contents
        let mut toc = Vec::with_capacity(toc_size);
        toc.extend_from_slice(&self.module_identifier);
        toc.extend_from_slice(&self.serial_number.to_le_bytes());
        for entry in [&calibration_entry, &register_maps_entry, &use_case_entry] {
            push_u24_le(&mut toc, entry.address);
            push_u24_le(&mut toc, entry.size);
            toc.extend_from_slice(&entry.crc.to_le_bytes());
        }
        let toc_offset = toc_offset as usize;
        image[toc_offset..toc_offset + toc_size].copy_from_slice(&toc);
        image
    }
}
