// SPDX-License-Identifier: GPL-3.0-only

//! Flash-defined imager
//!
//! Second-generation devices keep their use-case register sets in the
//! external flash, keyed by use-case identifier. Executing a use case
//! instructs the iSM to copy the register data from flash into the
//! configuration container over the SPI gateway; the host then overwrites
//! the exposure registers with the currently configured values.

use crate::errors::{CoreError, CoreResult};
use crate::imager::{
    CFG_FLAG_CONFIG_CHANGED, CFG_FLAG_USE_CASE_CHANGED, Imager, ImagerCore, ImagerState,
    ReconfigRegisters,
};
use crate::pseudodata::{ImagerFamily, PseudoDataInterpreter};
use crate::registers::{RegisterAccess, RegisterIo};
use crate::storage::formats::{ExternalConfig, FlashUseCase};
use crate::storage::spi_gateway::{
    GatewayRegisters, POLLING_INTERVAL, SPI_CLOCK_DIV_8, SPI_DONE, SPI_ENABLE, SPI_LEN_FLAGS,
    SPI_TRIGGER, TIME_BLOCK_TRANSFER,
};
use crate::usecase::{SequenceLimits, UseCaseDefinition, VerificationStatus};
use std::time::Duration;
use tracing::info;

/// Register addresses of the Aura200 family
mod regs {
    pub const DESIGN_STEP: u16 = 0xA0A4;
    /// Four consecutive fuse registers holding the device serial
    pub const EFUSE_SERIAL: u16 = 0xA0A6;
    /// Routes the capture start to the external trigger GPIO
    pub const TRIGGER_MUX: u16 = 0xB00F;
}

/// Expected design-step value of supported silicon
const SUPPORTED_DESIGN_STEP: u16 = 0x0B12;

/// One gateway transfer moves at most this many 16-bit registers
const MAX_TRANSFER_REGISTERS: usize = 128;

const REGISTER_SIZE: usize = 2;

/// Safe-reconfiguration registers of the Aura200; the per-sequence entries
/// live in the configuration container the gateway writes into
pub const AURA200_RECONFIG: ReconfigRegisters = ReconfigRegisters {
    cfgcnt_flags: 0x91E0,
    cfgcnt_counter: 0x91E1,
    expo_time_base: 0x9100,
    expo_time_stride: 4,
    frame_rate: 0x91E2,
    sequence_entries: 32,
};

/// Capture limits of the Aura200
pub const AURA200_LIMITS: SequenceLimits = SequenceLimits {
    max_raw_frames: 32,
    max_width: 448,
    max_height: 343,
    min_modulation_frequency: 30_000_000,
    max_modulation_frequency: 100_000_000,
    max_target_rate: 60.0,
    supports_grayscale: true,
};

/// Flash-configured imager of the Aura200 family
pub struct FlashDefinedImager<B> {
    core: ImagerCore<B>,
    gateway: GatewayRegisters,
    external_config: ExternalConfig,
    limits: SequenceLimits,
    executing: Option<UseCaseDefinition>,
}

impl<B: RegisterIo> FlashDefinedImager<B> {
    pub fn new(
        access: RegisterAccess<B>,
        gateway: GatewayRegisters,
        external_config: ExternalConfig,
        uses_current_monitor: bool,
    ) -> Self {
        Self {
            core: ImagerCore::new(
                access,
                ImagerFamily::Aura200,
                AURA200_RECONFIG,
                uses_current_monitor,
            ),
            gateway,
            external_config,
            limits: AURA200_LIMITS,
            executing: None,
        }
    }

    pub fn core_mut(&mut self) -> &mut ImagerCore<B> {
        &mut self.core
    }

    fn find_use_case(&self, use_case: &UseCaseDefinition) -> Option<&FlashUseCase> {
        self.external_config
            .use_cases
            .iter()
            .find(|entry| entry.identifier == use_case.identifier)
    }

    /// Copy one use case's register data from flash into the configuration
    /// container, in gateway-sized blocks
    fn flash_to_imager_transfer(&mut self, entry: &FlashUseCase) -> CoreResult<()> {
        if entry.flash_size as usize % REGISTER_SIZE != 0 {
            return Err(CoreError::Logic(
                "flash data size is not a multiple of the register size".to_string(),
            ));
        }
        let register_count = entry.flash_size as usize / REGISTER_SIZE;
        if register_count > usize::from(u16::MAX) {
            return Err(CoreError::InvalidValue(
                "use case register data exceeds the container".to_string(),
            ));
        }

        let mut offset = 0usize;
        while offset < register_count {
            let block = (register_count - offset).min(MAX_TRANSFER_REGISTERS);
            self.flash_to_imager_block_transfer(
                entry.flash_address + (offset * REGISTER_SIZE) as u32,
                offset as u16,
                block,
            )?;
            offset += block;
        }
        Ok(())
    }

    /// One gateway block: stage the flash read command in pixel memory,
    /// point the receive side at the container, trigger, poll
    fn flash_to_imager_block_transfer(
        &mut self,
        flash_address: u32,
        container_offset: u16,
        payload_registers: usize,
    ) -> CoreResult<()> {
        // spi_len counts bytes minus one: command and address words plus
        // the payload
        let spi_len = ((payload_registers << 1) + 3) as u16;
        let gw = self.gateway;
        let access = &mut self.core.access;

        access.write(gw.spi_cfg, SPI_ENABLE | SPI_CLOCK_DIV_8)?;

        // stage the flash READ command and 24-bit address in pixel memory
        access.write(gw.spi_wr_addr, gw.pix_mem)?;
        access.write(gw.pix_mem, (0x03 << 8) | (flash_address >> 16) as u16)?;
        access.write(gw.pix_mem + 1, flash_address as u16)?;

        // received data goes to the configuration container
        access.write(gw.spi_rd_addr, gw.cfg_cnt + container_offset)?;
        access.write(gw.spi_len, SPI_LEN_FLAGS | spi_len)?;

        access.write(gw.spi_trig, SPI_TRIGGER)?;
        access.poll_until(gw.spi_status, SPI_DONE, TIME_BLOCK_TRANSFER, POLLING_INTERVAL)
    }

    fn transfer_named_map(&mut self, which: MapKind) -> CoreResult<()> {
        let map = match which {
            MapKind::Init => self.external_config.register_maps.init.clone(),
            MapKind::Start => self.external_config.register_maps.start.clone(),
            MapKind::Stop => self.external_config.register_maps.stop.clone(),
        };
        self.core.access.transfer_timed_register_list(&map)
    }
}

#[derive(Clone, Copy)]
enum MapKind {
    Init,
    Start,
    Stop,
}

impl<B: RegisterIo> Imager for FlashDefinedImager<B> {
    fn initialize(&mut self) -> CoreResult<()> {
        self.core.require_state(ImagerState::Virgin)?;

        self.core.access.bridge_mut().set_imager_reset(true)?;
        self.core.access.sleep_for(Duration::from_micros(100));
        self.core.access.bridge_mut().set_imager_reset(false)?;
        self.core.access.sleep_for(Duration::from_millis(1));

        let design_step = self.core.access.read(regs::DESIGN_STEP)?;
        if design_step != SUPPORTED_DESIGN_STEP {
            return Err(CoreError::CouldNotOpen(format!(
                "unsupported design step {design_step:#06x}"
            )));
        }

        self.transfer_named_map(MapKind::Init)?;
        self.core.set_state(ImagerState::Ready);
        info!(
            serial = %self.external_config.serial,
            use_cases = self.external_config.use_cases.len(),
            "flash-defined imager initialized"
        );
        Ok(())
    }

    fn sleep(&mut self) -> CoreResult<()> {
        if self.core.state() == ImagerState::Capturing {
            self.stop_capture()?;
        }
        self.core.access.bridge_mut().set_imager_reset(true)?;
        self.core.shadow.invalidate_all();
        self.executing = None;
        self.core.set_state(ImagerState::Virgin);
        Ok(())
    }

    fn wake(&mut self) -> CoreResult<()> {
        self.core.require_state(ImagerState::Virgin)?;
        self.core.access.bridge_mut().set_imager_reset(false)?;
        Ok(())
    }

    fn state(&self) -> ImagerState {
        self.core.state()
    }

    fn serial_number(&mut self) -> CoreResult<String> {
        if self.core.state() == ImagerState::Virgin {
            return Err(CoreError::WrongState(
                "serial number requires an initialized imager".to_string(),
            ));
        }
        let addresses: Vec<u16> = (0..4).map(|i| regs::EFUSE_SERIAL + i).collect();
        let mut values = [0u16; 4];
        self.core.access.read_registers(&addresses, &mut values)?;
        Ok(format!(
            "{:04x}-{:04x}-{:04x}-{:04x}",
            values[0], values[1], values[2], values[3]
        ))
    }

    fn verify_use_case(&self, use_case: &UseCaseDefinition) -> VerificationStatus {
        let status = use_case.verify(&self.limits);
        if status != VerificationStatus::Success {
            return status;
        }
        let Some(entry) = self.find_use_case(use_case) else {
            return VerificationStatus::Undefined;
        };
        if entry.width != use_case.width || entry.height != use_case.height {
            return VerificationStatus::Region;
        }
        if use_case.width < self.core.interpreter().required_image_width() {
            return VerificationStatus::Region;
        }
        VerificationStatus::Success
    }

    fn execute_use_case(&mut self, use_case: &UseCaseDefinition) -> CoreResult<()> {
        self.core.require_state(ImagerState::Ready)?;
        let status = self.verify_use_case(use_case);
        if status != VerificationStatus::Success {
            return Err(CoreError::InvalidValue(format!(
                "use case {} failed verification: {status:?}",
                use_case.name
            )));
        }
        let entry = self
            .find_use_case(use_case)
            .cloned()
            .ok_or_else(|| CoreError::Logic("verified use case vanished".to_string()))?;

        self.flash_to_imager_transfer(&entry)?;

        // the flash image carries provisioning-time exposures; overwrite
        // them with the configured values
        let exposure_times: Vec<u32> = use_case
            .exposure_groups
            .iter()
            .map(|g| g.exposure_time)
            .collect();
        let writes = self.core.exposure_writes(use_case, &exposure_times)?;
        for (address, value) in writes {
            self.core
                .shadow
                .track_and_write(&mut self.core.access, address, value)?;
        }

        self.core
            .set_eye_safety_gap(Duration::from_secs_f64(use_case.eye_safety_gap()));
        self.executing = Some(use_case.clone());
        info!(use_case = %use_case.name, flash_address = entry.flash_address, "use case executed");
        Ok(())
    }

    fn start_capture(&mut self) -> CoreResult<()> {
        self.core.require_state(ImagerState::Ready)?;
        if self.executing.is_none() {
            return Err(CoreError::WrongState(
                "no use case has been executed".to_string(),
            ));
        }

        self.core.wait_for_eye_safety();
        if self.core.external_trigger() {
            self.core.access.write(regs::TRIGGER_MUX, 1)?;
        } else {
            self.transfer_named_map(MapKind::Start)?;
        }
        self.core.set_state(ImagerState::Capturing);
        Ok(())
    }

    fn stop_capture(&mut self) -> CoreResult<()> {
        self.core.require_state(ImagerState::Capturing)?;
        self.transfer_named_map(MapKind::Stop)?;
        self.core.note_stop();
        self.core.set_state(ImagerState::Ready);
        Ok(())
    }

    fn reconfigure_exposure_times(&mut self, exposure_times: &[u32]) -> CoreResult<u16> {
        let use_case = self
            .executing
            .clone()
            .ok_or_else(|| CoreError::WrongState("no use case executing".to_string()))?;
        let writes = self.core.exposure_writes(&use_case, exposure_times)?;
        self.core.safe_reconfigure(&writes, CFG_FLAG_CONFIG_CHANGED)
    }

    fn reconfigure_target_frame_rate(&mut self, frame_rate: u16) -> CoreResult<u16> {
        if self.executing.is_none() {
            return Err(CoreError::WrongState("no use case executing".to_string()));
        }
        if f64::from(frame_rate) > self.limits.max_target_rate {
            return Err(CoreError::InvalidValue(format!(
                "frame rate {frame_rate} above the limit"
            )));
        }
        let address = self.core.regs().frame_rate;
        self.core
            .safe_reconfigure(&[(address, frame_rate)], CFG_FLAG_USE_CASE_CHANGED)
    }

    fn measurement_block_sizes(&self) -> Vec<usize> {
        // this family concatenates the whole sequence into one superframe
        self.executing
            .as_ref()
            .map(|ucd| vec![ucd.raw_frame_count()])
            .unwrap_or_default()
    }

    fn create_pseudodata_interpreter(&self) -> PseudoDataInterpreter {
        self.core.interpreter()
    }

    fn set_external_trigger(&mut self, enabled: bool) -> CoreResult<()> {
        if self.core.state() == ImagerState::Capturing {
            return Err(CoreError::WrongState(
                "cannot change the trigger while capturing".to_string(),
            ));
        }
        self.core.set_external_trigger(enabled);
        Ok(())
    }
}
