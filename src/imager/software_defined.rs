// SPDX-License-Identifier: GPL-3.0-only

//! Software-defined imager
//!
//! First-generation devices carry no configuration of their own: the host
//! composes the full register image for every use case (region of interest,
//! per-sequence-entry exposure, phase and PLL settings) and transfers it
//! before capturing.

use crate::errors::{CoreError, CoreResult};
use crate::imager::{
    CFG_FLAG_CONFIG_CHANGED, CFG_FLAG_USE_CASE_CHANGED, Imager, ImagerCore, ImagerState,
    ReconfigRegisters, exposure_register_value,
};
use crate::pseudodata::{ImagerFamily, PseudoDataInterpreter};
use crate::registers::{RegisterAccess, RegisterIo, TimedRegisterEntry, TimedRegisterList};
use crate::usecase::{PhaseDefinition, SequenceLimits, UseCaseDefinition, VerificationStatus};
use std::time::Duration;
use tracing::info;

/// Register addresses of the Aura100 family
mod regs {
    /// Design step, for probing the silicon revision
    pub const DESIGN_STEP: u16 = 0xA0A5;
    /// Four consecutive fuse registers holding the device serial
    pub const EFUSE_SERIAL: u16 = 0xA0A1;
    /// Region of interest: first/last column, first/last row
    pub const ROI_CMIN: u16 = 0xA001;
    pub const ROI_CMAX: u16 = 0xA002;
    pub const ROI_RMIN: u16 = 0xA003;
    pub const ROI_RMAX: u16 = 0xA004;
    /// Sequencer run control: 1 starts the measurement, 0 stops it
    pub const MODE_START: u16 = 0x9400;
    /// Routes the capture start to the external trigger GPIO
    pub const TRIGGER_MUX: u16 = 0xA00F;
    /// Number of active sequence entries minus one
    pub const SEQUENCE_LENGTH: u16 = 0x9083;
}

/// Expected design-step value of supported silicon
const SUPPORTED_DESIGN_STEP: u16 = 0x0A12;

/// Per-sequence-entry register block: exposure, frame time, phase, PLL
const SEQ_ENTRY_STRIDE: u16 = 4;

/// Safe-reconfiguration registers of the Aura100
pub const AURA100_RECONFIG: ReconfigRegisters = ReconfigRegisters {
    cfgcnt_flags: 0x9080,
    cfgcnt_counter: 0x9081,
    expo_time_base: 0x9000,
    expo_time_stride: SEQ_ENTRY_STRIDE,
    frame_rate: 0x9082,
    sequence_entries: 32,
};

/// Capture limits of the Aura100
pub const AURA100_LIMITS: SequenceLimits = SequenceLimits {
    max_raw_frames: 32,
    max_width: 352,
    max_height: 287,
    min_modulation_frequency: 30_000_000,
    max_modulation_frequency: 100_000_000,
    max_target_rate: 45.0,
    supports_grayscale: true,
};

/// Host-configured imager of the Aura100 family
pub struct SoftwareDefinedImager<B> {
    core: ImagerCore<B>,
    /// Base configuration transferred during initialization (clock setup,
    /// firmware patches); module-specific
    base_config: TimedRegisterList,
    limits: SequenceLimits,
    executing: Option<UseCaseDefinition>,
}

impl<B: RegisterIo> SoftwareDefinedImager<B> {
    pub fn new(access: RegisterAccess<B>, base_config: TimedRegisterList) -> Self {
        Self {
            core: ImagerCore::new(access, ImagerFamily::Aura100, AURA100_RECONFIG, false),
            base_config,
            limits: AURA100_LIMITS,
            executing: None,
        }
    }

    pub fn core_mut(&mut self) -> &mut ImagerCore<B> {
        &mut self.core
    }

    /// Phase-select register value of a sequence entry
    fn phase_select(set_phase: PhaseDefinition, phase_index: usize) -> u16 {
        match set_phase {
            // grayscale entries disable the modulation
            PhaseDefinition::Grayscale => 0x0008,
            PhaseDefinition::Modulated4PhaseCw => phase_index as u16,
        }
    }

    /// Compose the register image of a use case
    fn use_case_register_list(&self, use_case: &UseCaseDefinition) -> TimedRegisterList {
        let mut list = TimedRegisterList::new();

        list.push(TimedRegisterEntry::new(regs::ROI_CMIN, 0));
        list.push(TimedRegisterEntry::new(regs::ROI_CMAX, use_case.width - 1));
        list.push(TimedRegisterEntry::new(regs::ROI_RMIN, 0));
        list.push(TimedRegisterEntry::new(regs::ROI_RMAX, use_case.height - 1));

        let raw_frame_count = use_case.raw_frame_count() as u16;
        list.push(TimedRegisterEntry::new(
            regs::SEQUENCE_LENGTH,
            raw_frame_count - 1,
        ));
        list.push(TimedRegisterEntry::new(
            self.core.regs().frame_rate,
            frame_rate_register_value(use_case.target_rate),
        ));

        // per-entry frame time, phase and PLL settings; exposures are
        // written separately so the shadow tracks them for reconfiguration
        let frame_time = frame_time_register_value(use_case.target_rate, raw_frame_count);
        let mut sequence_index: u16 = 0;
        for set in &use_case.raw_frame_sets {
            for phase_index in 0..set.raw_frame_count() {
                let base =
                    self.core.regs().expo_time_base + sequence_index * SEQ_ENTRY_STRIDE;
                list.push(TimedRegisterEntry::new(base + 1, frame_time));
                list.push(TimedRegisterEntry::new(
                    base + 2,
                    Self::phase_select(set.phase_definition, phase_index),
                ));
                list.push(TimedRegisterEntry::new(
                    base + 3,
                    (set.modulation_frequency / 1_000_000) as u16,
                ));
                sequence_index += 1;
            }
        }
        list
    }
}

/// Frame rate register counts in units of 100 us per sequence
fn frame_rate_register_value(target_rate: f64) -> u16 {
    (10_000.0 / target_rate) as u16
}

/// Per-frame share of the sequence period, in the same 100 us units
fn frame_time_register_value(target_rate: f64, raw_frame_count: u16) -> u16 {
    (10_000.0 / target_rate / f64::from(raw_frame_count)) as u16
}

impl<B: RegisterIo> Imager for SoftwareDefinedImager<B> {
    fn initialize(&mut self) -> CoreResult<()> {
        self.core.require_state(ImagerState::Virgin)?;

        // reset pulse, then give the device time to boot
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

        let base_config = self.base_config.clone();
        self.core.access.transfer_timed_register_list(&base_config)?;
        self.core.set_state(ImagerState::Ready);
        info!(design_step = format!("{design_step:#06x}"), "imager initialized");
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
        // stays virgin; initialize() reloads the configuration
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

        let list = self.use_case_register_list(use_case);
        self.core.access.transfer_timed_register_list(&list)?;

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
        info!(use_case = %use_case.name, "use case executed");
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
            self.core.access.write(regs::MODE_START, 1)?;
        }
        self.core.set_state(ImagerState::Capturing);
        Ok(())
    }

    fn stop_capture(&mut self) -> CoreResult<()> {
        self.core.require_state(ImagerState::Capturing)?;
        self.core.access.write(regs::MODE_START, 0)?;
        // the sequencer finishes the current raw frame before stopping
        self.core.access.poll_until(
            regs::MODE_START,
            0,
            Duration::ZERO,
            Duration::from_millis(1),
        )?;
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
        let value = frame_rate_register_value(f64::from(frame_rate));
        let address = self.core.regs().frame_rate;
        self.core
            .safe_reconfigure(&[(address, value)], CFG_FLAG_USE_CASE_CHANGED)
    }

    fn measurement_block_sizes(&self) -> Vec<usize> {
        // this family transfers every raw frame individually
        self.executing
            .as_ref()
            .map(|ucd| vec![1; ucd.raw_frame_count()])
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
