// SPDX-License-Identifier: GPL-3.0-only

//! Imager control
//!
//! Two sub-variants exist. Software-defined imagers get their per-frame
//! register sets composed by the host from the use case; flash-defined
//! imagers keep them in external flash, keyed by use-case identifier, and
//! copy them into the configuration container through the SPI gateway.
//!
//! Both share the lifecycle state machine, the safe-reconfiguration
//! protocol and the eye-safety gap between capture sessions.

pub mod flash_defined;
pub mod software_defined;

use crate::errors::{CoreError, CoreResult};
use crate::pseudodata::{ImagerFamily, PseudoDataInterpreter};
use crate::registers::shadow::ShadowRegisters;
use crate::registers::{RegisterAccess, RegisterIo};
use crate::usecase::{UseCaseDefinition, VerificationStatus};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Lifecycle state of the imager
///
/// Register writes beyond the vendor channel are only permitted in `Ready`
/// or `Capturing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagerState {
    /// Power-on state; nothing has been configured
    Virgin,
    /// Initialized and configured, not measuring
    Ready,
    /// Actively capturing frames
    Capturing,
}

impl fmt::Display for ImagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImagerState::Virgin => write!(f, "virgin"),
            ImagerState::Ready => write!(f, "ready"),
            ImagerState::Capturing => write!(f, "capturing"),
        }
    }
}

/// Registers driving the safe-reconfiguration protocol, per family
#[derive(Debug, Clone, Copy)]
pub struct ReconfigRegisters {
    /// Flag register: bit 0 requests a configuration change, bit 1 a
    /// use-case change. The imager clears the bits once consumed.
    pub cfgcnt_flags: u16,
    /// 12-bit counter the imager increments to acknowledge a change
    pub cfgcnt_counter: u16,
    /// First per-sequence-entry exposure register
    pub expo_time_base: u16,
    /// Address distance between consecutive sequence entries
    pub expo_time_stride: u16,
    /// Target frame rate register
    pub frame_rate: u16,
    /// Number of sequence entries in the configuration container
    pub sequence_entries: usize,
}

/// Flag bit requesting a configuration change (exposure values)
pub const CFG_FLAG_CONFIG_CHANGED: u16 = 1 << 0;
/// Flag bit requesting a use-case change (frame timing)
pub const CFG_FLAG_USE_CASE_CHANGED: u16 = 1 << 1;

/// Exposure time register value from microseconds and the modulation
/// frequency; the register counts in units of eight modulation clocks
pub fn exposure_register_value(exposure_micros: u32, modulation_frequency: u32) -> u16 {
    let clocks = u64::from(exposure_micros) * u64::from(modulation_frequency) / 1_000_000 / 8;
    clocks.min(0x3FFF) as u16
}

/// The device-independent interface of an imager
pub trait Imager {
    /// Bring the device from `Virgin` to `Ready`
    fn initialize(&mut self) -> CoreResult<()>;
    /// Power down; the device returns to `Virgin` and must be woken
    fn sleep(&mut self) -> CoreResult<()>;
    /// Wake from `sleep`; requires `Virgin` and stays there until
    /// `initialize` reloads the device
    fn wake(&mut self) -> CoreResult<()>;
    fn state(&self) -> ImagerState;
    fn serial_number(&mut self) -> CoreResult<String>;
    /// Pure verification against this imager's limits; no device I/O
    fn verify_use_case(&self, use_case: &UseCaseDefinition) -> VerificationStatus;
    /// Configure the device for a verified use case; `Ready` only
    fn execute_use_case(&mut self, use_case: &UseCaseDefinition) -> CoreResult<()>;
    /// `Ready` to `Capturing`; enforces the eye-safety gap
    fn start_capture(&mut self) -> CoreResult<()>;
    /// `Capturing` to `Ready`; safe to call after a trigger-forced stop
    fn stop_capture(&mut self) -> CoreResult<()>;
    /// Change exposure times while capturing; returns the reconfiguration
    /// counter. The first frame whose pseudodata reports the returned value
    /// was still captured with the old settings.
    fn reconfigure_exposure_times(&mut self, exposure_times: &[u32]) -> CoreResult<u16>;
    /// Change the target frame rate while capturing; counter semantics as
    /// for [`Imager::reconfigure_exposure_times`]
    fn reconfigure_target_frame_rate(&mut self, frame_rate: u16) -> CoreResult<u16>;
    /// Raw frames per delivered buffer for the executing use case
    fn measurement_block_sizes(&self) -> Vec<usize>;
    fn create_pseudodata_interpreter(&self) -> PseudoDataInterpreter;
    /// Route the capture start to the external trigger GPIO
    fn set_external_trigger(&mut self, enabled: bool) -> CoreResult<()>;
}

/// State and helpers shared by the imager variants
pub struct ImagerCore<B> {
    pub access: RegisterAccess<B>,
    pub shadow: ShadowRegisters,
    family: ImagerFamily,
    regs: ReconfigRegisters,
    state: ImagerState,
    uses_current_monitor: bool,
    external_trigger: bool,
    /// When the imager was last stopped, for the eye-safety gap before the
    /// next start
    last_stop: Option<Instant>,
    eye_safety_gap: Duration,
}

impl<B: RegisterIo> ImagerCore<B> {
    pub fn new(
        access: RegisterAccess<B>,
        family: ImagerFamily,
        regs: ReconfigRegisters,
        uses_current_monitor: bool,
    ) -> Self {
        Self {
            access,
            shadow: ShadowRegisters::new(),
            family,
            regs,
            state: ImagerState::Virgin,
            uses_current_monitor,
            external_trigger: false,
            last_stop: None,
            eye_safety_gap: Duration::ZERO,
        }
    }

    pub fn family(&self) -> ImagerFamily {
        self.family
    }

    pub fn regs(&self) -> &ReconfigRegisters {
        &self.regs
    }

    pub fn state(&self) -> ImagerState {
        self.state
    }

    pub fn set_state(&mut self, state: ImagerState) {
        debug!(from = %self.state, to = %state, "imager state transition");
        self.state = state;
    }

    pub fn require_state(&self, expected: ImagerState) -> CoreResult<()> {
        if self.state != expected {
            return Err(CoreError::WrongState(format!(
                "operation requires the {expected} state, imager is {}",
                self.state
            )));
        }
        Ok(())
    }

    pub fn external_trigger(&self) -> bool {
        self.external_trigger
    }

    pub fn set_external_trigger(&mut self, enabled: bool) {
        self.external_trigger = enabled;
    }

    pub fn interpreter(&self) -> PseudoDataInterpreter {
        PseudoDataInterpreter::new(self.family, self.uses_current_monitor)
    }

    /// Remember the eye-safety gap of the use case being executed
    pub fn set_eye_safety_gap(&mut self, gap: Duration) {
        self.eye_safety_gap = gap;
    }

    /// Record the stop time; the next start must respect the gap
    pub fn note_stop(&mut self) {
        self.last_stop = Some(Instant::now());
    }

    /// Block until the configured gap since the last stop has elapsed
    pub fn wait_for_eye_safety(&mut self) {
        if let Some(stopped) = self.last_stop {
            let elapsed = stopped.elapsed();
            if elapsed < self.eye_safety_gap {
                let remaining = self.eye_safety_gap - elapsed;
                info!(remaining_us = remaining.as_micros() as u64, "eye-safety pause before start");
                self.access.sleep_for(remaining);
            }
        }
    }

    /// Whether a previously requested configuration change is still pending
    pub fn config_change_pending(&mut self) -> CoreResult<bool> {
        let flags = self.access.read(self.regs.cfgcnt_flags)?;
        Ok(flags & (CFG_FLAG_CONFIG_CHANGED | CFG_FLAG_USE_CASE_CHANGED) != 0)
    }

    /// Wait for any pending configuration change to be consumed
    fn wait_for_config_idle(&mut self) -> CoreResult<()> {
        self.access.poll_until(
            self.regs.cfgcnt_flags,
            0,
            Duration::ZERO,
            Duration::from_millis(1),
        )
    }

    /// Run the safe-reconfiguration sequence: wait until no change is
    /// pending, write the staged values, raise the flag bit and read back
    /// the 12-bit acknowledgement counter.
    ///
    /// If writing the new values fails partway, the previous values are
    /// restored from the shadow and `ValidButUnchanged` is returned; only
    /// when the restore itself fails does the original error surface.
    pub fn safe_reconfigure(&mut self, writes: &[(u16, u16)], flag: u16) -> CoreResult<u16> {
        self.require_state(ImagerState::Capturing)?;
        self.wait_for_config_idle()?;

        let previous: Vec<(u16, Option<u16>)> = writes
            .iter()
            .map(|(address, _)| (*address, self.shadow.known_value(*address)))
            .collect();

        for (i, (address, value)) in writes.iter().enumerate() {
            if let Err(e) = self.shadow.track_and_write(&mut self.access, *address, *value) {
                return self.rollback(&previous[..i], e);
            }
        }

        if let Err(e) = self
            .shadow
            .track_and_write(&mut self.access, self.regs.cfgcnt_flags, flag)
        {
            return self.rollback(&previous, e);
        }
        // the device clears the flag bits itself once they're consumed
        self.shadow.invalidate(self.regs.cfgcnt_flags);

        let counter = self.access.read(self.regs.cfgcnt_counter)?;
        Ok(counter & 0x0FFF)
    }

    fn rollback(&mut self, written: &[(u16, Option<u16>)], cause: CoreError) -> CoreResult<u16> {
        for (address, value) in written {
            let Some(value) = value else {
                // no shadow entry to restore from
                return Err(cause);
            };
            if self
                .shadow
                .track_and_write(&mut self.access, *address, *value)
                .is_err()
            {
                return Err(cause);
            }
        }
        Err(CoreError::ValidButUnchanged(cause.to_string()))
    }

    /// Exposure register writes for a use case, one per sequence entry
    pub fn exposure_writes(
        &self,
        use_case: &UseCaseDefinition,
        exposure_times: &[u32],
    ) -> CoreResult<Vec<(u16, u16)>> {
        if exposure_times.len() != use_case.exposure_groups.len() {
            return Err(CoreError::InvalidValue(format!(
                "{} exposure times for {} groups",
                exposure_times.len(),
                use_case.exposure_groups.len()
            )));
        }
        for (time, group) in exposure_times.iter().zip(&use_case.exposure_groups) {
            if !group.contains(*time) {
                return Err(CoreError::InvalidValue(format!(
                    "exposure {time} outside [{}, {}] of group {}",
                    group.min, group.max, group.name
                )));
            }
        }

        let mut writes = Vec::new();
        let mut sequence_index = 0u16;
        for set in &use_case.raw_frame_sets {
            let value =
                exposure_register_value(exposure_times[set.exposure_group], set.modulation_frequency);
            for _ in 0..set.raw_frame_count() {
                if usize::from(sequence_index) >= self.regs.sequence_entries {
                    return Err(CoreError::InvalidValue(
                        "use case exceeds the sequence capacity".to_string(),
                    ));
                }
                let address = self.regs.expo_time_base + sequence_index * self.regs.expo_time_stride;
                writes.push((address, value));
                sequence_index += 1;
            }
        }
        Ok(writes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::mock::MockRegisterIo;
    use crate::usecase::four_phase_plus_gray;

    const TEST_REGS: ReconfigRegisters = ReconfigRegisters {
        cfgcnt_flags: 0x9080,
        cfgcnt_counter: 0x9081,
        expo_time_base: 0x9000,
        expo_time_stride: 4,
        frame_rate: 0x9082,
        sequence_entries: 32,
    };

    fn core() -> ImagerCore<MockRegisterIo> {
        ImagerCore::new(
            RegisterAccess::new(MockRegisterIo::default()),
            ImagerFamily::Aura200,
            TEST_REGS,
            false,
        )
    }

    #[test]
    fn test_require_state() {
        let core = core();
        assert!(core.require_state(ImagerState::Virgin).is_ok());
        assert!(matches!(
            core.require_state(ImagerState::Ready),
            Err(CoreError::WrongState(_))
        ));
    }

    #[test]
    fn test_safe_reconfigure_returns_counter() {
        let mut core = core();
        core.set_state(ImagerState::Capturing);
        core.access.bridge_mut().registers.insert(0x9081, 0xF005);

        let counter = core
            .safe_reconfigure(&[(0x9000, 0x0123)], CFG_FLAG_CONFIG_CHANGED)
            .expect("reconfigure");
        // counter is 12 bit, flag bits masked away
        assert_eq!(counter, 5);
        // the value was written and the flag raised
        assert_eq!(core.access.bridge_mut().registers[&0x9000], 0x0123);
        assert_eq!(
            core.access.bridge_mut().registers[&0x9080],
            CFG_FLAG_CONFIG_CHANGED
        );
    }

    #[test]
    fn test_safe_reconfigure_outside_capturing() {
        let mut core = core();
        assert!(matches!(
            core.safe_reconfigure(&[(0x9000, 1)], CFG_FLAG_CONFIG_CHANGED),
            Err(CoreError::WrongState(_))
        ));
    }

    #[test]
    fn test_safe_reconfigure_waits_for_pending_change() {
        let mut core = core();
        core.set_state(ImagerState::Capturing);
        // flag still set for two polls, then consumed
        core.access
            .bridge_mut()
            .script_reads(0x9080, &[CFG_FLAG_CONFIG_CHANGED, CFG_FLAG_CONFIG_CHANGED, 0]);

        core.safe_reconfigure(&[(0x9000, 1)], CFG_FLAG_CONFIG_CHANGED)
            .expect("reconfigure");
    }

    #[test]
    fn test_exposure_writes_cover_every_sequence_entry() {
        let core = core();
        let use_case = four_phase_plus_gray("TEST", 5.0, 176, 120, 80_000_000, 1000);
        let writes = core
            .exposure_writes(&use_case, &[1000, 200])
            .expect("writes");
        // four modulated frames plus one grayscale frame
        assert_eq!(writes.len(), 5);
        let addresses: Vec<u16> = writes.iter().map(|(a, _)| *a).collect();
        assert_eq!(addresses, vec![0x9000, 0x9004, 0x9008, 0x900C, 0x9010]);
        // modulated frames share the first group's exposure
        assert_eq!(writes[0].1, writes[3].1);
    }

    #[test]
    fn test_exposure_writes_validate_ranges() {
        let core = core();
        let use_case = four_phase_plus_gray("TEST", 5.0, 176, 120, 80_000_000, 1000);
        assert!(matches!(
            core.exposure_writes(&use_case, &[1000]),
            Err(CoreError::InvalidValue(_))
        ));
        assert!(matches!(
            core.exposure_writes(&use_case, &[1000, 50_000]),
            Err(CoreError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_exposure_register_value() {
        // 1000 us at 80 MHz: 80000 clocks, 10000 register units
        assert_eq!(exposure_register_value(1000, 80_000_000), 10_000);
        // saturates at the 14-bit register width
        assert_eq!(exposure_register_value(2_000_000, 80_000_000), 0x3FFF);
    }
}
