// SPDX-License-Identifier: GPL-3.0-only

//! Pseudodata interpretation
//!
//! Every raw frame carries metadata encoded by the imager into the first
//! line of the image: frame number, sequence index, reconfiguration counter,
//! region of interest, raw temperature ADC readings and eye-safety flags.
//! Each 16-bit word carries its payload in bits 0-11; bits 12-15 are flags or
//! padding.
//!
//! The layout differs per imager family. Family-specific offsets live in
//! per-variant tables; the field accessors dispatch on [`ImagerFamily`].

use serde::{Deserialize, Serialize};

/// Modulus of the frame and reconfiguration counters (12 bit)
pub const FRAME_NUMBER_MODULO: u16 = 1 << 12;

/// How the imager advances the frame counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCounterMode {
    /// The counter increments once per raw frame
    PerRawFrame,
    /// The counter increments once per superframe, i.e. all raw frames of
    /// one sequence share a frame number
    PerSuperframe,
}

/// Supported imager families
///
/// Adding a family means adding a table row below; the counter mode and the
/// field offsets are not discoverable at runtime and must come from the
/// device documentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImagerFamily {
    /// First-generation sensor: host-composed register sets, per-raw-frame
    /// counter, on-chip temperature ADC
    Aura100,
    /// Second-generation sensor: flash-defined register sets, per-superframe
    /// counter, external NTC readings and an internal eye-safety monitor
    Aura200,
}

/// Indices of the four raw temperature readings within the pseudodata
#[derive(Debug, Clone, Copy)]
pub struct NtcIndices {
    pub v_ref1: usize,
    pub v_ref2: usize,
    pub v_ntc1: usize,
    pub v_ntc2: usize,
}

/// Per-family pseudodata layout
#[derive(Debug, Clone, Copy)]
pub struct FamilyLayout {
    pub frame_counter: FrameCounterMode,
    /// Word index of the reconfiguration counter
    pub reconfig_index: usize,
    /// NTC reading positions, for families routing an external thermistor
    /// through the pseudodata
    pub ntc: Option<NtcIndices>,
    /// Minimum configured image width needed to read every field used here.
    /// The imager only allows widths in certain multiples, so callers round
    /// this up to a valid region width.
    pub required_image_width: u16,
}

const AURA100_LAYOUT: FamilyLayout = FamilyLayout {
    frame_counter: FrameCounterMode::PerRawFrame,
    reconfig_index: 148,
    ntc: None,
    required_image_width: 149,
};

const AURA200_LAYOUT: FamilyLayout = FamilyLayout {
    frame_counter: FrameCounterMode::PerSuperframe,
    reconfig_index: 2,
    ntc: Some(NtcIndices {
        v_ref2: 46,
        v_ref1: 47,
        v_ntc2: 48,
        v_ntc1: 49,
    }),
    required_image_width: 50,
};

impl ImagerFamily {
    pub fn layout(&self) -> &'static FamilyLayout {
        match self {
            ImagerFamily::Aura100 => &AURA100_LAYOUT,
            ImagerFamily::Aura200 => &AURA200_LAYOUT,
        }
    }
}

/// Offset-compensated raw temperature ADC readings
///
/// The reference and thermistor voltages each come as a pair sampled at two
/// points; the differences cancel the ADC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemperatureRawValues {
    pub v_ref1: u16,
    pub v_ntc1: u16,
    pub v_ref2: u16,
    pub v_ntc2: u16,
    /// Reserved
    pub offset: u16,
}

/// Decodes the pseudodata prefix of captured raw frames.
///
/// One interpreter instance is valid for every frame produced by the device
/// it was created for.
#[derive(Debug, Clone, Copy)]
pub struct PseudoDataInterpreter {
    family: ImagerFamily,
    /// Whether the imager's internal illumination current monitor is active;
    /// only then do the eye-safety words carry meaningful flags
    uses_current_monitor: bool,
}

impl PseudoDataInterpreter {
    pub fn new(family: ImagerFamily, uses_current_monitor: bool) -> Self {
        Self {
            family,
            uses_current_monitor,
        }
    }

    pub fn family(&self) -> ImagerFamily {
        self.family
    }

    /// Wrap-round counter of frames the imager has captured
    pub fn frame_number(&self, pd: &[u16]) -> u16 {
        match self.family {
            ImagerFamily::Aura100 => pd[0] & 0x0FFF,
            ImagerFamily::Aura200 => pd[3] & 0x0FFF,
        }
    }

    /// Counter the imager increments to acknowledge that a pending
    /// reconfiguration will take effect for the next frame
    pub fn reconfig_index(&self, pd: &[u16]) -> u16 {
        pd[self.family.layout().reconfig_index] & 0x0FFF
    }

    /// Position of this raw frame within the use case's sequence
    pub fn sequence_index(&self, pd: &[u16]) -> u16 {
        match self.family {
            ImagerFamily::Aura100 => pd[1] >> 7,
            ImagerFamily::Aura200 => pd[4] & 0x0FFF,
        }
    }

    /// Binning configuration; 1 for families without a binning module
    pub fn binning(&self, pd: &[u16]) -> u8 {
        match self.family {
            ImagerFamily::Aura100 => ((pd[1] >> 5) & 3) as u8,
            ImagerFamily::Aura200 => 1,
        }
    }

    /// Horizontal image size, binning applied
    pub fn horizontal_size(&self, pd: &[u16]) -> u16 {
        match self.family {
            ImagerFamily::Aura100 => ((pd[1] & 31) << 4) / (1 << self.binning(pd)),
            ImagerFamily::Aura200 => 1 + pd[23] - pd[22],
        }
    }

    /// Vertical image size, binning applied
    pub fn vertical_size(&self, pd: &[u16]) -> u16 {
        match self.family {
            ImagerFamily::Aura100 => (pd[2] & 511) / (1 << self.binning(pd)),
            ImagerFamily::Aura200 => 1 + pd[25] - pd[24],
        }
    }

    /// Raw ADC readings of the external thermistor, if this family routes
    /// them through the pseudodata
    pub fn temperature_raw_values(&self, pd: &[u16]) -> Option<TemperatureRawValues> {
        let ntc = self.family.layout().ntc?;
        Some(TemperatureRawValues {
            v_ref1: pd[ntc.v_ref1] & 0x0FFF,
            v_ref2: pd[ntc.v_ref2] & 0x0FFF,
            v_ntc1: pd[ntc.v_ntc1] & 0x0FFF,
            v_ntc2: pd[ntc.v_ntc2] & 0x0FFF,
            offset: 0,
        })
    }

    /// Eye-safety monitor status; zero during normal operation.
    ///
    /// Families without an internal current monitor, and devices where the
    /// monitor isn't activated, always report zero.
    pub fn eye_safety_error(&self, pd: &[u16]) -> u32 {
        match self.family {
            ImagerFamily::Aura100 => 0,
            ImagerFamily::Aura200 => {
                if self.uses_current_monitor {
                    let low = u32::from(pd[41] & 0x3FF);
                    let high = u32::from(pd[42] & 0x1F) << 16;
                    low | high
                } else {
                    0
                }
            }
        }
    }

    /// Minimum region-of-interest width required to read this family's
    /// pseudodata fields
    pub fn required_image_width(&self) -> u16 {
        self.family.layout().required_image_width
    }

    /// Expected frame number of the n-th raw frame after `base`
    pub fn following_frame_number(&self, base: u16, n: u16) -> u16 {
        let step = match self.family.layout().frame_counter {
            FrameCounterMode::PerRawFrame => n,
            FrameCounterMode::PerSuperframe => 1,
        };
        (base.wrapping_add(step)) % FRAME_NUMBER_MODULO
    }

    /// True if `n` is later than `base` under the counters' wrapping logic.
    ///
    /// With 12-bit counters, 4000 is greater than 3000, but 100 is greater
    /// than 4000. Frame numbers compare with frame numbers and reconfig
    /// indices with reconfig indices; mixing them is meaningless.
    pub fn is_greater_frame(&self, base: u16, n: u16) -> bool {
        is_greater_modulo(base, n)
    }

    /// Number of frames `lhs` is later than `rhs`, modulo the counter width
    pub fn frame_number_fwd_distance(&self, lhs: u16, rhs: u16) -> u16 {
        lhs.wrapping_sub(rhs) % FRAME_NUMBER_MODULO
    }
}

/// Wrap-around greater-than on 12-bit counters: `n` is later than `base` iff
/// the forward distance from `base` to `n` is in (0, 2^11).
pub fn is_greater_modulo(base: u16, n: u16) -> bool {
    let distance = n.wrapping_sub(base) % FRAME_NUMBER_MODULO;
    distance > 0 && distance < FRAME_NUMBER_MODULO / 2
}

/// Thermistor parameters of the module's temperature sensor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NtcParameters {
    /// Reference resistance in ohms at `ref_temperature`
    pub resistance: f32,
    /// B constant of the NTC in kelvin
    pub b_constant: f32,
    /// Reference temperature in degrees celsius
    pub ref_temperature: f32,
}

impl Default for NtcParameters {
    fn default() -> Self {
        Self {
            resistance: 100_000.0,
            b_constant: 4250.0,
            ref_temperature: 25.0,
        }
    }
}

const CELSIUS_KELVIN_OFFSET: f32 = 273.15;

impl NtcParameters {
    /// Convert offset-compensated ADC readings into degrees celsius.
    ///
    /// The thermistor and a reference resistor form a voltage divider; the
    /// resistance follows from the voltage ratio and the temperature from
    /// the B-parameter equation.
    pub fn celsius_from_raw(&self, raw: &TemperatureRawValues) -> Option<f32> {
        let v_ref = f32::from(raw.v_ref1) - f32::from(raw.v_ref2);
        let v_ntc = f32::from(raw.v_ntc1) - f32::from(raw.v_ntc2);
        if v_ref <= v_ntc || v_ntc <= 0.0 {
            return None;
        }
        let resistance = self.resistance * v_ntc / (v_ref - v_ntc);
        let ref_kelvin = self.ref_temperature + CELSIUS_KELVIN_OFFSET;
        let inv_kelvin = 1.0 / ref_kelvin + (resistance / self.resistance).ln() / self.b_constant;
        Some(1.0 / inv_kelvin - CELSIUS_KELVIN_OFFSET)
    }
}
