// SPDX-License-Identifier: GPL-3.0-only

//! Use-case model
//!
//! A use case fully specifies one capture configuration: modulation
//! frequencies, exposure groups, frame rate, region of interest and the
//! raw-frame sequence. Mixed-mode use cases interleave several streams in a
//! single sequence (for example a 5:1 ratio of a high-throughput stream to a
//! long-range stream).

mod identifier;

pub use identifier::UseCaseIdentifier;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel for [`RawFrameSet::modulation_frequency`] letting the imager pick
/// a frequency from its module configuration
pub const MODFREQ_AUTO: u32 = 0;

/// Phase layout of a raw frame set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseDefinition {
    /// A single unmodulated raw frame
    Grayscale,
    /// Four phase-shifted raw frames of a continuous-wave measurement
    Modulated4PhaseCw,
}

impl PhaseDefinition {
    /// Number of raw frames this definition expands to in the sequence
    pub fn raw_frame_count(&self) -> usize {
        match self {
            PhaseDefinition::Grayscale => 1,
            PhaseDefinition::Modulated4PhaseCw => 4,
        }
    }

    /// Phase angles in degrees, in capture order
    pub fn phase_angles(&self) -> &'static [u16] {
        match self {
            PhaseDefinition::Grayscale => &[0],
            PhaseDefinition::Modulated4PhaseCw => &[0, 90, 180, 270],
        }
    }
}

/// Illumination duty cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DutyCycle {
    /// Use the duty cycle from the module configuration
    #[default]
    Auto,
    Dc0,
    Dc25,
    Dc37_5,
    Dc50,
    Dc75,
    Dc100,
}

impl fmt::Display for DutyCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DutyCycle::Auto => write!(f, "auto"),
            DutyCycle::Dc0 => write!(f, "0%"),
            DutyCycle::Dc25 => write!(f, "25%"),
            DutyCycle::Dc37_5 => write!(f, "37.5%"),
            DutyCycle::Dc50 => write!(f, "50%"),
            DutyCycle::Dc75 => write!(f, "75%"),
            DutyCycle::Dc100 => write!(f, "100%"),
        }
    }
}

/// Position of a raw frame set within the measurement sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Alignment {
    /// Spread evenly over the sequence; in mixed mode this marks the master
    /// stream's sets, to which all others are aligned
    ClockAligned,
    /// Starts immediately after the previous raw frame set
    #[default]
    StartAligned,
    /// Ends immediately before the next raw frame set
    StopAligned,
    /// Starts after a virtual clock-aligned slot, i.e. at the end of the
    /// next block
    NextStopAligned,
}

/// Spread-spectrum clocking parameters applied to the modulation frequency
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SscParams {
    /// Frequency of the SSC modulation in Hz
    pub freq: f64,
    /// Deviation of the actual frequency around the nominal frequency
    pub kspread: f64,
    /// Total frequency deviation used during SSC modulation
    pub delta: f64,
}

/// Index into [`UseCaseDefinition::exposure_groups`]
pub type ExposureGroupIdx = usize;

/// A named exposure setting shared by one or more raw frame sets
///
/// Sets referencing the same group are forced to equal exposure; the group is
/// the unit of reconfiguration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureGroup {
    pub name: String,
    /// Lower bound in microseconds
    pub min: u32,
    /// Upper bound in microseconds
    pub max: u32,
    /// Currently configured exposure time in microseconds
    pub exposure_time: u32,
}

impl ExposureGroup {
    pub fn new(name: impl Into<String>, min: u32, max: u32, exposure_time: u32) -> Self {
        Self {
            name: name.into(),
            min,
            max,
            exposure_time,
        }
    }

    pub fn contains(&self, exposure_time: u32) -> bool {
        (self.min..=self.max).contains(&exposure_time)
    }
}

/// One grayscale raw frame or four modulated phase frames sharing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFrameSet {
    /// Modulation PLL frequency in Hz, or [`MODFREQ_AUTO`]
    pub modulation_frequency: u32,
    pub phase_definition: PhaseDefinition,
    pub duty_cycle: DutyCycle,
    pub exposure_group: ExposureGroupIdx,
    pub alignment: Alignment,
    /// Minimum guaranteed gap in seconds between the end of this set's last
    /// exposure and the start of the next set's first exposure
    pub t_eye_safety: f64,
    pub ssc: Option<SscParams>,
}

impl RawFrameSet {
    pub fn modulated(
        modulation_frequency: u32,
        duty_cycle: DutyCycle,
        exposure_group: ExposureGroupIdx,
    ) -> Self {
        Self {
            modulation_frequency,
            phase_definition: PhaseDefinition::Modulated4PhaseCw,
            duty_cycle,
            exposure_group,
            alignment: Alignment::default(),
            t_eye_safety: 0.0,
            ssc: None,
        }
    }

    pub fn grayscale(exposure_group: ExposureGroupIdx) -> Self {
        Self {
            modulation_frequency: MODFREQ_AUTO,
            phase_definition: PhaseDefinition::Grayscale,
            duty_cycle: DutyCycle::Auto,
            exposure_group,
            alignment: Alignment::default(),
            t_eye_safety: 0.0,
            ssc: None,
        }
    }

    pub fn is_modulated(&self) -> bool {
        self.phase_definition == PhaseDefinition::Modulated4PhaseCw
    }

    pub fn is_grayscale(&self) -> bool {
        self.phase_definition == PhaseDefinition::Grayscale
    }

    pub fn raw_frame_count(&self) -> usize {
        self.phase_definition.raw_frame_count()
    }
}

/// Identifier of a logical output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u16);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream {}", self.0)
    }
}

/// The raw frame sets forming one output frame of a stream, as indices into
/// [`UseCaseDefinition::raw_frame_sets`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGroup {
    pub frame_set_indices: Vec<usize>,
}

/// A logical output producing depth frames at a fixed rate
///
/// In mixed mode a high-rate stream owns several frame groups per sequence
/// (one per repetition) while the low-rate stream owns a single group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    pub id: StreamId,
    pub frame_groups: Vec<FrameGroup>,
}

/// Outcome of verifying a use case against an imager's limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationStatus {
    Success,
    ExposureTime,
    Framerate,
    ModulationFrequency,
    Phase,
    Region,
    DutyCycle,
    Undefined,
}

/// Limits an imager family imposes on use cases; see
/// [`UseCaseDefinition::verify`]
#[derive(Debug, Clone, Copy)]
pub struct SequenceLimits {
    /// Capacity of the imager's sequence configuration container, in raw
    /// frames
    pub max_raw_frames: usize,
    pub max_width: u16,
    pub max_height: u16,
    /// Supported modulation PLL range in Hz
    pub min_modulation_frequency: u32,
    pub max_modulation_frequency: u32,
    pub max_target_rate: f64,
    /// Whether the sequencer can schedule unmodulated frames
    pub supports_grayscale: bool,
}

impl Default for SequenceLimits {
    fn default() -> Self {
        Self {
            max_raw_frames: 32,
            max_width: 352,
            max_height: 287,
            min_modulation_frequency: 30_000_000,
            max_modulation_frequency: 100_000_000,
            max_target_rate: 60.0,
            supports_grayscale: true,
        }
    }
}

/// A fully specified capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UseCaseDefinition {
    #[serde(skip)]
    pub identifier: UseCaseIdentifier,
    pub name: String,
    /// Target frame rate of the sequence in Hz
    pub target_rate: f64,
    /// Region of interest, in pixels
    pub width: u16,
    pub height: u16,
    pub raw_frame_sets: Vec<RawFrameSet>,
    pub exposure_groups: Vec<ExposureGroup>,
    pub streams: Vec<Stream>,
}

impl UseCaseDefinition {
    /// Total number of raw frames captured per sequence
    pub fn raw_frame_count(&self) -> usize {
        self.raw_frame_sets
            .iter()
            .map(RawFrameSet::raw_frame_count)
            .sum()
    }

    /// Sequence index of the first raw frame of the given raw frame set
    pub fn first_sequence_index(&self, set_index: usize) -> u16 {
        self.raw_frame_sets[..set_index]
            .iter()
            .map(|s| s.raw_frame_count() as u16)
            .sum()
    }

    /// Sequence indices of one frame group, in capture order.
    ///
    /// Frame groups are stored as raw-frame-set indices; the collector works
    /// in raw-frame sequence indices, so each set expands to its frames.
    pub fn group_sequence_indices(&self, group: &FrameGroup) -> Vec<u16> {
        let mut indices = Vec::new();
        for &set_index in &group.frame_set_indices {
            let first = self.first_sequence_index(set_index);
            let count = self.raw_frame_sets[set_index].raw_frame_count() as u16;
            indices.extend(first..first + count);
        }
        indices
    }

    /// The largest eye-safety gap demanded by any raw frame set, in seconds
    pub fn eye_safety_gap(&self) -> f64 {
        self.raw_frame_sets
            .iter()
            .map(|s| s.t_eye_safety)
            .fold(0.0, f64::max)
    }

    /// Highest exposure group count of frame groups owned by a single stream;
    /// 1 for non-mixed use cases, the ratio for mixed ones
    pub fn stream_ratio(&self) -> usize {
        self.streams
            .iter()
            .map(|s| s.frame_groups.len())
            .max()
            .unwrap_or(1)
    }

    /// Structural and limit verification.
    ///
    /// Pure; performs no device I/O. The imager layer calls this with its
    /// family's limits before accepting a use case for execution.
    pub fn verify(&self, limits: &SequenceLimits) -> VerificationStatus {
        if self.raw_frame_sets.is_empty() || self.streams.is_empty() {
            return VerificationStatus::Undefined;
        }
        if self.raw_frame_count() > limits.max_raw_frames {
            return VerificationStatus::Undefined;
        }

        if self.width == 0 || self.height == 0 {
            return VerificationStatus::Region;
        }
        if self.width > limits.max_width || self.height > limits.max_height {
            return VerificationStatus::Region;
        }

        if !(self.target_rate > 0.0) || self.target_rate > limits.max_target_rate {
            return VerificationStatus::Framerate;
        }

        for set in &self.raw_frame_sets {
            let Some(group) = self.exposure_groups.get(set.exposure_group) else {
                return VerificationStatus::ExposureTime;
            };
            if group.min > group.max || !group.contains(group.exposure_time) {
                return VerificationStatus::ExposureTime;
            }
            if set.is_modulated()
                && set.modulation_frequency != MODFREQ_AUTO
                && !(limits.min_modulation_frequency..=limits.max_modulation_frequency)
                    .contains(&set.modulation_frequency)
            {
                return VerificationStatus::ModulationFrequency;
            }
            if set.is_grayscale() && !limits.supports_grayscale {
                return VerificationStatus::Phase;
            }
            if set.is_grayscale() && set.duty_cycle != DutyCycle::Auto && set.duty_cycle != DutyCycle::Dc0
            {
                return VerificationStatus::DutyCycle;
            }
        }

        // Per stream, frame groups must reference valid, non-overlapping
        // raw frame sets.
        for stream in &self.streams {
            if stream.frame_groups.is_empty() {
                return VerificationStatus::Undefined;
            }
            let mut seen = vec![false; self.raw_frame_sets.len()];
            for group in &stream.frame_groups {
                if group.frame_set_indices.is_empty() {
                    return VerificationStatus::Undefined;
                }
                for &idx in &group.frame_set_indices {
                    if idx >= self.raw_frame_sets.len() || seen[idx] {
                        return VerificationStatus::Undefined;
                    }
                    seen[idx] = true;
                }
            }
        }

        VerificationStatus::Success
    }
}

/// Build a standard four-phase use case with a trailing grayscale frame
/// (the ubiquitous "4+1" sequence).
pub fn four_phase_plus_gray(
    name: &str,
    target_rate: f64,
    width: u16,
    height: u16,
    modulation_frequency: u32,
    exposure_time: u32,
) -> UseCaseDefinition {
    let exposure_groups = vec![
        ExposureGroup::new("mod", 8, 2000, exposure_time),
        ExposureGroup::new("gray", 8, 2000, exposure_time),
    ];
    let raw_frame_sets = vec![
        RawFrameSet::modulated(modulation_frequency, DutyCycle::Auto, 0),
        RawFrameSet::grayscale(1),
    ];
    let streams = vec![Stream {
        id: StreamId(0xdefa),
        frame_groups: vec![FrameGroup {
            frame_set_indices: vec![0, 1],
        }],
    }];
    UseCaseDefinition {
        identifier: UseCaseIdentifier::from_name(name),
        name: name.to_string(),
        target_rate,
        width,
        height,
        raw_frame_sets,
        exposure_groups,
        streams,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_use_case() -> UseCaseDefinition {
        four_phase_plus_gray("MODE_9_5FPS", 5.0, 176, 120, 80_320_000, 1000)
    }

    #[test]
    fn test_four_phase_plus_gray_shape() {
        let ucd = default_use_case();
        assert_eq!(ucd.raw_frame_count(), 5);
        assert_eq!(ucd.first_sequence_index(0), 0);
        assert_eq!(ucd.first_sequence_index(1), 4);
        let indices = ucd.group_sequence_indices(&ucd.streams[0].frame_groups[0]);
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_verify_default_use_case() {
        let ucd = default_use_case();
        assert_eq!(
            ucd.verify(&SequenceLimits::default()),
            VerificationStatus::Success
        );
    }

    #[test]
    fn test_verify_rejects_bad_exposure() {
        let mut ucd = default_use_case();
        ucd.exposure_groups[0].exposure_time = 5000; // above max 2000
        assert_eq!(
            ucd.verify(&SequenceLimits::default()),
            VerificationStatus::ExposureTime
        );

        let mut ucd = default_use_case();
        ucd.raw_frame_sets[0].exposure_group = 7; // dangling reference
        assert_eq!(
            ucd.verify(&SequenceLimits::default()),
            VerificationStatus::ExposureTime
        );
    }

    #[test]
    fn test_verify_rejects_bad_region_and_rate() {
        let mut ucd = default_use_case();
        ucd.width = 2000;
        assert_eq!(
            ucd.verify(&SequenceLimits::default()),
            VerificationStatus::Region
        );

        let mut ucd = default_use_case();
        ucd.target_rate = 0.0;
        assert_eq!(
            ucd.verify(&SequenceLimits::default()),
            VerificationStatus::Framerate
        );
    }

    #[test]
    fn test_verify_rejects_modulation_out_of_range() {
        let mut ucd = default_use_case();
        ucd.raw_frame_sets[0].modulation_frequency = 1_000_000; // below PLL range
        assert_eq!(
            ucd.verify(&SequenceLimits::default()),
            VerificationStatus::ModulationFrequency
        );
    }

    #[test]
    fn test_verify_rejects_overlapping_groups() {
        let mut ucd = default_use_case();
        ucd.streams[0].frame_groups.push(FrameGroup {
            frame_set_indices: vec![0], // set 0 already claimed by group 0
        });
        assert_eq!(
            ucd.verify(&SequenceLimits::default()),
            VerificationStatus::Undefined
        );
    }

    #[test]
    fn test_verify_rejects_sequence_overflow() {
        let mut ucd = default_use_case();
        for _ in 0..8 {
            ucd.raw_frame_sets
                .push(RawFrameSet::modulated(80_320_000, DutyCycle::Auto, 0));
        }
        assert!(ucd.raw_frame_count() > 32);
        assert_eq!(
            ucd.verify(&SequenceLimits::default()),
            VerificationStatus::Undefined
        );
    }

    #[test]
    fn test_verify_rejects_grayscale_without_sequencer_support() {
        let ucd = default_use_case();
        let limits = SequenceLimits {
            supports_grayscale: false,
            ..SequenceLimits::default()
        };
        assert_eq!(ucd.verify(&limits), VerificationStatus::Phase);
    }

    #[test]
    fn test_mixed_mode_ratio() {
        let mut ucd = default_use_case();
        assert_eq!(ucd.stream_ratio(), 1);
        // A second stream with five groups models a 5:1 mixed mode
        ucd.streams.push(Stream {
            id: StreamId(0xdefb),
            frame_groups: (0..5)
                .map(|_| FrameGroup {
                    frame_set_indices: vec![],
                })
                .collect(),
        });
        assert_eq!(ucd.stream_ratio(), 5);
    }

    #[test]
    fn test_eye_safety_gap_is_max_over_sets() {
        let mut ucd = default_use_case();
        ucd.raw_frame_sets[0].t_eye_safety = 0.0022;
        ucd.raw_frame_sets[1].t_eye_safety = 0.0005;
        assert_eq!(ucd.eye_safety_gap(), 0.0022);
    }
}
