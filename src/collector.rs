// SPDX-License-Identifier: GPL-3.0-only

//! Frame collector
//!
//! Raw frames arrive from the bridge one buffer at a time, individually or
//! concatenated into superframes. The collector sorts each raw frame into
//! the stream that expects its sequence index, checks that the frame
//! numbers of a group are consistent under the family's wrap-around
//! arithmetic, and delivers complete frame groups to the processing
//! listener. Streams deliver independently, so in mixed mode the high-rate
//! stream is never held back by an incomplete low-rate group.
//!
//! Buffers return to the pool as soon as their frames are extracted; the
//! delivered groups own their pixel data.

use crate::bridge::acquisition::BridgeStats;
use crate::bridge::buffer_pool::BufferPool;
use crate::bridge::{CaptureBuffer, CaptureListener};
use crate::errors::{CoreError, CoreResult};
use crate::events::{Event, EventSender};
use crate::monitor::TemperatureMonitor;
use crate::pseudodata::{
    FRAME_NUMBER_MODULO, FrameCounterMode, NtcParameters, PseudoDataInterpreter,
};
use crate::usecase::{StreamId, UseCaseDefinition};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// One raw frame extracted from a capture buffer
#[derive(Debug, Clone)]
pub struct CollectedFrame {
    pub sequence_index: u16,
    pub frame_number: u16,
    pub reconfig_index: u16,
    /// Pseudodata line followed by the pixel payload
    pub data: Vec<u16>,
}

/// A complete frame group of one stream, ready for processing
#[derive(Debug, Clone)]
pub struct CollectedFrameGroup {
    pub stream_id: StreamId,
    /// In sequence-index order
    pub frames: Vec<CollectedFrame>,
    /// Module temperature derived from this group's pseudodata, when the
    /// family routes thermistor readings through it
    pub temperature: Option<f32>,
}

/// Consumer of assembled frame groups; runs on the acquisition thread and
/// must not block on anything the application thread holds
pub trait FrameGroupListener: Send + Sync {
    fn on_frame_group(&self, group: CollectedFrameGroup);
}

/// Assembly state of one frame group
struct GroupSlot {
    sequence_indices: Vec<u16>,
    /// Frame number and sequence index of the first frame accepted into
    /// the current assembly
    base: Option<(u16, u16)>,
    frames: Vec<Option<CollectedFrame>>,
}

impl GroupSlot {
    fn new(sequence_indices: Vec<u16>) -> Self {
        let len = sequence_indices.len();
        Self {
            sequence_indices,
            base: None,
            frames: (0..len).map(|_| None).collect(),
        }
    }

    fn clear(&mut self) -> usize {
        self.base = None;
        let mut discarded = 0;
        for frame in &mut self.frames {
            if frame.take().is_some() {
                discarded += 1;
            }
        }
        discarded
    }

    fn is_complete(&self) -> bool {
        self.frames.iter().all(Option::is_some)
    }
}

struct StreamSlot {
    id: StreamId,
    groups: Vec<GroupSlot>,
}

#[derive(Default)]
struct CollectorState {
    streams: Vec<StreamSlot>,
    frame_words: usize,
    frames_total: u64,
    dropped_collector: u64,
    frames_since_stats: usize,
    last_eye_error: u32,
}

/// Assembles raw frames into frame groups, per stream
pub struct FrameCollector {
    interpreter: PseudoDataInterpreter,
    pool: Arc<BufferPool>,
    state: Mutex<CollectorState>,
    listener: Mutex<Option<Arc<dyn FrameGroupListener>>>,
    events: EventSender,
    bridge_stats: Arc<BridgeStats>,
    /// Frames between two statistics events
    stats_interval: usize,
    temperature: Mutex<Option<(NtcParameters, Arc<TemperatureMonitor>)>>,
}

impl FrameCollector {
    pub fn new(
        interpreter: PseudoDataInterpreter,
        pool: Arc<BufferPool>,
        bridge_stats: Arc<BridgeStats>,
        events: EventSender,
        stats_interval: usize,
    ) -> Self {
        Self {
            interpreter,
            pool,
            state: Mutex::new(CollectorState::default()),
            listener: Mutex::new(None),
            events,
            bridge_stats,
            stats_interval: stats_interval.max(1),
            temperature: Mutex::new(None),
        }
    }

    /// Configure stream assembly for a use case; discards any assembly in
    /// progress
    pub fn execute_use_case(&self, use_case: &UseCaseDefinition) -> CoreResult<()> {
        if use_case.streams.is_empty() {
            return Err(CoreError::InvalidValue(
                "use case defines no streams".to_string(),
            ));
        }
        let dangling = use_case.streams.iter().flat_map(|s| &s.frame_groups).any(|g| {
            g.frame_set_indices
                .iter()
                .any(|&i| i >= use_case.raw_frame_sets.len())
        });
        if dangling {
            return Err(CoreError::InvalidValue(
                "frame group references a raw frame set that does not exist".to_string(),
            ));
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.frame_words = usize::from(use_case.width) * usize::from(use_case.height);
        state.streams = use_case
            .streams
            .iter()
            .map(|stream| StreamSlot {
                id: stream.id,
                groups: stream
                    .frame_groups
                    .iter()
                    .map(|group| GroupSlot::new(use_case.group_sequence_indices(group)))
                    .collect(),
            })
            .collect();
        Ok(())
    }

    pub fn set_frame_group_listener(&self, listener: Option<Arc<dyn FrameGroupListener>>) {
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = listener;
    }

    /// Route pseudodata thermistor readings into a temperature monitor
    pub fn set_temperature_monitor(
        &self,
        parameters: NtcParameters,
        monitor: Arc<TemperatureMonitor>,
    ) {
        *self.temperature.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((parameters, monitor));
    }

    /// Buffers needed to absorb one complete group of every stream plus an
    /// in-flight transfer; in mixed mode this covers a full low-rate group
    /// while the high-rate stream keeps running
    pub fn buffer_reservation(use_case: &UseCaseDefinition) -> usize {
        let per_stream: usize = use_case
            .streams
            .iter()
            .map(|stream| {
                stream
                    .frame_groups
                    .iter()
                    .map(|group| use_case.group_sequence_indices(group).len())
                    .max()
                    .unwrap_or(0)
            })
            .sum();
        per_stream + 1
    }

    /// Emit a statistics event immediately
    pub fn flush_statistics(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.emit_statistics(&mut state);
    }

    fn emit_statistics(&self, state: &mut CollectorState) {
        state.frames_since_stats = 0;
        self.events.send(Event::RawFrameStats {
            frames_total: state.frames_total,
            frames_dropped_bridge: self.bridge_stats.buffers_dropped.load(Ordering::Relaxed),
            frames_dropped_collector: state.dropped_collector,
        });
    }

    /// Expected frame number for a frame of the same group, given the
    /// group's base
    fn expected_frame_number(&self, base: (u16, u16), sequence_index: u16) -> u16 {
        let (base_frame, base_sequence) = base;
        match self.interpreter.family().layout().frame_counter {
            // counts every raw frame: advance by the sequence distance
            FrameCounterMode::PerRawFrame => {
                let distance = sequence_index.wrapping_sub(base_sequence);
                base_frame.wrapping_add(distance) % FRAME_NUMBER_MODULO
            }
            // all frames of one superframe share the number
            FrameCounterMode::PerSuperframe => base_frame,
        }
    }

    /// Sort one raw frame into its stream; returns a completed group when
    /// this frame was the last missing piece
    fn process_frame(&self, data: &[u16]) -> Option<CollectedFrameGroup> {
        let interpreter = &self.interpreter;
        let sequence_index = interpreter.sequence_index(data);
        let frame_number = interpreter.frame_number(data);
        let reconfig_index = interpreter.reconfig_index(data);

        self.observe_health(data);

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.frames_total += 1;
        state.frames_since_stats += 1;
        if state.frames_since_stats >= self.stats_interval {
            self.emit_statistics(&mut state);
        }

        let mut located = None;
        'streams: for (stream_index, stream) in state.streams.iter().enumerate() {
            for (group_index, group) in stream.groups.iter().enumerate() {
                if let Some(position) = group
                    .sequence_indices
                    .iter()
                    .position(|&s| s == sequence_index)
                {
                    located = Some((stream_index, group_index, position));
                    break 'streams;
                }
            }
        }
        let Some((stream_index, group_index, position)) = located else {
            state.dropped_collector += 1;
            debug!(sequence_index, "no stream expects this sequence index");
            return None;
        };

        let stream_id = state.streams[stream_index].id;
        let slot = &mut state.streams[stream_index].groups[group_index];

        if let Some(base) = slot.base {
            let expected = self.expected_frame_number(base, sequence_index);
            if expected != frame_number || slot.frames[position].is_some() {
                // inconsistent group: throw it away and restart from this
                // frame
                let discarded = slot.clear();
                state.dropped_collector += discarded as u64;
                warn!(
                    %stream_id,
                    expected,
                    got = frame_number,
                    discarded,
                    "frame number mismatch, restarting group"
                );
            }
        }
        let slot = &mut state.streams[stream_index].groups[group_index];
        if slot.base.is_none() {
            slot.base = Some((frame_number, sequence_index));
        }

        slot.frames[position] = Some(CollectedFrame {
            sequence_index,
            frame_number,
            reconfig_index,
            data: data.to_vec(),
        });

        if !slot.is_complete() {
            return None;
        }

        let frames: Vec<CollectedFrame> = slot.frames.iter_mut().filter_map(Option::take).collect();
        slot.base = None;
        drop(state);

        let temperature = self.group_temperature(&frames);
        Some(CollectedFrameGroup {
            stream_id,
            frames,
            temperature,
        })
    }

    /// Eye-safety flags and thermistor readings ride along in every frame
    fn observe_health(&self, data: &[u16]) {
        let eye_error = self.interpreter.eye_safety_error(data);
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if eye_error != 0 && state.last_eye_error == 0 {
                self.events.send(Event::EyeSafety {
                    error_flags: eye_error,
                });
            }
            state.last_eye_error = eye_error;
        }

        if let Some(raw) = self.interpreter.temperature_raw_values(data) {
            let temperature = self.temperature.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((parameters, monitor)) = temperature.as_ref()
                && let Some(celsius) = parameters.celsius_from_raw(&raw)
            {
                monitor.accept_temperature(celsius);
            }
        }
    }

    fn group_temperature(&self, frames: &[CollectedFrame]) -> Option<f32> {
        let temperature = self.temperature.lock().unwrap_or_else(|e| e.into_inner());
        let (parameters, _) = temperature.as_ref()?;
        let raw = self
            .interpreter
            .temperature_raw_values(&frames.first()?.data)?;
        parameters.celsius_from_raw(&raw)
    }
}

impl CaptureListener for FrameCollector {
    fn buffer_callback(&self, buffer: CaptureBuffer) {
        let frame_words = self.state.lock().unwrap_or_else(|e| e.into_inner()).frame_words;

        let mut completed = Vec::new();
        if frame_words == 0 {
            warn!("collector received a buffer before a use case was configured");
        } else {
            for index in 0..buffer.raw_frame_count(frame_words) {
                if let Some(frame) = buffer.raw_frame(index, frame_words)
                    && let Some(group) = self.process_frame(frame.data())
                {
                    completed.push(group);
                }
            }
        }

        // the buffer's frames are copied out; give it back before the
        // potentially slow listener runs
        if let Err(e) = self.pool.queue_buffer(buffer) {
            warn!(error = %e, "failed to requeue a processed buffer");
        }

        let listener = self.listener.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(listener) = listener {
            for group in completed {
                listener.on_frame_group(group);
            }
        }
    }
}
