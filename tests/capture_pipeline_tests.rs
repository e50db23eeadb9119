// SPDX-License-Identifier: GPL-3.0-only

//! End-to-end tests of the capture path: scripted transport, bridge buffer
//! pool, acquisition loop and frame collector working together.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tofcam::bridge::BufferDataFormat;
use tofcam::bridge::acquisition::{BridgeDataReceiver, BridgeStats, DataSource};
use tofcam::collector::{CollectedFrameGroup, FrameCollector, FrameGroupListener};
use tofcam::errors::CoreResult;
use tofcam::events::EventQueue;
use tofcam::pseudodata::{ImagerFamily, PseudoDataInterpreter};
use tofcam::usecase::four_phase_plus_gray;

const WIDTH: u16 = 64;
const HEIGHT: u16 = 4;
const FRAME_WORDS: usize = WIDTH as usize * HEIGHT as usize;

/// Transport stub replaying prepared transfers
struct ScriptedSource {
    payloads: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl DataSource for ScriptedSource {
    fn receive_payload(&mut self, timeout: Duration) -> CoreResult<Option<Vec<u8>>> {
        let next = self
            .payloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if next.is_none() {
            std::thread::sleep(timeout.min(Duration::from_millis(2)));
        }
        Ok(next)
    }
}

struct GroupRecorder {
    groups: Mutex<Vec<CollectedFrameGroup>>,
}

impl FrameGroupListener for GroupRecorder {
    fn on_frame_group(&self, group: CollectedFrameGroup) {
        self.groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(group);
    }
}

/// RAW16 transfer of one first-generation raw frame
fn raw16_frame(frame_number: u16, sequence_index: u16, reconfig_index: u16) -> Vec<u8> {
    let mut words = vec![0u16; FRAME_WORDS];
    words[0] = frame_number;
    words[1] = sequence_index << 7;
    words[148] = reconfig_index;
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn wait_until(deadline_ms: u64, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    predicate()
}

struct Pipeline {
    receiver: BridgeDataReceiver<ScriptedSource>,
    collector: Arc<FrameCollector>,
    recorder: Arc<GroupRecorder>,
    stats: Arc<BridgeStats>,
    _queue: EventQueue,
}

fn pipeline(payloads: Vec<Vec<u8>>) -> Pipeline {
    let queue = EventQueue::new();
    let use_case = four_phase_plus_gray("PIPELINE", 5.0, WIDTH, HEIGHT, 80_320_000, 1000);

    let source = ScriptedSource {
        payloads: Arc::new(Mutex::new(payloads.into())),
    };
    let mut receiver = BridgeDataReceiver::new(source, BufferDataFormat::Raw16);
    receiver
        .execute_use_case(WIDTH, HEIGHT, 1, FrameCollector::buffer_reservation(&use_case))
        .expect("buffer pool");
    let stats = receiver.stats();

    let collector = Arc::new(FrameCollector::new(
        PseudoDataInterpreter::new(ImagerFamily::Aura100, false),
        receiver.pool(),
        receiver.stats(),
        queue.sender(),
        1000,
    ));
    collector.execute_use_case(&use_case).expect("use case");

    let recorder = Arc::new(GroupRecorder {
        groups: Mutex::new(Vec::new()),
    });
    collector.set_frame_group_listener(Some(Arc::clone(&recorder) as _));
    receiver.set_capture_listener(Some(Arc::clone(&collector) as _));

    Pipeline {
        receiver,
        collector,
        recorder,
        stats,
        _queue: queue,
    }
}

#[test]
fn test_five_frames_become_one_group() {
    let payloads = (0..5u16).map(|i| raw16_frame(i, i, 0)).collect();
    let mut pipeline = pipeline(payloads);
    pipeline.receiver.start_capture().expect("start");

    assert!(wait_until(2000, || {
        !pipeline
            .recorder
            .groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }));
    pipeline.receiver.stop_capture();

    let groups = pipeline
        .recorder
        .groups
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].frames.len(), 5);
    for (i, frame) in groups[0].frames.iter().enumerate() {
        assert_eq!(frame.sequence_index, i as u16);
    }
}

#[test]
fn test_every_buffer_returns_to_the_pool() {
    let payloads = (0..15u16).map(|i| raw16_frame(i, i % 5, 0)).collect();
    let mut pipeline = pipeline(payloads);
    pipeline.receiver.start_capture().expect("start");

    assert!(wait_until(2000, || {
        pipeline.stats.buffers_received.load(Ordering::Relaxed) == 15
    }));
    pipeline.receiver.stop_capture();
    pipeline.receiver.wait_capture_buffer_dealloc();
    assert!(pipeline.receiver.pool().is_drained());

    let groups = pipeline
        .recorder
        .groups
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    assert_eq!(groups.len(), 3);
}

#[test]
fn test_group_survives_frame_number_wrap() {
    // frame numbers 4094, 4095, 0, 1, 2 for sequence indices 0..=4
    let payloads = (0..5u16)
        .map(|i| raw16_frame((4094 + i) % 4096, i, 0))
        .collect();
    let mut pipeline = pipeline(payloads);
    pipeline.receiver.start_capture().expect("start");

    assert!(wait_until(2000, || {
        !pipeline
            .recorder
            .groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }));
    pipeline.receiver.stop_capture();

    let groups = pipeline
        .recorder
        .groups
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].frames[0].frame_number, 4094);
    assert_eq!(groups[0].frames[2].frame_number, 0);
}

#[test]
fn test_reconfig_index_rides_along_in_delivered_frames() {
    // the imager acknowledged a reconfiguration with counter 5 starting at
    // the third frame; earlier frames still report 4 and thus the old
    // settings
    let payloads = (0..5u16)
        .map(|i| raw16_frame(i, i, if i < 2 { 4 } else { 5 }))
        .collect();
    let mut pipeline = pipeline(payloads);
    pipeline.receiver.start_capture().expect("start");

    assert!(wait_until(2000, || {
        !pipeline
            .recorder
            .groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }));
    pipeline.receiver.stop_capture();

    let groups = pipeline
        .recorder
        .groups
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    assert_eq!(groups[0].frames[0].reconfig_index, 4);
    assert_eq!(groups[0].frames[4].reconfig_index, 5);
}

#[test]
fn test_collector_statistics_reach_the_listener() {
    use tofcam::events::{Event, EventListener};

    struct StatsRecorder {
        stats: Mutex<Vec<Event>>,
    }
    impl EventListener for StatsRecorder {
        fn on_event(&self, event: Event) {
            self.stats
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(event);
        }
    }

    let payloads = (0..5u16).map(|i| raw16_frame(i, i, 0)).collect();
    let mut pipeline = pipeline(payloads);
    let recorder = Arc::new(StatsRecorder {
        stats: Mutex::new(Vec::new()),
    });
    pipeline
        ._queue
        .set_event_listener(Some(Arc::clone(&recorder) as _));

    pipeline.receiver.start_capture().expect("start");
    assert!(wait_until(2000, || {
        pipeline.stats.buffers_received.load(Ordering::Relaxed) == 5
    }));
    pipeline.receiver.stop_capture();

    pipeline.collector.flush_statistics();
    pipeline._queue.sync();
    let events = recorder.stats.lock().unwrap_or_else(|e| e.into_inner());
    assert!(events.iter().any(|e| matches!(
        e,
        Event::RawFrameStats { frames_total: 5, frames_dropped_collector: 0, .. }
    )));
}
