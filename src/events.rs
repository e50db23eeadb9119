// SPDX-License-Identifier: GPL-3.0-only

//! Asynchronous event delivery
//!
//! Producers enqueue from any thread without blocking; a single worker
//! drains the FIFO and dispatches to the registered listener, preserving
//! enqueue order. `sync` flushes the queue, which test code and orderly
//! shutdown paths use.

use crate::bridge::loop_control::{LoopAction, LoopController};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::debug;

/// How urgently the application should react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
}

/// Events the capture core reports to the application
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Periodic capture statistics
    RawFrameStats {
        frames_total: u64,
        frames_dropped_bridge: u64,
        frames_dropped_collector: u64,
    },
    /// The module temperature crossed the soft limit
    TemperatureSoftAlarm { celsius: f32 },
    /// The module temperature crossed the hard limit
    TemperatureHardAlarm { celsius: f32 },
    /// The imager's eye-safety monitor flagged an illumination fault
    EyeSafety { error_flags: u32 },
    /// A required external configuration file is missing
    ImagerConfigNotFound { camera: String, filename: PathBuf },
    /// The device went away mid-operation
    DeviceDisconnected { camera: String },
}

impl Event {
    pub fn severity(&self) -> EventSeverity {
        match self {
            Event::RawFrameStats { .. } => EventSeverity::Info,
            Event::TemperatureSoftAlarm { .. } => EventSeverity::Warning,
            Event::TemperatureHardAlarm { .. } => EventSeverity::Error,
            Event::EyeSafety { .. } => EventSeverity::Error,
            Event::ImagerConfigNotFound { .. } => EventSeverity::Error,
            Event::DeviceDisconnected { .. } => EventSeverity::Error,
        }
    }
}

/// Receiver of dispatched events; called on the worker thread
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: Event);
}

#[derive(Default)]
struct QueueState {
    events: VecDeque<Event>,
    listener: Option<Arc<dyn EventListener>>,
    dispatching: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    condition: Condvar,
}

/// Non-blocking producer handle; clone freely across threads
#[derive(Clone, Default)]
pub struct EventSender {
    shared: Arc<Shared>,
}

impl EventSender {
    /// Enqueue and return; never blocks on the listener
    pub fn send(&self, event: Event) {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.events.push_back(event);
        self.shared.condition.notify_all();
    }
}

/// FIFO queue with a single dispatch worker
pub struct EventQueue {
    shared: Arc<Shared>,
    worker: LoopController,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);

        let worker = LoopController::start("event-queue", move || {
            let (event, listener) = {
                let mut state = worker_shared
                    .state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                if state.events.is_empty() {
                    // wake up periodically to observe the stop signal
                    let (next, _) = worker_shared
                        .condition
                        .wait_timeout(state, Duration::from_millis(50))
                        .unwrap_or_else(|e| e.into_inner());
                    state = next;
                }
                match state.events.pop_front() {
                    Some(event) => {
                        state.dispatching = true;
                        (event, state.listener.clone())
                    }
                    None => return LoopAction::Continue,
                }
            };

            // dispatch outside the lock so on_event can enqueue
            if let Some(listener) = listener {
                listener.on_event(event);
            } else {
                debug!("event dropped, no listener registered");
            }

            let mut state = worker_shared
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            state.dispatching = false;
            worker_shared.condition.notify_all();
            LoopAction::Continue
        });

        Self { shared, worker }
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Replace the listener; queued events go to the new one
    pub fn set_event_listener(&self, listener: Option<Arc<dyn EventListener>>) {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.listener = listener;
    }

    /// Block until every queued event has been dispatched
    pub fn sync(&self) {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        while !state.events.is_empty() || state.dispatching {
            state = self
                .shared
                .condition
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.worker.request_stop();
        self.shared.condition.notify_all();
        self.worker.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        events: Mutex<Vec<Event>>,
    }

    impl EventListener for Recorder {
        fn on_event(&self, event: Event) {
            self.events
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(event);
        }
    }

    #[test]
    fn test_events_arrive_in_enqueue_order() {
        let queue = EventQueue::new();
        let recorder = Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
        });
        queue.set_event_listener(Some(Arc::clone(&recorder) as _));

        let sender = queue.sender();
        for i in 0..100u64 {
            sender.send(Event::RawFrameStats {
                frames_total: i,
                frames_dropped_bridge: 0,
                frames_dropped_collector: 0,
            });
        }
        queue.sync();

        let events = recorder.events.lock().unwrap_or_else(|e| e.into_inner());
        assert_eq!(events.len(), 100);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(
                *event,
                Event::RawFrameStats {
                    frames_total: i as u64,
                    frames_dropped_bridge: 0,
                    frames_dropped_collector: 0,
                }
            );
        }
    }

    #[test]
    fn test_events_without_listener_are_dropped() {
        let queue = EventQueue::new();
        queue.sender().send(Event::DeviceDisconnected {
            camera: "cam0".to_string(),
        });
        queue.sync();

        // a listener registered afterwards sees nothing old
        let recorder = Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
        });
        queue.set_event_listener(Some(Arc::clone(&recorder) as _));
        queue.sync();
        assert!(
            recorder
                .events
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty()
        );
    }

    #[test]
    fn test_severities() {
        assert_eq!(
            Event::TemperatureSoftAlarm { celsius: 61.0 }.severity(),
            EventSeverity::Warning
        );
        assert_eq!(
            Event::TemperatureHardAlarm { celsius: 66.0 }.severity(),
            EventSeverity::Error
        );
        assert_eq!(
            Event::RawFrameStats {
                frames_total: 0,
                frames_dropped_bridge: 0,
                frames_dropped_collector: 0
            }
            .severity(),
            EventSeverity::Info
        );
    }
}
