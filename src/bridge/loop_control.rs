// SPDX-License-Identifier: GPL-3.0-only

//! Thread lifecycle for the acquisition and event worker loops
//!
//! A controller spawns a named worker thread that calls the loop closure
//! until either the closure asks to stop or the controller's stop signal is
//! raised. Dropping the controller stops and joins the thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Action returned by a loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    Continue,
    Stop,
}

/// Controller for a worker loop running in its own thread
pub struct LoopController {
    thread_handle: Option<JoinHandle<()>>,
    stop_signal: Arc<AtomicBool>,
    name: String,
}

impl LoopController {
    /// Spawn the loop thread; `loop_fn` runs until it returns
    /// [`LoopAction::Stop`] or [`LoopController::stop`] is called
    pub fn start<F>(name: &str, mut loop_fn: F) -> Self
    where
        F: FnMut() -> LoopAction + Send + 'static,
    {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop_signal);
        let thread_name = name.to_string();

        info!(name = %name, "starting worker loop");
        let thread_handle = thread::spawn(move || {
            debug!(name = %thread_name, "worker thread started");
            while !stop_clone.load(Ordering::SeqCst) {
                if loop_fn() == LoopAction::Stop {
                    debug!(name = %thread_name, "loop requested stop");
                    break;
                }
            }
            info!(name = %thread_name, "worker thread exiting");
        });

        Self {
            thread_handle: Some(thread_handle),
            stop_signal,
            name: name.to_string(),
        }
    }

    /// Clone of the stop signal, for loop bodies that block internally
    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_signal)
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Raise the stop signal without waiting
    pub fn request_stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Stop the loop and join the thread
    pub fn stop(&mut self) {
        self.request_stop();
        self.join();
    }

    /// Join without raising the stop signal
    pub fn join(&mut self) {
        if let Some(handle) = self.thread_handle.take()
            && handle.join().is_err()
        {
            warn!(name = %self.name, "worker thread panicked");
        }
    }
}

impl Drop for LoopController {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            debug!(name = %self.name, "controller dropped, stopping loop");
            self.stop();
        }
    }
}
