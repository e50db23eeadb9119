// SPDX-License-Identifier: GPL-3.0-only

//! Acquisition loop and buffer normalization
//!
//! The acquisition thread blocks on the vendor transport with a short
//! timeout, copies each received transfer into a pool buffer while
//! normalizing it to RAW16, and invokes the capture listener. Data arriving
//! while capture is stopped, while no listener is set, or while the pool is
//! empty is dropped; the transport is never stalled.

use crate::bridge::buffer_pool::BufferPool;
use crate::bridge::loop_control::{LoopAction, LoopController};
use crate::bridge::{BufferDataFormat, CaptureBuffer, CaptureListener};
use crate::errors::{CoreError, CoreResult};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Timeout of one blocking receive; bounds how long stopping the capture
/// can take
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// Blocking vendor data transport (USB bulk-in or equivalent)
pub trait DataSource: Send + 'static {
    /// Wait up to `timeout` for one transfer; `Ok(None)` on timeout
    fn receive_payload(&mut self, timeout: Duration) -> CoreResult<Option<Vec<u8>>>;
}

/// Counters the frame collector folds into its statistics events
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub buffers_received: AtomicU64,
    pub buffers_dropped: AtomicU64,
}

/// Capture-side bridge: buffer pool ownership, acquisition thread and
/// format normalization
pub struct BridgeDataReceiver<S> {
    pool: Arc<BufferPool>,
    source: Arc<Mutex<S>>,
    listener: Arc<Mutex<Option<Arc<dyn CaptureListener>>>>,
    capture_started: Arc<AtomicBool>,
    /// Latched transfer format; `Unknown` until configured or detected
    format: Arc<Mutex<BufferDataFormat>>,
    /// Pixel count of one buffer for the executing use case
    buffer_words: Arc<AtomicUsize>,
    stats: Arc<BridgeStats>,
    controller: Option<LoopController>,
    start_epoch: Instant,
}

impl<S: DataSource> BridgeDataReceiver<S> {
    /// `format` may be fixed up front by bridges that know their transport,
    /// or left `Unknown` for auto-detection from the first transfer
    pub fn new(source: S, format: BufferDataFormat) -> Self {
        Self {
            pool: Arc::new(BufferPool::new()),
            source: Arc::new(Mutex::new(source)),
            listener: Arc::new(Mutex::new(None)),
            capture_started: Arc::new(AtomicBool::new(false)),
            format: Arc::new(Mutex::new(format)),
            buffer_words: Arc::new(AtomicUsize::new(0)),
            stats: Arc::new(BridgeStats::default()),
            controller: None,
            start_epoch: Instant::now(),
        }
    }

    pub fn pool(&self) -> Arc<BufferPool> {
        Arc::clone(&self.pool)
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        Arc::clone(&self.stats)
    }

    /// The detected or configured transfer format; `Unknown` while waiting
    /// for the first transfer
    pub fn transfer_format(&self) -> BufferDataFormat {
        *self.format.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resize the buffer pool for a use case.
    ///
    /// One buffer holds `frames_per_buffer` raw frames of `width` by
    /// `height` pixels. Returns the allocated count, which may be less
    /// than preferred.
    pub fn execute_use_case(
        &mut self,
        width: u16,
        height: u16,
        frames_per_buffer: usize,
        preferred_buffer_count: usize,
    ) -> CoreResult<usize> {
        if self.capture_started.load(Ordering::Acquire) {
            return Err(CoreError::WrongState(
                "cannot change the use case while capturing".to_string(),
            ));
        }
        let words = usize::from(width) * usize::from(height) * frames_per_buffer;
        let allocated = self.pool.reallocate(words, preferred_buffer_count)?;
        self.buffer_words.store(words, Ordering::Release);
        info!(width, height, frames_per_buffer, allocated, "buffer pool configured");
        Ok(allocated)
    }

    /// Replace the listener; takes effect no later than the next
    /// buffer callback. Buffers already in flight may still reach the old
    /// listener.
    pub fn set_capture_listener(&self, listener: Option<Arc<dyn CaptureListener>>) {
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = listener;
    }

    pub fn start_capture(&mut self) -> CoreResult<()> {
        if self.controller.as_ref().is_some_and(LoopController::is_running) {
            return Err(CoreError::WrongState(
                "capture is already running".to_string(),
            ));
        }
        if self.pool.allocated_count() == 0 {
            return Err(CoreError::WrongState(
                "no use case has been executed".to_string(),
            ));
        }

        self.capture_started.store(true, Ordering::Release);

        let source = Arc::clone(&self.source);
        let pool = Arc::clone(&self.pool);
        let listener = Arc::clone(&self.listener);
        let capture_started = Arc::clone(&self.capture_started);
        let format = Arc::clone(&self.format);
        let buffer_words = Arc::clone(&self.buffer_words);
        let stats = Arc::clone(&self.stats);
        let epoch = self.start_epoch;

        self.controller = Some(LoopController::start("acquisition", move || {
            let payload = {
                let mut source = source.lock().unwrap_or_else(|e| e.into_inner());
                source.receive_payload(RECEIVE_TIMEOUT)
            };
            match payload {
                Ok(None) => LoopAction::Continue,
                Ok(Some(bytes)) => {
                    if !capture_started.load(Ordering::Acquire) {
                        // stop_capture has been called more recently than
                        // start_capture; drop the data
                        return LoopAction::Continue;
                    }
                    handle_transfer(
                        &bytes,
                        &pool,
                        &listener,
                        &format,
                        buffer_words.load(Ordering::Acquire),
                        &stats,
                        epoch,
                    );
                    LoopAction::Continue
                }
                Err(CoreError::Disconnected) => {
                    warn!("device disconnected, acquisition stops");
                    LoopAction::Stop
                }
                Err(e) => {
                    warn!(error = %e, "transport error, continuing");
                    LoopAction::Continue
                }
            }
        }));
        Ok(())
    }

    /// Stop the acquisition; returns once the thread has joined, bounded by
    /// the receive timeout
    pub fn stop_capture(&mut self) {
        self.capture_started.store(false, Ordering::Release);
        if let Some(mut controller) = self.controller.take() {
            controller.stop();
        }
    }

    /// Drain the pool after a stop, e.g. before destroying the bridge
    pub fn wait_capture_buffer_dealloc(&self) {
        self.pool.wait_capture_buffer_dealloc();
    }
}

impl<S> Drop for BridgeDataReceiver<S> {
    fn drop(&mut self) {
        self.capture_started.store(false, Ordering::Release);
        if let Some(mut controller) = self.controller.take() {
            controller.stop();
        }
    }
}

/// Copy one transfer into a pool buffer, normalizing the wire format
fn handle_transfer(
    bytes: &[u8],
    pool: &BufferPool,
    listener: &Mutex<Option<Arc<dyn CaptureListener>>>,
    format: &Mutex<BufferDataFormat>,
    buffer_words: usize,
    stats: &BridgeStats,
    epoch: Instant,
) {
    stats.buffers_received.fetch_add(1, Ordering::Relaxed);

    let effective = {
        let mut format = format.lock().unwrap_or_else(|e| e.into_inner());
        if *format == BufferDataFormat::Unknown {
            let detected = BufferDataFormat::detect(buffer_words, bytes.len());
            if detected != BufferDataFormat::Unknown {
                info!(format = ?detected, size = bytes.len(), "transfer format detected");
                // latch, so variable superframe sizes in mixed mode cannot
                // re-detect differently
                *format = detected;
            }
        }
        *format
    };

    let words = match effective {
        BufferDataFormat::Unknown => {
            debug!(size = bytes.len(), "dropping transfer of unknown format");
            stats.buffers_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        BufferDataFormat::Raw16 => normalize_raw16(bytes),
        BufferDataFormat::Raw12 => normalize_raw12(bytes),
    };

    if words.len() != buffer_words {
        debug!(
            got = words.len(),
            expected = buffer_words,
            "dropping transfer with unexpected size"
        );
        stats.buffers_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let Some(mut buffer) = pool.try_dequeue() else {
        stats.buffers_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    };
    buffer.data_mut().copy_from_slice(&words);
    buffer.set_timestamp_us(epoch.elapsed().as_micros() as u64);

    // the callback runs without holding the pool lock
    let listener = listener.lock().unwrap_or_else(|e| e.into_inner()).clone();
    match listener {
        Some(listener) => listener.buffer_callback(buffer),
        None => {
            if let Err(e) = pool.queue_buffer(buffer) {
                warn!(error = %e, "failed to requeue an undelivered buffer");
            }
        }
    }
}

/// RAW16: one pixel per little-endian 16-bit word
fn normalize_raw16(bytes: &[u8]) -> Vec<u16> {
    bytemuck::pod_collect_to_vec::<u8, u16>(&bytes[..bytes.len() & !1])
}

/// RAW12 packed: two pixels in three bytes, left-aligned nibbles
fn normalize_raw12(bytes: &[u8]) -> Vec<u16> {
    let mut words = Vec::with_capacity(bytes.len() * 2 / 3);
    for chunk in bytes.chunks_exact(3) {
        words.push((u16::from(chunk[0]) << 4) | u16::from(chunk[1] >> 4));
        words.push((u16::from(chunk[1] & 0x0F) << 8) | u16::from(chunk[2]));
    }
    words
}
