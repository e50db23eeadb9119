// SPDX-License-Identifier: GPL-3.0-only

//! The bridge's image buffer pool
//!
//! One mutex guards the queue; a condition variable signals both "a buffer
//! became available" and "the pool has drained". Buffers are identified by
//! id and reallocation generation, so a stale buffer from before a use-case
//! switch cannot be queued into the new pool.
//!
//! A buffer that is never returned (a misbehaving listener at shutdown)
//! simply stays allocated wherever it is owned; leaking it is preferred
//! over freeing memory another thread may still touch.

use crate::bridge::CaptureBuffer;
use crate::errors::{CoreError, CoreResult};
use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use tracing::{debug, warn};

/// Hard cap on the buffer count, regardless of the caller's preference
const MAX_BUFFER_COUNT: usize = 32;

#[derive(Default)]
struct PoolState {
    queued: Vec<CaptureBuffer>,
    queued_ids: HashSet<usize>,
    allocated: usize,
    buffer_words: usize,
    generation: u64,
    change_in_progress: bool,
}

/// Fixed-size pool of capture buffers
#[derive(Default)]
pub struct BufferPool {
    state: Mutex<PoolState>,
    condition: Condvar,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resize the pool for a new use case.
    ///
    /// Waits for all outstanding buffers to come back (no timeout: blocking
    /// on a misbehaving listener is preferred over reusing memory it still
    /// holds), drops the old allocation and queues fresh buffers. Returns
    /// the allocated count, which may be less than preferred.
    pub fn reallocate(&self, buffer_words: usize, preferred_count: usize) -> CoreResult<usize> {
        if buffer_words == 0 || preferred_count == 0 {
            return Err(CoreError::InvalidValue(
                "buffer pool needs a nonzero geometry".to_string(),
            ));
        }
        let count = preferred_count.min(MAX_BUFFER_COUNT);

        let mut state = self.lock();
        state.change_in_progress = true;
        while state.queued.len() != state.allocated {
            debug!(
                queued = state.queued.len(),
                allocated = state.allocated,
                "waiting for outstanding buffers before reallocation"
            );
            state = self
                .condition
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }

        state.queued.clear();
        state.queued_ids.clear();
        state.generation += 1;
        state.buffer_words = buffer_words;
        state.allocated = count;
        let generation = state.generation;
        for id in 0..count {
            state
                .queued
                .push(CaptureBuffer::new(id, generation, buffer_words));
            state.queued_ids.insert(id);
        }
        state.change_in_progress = false;
        self.condition.notify_all();

        debug!(count, words = buffer_words, "buffer pool reallocated");
        Ok(count)
    }

    /// Take an available buffer, or `None` when the pool is empty or a
    /// reallocation is in progress. Never blocks; the acquisition path
    /// drops data instead of stalling the transport.
    pub fn try_dequeue(&self) -> Option<CaptureBuffer> {
        let mut state = self.lock();
        if state.change_in_progress {
            return None;
        }
        let buffer = state.queued.pop()?;
        state.queued_ids.remove(&buffer.id());
        Some(buffer)
    }

    /// Return a buffer to the pool.
    ///
    /// Double-queueing and buffers from a previous allocation are contract
    /// violations; stale buffers are dropped after the error is reported.
    pub fn queue_buffer(&self, buffer: CaptureBuffer) -> CoreResult<()> {
        let mut state = self.lock();
        if buffer.generation() != state.generation || buffer.id() >= state.allocated {
            warn!(
                id = buffer.id(),
                generation = buffer.generation(),
                "discarding buffer from a previous allocation"
            );
            return Err(CoreError::Logic(
                "queueing a buffer that was not allocated by this pool".to_string(),
            ));
        }
        if !state.queued_ids.insert(buffer.id()) {
            return Err(CoreError::Logic(
                "queueing an already-queued buffer".to_string(),
            ));
        }
        state.queued.push(buffer);
        self.condition.notify_all();
        Ok(())
    }

    /// Block until every allocated buffer is back in the queue
    pub fn wait_capture_buffer_dealloc(&self) {
        let mut state = self.lock();
        while state.queued.len() != state.allocated {
            state = self
                .condition
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Number of buffers currently waiting in the queue
    pub fn queued_count(&self) -> usize {
        self.lock().queued.len()
    }

    pub fn allocated_count(&self) -> usize {
        self.lock().allocated
    }

    /// True when every allocated buffer is queued
    pub fn is_drained(&self) -> bool {
        let state = self.lock();
        state.queued.len() == state.allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_reallocate_and_dequeue() {
        let pool = BufferPool::new();
        assert_eq!(pool.reallocate(100, 4).expect("reallocate"), 4);
        assert_eq!(pool.queued_count(), 4);

        let buffer = pool.try_dequeue().expect("buffer available");
        assert_eq!(buffer.data().len(), 100);
        assert_eq!(pool.queued_count(), 3);
        pool.queue_buffer(buffer).expect("queue");
        assert_eq!(pool.queued_count(), 4);
    }

    #[test]
    fn test_preferred_count_is_capped() {
        let pool = BufferPool::new();
        assert_eq!(pool.reallocate(16, 1000).expect("reallocate"), 32);
    }

    #[test]
    fn test_empty_pool_does_not_block() {
        let pool = BufferPool::new();
        pool.reallocate(16, 1).expect("reallocate");
        let first = pool.try_dequeue().expect("buffer");
        assert!(pool.try_dequeue().is_none());
        pool.queue_buffer(first).expect("queue");
    }

    #[test]
    fn test_double_queue_is_rejected() {
        let pool = BufferPool::new();
        pool.reallocate(16, 2).expect("reallocate");
        let buffer = pool.try_dequeue().expect("buffer");
        let impostor = CaptureBuffer::new(buffer.id(), buffer.generation(), 16);
        pool.queue_buffer(buffer).expect("queue");
        assert!(matches!(
            pool.queue_buffer(impostor),
            Err(CoreError::Logic(_))
        ));
    }

    #[test]
    fn test_stale_generation_is_rejected() {
        let pool = BufferPool::new();
        pool.reallocate(16, 2).expect("reallocate");
        let stale = pool.try_dequeue().expect("buffer");
        pool.queue_buffer(CaptureBuffer::new(stale.id(), stale.generation(), 16))
            .expect("give the id back so reallocation can proceed");
        pool.reallocate(16, 2).expect("second allocation");
        assert!(matches!(
            pool.queue_buffer(stale),
            Err(CoreError::Logic(_))
        ));
    }

    #[test]
    fn test_reallocate_waits_for_outstanding_buffers() {
        let pool = Arc::new(BufferPool::new());
        pool.reallocate(16, 2).expect("reallocate");
        let outstanding = pool.try_dequeue().expect("buffer");

        let pool_clone = Arc::clone(&pool);
        let returner = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            pool_clone.queue_buffer(outstanding).expect("queue");
        });

        // blocks until the other thread returns the buffer
        assert_eq!(pool.reallocate(32, 2).expect("reallocate"), 2);
        returner.join().expect("thread");
        assert_eq!(pool.queued_count(), 2);
        assert!(pool.is_drained());
    }

    #[test]
    fn test_drain_wait() {
        let pool = Arc::new(BufferPool::new());
        pool.reallocate(16, 1).expect("reallocate");
        let buffer = pool.try_dequeue().expect("buffer");
        assert!(!pool.is_drained());

        let pool_clone = Arc::clone(&pool);
        let returner = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            pool_clone.queue_buffer(buffer).expect("queue");
        });
        pool.wait_capture_buffer_dealloc();
        assert!(pool.is_drained());
        returner.join().expect("thread");
    }
}
