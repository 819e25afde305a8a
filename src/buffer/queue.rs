//! # Buffer Queue Implementation
//!
//! A thread-safe FIFO that can make the remover wait.
//!
//! ## Plain English
//!
//! Picture a ticket line at a counter. New tickets join at the back, the
//! clerk always serves the front. If the line is empty the clerk can either
//! say "nobody here" right away or sit and wait for the next customer.
//! At closing time the clerk serves whoever is still in line, then goes home.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{PipelineError, PipelineResult, PoolErrorKind};

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// A FIFO queue guarded by its own lock.
///
/// ## Properties
/// - `enqueue` never blocks and always succeeds
/// - removal is oldest-first
/// - blocking removal wakes on enqueue or close
/// - each instance has an independent lock
#[derive(Debug)]
pub struct BufferQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

impl<T> BufferQueue<T> {
    /// Creates an empty queue.
    ///
    /// ## Example
    /// ```
    /// # use reelpipe::buffer::BufferQueue;
    /// let queue: BufferQueue<i32> = BufferQueue::new();
    /// assert!(queue.is_empty());
    /// ```
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty queue with room for `capacity` items before it
    /// has to reallocate.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Appends an item at the tail.
    ///
    /// Still accepted after `close`, so buffers coming home during teardown
    /// are not lost.
    pub fn enqueue(&self, item: T) {
        let mut state = self.state.lock();
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
    }

    /// Appends an item unless the queue is closed, in which case the item
    /// is handed back.
    pub fn try_enqueue(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Removes the oldest item without waiting.
    pub fn dequeue_oldest(&self) -> PipelineResult<T> {
        let mut state = self.state.lock();
        match state.items.pop_front() {
            Some(item) => Ok(item),
            None if state.closed => Err(PipelineError::Pool(PoolErrorKind::QueueClosed)),
            None => Err(PipelineError::Pool(PoolErrorKind::QueueEmpty)),
        }
    }

    /// Removes the oldest item, waiting as long as it takes.
    ///
    /// Fails only once the queue is closed AND empty.
    pub fn dequeue_oldest_blocking(&self) -> PipelineResult<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Ok(item);
            }
            if state.closed {
                return Err(PipelineError::Pool(PoolErrorKind::QueueClosed));
            }
            self.available.wait(&mut state);
        }
    }

    /// Removes the oldest item, waiting at most `timeout`.
    pub fn dequeue_oldest_timeout(&self, timeout: Duration) -> PipelineResult<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Ok(item);
            }
            if state.closed {
                return Err(PipelineError::Pool(PoolErrorKind::QueueClosed));
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                // One last look: an enqueue may have raced the deadline
                return state
                    .items
                    .pop_front()
                    .ok_or(PipelineError::Pool(PoolErrorKind::QueueTimeout(timeout)));
            }
        }
    }

    /// Marks the queue closed and wakes every waiter.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    /// Returns true once `close` was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns the number of items currently queued.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Removes every item, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.state.lock().items.drain(..).collect()
    }
}

impl<T> Default for BufferQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================
// TESTS
// ============================================
