//! # Queue Controller
//!
//! Owns the buffer pool and the free/filled queue pair.
//!
//! ## Plain English
//!
//! Think of a restaurant with a fixed set of plates. Clean plates sit on
//! the "free" shelf, plates with food wait on the "filled" pass, and the
//! controller keeps a clipboard saying where every numbered plate is right
//! now. A plate that comes back twice, or a plate from another restaurant,
//! gets turned away at the door.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::frame::{FrameBuffer, PixelFormat, RenderContext, TimestampedFrame};
use super::queue::BufferQueue;
use crate::config::DrainMode;
use crate::error::{PipelineError, PipelineResult, PoolErrorKind, Rejected, SubmissionErrorKind};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

// ============================================
// LOAN TABLE
// ============================================

/// Where a pool slot currently lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotLocation {
    /// Waiting in the free queue
    Free,
    /// Taken by the producer, being painted
    WithProducer,
    /// Waiting in the filled queue
    Filled,
    /// Taken by the exporter, being encoded
    WithEncoder,
    /// Dropped during pool teardown
    Released,
}

impl fmt::Display for SlotLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "free",
            Self::WithProducer => "with the producer",
            Self::Filled => "filled",
            Self::WithEncoder => "with the encoder",
            Self::Released => "released",
        };
        f.write_str(name)
    }
}

/// Snapshot of where every pool slot is.
///
/// The four counts always add up to the pool size while the pool is alive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolCensus {
    pub free: usize,
    pub filled: usize,
    pub with_producer: usize,
    pub with_encoder: usize,
}

impl PoolCensus {
    pub fn total(&self) -> usize {
        self.free + self.filled + self.with_producer + self.with_encoder
    }

    /// Buffers held outside both queues.
    pub fn in_flight(&self) -> usize {
        self.with_producer + self.with_encoder
    }
}

// ============================================
// QUEUE CONTROLLER
// ============================================

/// Free/filled queue pair over a fixed pool of frame buffers.
pub struct QueueController {
    pool_id: u64,
    width: u32,
    height: u32,
    format: PixelFormat,
    free: BufferQueue<FrameBuffer>,
    filled: BufferQueue<TimestampedFrame>,
    filled_mode: DrainMode,
    /// Indexed by slot; may be held while taking a queue lock, never the
    /// other way round
    loans: Mutex<Vec<SlotLocation>>,
    /// Newest timestamp accepted into the filled queue
    last_filled: Mutex<Option<f64>>,
}

impl QueueController {
    /// Builds a pool of `buffer_count` RGBA buffers and puts them all in the
    /// free queue.
    pub fn initialize(
        buffer_count: usize,
        width: u32,
        height: u32,
        context: &dyn RenderContext,
    ) -> PipelineResult<Self> {
        Self::initialize_with_format(buffer_count, width, height, PixelFormat::Rgba8, context)
    }

    /// Same as [`initialize`](Self::initialize) with an explicit pixel format.
    ///
    /// ## What Happens (Plain English)
    ///
    /// 1. Ask the render context for `buffer_count` canvases
    /// 2. If any request fails, throw away the ones we already got
    /// 3. Otherwise number them 0..N and line them up on the free shelf
    pub fn initialize_with_format(
        buffer_count: usize,
        width: u32,
        height: u32,
        format: PixelFormat,
        context: &dyn RenderContext,
    ) -> PipelineResult<Self> {
        if buffer_count == 0 {
            return Err(PipelineError::AllocationFailure {
                index: 0,
                reason: "pool needs at least one buffer".to_string(),
            });
        }

        let pool_id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let frame_bytes = format.frame_bytes(width, height);

        log::info!(
            "Creating buffer pool {}: {} x {}x{} {:?} = {:.1} MB",
            pool_id,
            buffer_count,
            width,
            height,
            format,
            (buffer_count * frame_bytes) as f64 / (1024.0 * 1024.0)
        );

        let mut buffers = Vec::with_capacity(buffer_count);
        for index in 0..buffer_count {
            match context.allocate(width, height, format) {
                Ok(pixels) if pixels.len() == frame_bytes => {
                    buffers.push(FrameBuffer::new(pool_id, index, width, height, format, pixels));
                }
                Ok(pixels) => {
                    log::warn!(
                        "Releasing {} partially built buffers after short allocation",
                        buffers.len()
                    );
                    return Err(PipelineError::AllocationFailure {
                        index,
                        reason: format!(
                            "context returned {} bytes, expected {}",
                            pixels.len(),
                            frame_bytes
                        ),
                    });
                }
                Err(reason) => {
                    log::warn!(
                        "Releasing {} partially built buffers after allocation failure",
                        buffers.len()
                    );
                    return Err(PipelineError::AllocationFailure { index, reason });
                }
            }
        }

        let free = BufferQueue::with_capacity(buffer_count);
        for buffer in buffers {
            free.enqueue(buffer);
        }

        Ok(Self {
            pool_id,
            width,
            height,
            format,
            free,
            filled: BufferQueue::with_capacity(buffer_count),
            filled_mode: DrainMode::Blocking,
            loans: Mutex::new(vec![SlotLocation::Free; buffer_count]),
            last_filled: Mutex::new(None),
        })
    }

    /// Chooses how `remove_oldest_from_filled` treats an empty queue.
    pub fn with_filled_mode(mut self, mode: DrainMode) -> Self {
        self.filled_mode = mode;
        self
    }

    // ----------------------------------------
    // PRODUCER SIDE
    // ----------------------------------------

    /// Takes the oldest free buffer, waiting until one comes back if needed.
    ///
    /// This wait is the backpressure: the producer can never get ahead of
    /// the encoder by more than the pool size.
    pub fn remove_oldest_from_free(&self) -> PipelineResult<FrameBuffer> {
        let buffer = self.free.dequeue_oldest_blocking()?;
        self.mark(buffer.index(), SlotLocation::WithProducer);
        Ok(buffer)
    }

    /// Takes the oldest free buffer or fails with `QueueEmpty`.
    pub fn try_remove_oldest_from_free(&self) -> PipelineResult<FrameBuffer> {
        let buffer = self.free.dequeue_oldest()?;
        self.mark(buffer.index(), SlotLocation::WithProducer);
        Ok(buffer)
    }

    /// Takes the oldest free buffer, waiting at most `timeout`.
    pub fn remove_oldest_from_free_timeout(&self, timeout: Duration) -> PipelineResult<FrameBuffer> {
        let buffer = self.free.dequeue_oldest_timeout(timeout)?;
        self.mark(buffer.index(), SlotLocation::WithProducer);
        Ok(buffer)
    }

    /// Queues a painted frame for the exporter.
    ///
    /// Timestamps must be finite and never go backwards; equal ones are
    /// fine. Refused once the queue is closed for teardown. A refused frame
    /// comes back untouched and the pool counts don't change.
    pub fn add_to_filled(&self, frame: TimestampedFrame) -> Result<(), Rejected<TimestampedFrame>> {
        // Held until the frame is queued so concurrent inserts stay ordered
        let mut last = self.last_filled.lock();

        if let Err(kind) = check_timestamp(frame.timestamp, *last) {
            log::warn!("Refused filled frame: {}", kind);
            return Err(Rejected::new(PipelineError::Submission(kind), frame));
        }

        if let Err(kind) = self.check_return(&frame.buffer, SlotLocation::Filled) {
            return Err(Rejected::new(PipelineError::Pool(kind), frame));
        }

        let timestamp = frame.timestamp;
        match self.filled.try_enqueue(frame) {
            Ok(()) => {
                *last = Some(timestamp);
                Ok(())
            }
            Err(frame) => {
                self.mark(frame.buffer.index(), SlotLocation::WithProducer);
                Err(Rejected::new(
                    PipelineError::Pool(PoolErrorKind::QueueClosed),
                    frame,
                ))
            }
        }
    }

    // ----------------------------------------
    // CONSUMER SIDE
    // ----------------------------------------

    /// Takes the oldest filled frame according to the configured drain mode.
    pub fn remove_oldest_from_filled(&self) -> PipelineResult<TimestampedFrame> {
        let frame = match self.filled_mode {
            DrainMode::Blocking => self.filled.dequeue_oldest_blocking()?,
            DrainMode::NonBlocking => self.filled.dequeue_oldest()?,
        };
        self.mark(frame.buffer.index(), SlotLocation::WithEncoder);
        Ok(frame)
    }

    /// Puts a buffer back on the free shelf.
    ///
    /// Called by the completion thread after encoding, or by the producer
    /// to hand back a buffer it decided not to use.
    pub fn add_to_free(&self, buffer: FrameBuffer) -> Result<(), Rejected<FrameBuffer>> {
        if let Err(kind) = self.check_return(&buffer, SlotLocation::Free) {
            return Err(Rejected::new(PipelineError::Pool(kind), buffer));
        }
        self.free.enqueue(buffer);
        Ok(())
    }

    // ----------------------------------------
    // TEARDOWN
    // ----------------------------------------

    /// Closes both queues, waking anyone blocked on them.
    ///
    /// Buffers can still be returned to the free queue afterwards.
    pub fn close(&self) {
        log::debug!("Closing queues of pool {}", self.pool_id);
        self.free.close();
        self.filled.close();
    }

    /// Drops every pooled buffer.
    ///
    /// Refuses (and releases nothing) while any buffer is still loaned out,
    /// so a buffer is never freed under a pending completion. Releasing an
    /// already released pool returns 0.
    pub fn release(&self) -> PipelineResult<usize> {
        self.close();

        let mut loans = self.loans.lock();
        if loans.iter().all(|l| *l == SlotLocation::Released) {
            return Ok(0);
        }

        let in_flight = loans
            .iter()
            .filter(|l| matches!(l, SlotLocation::WithProducer | SlotLocation::WithEncoder))
            .count();
        if in_flight > 0 {
            return Err(PipelineError::Pool(PoolErrorKind::BuffersInFlight { count: in_flight }));
        }

        let free = self.free.drain();
        let filled = self.filled.drain();
        let released = free.len() + filled.len();

        // A removal can sit between its dequeue and its loan-table update
        if released < loans.len() {
            let missing = loans.len() - released;
            for buffer in free {
                self.free.enqueue(buffer);
            }
            for frame in filled {
                self.filled.enqueue(frame);
            }
            return Err(PipelineError::Pool(PoolErrorKind::BuffersInFlight { count: missing }));
        }

        for location in loans.iter_mut() {
            *location = SlotLocation::Released;
        }
        drop(loans);

        if !filled.is_empty() {
            log::warn!("Releasing {} frames that were never encoded", filled.len());
        }
        log::info!("Released {} buffers of pool {}", released, self.pool_id);
        Ok(released)
    }

    // ----------------------------------------
    // OBSERVERS
    // ----------------------------------------

    /// Counts slots by location.
    pub fn census(&self) -> PoolCensus {
        let loans = self.loans.lock();
        let mut census = PoolCensus::default();
        for location in loans.iter() {
            match location {
                SlotLocation::Free => census.free += 1,
                SlotLocation::Filled => census.filled += 1,
                SlotLocation::WithProducer => census.with_producer += 1,
                SlotLocation::WithEncoder => census.with_encoder += 1,
                SlotLocation::Released => {}
            }
        }
        census
    }

    /// Where slot `index` is right now.
    pub fn location_of(&self, index: usize) -> Option<SlotLocation> {
        self.loans.lock().get(index).copied()
    }

    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub fn pool_size(&self) -> usize {
        self.loans.lock().len()
    }

    /// Width, height and pixel format shared by every buffer.
    pub fn geometry(&self) -> (u32, u32, PixelFormat) {
        (self.width, self.height, self.format)
    }

    pub fn filled_mode(&self) -> DrainMode {
        self.filled_mode
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn filled_len(&self) -> usize {
        self.filled.len()
    }

    // ----------------------------------------
    // INTERNALS
    // ----------------------------------------

    fn mark(&self, index: usize, location: SlotLocation) {
        if let Some(slot) = self.loans.lock().get_mut(index) {
            *slot = location;
        }
    }

    /// Validates a buffer coming back into a queue and records its new spot.
    fn check_return(&self, buffer: &FrameBuffer, to: SlotLocation) -> Result<(), PoolErrorKind> {
        let index = buffer.index();
        let foreign = PoolErrorKind::ForeignBuffer {
            pool_id: buffer.pool_id(),
            index,
        };
        if buffer.pool_id() != self.pool_id {
            return Err(foreign);
        }

        let mut loans = self.loans.lock();
        let current = *loans.get(index).ok_or(foreign.clone())?;

        let allowed = match (current, to) {
            (SlotLocation::WithProducer, SlotLocation::Filled) => Ok(()),
            (SlotLocation::WithProducer | SlotLocation::WithEncoder, SlotLocation::Free) => Ok(()),
            (SlotLocation::Free | SlotLocation::Filled, _) => {
                Err(PoolErrorKind::DoubleReturn { index })
            }
            (SlotLocation::Released, _) => Err(foreign),
            (location, _) => Err(PoolErrorKind::InvalidReturn { index, location }),
        };

        match allowed {
            Ok(()) => {
                loans[index] = to;
                Ok(())
            }
            Err(kind) => {
                log::warn!("Rejected buffer return: {}", kind);
                Err(kind)
            }
        }
    }
}

fn check_timestamp(timestamp: f64, last: Option<f64>) -> Result<(), SubmissionErrorKind> {
    if !timestamp.is_finite() {
        return Err(SubmissionErrorKind::InvalidTimestamp(timestamp));
    }
    match last {
        Some(previous) if timestamp < previous => Err(SubmissionErrorKind::OutOfOrder {
            previous,
            got: timestamp,
        }),
        _ => Ok(()),
    }
}

impl fmt::Debug for QueueController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueController")
            .field("pool_id", &self.pool_id)
            .field("geometry", &(self.width, self.height, self.format))
            .field("filled_mode", &self.filled_mode)
            .field("census", &self.census())
            .finish()
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::HeapRenderContext;
    use std::sync::Arc;
    use std::thread;

    fn pool(count: usize) -> QueueController {
        QueueController::initialize(count, 64, 64, &HeapRenderContext::new()).unwrap()
    }

    #[test]
    fn test_initialize_fills_free_queue() {
        let controller = pool(3);
        assert_eq!(controller.free_len(), 3);
        assert_eq!(controller.filled_len(), 0);
        assert_eq!(controller.pool_size(), 3);
        assert_eq!(
            controller.census(),
            PoolCensus {
                free: 3,
                ..PoolCensus::default()
            }
        );
    }

    #[test]
    fn test_allocation_failure() {
        // Room for two 64x64 RGBA buffers, not three
        let context = HeapRenderContext::with_budget(2 * 64 * 64 * 4);
        match QueueController::initialize(3, 64, 64, &context) {
            Err(PipelineError::AllocationFailure { index, .. }) => assert_eq!(index, 2),
            other => panic!("expected AllocationFailure, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_buffers_is_allocation_failure() {
        let result = QueueController::initialize(0, 64, 64, &HeapRenderContext::new());
        assert!(matches!(result, Err(PipelineError::AllocationFailure { .. })));
    }

    #[test]
    fn test_full_cycle_census() {
        let controller = pool(3);

        let buffer = controller.remove_oldest_from_free().unwrap();
        assert_eq!(controller.free_len(), 2);
        assert_eq!(controller.census().with_producer, 1);

        controller
            .add_to_filled(TimestampedFrame::new(buffer, 0.0))
            .unwrap();
        assert_eq!(controller.filled_len(), 1);
        assert_eq!(controller.census().filled, 1);

        let frame = controller.remove_oldest_from_filled().unwrap();
        assert_eq!(controller.filled_len(), 0);
        assert_eq!(controller.census().with_encoder, 1);

        controller.add_to_free(frame.into_buffer()).unwrap();
        assert_eq!(controller.free_len(), 3);
        assert_eq!(controller.census().total(), 3);
    }

    #[test]
    fn test_free_order_is_fifo() {
        let controller = pool(3);
        let indices: Vec<_> = (0..3)
            .map(|_| controller.remove_oldest_from_free().unwrap().index())
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_foreign_buffer_rejected() {
        let ours = pool(2);
        let theirs = pool(2);

        let stranger = theirs.remove_oldest_from_free().unwrap();
        let rejected = ours.add_to_free(stranger).unwrap_err();
        assert!(matches!(
            rejected.error(),
            PipelineError::Pool(PoolErrorKind::ForeignBuffer { .. })
        ));

        // The stranger can still go home
        theirs.add_to_free(rejected.into_inner()).unwrap();
        assert_eq!(theirs.free_len(), 2);
        assert_eq!(ours.free_len(), 2);
    }

    #[test]
    fn test_double_return_rejected() {
        let controller = pool(2);
        let buffer = controller.remove_oldest_from_free().unwrap();
        let index = buffer.index();

        // Forge a second handle to the same slot
        let forged = FrameBuffer::new(
            controller.pool_id(),
            index,
            64,
            64,
            PixelFormat::Rgba8,
            vec![0u8; 64 * 64 * 4],
        );

        controller.add_to_free(buffer).unwrap();
        let rejected = controller.add_to_free(forged).unwrap_err();
        assert!(matches!(
            rejected.error(),
            PipelineError::Pool(PoolErrorKind::DoubleReturn { .. })
        ));
        assert_eq!(controller.free_len(), 2);
    }

    #[test]
    fn test_encoder_buffer_cannot_refill() {
        let controller = pool(1);
        let buffer = controller.remove_oldest_from_free().unwrap();
        controller
            .add_to_filled(TimestampedFrame::new(buffer, 0.0))
            .unwrap();
        let frame = controller.remove_oldest_from_filled().unwrap();

        let rejected = controller.add_to_filled(frame).unwrap_err();
        assert!(matches!(
            rejected.error(),
            PipelineError::Pool(PoolErrorKind::InvalidReturn { .. })
        ));
    }

    #[test]
    fn test_exhausted_free_queue_blocks() {
        let controller = Arc::new(pool(3));
        let held: Vec<_> = (0..3)
            .map(|_| controller.remove_oldest_from_free().unwrap())
            .collect();

        let waiter = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.remove_oldest_from_free())
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        assert_eq!(controller.census().with_producer, 3);

        let mut held = held.into_iter();
        let first = held.next().unwrap();
        let first_index = first.index();
        controller.add_to_free(first).unwrap();

        let got = waiter.join().unwrap().unwrap();
        assert_eq!(got.index(), first_index);
        assert_eq!(controller.census().total(), 3);
    }

    #[test]
    fn test_non_blocking_filled_mode() {
        let controller = pool(1).with_filled_mode(DrainMode::NonBlocking);
        assert!(matches!(
            controller.remove_oldest_from_filled(),
            Err(PipelineError::Pool(PoolErrorKind::QueueEmpty))
        ));
    }

    #[test]
    fn test_try_remove_from_empty_free() {
        let controller = pool(1);
        let _held = controller.try_remove_oldest_from_free().unwrap();
        assert!(matches!(
            controller.try_remove_oldest_from_free(),
            Err(PipelineError::Pool(PoolErrorKind::QueueEmpty))
        ));
        assert!(matches!(
            controller.remove_oldest_from_free_timeout(Duration::from_millis(10)),
            Err(PipelineError::Pool(PoolErrorKind::QueueTimeout(_)))
        ));
    }

    #[test]
    fn test_release_refuses_while_in_flight() {
        let controller = pool(2);
        let buffer = controller.remove_oldest_from_free().unwrap();

        assert!(matches!(
            controller.release(),
            Err(PipelineError::Pool(PoolErrorKind::BuffersInFlight { count: 1 }))
        ));

        controller.add_to_free(buffer).unwrap();
        assert_eq!(controller.release().unwrap(), 2);
        assert_eq!(controller.census().total(), 0);
        assert_eq!(controller.location_of(0), Some(SlotLocation::Released));
    }

    #[test]
    fn test_filled_rejects_out_of_order() {
        let controller = pool(3);

        let first = controller.remove_oldest_from_free().unwrap();
        controller
            .add_to_filled(TimestampedFrame::new(first, 0.2))
            .unwrap();

        let late = controller.remove_oldest_from_free().unwrap();
        let before = controller.census();
        let rejected = controller
            .add_to_filled(TimestampedFrame::new(late, 0.1))
            .unwrap_err();

        assert!(matches!(
            rejected.error(),
            PipelineError::Submission(SubmissionErrorKind::OutOfOrder { .. })
        ));
        assert_eq!(controller.census(), before);
        assert_eq!(controller.filled_len(), 1);

        // Same buffer, equal timestamp: accepted
        let buffer = rejected.into_inner().into_buffer();
        controller
            .add_to_filled(TimestampedFrame::new(buffer, 0.2))
            .unwrap();
        assert_eq!(controller.filled_len(), 2);
    }

    #[test]
    fn test_filled_rejects_non_finite_timestamp() {
        let controller = pool(1);
        let buffer = controller.remove_oldest_from_free().unwrap();

        let rejected = controller
            .add_to_filled(TimestampedFrame::new(buffer, f64::INFINITY))
            .unwrap_err();
        assert!(matches!(
            rejected.error(),
            PipelineError::Submission(SubmissionErrorKind::InvalidTimestamp(_))
        ));
        assert_eq!(controller.census().with_producer, 1);
    }

    #[test]
    fn test_filled_refused_after_close() {
        let controller = pool(2);
        let buffer = controller.remove_oldest_from_free().unwrap();
        let index = buffer.index();
        controller.close();

        let rejected = controller
            .add_to_filled(TimestampedFrame::new(buffer, 0.0))
            .unwrap_err();
        assert!(matches!(
            rejected.error(),
            PipelineError::Pool(PoolErrorKind::QueueClosed)
        ));
        assert_eq!(controller.location_of(index), Some(SlotLocation::WithProducer));
        assert_eq!(controller.filled_len(), 0);

        // Still allowed home so teardown can release it
        controller
            .add_to_free(rejected.into_inner().into_buffer())
            .unwrap();
        assert_eq!(controller.release().unwrap(), 2);
    }

    #[test]
    fn test_release_counts_drained_buffers() {
        let controller = pool(2);

        // Dequeued but not yet marked as loaned
        let buffer = controller.free.dequeue_oldest().unwrap();
        assert_eq!(controller.census().free, 2);

        assert!(matches!(
            controller.release(),
            Err(PipelineError::Pool(PoolErrorKind::BuffersInFlight { count: 1 }))
        ));
        assert_eq!(controller.free_len(), 1);
        assert_eq!(controller.location_of(0), Some(SlotLocation::Free));

        controller.free.enqueue(buffer);
        assert_eq!(controller.release().unwrap(), 2);
        assert_eq!(controller.release().unwrap(), 0);
    }

    #[test]
    fn test_close_unblocks_producer() {
        let controller = Arc::new(pool(1));
        let _held = controller.remove_oldest_from_free().unwrap();

        let waiter = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.remove_oldest_from_free())
        };
        thread::sleep(Duration::from_millis(20));
        controller.close();

        assert!(matches!(
            waiter.join().unwrap(),
            Err(PipelineError::Pool(PoolErrorKind::QueueClosed))
        ));
    }
}
