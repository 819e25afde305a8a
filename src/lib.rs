//! # reelpipe
//!
//! A bounded frame-buffer pipeline that streams timestamped video frames
//! into a movie file.
//!
//! ## Architecture Overview
//!
//! The crate is structured into independent modules:
//!
//! - `buffer`: Fixed buffer pool, free/filled queues and the loan table
//! - `encoder`: Codec trait plus Motion-JPEG and raw codecs
//! - `container`: The `.reel` movie file writer and reader
//! - `exporter`: Compression session and its completion thread
//! - `storage`: Output file naming and directories
//! - `config`: Pipeline configuration
//! - `error`: Error types
//!
//! ```text
//!   producer ──acquire──▶ paint ──submit──▶ [filled] ──drain thread──▶ exporter
//!       ▲                                                               │
//!       └────────────────────── [free] ◀──── completion thread ◀────────┘
//! ```

// ============================================
// MODULE DECLARATIONS
// ============================================

pub mod buffer;
pub mod config;
pub mod container;
pub mod encoder;
pub mod error;
pub mod exporter;
pub mod storage;

// ============================================
// RE-EXPORTS
// ============================================

pub use buffer::{
    FrameBuffer, HeapRenderContext, PixelFormat, PoolCensus, QueueController, RenderContext,
    TimestampedFrame,
};
pub use config::{DrainMode, PipelineConfig};
pub use container::{MovieFileWriter, MovieReader};
pub use encoder::{CodecType, CompressionOptions};
pub use error::{PipelineError, PipelineResult, Rejected};
pub use exporter::{ExportStats, MovieExporter, SessionState};

// ============================================
// IMPORTS
// ============================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{error, info, warn};
use parking_lot::Mutex;

use error::{PoolErrorKind, SubmissionErrorKind};

// ============================================
// CAPTURE PIPELINE
// ============================================

/// A running pipeline: buffer pool, compression session and (optionally)
/// a drain thread feeding one into the other.
///
/// ## Plain English
///
/// This is the "control center". The producer borrows blank buffers,
/// paints them and hands them back with a timestamp. Everything after
/// that (queueing, encoding, writing, recycling) happens behind the scenes.
pub struct CapturePipeline {
    config: PipelineConfig,

    /// Owns the buffers and both queues
    controller: Arc<QueueController>,

    /// Compression session writing the output file
    exporter: Arc<MovieExporter>,

    /// Calls `export_next` until the filled queue closes
    drain: Mutex<Option<JoinHandle<()>>>,

    /// Cleared when shutdown starts; producer inserts are refused after
    accepting: AtomicBool,

    /// Held for the whole teardown; true once it has run
    shut_down: Mutex<bool>,

    frames_submitted: AtomicU64,
    frames_refused: AtomicU64,
}

/// Runtime statistics for monitoring
#[derive(Debug, Clone)]
pub struct PipelineStats {
    /// Frames the producer handed to the filled queue
    pub frames_submitted: u64,
    /// Producer submissions that were refused
    pub frames_refused: u64,
    /// Compression session counters
    pub export: ExportStats,
    /// Where the buffers are right now
    pub census: PoolCensus,
}

impl CapturePipeline {
    /// Validates `config`, allocates the pool, opens the output file and
    /// starts the drain thread if asked to.
    pub fn start(config: PipelineConfig, context: &dyn RenderContext) -> PipelineResult<Self> {
        let errors = config.validate();
        if let Some(first) = errors.first() {
            for e in &errors {
                warn!("Invalid configuration: {}", e);
            }
            return Err(PipelineError::Config(first.clone()));
        }

        info!(
            "Starting pipeline: {} x {}x{} {:?} buffers (~{:.1} MB), {:?} -> {:?}",
            config.pool_size,
            config.width,
            config.height,
            config.pixel_format,
            config.estimated_memory_mb(),
            config.codec,
            config.output_path
        );

        let controller = Arc::new(
            QueueController::initialize_with_format(
                config.pool_size,
                config.width,
                config.height,
                config.pixel_format,
                context,
            )?
            .with_filled_mode(config.filled_mode),
        );

        let exporter = Arc::new(MovieExporter::initialize(
            &config.output_path,
            config.codec,
            config.width,
            config.height,
            config.options,
            Arc::clone(&controller),
        )?);

        let drain = if config.drain_thread {
            let exporter = Arc::clone(&exporter);
            let handle = thread::Builder::new()
                .name("reelpipe-drain".to_string())
                .spawn(move || drain_loop(&exporter))
                .map_err(|e| {
                    PipelineError::SessionCreationFailure(format!(
                        "cannot start drain thread: {}",
                        e
                    ))
                })?;
            Some(handle)
        } else {
            None
        };

        Ok(Self {
            config,
            controller,
            exporter,
            drain: Mutex::new(drain),
            accepting: AtomicBool::new(true),
            shut_down: Mutex::new(false),
            frames_submitted: AtomicU64::new(0),
            frames_refused: AtomicU64::new(0),
        })
    }

    // ----------------------------------------
    // PRODUCER API
    // ----------------------------------------

    /// Borrows a blank buffer, waiting if every buffer is busy.
    ///
    /// Honours `acquire_timeout` from the configuration.
    pub fn acquire_buffer(&self) -> PipelineResult<FrameBuffer> {
        self.ensure_accepting()?;
        let buffer = match self.config.acquire_timeout {
            Some(timeout) => self.controller.remove_oldest_from_free_timeout(timeout)?,
            None => self.controller.remove_oldest_from_free()?,
        };
        self.keep_if_accepting(buffer)
    }

    /// Borrows a blank buffer or fails with `QueueEmpty` right away.
    pub fn try_acquire_buffer(&self) -> PipelineResult<FrameBuffer> {
        self.ensure_accepting()?;
        let buffer = self.controller.try_remove_oldest_from_free()?;
        self.keep_if_accepting(buffer)
    }

    /// Hands a painted buffer to the pipeline.
    ///
    /// Refused, with the frame handed back, if the timestamp is not finite
    /// or is older than the previous submission, or once shutdown started.
    /// Geometry is checked later by the exporter; a frame refused there is
    /// logged and its buffer recycled.
    pub fn submit_frame(
        &self,
        buffer: FrameBuffer,
        timestamp: f64,
    ) -> Result<(), Rejected<TimestampedFrame>> {
        let frame = TimestampedFrame::new(buffer, timestamp);

        if !self.accepting.load(Ordering::SeqCst) {
            self.frames_refused.fetch_add(1, Ordering::Relaxed);
            return Err(Rejected::new(self.not_accepting(), frame));
        }

        match self.controller.add_to_filled(frame) {
            Ok(()) => {
                self.frames_submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(rejected) => {
                self.frames_refused.fetch_add(1, Ordering::Relaxed);
                Err(rejected)
            }
        }
    }

    /// Gives back a buffer the producer decided not to use.
    pub fn release_unused(&self, buffer: FrameBuffer) -> Result<(), Rejected<FrameBuffer>> {
        self.controller.add_to_free(buffer)
    }

    // ----------------------------------------
    // CONSUMER API
    // ----------------------------------------

    /// Exports one filled frame; for pipelines without a drain thread.
    ///
    /// Returns the exported frame's timestamp.
    pub fn pump(&self) -> PipelineResult<f64> {
        self.exporter.export_next()
    }

    // ----------------------------------------
    // TEARDOWN
    // ----------------------------------------

    /// Shuts the pipeline down gracefully.
    ///
    /// ## What Happens (Plain English)
    ///
    /// 1. Stop taking new frames from the producer
    /// 2. Close the queues; the drain side exports what is left, then
    ///    stops. A producer waiting for a buffer wakes up with an error
    /// 3. Finalize the movie file once every frame is written
    /// 4. Free every buffer
    ///
    /// Safe to call more than once.
    pub fn shutdown(&self) -> PipelineResult<()> {
        let mut done = self.shut_down.lock();
        if *done {
            return Ok(());
        }
        *done = true;

        info!("Shutting down pipeline...");
        self.accepting.store(false, Ordering::SeqCst);
        self.controller.close();

        let drain = self.drain.lock().take();
        match drain {
            Some(handle) => {
                if handle.join().is_err() {
                    error!("Drain thread panicked");
                }
            }
            None => self.pump_remaining(),
        }

        let finalized = self.exporter.finalize();
        if let Err(e) = &finalized {
            error!("Finalize failed: {}", e);
        }

        let released = self.controller.release().map(|count| {
            info!("Shutdown complete, {} buffers released", count);
        });
        if let Err(e) = &released {
            warn!("Buffers not released: {}", e);
        }

        finalized.and(released)
    }

    // ----------------------------------------
    // OBSERVERS
    // ----------------------------------------

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            frames_submitted: self.frames_submitted.load(Ordering::Relaxed),
            frames_refused: self.frames_refused.load(Ordering::Relaxed),
            export: self.exporter.stats(),
            census: self.controller.census(),
        }
    }

    pub fn session_state(&self) -> SessionState {
        self.exporter.state()
    }

    pub fn controller(&self) -> &Arc<QueueController> {
        &self.controller
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // ----------------------------------------
    // INTERNALS
    // ----------------------------------------

    fn ensure_accepting(&self) -> PipelineResult<()> {
        if self.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(self.not_accepting())
        }
    }

    /// A buffer that came home during teardown goes straight back.
    fn keep_if_accepting(&self, buffer: FrameBuffer) -> PipelineResult<FrameBuffer> {
        if self.accepting.load(Ordering::SeqCst) {
            return Ok(buffer);
        }
        if let Err(rejected) = self.controller.add_to_free(buffer) {
            error!("Could not return buffer during shutdown: {}", rejected);
        }
        Err(self.not_accepting())
    }

    fn not_accepting(&self) -> PipelineError {
        PipelineError::Submission(SubmissionErrorKind::NotAccepting(self.exporter.state()))
    }

    fn pump_remaining(&self) {
        let mut exported = 0usize;
        loop {
            match self.exporter.export_next() {
                Ok(_) => exported += 1,
                Err(PipelineError::Pool(PoolErrorKind::QueueEmpty | PoolErrorKind::QueueClosed)) => {
                    break
                }
                Err(e) => warn!("Frame lost during shutdown: {}", e),
            }
        }
        if exported > 0 {
            info!("Exported {} leftover frames", exported);
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Shutdown on drop failed: {}", e);
        }
    }
}

/// Body of the drain thread.
fn drain_loop(exporter: &MovieExporter) {
    let mut reported_failure = false;

    loop {
        match exporter.export_next() {
            Ok(_) => {}
            Err(PipelineError::Pool(PoolErrorKind::QueueClosed)) => break,
            Err(PipelineError::SessionFailed(reason)) => {
                // Keep draining so buffers keep flowing back to the producer
                if !reported_failure {
                    error!("Session failed, discarding frames: {}", reason);
                    reported_failure = true;
                }
            }
            Err(e) => warn!("Drain: {}", e),
        }
    }

    log::debug!("Drain thread finished");
}

// ============================================
// LOGGING
// ============================================

/// Initialize logging.
///
/// `RUST_LOG` still overrides the default `info` level. Calling this more
/// than once is harmless.
pub fn init_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .try_init();
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config(path: std::path::PathBuf) -> PipelineConfig {
        PipelineConfig {
            pool_size: 3,
            codec: CodecType::Raw,
            ..PipelineConfig::new(64, 64, path)
        }
    }

    #[test]
    fn test_pipeline_end_to_end() {
        init_logging();
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("run.reel");
        let pipeline = CapturePipeline::start(config(path.clone()), &HeapRenderContext::new()).unwrap();

        for i in 0..30u32 {
            let mut buffer = pipeline.acquire_buffer().unwrap();
            buffer.fill_with([i as u8, 0, 0, 255]);
            pipeline.submit_frame(buffer, i as f64 / 30.0).unwrap();
        }

        pipeline.shutdown().unwrap();

        let stats = pipeline.stats();
        assert_eq!(stats.frames_submitted, 30);
        assert_eq!(stats.export.encoded, 30);
        assert_eq!(pipeline.session_state(), SessionState::Closed);

        let reader = MovieReader::open(&path).unwrap();
        assert_eq!(reader.frame_count(), 30);
        let timestamps = reader.timestamps();
        assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(reader.frame(7).unwrap().data[0], 7);
    }

    #[test]
    fn test_jpeg_pipeline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mjpg.reel");
        let config = PipelineConfig {
            codec: CodecType::Jpeg,
            ..PipelineConfig::new(64, 64, &path)
        };
        let pipeline = CapturePipeline::start(config, &HeapRenderContext::new()).unwrap();

        for i in 0..5 {
            let buffer = pipeline.acquire_buffer().unwrap();
            pipeline.submit_frame(buffer, i as f64 * 0.1).unwrap();
        }
        pipeline.shutdown().unwrap();

        let reader = MovieReader::open(&path).unwrap();
        assert_eq!(reader.header().codec, CodecType::Jpeg);
        for frame in reader.frames() {
            assert_eq!(&frame.data[..2], &[0xFF, 0xD8]);
        }
    }

    #[test]
    fn test_manual_pumping() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            drain_thread: false,
            filled_mode: DrainMode::NonBlocking,
            ..config(dir.path().join("pump.reel"))
        };
        let pipeline = CapturePipeline::start(config, &HeapRenderContext::new()).unwrap();

        assert!(matches!(
            pipeline.pump(),
            Err(PipelineError::Pool(PoolErrorKind::QueueEmpty))
        ));

        let buffer = pipeline.acquire_buffer().unwrap();
        pipeline.submit_frame(buffer, 0.5).unwrap();
        assert_eq!(pipeline.pump().unwrap(), 0.5);

        // Left in the filled queue; shutdown exports it
        let buffer = pipeline.acquire_buffer().unwrap();
        pipeline.submit_frame(buffer, 0.6).unwrap();

        pipeline.shutdown().unwrap();
        assert_eq!(pipeline.stats().export.encoded, 2);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let dir = tempdir().unwrap();
        let pipeline =
            CapturePipeline::start(config(dir.path().join("idem.reel")), &HeapRenderContext::new())
                .unwrap();
        pipeline.shutdown().unwrap();
        pipeline.shutdown().unwrap();
        assert_eq!(pipeline.stats().census.total(), 0);
    }

    #[test]
    fn test_submit_after_shutdown_refused() {
        let dir = tempdir().unwrap();
        let pipeline =
            CapturePipeline::start(config(dir.path().join("late.reel")), &HeapRenderContext::new())
                .unwrap();
        let buffer = pipeline.acquire_buffer().unwrap();
        pipeline.release_unused(buffer).unwrap();
        pipeline.shutdown().unwrap();

        assert!(matches!(
            pipeline.acquire_buffer(),
            Err(PipelineError::Submission(SubmissionErrorKind::NotAccepting(_)))
        ));
    }

    #[test]
    fn test_shutdown_with_held_buffer_reports_it() {
        let dir = tempdir().unwrap();
        let pipeline =
            CapturePipeline::start(config(dir.path().join("held.reel")), &HeapRenderContext::new())
                .unwrap();
        let buffer = pipeline.acquire_buffer().unwrap();

        assert!(matches!(
            pipeline.shutdown(),
            Err(PipelineError::Pool(PoolErrorKind::BuffersInFlight { count: 1 }))
        ));

        // The movie itself was still finalized
        assert_eq!(pipeline.session_state(), SessionState::Closed);
        drop(buffer);
    }

    #[test]
    fn test_shutdown_unblocks_waiting_producer() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            pool_size: 1,
            drain_thread: false,
            filled_mode: DrainMode::NonBlocking,
            ..config(dir.path().join("wait.reel"))
        };
        let pipeline = Arc::new(CapturePipeline::start(config, &HeapRenderContext::new()).unwrap());

        let buffer = pipeline.acquire_buffer().unwrap();
        pipeline.submit_frame(buffer, 0.0).unwrap();

        let waiter = {
            let pipeline = Arc::clone(&pipeline);
            std::thread::spawn(move || pipeline.acquire_buffer().map(|_| ()))
        };
        std::thread::sleep(Duration::from_millis(50));

        pipeline.shutdown().unwrap();
        assert!(waiter.join().unwrap().is_err());
        assert_eq!(pipeline.stats().export.encoded, 1);
    }

    #[test]
    fn test_acquire_timeout() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            pool_size: 1,
            drain_thread: false,
            filled_mode: DrainMode::NonBlocking,
            acquire_timeout: Some(Duration::from_millis(20)),
            ..config(dir.path().join("timeout.reel"))
        };
        let pipeline = CapturePipeline::start(config, &HeapRenderContext::new()).unwrap();

        let held = pipeline.acquire_buffer().unwrap();
        assert!(matches!(
            pipeline.acquire_buffer(),
            Err(PipelineError::Pool(PoolErrorKind::QueueTimeout(_)))
        ));
        assert!(matches!(
            pipeline.try_acquire_buffer(),
            Err(PipelineError::Pool(PoolErrorKind::QueueEmpty))
        ));
        pipeline.release_unused(held).unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            pool_size: 0,
            ..config(dir.path().join("bad.reel"))
        };
        assert!(matches!(
            CapturePipeline::start(config, &HeapRenderContext::new()),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_allocation_budget_exceeded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("budget.reel");
        let context = HeapRenderContext::with_budget(64 * 64 * 4 * 2);
        let result = CapturePipeline::start(config(path.clone()), &context);

        assert!(matches!(result, Err(PipelineError::AllocationFailure { index: 2, .. })));
        // Nothing was created
        assert!(!path.exists());
    }

    #[test]
    fn test_out_of_order_submit_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("order.reel");
        let config = PipelineConfig {
            drain_thread: false,
            filled_mode: DrainMode::NonBlocking,
            ..config(path.clone())
        };
        let pipeline = CapturePipeline::start(config, &HeapRenderContext::new()).unwrap();

        let buffer = pipeline.acquire_buffer().unwrap();
        pipeline.submit_frame(buffer, 0.2).unwrap();

        let buffer = pipeline.acquire_buffer().unwrap();
        let before = pipeline.stats().census;
        let rejected = pipeline.submit_frame(buffer, 0.1).unwrap_err();

        assert!(matches!(
            rejected.error(),
            PipelineError::Submission(SubmissionErrorKind::OutOfOrder { .. })
        ));
        assert_eq!(pipeline.stats().census, before);
        assert_eq!(pipeline.stats().frames_refused, 1);
        assert_eq!(pipeline.stats().frames_submitted, 1);

        pipeline
            .submit_frame(rejected.into_inner().into_buffer(), 0.3)
            .unwrap();
        pipeline.shutdown().unwrap();

        assert_eq!(pipeline.stats().export.rejected, 0);
        assert_eq!(MovieReader::open(&path).unwrap().timestamps(), vec![0.2, 0.3]);
    }
}
