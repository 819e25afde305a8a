//! # Movie Exporter Module
//!
//! Binds the filled-frame queue to a compression session and an output
//! file.
//!
//! ## Plain English Explanation
//!
//! The exporter is the "consumer" half of the pipeline. It takes the oldest
//! filled buffer, checks the frame makes sense (right size, not older than
//! the last one), and hands it to the completion thread. It does NOT wait
//! for the encode: `export_frame` returns as soon as the frame is accepted.
//!
//! ```text
//!                 export_frame()                 completion thread
//!   filled queue ───────────────▶ [ channel ] ──▶ encode ─▶ append ─▶ free queue
//! ```
//!
//! ## Session States
//!
//! ```text
//!   Uninitialized ─▶ Ready ⇄ Submitting ⇄ Draining
//!                      │         │
//!                      └────┬────┘
//!                           ▼
//!                      Finalizing ─▶ Closed
//! ```

mod completion;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};

use crate::buffer::{QueueController, TimestampedFrame};
use crate::container::{ContainerWriter, MovieFileWriter, MovieHeader};
use crate::encoder::{CodecType, CompressionOptions, VideoCodec};
use crate::error::{
    PipelineError, PipelineResult, PoolErrorKind, Rejected, SubmissionErrorKind,
};

use completion::CompletionWorker;

// ============================================
// SESSION STATE
// ============================================

/// Lifecycle of a compression session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Being built; the completion thread is not running yet
    Uninitialized,
    /// Accepting frames, nothing in flight
    Ready,
    /// Accepting frames, some still being encoded
    Submitting,
    /// Someone is waiting for in-flight frames; new frames are refused
    Draining,
    /// No new frames; waiting for the last ones and closing the file
    Finalizing,
    /// Done for good
    Closed,
}

impl SessionState {
    /// Returns true if `export_frame` is allowed.
    pub fn accepts_frames(self) -> bool {
        matches!(self, Self::Ready | Self::Submitting)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Submitting => "submitting",
            Self::Draining => "draining",
            Self::Finalizing => "finalizing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Counters for one compression session.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ExportStats {
    /// Frames accepted by `export_frame`
    pub submitted: u64,
    /// Frames written to the container
    pub encoded: u64,
    /// Frames lost to codec errors or a dead session
    pub dropped: u64,
    /// Frames refused at submission by `export_next`
    pub rejected: u64,
    /// Container size so far
    pub bytes_written: u64,
    /// Timestamp of the newest accepted frame
    pub last_timestamp: Option<f64>,
}

#[derive(Debug)]
struct Session {
    state: SessionState,
    outstanding: usize,
    fatal: Option<String>,
    stats: ExportStats,
}

/// State shared between the exporter and its completion thread.
#[derive(Debug)]
struct SessionShared {
    session: Mutex<Session>,
    /// Signalled whenever `outstanding` drops or the state changes
    idle: Condvar,
}

// ============================================
// MOVIE EXPORTER
// ============================================

/// Streams timestamped frames into a movie file.
pub struct MovieExporter {
    shared: Arc<SessionShared>,
    controller: Arc<QueueController>,
    /// Dropped to tell the completion thread to finish
    jobs: Mutex<Option<Sender<TimestampedFrame>>>,
    worker: Mutex<Option<JoinHandle<PipelineResult<()>>>>,
    width: u32,
    height: u32,
}

impl MovieExporter {
    /// Opens a compression session writing to `path`.
    ///
    /// ## What Happens (Plain English)
    ///
    /// 1. Check the codec can handle this size and these options
    /// 2. Create (or wipe) the output file and write its header
    /// 3. Start the completion thread
    ///
    /// Step 1 happens first so a bad configuration never wipes a file.
    pub fn initialize(
        path: impl AsRef<Path>,
        codec: CodecType,
        width: u32,
        height: u32,
        options: CompressionOptions,
        controller: Arc<QueueController>,
    ) -> PipelineResult<Self> {
        let (pool_width, pool_height, format) = controller.geometry();
        if (pool_width, pool_height) != (width, height) {
            return Err(PipelineError::SessionCreationFailure(format!(
                "session is {}x{} but the buffer pool is {}x{}",
                width, height, pool_width, pool_height
            )));
        }

        let encoder = codec.build(width, height, format, &options)?;

        let header = MovieHeader {
            codec,
            width,
            height,
            frame_rate: options.frame_rate,
        };
        let writer = MovieFileWriter::create(path.as_ref(), header)?;

        log::info!(
            "Opening {:?} session {}x{} @ {} FPS, quality {} -> {:?}",
            codec,
            width,
            height,
            options.frame_rate,
            options.quality,
            path.as_ref()
        );

        Self::from_parts(encoder, Box::new(writer), width, height, controller)
    }

    /// Builds a session from an already constructed codec and container.
    pub fn from_parts(
        codec: Box<dyn VideoCodec>,
        writer: Box<dyn ContainerWriter>,
        width: u32,
        height: u32,
        controller: Arc<QueueController>,
    ) -> PipelineResult<Self> {
        let shared = Arc::new(SessionShared {
            session: Mutex::new(Session {
                state: SessionState::Uninitialized,
                outstanding: 0,
                fatal: None,
                stats: ExportStats::default(),
            }),
            idle: Condvar::new(),
        });

        let (tx, rx) = channel::unbounded();
        let worker = CompletionWorker {
            jobs: rx,
            codec,
            writer,
            controller: Arc::clone(&controller),
            shared: Arc::clone(&shared),
        };

        let handle = thread::Builder::new()
            .name("reelpipe-completion".to_string())
            .spawn(move || worker.run())
            .map_err(|e| {
                PipelineError::SessionCreationFailure(format!(
                    "cannot start completion thread: {}",
                    e
                ))
            })?;

        shared.session.lock().state = SessionState::Ready;

        Ok(Self {
            shared,
            controller,
            jobs: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
            width,
            height,
        })
    }

    /// Submits one frame for asynchronous encoding.
    ///
    /// Returns once the frame is queued for the completion thread, not when
    /// it has been encoded. A refused frame is handed back untouched.
    pub fn export_frame(&self, frame: TimestampedFrame) -> Result<(), Rejected<TimestampedFrame>> {
        // Held across the send so `finalize` can't slip in between the
        // state check and the channel push.
        let mut session = self.shared.session.lock();

        if let Some(reason) = &session.fatal {
            let error = PipelineError::SessionFailed(reason.clone());
            return Err(Rejected::new(error, frame));
        }

        if !session.state.accepts_frames() {
            let error = submission_error(SubmissionErrorKind::NotAccepting(session.state));
            return Err(Rejected::new(error, frame));
        }

        if let Err(error) = self.check_frame(&frame, session.stats.last_timestamp) {
            return Err(Rejected::new(error, frame));
        }

        let timestamp = frame.timestamp;
        let jobs = self.jobs.lock();
        let Some(tx) = jobs.as_ref() else {
            let error = submission_error(SubmissionErrorKind::NotAccepting(SessionState::Closed));
            return Err(Rejected::new(error, frame));
        };

        if let Err(channel::SendError(frame)) = tx.send(frame) {
            let reason = "completion thread stopped".to_string();
            session.fatal = Some(reason.clone());
            return Err(Rejected::new(PipelineError::SessionFailed(reason), frame));
        }

        session.outstanding += 1;
        session.state = SessionState::Submitting;
        session.stats.submitted += 1;
        session.stats.last_timestamp = Some(timestamp);
        Ok(())
    }

    /// Takes the oldest filled frame from the controller and submits it.
    ///
    /// Returns the submitted timestamp. A refused frame's buffer goes
    /// straight back to the free queue so the pool never shrinks.
    pub fn export_next(&self) -> PipelineResult<f64> {
        let frame = self.controller.remove_oldest_from_filled()?;
        let timestamp = frame.timestamp;

        match self.export_frame(frame) {
            Ok(()) => Ok(timestamp),
            Err(rejected) => {
                let (error, frame) = rejected.into_parts();
                log::warn!("Refused frame at {:.3}s: {}", timestamp, error);
                self.shared.session.lock().stats.rejected += 1;

                if let Err(lost) = self.controller.add_to_free(frame.into_buffer()) {
                    log::error!("Could not recycle refused frame: {}", lost);
                }
                Err(error)
            }
        }
    }

    /// Waits until every submitted frame has completed, without closing.
    ///
    /// New submissions are refused while this waits.
    pub fn drain(&self) -> PipelineResult<()> {
        let mut session = self.shared.session.lock();
        if session.state == SessionState::Submitting {
            session.state = SessionState::Draining;
        }

        while session.outstanding > 0 {
            self.shared.idle.wait(&mut session);
        }

        if session.state == SessionState::Draining {
            session.state = SessionState::Ready;
        }
        drop(session);
        self.shared.idle.notify_all();

        self.health()
    }

    /// Stops accepting frames, waits for in-flight ones, and closes the file.
    ///
    /// Calling it again after it finished does nothing. A second caller
    /// racing the first waits for it to finish.
    pub fn finalize(&self) -> PipelineResult<()> {
        {
            let mut session = self.shared.session.lock();
            loop {
                match session.state {
                    SessionState::Closed => return Ok(()),
                    SessionState::Finalizing => self.shared.idle.wait(&mut session),
                    _ => break,
                }
            }

            log::info!(
                "Finalizing session: {} submitted, {} in flight",
                session.stats.submitted,
                session.outstanding
            );
            session.state = SessionState::Finalizing;

            while session.outstanding > 0 {
                self.shared.idle.wait(&mut session);
            }
        }

        // Closing the channel lets the completion thread flush and exit
        self.jobs.lock().take();

        let handle = self.worker.lock().take();
        let finished = match handle {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(PipelineError::SessionFailed(
                    "completion thread panicked".to_string(),
                ))
            }),
            None => Ok(()),
        };

        let mut session = self.shared.session.lock();
        session.state = SessionState::Closed;
        let fatal = session.fatal.clone();
        let stats = session.stats.clone();
        drop(session);
        self.shared.idle.notify_all();

        log::info!(
            "Session closed: {} encoded, {} dropped, {} bytes",
            stats.encoded,
            stats.dropped,
            stats.bytes_written
        );

        if let Some(reason) = fatal {
            return Err(PipelineError::SessionFailed(reason));
        }
        finished.map_err(|e| match e {
            PipelineError::SessionFailed(_) => e,
            other => PipelineError::SessionFailed(format!("closing session: {}", other)),
        })
    }

    // ----------------------------------------
    // OBSERVERS
    // ----------------------------------------

    pub fn state(&self) -> SessionState {
        self.shared.session.lock().state
    }

    pub fn stats(&self) -> ExportStats {
        self.shared.session.lock().stats.clone()
    }

    /// Frames submitted but not yet completed.
    pub fn outstanding(&self) -> usize {
        self.shared.session.lock().outstanding
    }

    /// Returns the fatal error, if the session has one.
    pub fn health(&self) -> PipelineResult<()> {
        match &self.shared.session.lock().fatal {
            Some(reason) => Err(PipelineError::SessionFailed(reason.clone())),
            None => Ok(()),
        }
    }

    pub fn controller(&self) -> &Arc<QueueController> {
        &self.controller
    }

    // ----------------------------------------
    // INTERNALS
    // ----------------------------------------

    fn check_frame(&self, frame: &TimestampedFrame, previous: Option<f64>) -> PipelineResult<()> {
        let buffer = &frame.buffer;
        if buffer.pool_id() != self.controller.pool_id() {
            return Err(PipelineError::Pool(PoolErrorKind::ForeignBuffer {
                pool_id: buffer.pool_id(),
                index: buffer.index(),
            }));
        }

        if !frame.timestamp.is_finite() {
            return Err(submission_error(SubmissionErrorKind::InvalidTimestamp(
                frame.timestamp,
            )));
        }

        if let Some(previous) = previous {
            if frame.timestamp < previous {
                return Err(submission_error(SubmissionErrorKind::OutOfOrder {
                    previous,
                    got: frame.timestamp,
                }));
            }
        }

        if (buffer.width(), buffer.height()) != (self.width, self.height) {
            return Err(submission_error(SubmissionErrorKind::GeometryMismatch {
                expected: (self.width, self.height),
                got: (buffer.width(), buffer.height()),
            }));
        }

        Ok(())
    }
}

impl Drop for MovieExporter {
    fn drop(&mut self) {
        if self.state() != SessionState::Closed {
            if let Err(e) = self.finalize() {
                log::error!("Finalize on drop failed: {}", e);
            }
        }
    }
}

impl fmt::Debug for MovieExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MovieExporter")
            .field("state", &self.state())
            .field("geometry", &(self.width, self.height))
            .field("stats", &self.stats())
            .finish()
    }
}

fn submission_error(kind: SubmissionErrorKind) -> PipelineError {
    PipelineError::Submission(kind)
}

// ============================================
// TESTS
// ============================================
