//! # Completion Thread
//!
//! The encoder-owned side of a compression session.
//!
//! ## Plain English
//!
//! The exporter drops frames into a mailbox and walks away. This thread
//! empties the mailbox one frame at a time: encode, write to the file, put
//! the buffer back on the free shelf, tick the "outstanding" counter down.
//! Whatever happens to the frame, the buffer always goes back.

use std::sync::Arc;

use crossbeam::channel::Receiver;

use super::{SessionShared, SessionState};
use crate::buffer::{FrameBuffer, QueueController, TimestampedFrame};
use crate::container::ContainerWriter;
use crate::encoder::VideoCodec;
use crate::error::PipelineResult;

/// Log progress every this many encoded frames.
const PROGRESS_INTERVAL: u64 = 100;

/// What happened to one submitted frame.
enum Outcome {
    /// Written to the container
    Written { bytes_total: u64 },
    /// Codec refused it; session carries on
    Dropped,
    /// Container write failed; session is dead
    Fatal(String),
    /// Session was already dead, frame ignored
    Skipped,
}

pub(super) struct CompletionWorker {
    pub(super) jobs: Receiver<TimestampedFrame>,
    pub(super) codec: Box<dyn VideoCodec>,
    pub(super) writer: Box<dyn ContainerWriter>,
    pub(super) controller: Arc<QueueController>,
    pub(super) shared: Arc<SessionShared>,
}

impl CompletionWorker {
    /// Runs until the exporter drops its end of the channel, then flushes
    /// the codec and closes the container.
    pub(super) fn run(mut self) -> PipelineResult<()> {
        log::debug!("Completion thread started");

        while let Ok(frame) = self.jobs.recv() {
            let TimestampedFrame { buffer, timestamp } = frame;

            let healthy = self.shared.session.lock().fatal.is_none();
            let outcome = if healthy {
                self.encode_and_write(&buffer, timestamp)
            } else {
                Outcome::Skipped
            };

            // The buffer goes home before the frame counts as complete, so
            // once `outstanding` hits zero the whole pool is back.
            if let Err(rejected) = self.controller.add_to_free(buffer) {
                log::error!("Completion could not recycle buffer: {}", rejected);
            }

            self.complete(outcome);
        }

        self.finish()
    }

    fn encode_and_write(&mut self, buffer: &FrameBuffer, timestamp: f64) -> Outcome {
        let encoded = match self.codec.encode(buffer, timestamp) {
            Ok(encoded) => encoded,
            Err(e) => {
                log::warn!("Dropping frame at {:.3}s: {}", timestamp, e);
                return Outcome::Dropped;
            }
        };

        match self.writer.append(&encoded) {
            Ok(()) => Outcome::Written {
                bytes_total: self.writer.bytes_written(),
            },
            Err(e) => Outcome::Fatal(e.to_string()),
        }
    }

    fn complete(&self, outcome: Outcome) {
        let mut session = self.shared.session.lock();
        session.outstanding -= 1;

        match outcome {
            Outcome::Written { bytes_total } => {
                session.stats.encoded += 1;
                session.stats.bytes_written = bytes_total;
                if session.stats.encoded % PROGRESS_INTERVAL == 0 {
                    log::debug!("Encoded {} frames", session.stats.encoded);
                }
            }
            Outcome::Dropped | Outcome::Skipped => session.stats.dropped += 1,
            Outcome::Fatal(reason) => {
                log::error!("Compression session failed: {}", reason);
                session.stats.dropped += 1;
                session.fatal.get_or_insert(reason);
            }
        }

        if session.outstanding == 0 && session.state == SessionState::Submitting {
            session.state = SessionState::Ready;
        }
        drop(session);
        self.shared.idle.notify_all();
    }

    fn finish(mut self) -> PipelineResult<()> {
        let healthy = self.shared.session.lock().fatal.is_none();
        let mut flushed = Ok(());

        if healthy {
            match self.codec.flush() {
                Ok(tail) => {
                    for encoded in &tail {
                        if let Err(e) = self.writer.append(encoded) {
                            flushed = Err(e);
                            break;
                        }
                        self.shared.session.lock().stats.encoded += 1;
                    }
                }
                Err(e) => log::warn!("Codec flush failed: {}", e),
            }
        }

        let closed = self.writer.close();
        self.shared.session.lock().stats.bytes_written = self.writer.bytes_written();

        log::debug!("Completion thread finished");
        flushed.and(closed)
    }
}
