//! # Error Types Module
//!
//! This module defines all the error types used throughout reelpipe.
//!
//! ## Plain English Explanation
//!
//! When things go wrong we need a way to describe WHAT went wrong, and just
//! as importantly, how bad it is:
//!
//! - "AllocationFailure: we could not build the buffer pool" (fatal, startup)
//! - "SubmissionFailure: that frame is older than the last one" (per call)
//! - "SessionFailed: the disk write broke" (fatal, finalize and tear down)
//!
//! Per-frame codec failures are NOT surfaced to callers at all: the
//! completion thread logs them and drops the frame.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::buffer::SlotLocation;
use crate::config::ConfigError;
use crate::encoder::CodecError;
use crate::exporter::SessionState;

// ============================================
// MAIN PIPELINE ERROR
// ============================================

/// The main error type for reelpipe
///
/// ## Plain English
///
/// This is the "parent" error that can contain any type of error from any
/// part of the pipeline. Each variant maps to one row of the error taxonomy:
/// pool construction, session construction, submission, and session health.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The buffer pool could not be built
    ///
    /// ## What This Means
    /// The render context refused to hand out memory for one of the slots.
    /// Any slots allocated before the failure have already been released.
    #[error("Buffer allocation failed for slot {index}: {reason}")]
    AllocationFailure { index: usize, reason: String },

    /// The destination movie file could not be opened or truncated
    #[error("Cannot create movie file {}: {source}", .path.display())]
    FileCreationFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Codec and options don't fit the requested geometry
    #[error("Compression session rejected: {0}")]
    SessionCreationFailure(String),

    /// A single submission was refused; the pipeline keeps running
    #[error("Frame submission refused: {0}")]
    Submission(SubmissionErrorKind),

    /// Something went wrong moving a buffer between queues
    #[error("Buffer pool error: {0}")]
    Pool(PoolErrorKind),

    /// The compression session is broken beyond repair
    ///
    /// ## What This Means
    /// Usually an I/O failure writing the container. Every later submission
    /// fails with this error; the caller should finalize and tear down.
    #[error("Compression session failed: {0}")]
    SessionFailed(String),

    /// The codec could not encode a frame
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The movie container is malformed or already closed
    #[error("Container error: {0}")]
    Container(ContainerErrorKind),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PipelineError {
    /// Returns true for errors that leave the pipeline usable.
    ///
    /// Submission refusals and empty/timed-out queues are recoverable; the
    /// caller can retry or wait. Everything else means tearing down.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Submission(_) | Self::Codec(_) => true,
            Self::Pool(kind) => matches!(
                kind,
                PoolErrorKind::QueueEmpty | PoolErrorKind::QueueTimeout(_)
            ),
            _ => false,
        }
    }
}

// ============================================
// SUBMISSION ERRORS
// ============================================

/// Reasons a frame submission was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionErrorKind {
    /// Timestamp went backwards
    OutOfOrder { previous: f64, got: f64 },

    /// Timestamp is NaN or infinite
    InvalidTimestamp(f64),

    /// Buffer dimensions differ from the session's
    GeometryMismatch {
        expected: (u32, u32),
        got: (u32, u32),
    },

    /// The session is not in a state that takes new frames
    NotAccepting(SessionState),
}

impl fmt::Display for SubmissionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfOrder { previous, got } => {
                write!(
                    f,
                    "timestamp {:.6}s is earlier than previous {:.6}s",
                    got, previous
                )
            }
            Self::InvalidTimestamp(ts) => write!(f, "timestamp {} is not finite", ts),
            Self::GeometryMismatch { expected, got } => {
                write!(
                    f,
                    "buffer is {}x{}, session expects {}x{}",
                    got.0, got.1, expected.0, expected.1
                )
            }
            Self::NotAccepting(state) => write!(f, "session is {}", state),
        }
    }
}

// ============================================
// POOL ERRORS
// ============================================

/// Errors raised by the buffer queues and the controller's loan table.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolErrorKind {
    /// Non-blocking removal found nothing
    QueueEmpty,

    /// Queue was closed for teardown and has nothing left
    QueueClosed,

    /// Bounded wait ran out
    QueueTimeout(Duration),

    /// Buffer belongs to a different pool or has an impossible index
    ForeignBuffer { pool_id: u64, index: usize },

    /// Buffer is already sitting in one of the queues
    DoubleReturn { index: usize },

    /// Buffer came back through the wrong door
    ///
    /// ## What This Means
    /// e.g. an encoder-held buffer being pushed into the filled queue.
    InvalidReturn { index: usize, location: SlotLocation },

    /// Teardown was asked to free buffers that are still loaned out
    BuffersInFlight { count: usize },
}

impl fmt::Display for PoolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueEmpty => write!(f, "queue is empty"),
            Self::QueueClosed => write!(f, "queue is closed"),
            Self::QueueTimeout(d) => write!(f, "no buffer available after {:?}", d),
            Self::ForeignBuffer { pool_id, index } => {
                write!(f, "buffer {} of pool {} does not belong here", index, pool_id)
            }
            Self::DoubleReturn { index } => {
                write!(f, "buffer {} was returned twice", index)
            }
            Self::InvalidReturn { index, location } => {
                write!(f, "buffer {} cannot be queued while {}", index, location)
            }
            Self::BuffersInFlight { count } => {
                write!(f, "{} buffer(s) still in flight", count)
            }
        }
    }
}

// ============================================
// CONTAINER ERRORS
// ============================================

/// Problems reading or writing the `.reel` movie container.
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerErrorKind {
    /// File doesn't start with the container magic
    BadMagic,

    /// Written by a newer version of the format
    UnsupportedVersion(u16),

    /// Codec FourCC we don't know
    UnknownCodec([u8; 4]),

    /// File ends in the middle of a record
    Truncated { offset: usize },

    /// Writer was already closed
    Closed,
}

impl fmt::Display for ContainerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "not a reel movie file"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported container version {}", v),
            Self::UnknownCodec(fourcc) => {
                write!(f, "unknown codec {:?}", String::from_utf8_lossy(fourcc))
            }
            Self::Truncated { offset } => write!(f, "file truncated at byte {}", offset),
            Self::Closed => write!(f, "container already closed"),
        }
    }
}

// ============================================
// REJECTED ITEMS
// ============================================

/// An error that hands back the item the caller gave us.
///
/// ## Plain English
///
/// Frame buffers are precious: the pool never grows, so losing one to an
/// error would shrink it for good. Every operation that takes a buffer by
/// value and can fail returns it inside this wrapper.
#[derive(Debug)]
pub struct Rejected<T> {
    error: PipelineError,
    item: T,
}

impl<T> Rejected<T> {
    pub(crate) fn new(error: PipelineError, item: T) -> Self {
        Self { error, item }
    }

    /// The reason the item was refused.
    pub fn error(&self) -> &PipelineError {
        &self.error
    }

    /// Takes the item back.
    pub fn into_inner(self) -> T {
        self.item
    }

    /// Splits into the error and the item.
    pub fn into_parts(self) -> (PipelineError, T) {
        (self.error, self.item)
    }

    /// Drops the item and keeps only the error.
    pub fn into_error(self) -> PipelineError {
        self.error
    }
}

impl<T> fmt::Display for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl<T: fmt::Debug> std::error::Error for Rejected<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

// ============================================
// RESULT TYPE ALIAS
// ============================================

/// A Result type that uses PipelineError
pub type PipelineResult<T> = Result<T, PipelineError>;

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::Submission(SubmissionErrorKind::OutOfOrder {
            previous: 1.0,
            got: 0.5,
        });
        let message = format!("{}", err);
        assert!(message.contains("submission"));
        assert!(message.contains("earlier"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: PipelineError = io_err.into();

        match err {
            PipelineError::Io(_) => {} // Expected
            _ => panic!("Expected Io error variant"),
        }
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(PipelineError::Pool(PoolErrorKind::QueueEmpty).is_recoverable());
        assert!(!PipelineError::Pool(PoolErrorKind::QueueClosed).is_recoverable());
        assert!(!PipelineError::SessionFailed("disk full".into()).is_recoverable());
    }

    #[test]
    fn test_rejected_hands_item_back() {
        let rejected = Rejected::new(PipelineError::Pool(PoolErrorKind::QueueClosed), 42u32);
        assert!(rejected.to_string().contains("closed"));
        assert_eq!(rejected.into_inner(), 42);
    }
}
