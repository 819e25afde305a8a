//! # Video Encoder Module
//!
//! This module turns filled frame buffers into compressed frames.
//!
//! ## Plain English Explanation
//!
//! A raw 1080p frame is about 8 MB. We can't write 30 of those a second to
//! disk, so each frame goes through a codec first. The codec only sees one
//! frame at a time; putting frames in order inside a file is the
//! container's job (see `container`).
//!
//! ```text
//!    FrameBuffer           Codec                EncodedFrame
//!    ┌────────┐         ┌─────────┐           ┌────────────┐
//!    │ pixels │ ──────▶ │  JPEG   │ ────────▶ │ bytes, pts │
//!    └────────┘         └─────────┘           └────────────┘
//! ```

mod jpeg;

pub use jpeg::JpegCodec;

use thiserror::Error;

use crate::buffer::{FrameBuffer, PixelFormat};
use crate::error::{PipelineError, PipelineResult};

/// Largest width or height a baseline JPEG can describe.
pub const MAX_JPEG_DIMENSION: u32 = 65_535;

// ============================================
// CODEC SELECTION
// ============================================

/// Which codec a compression session uses
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CodecType {
    /// Every frame compressed as a standalone JPEG (motion JPEG)
    #[default]
    Jpeg,

    /// Pixels stored as-is
    ///
    /// ## When to Use
    /// Tests, and short captures where disk bandwidth is not a concern.
    Raw,
}

impl CodecType {
    /// FourCC written into the container header.
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            Self::Jpeg => *b"MJPG",
            Self::Raw => *b"RAW ",
        }
    }

    /// Reverse of [`fourcc`](Self::fourcc).
    pub fn from_fourcc(fourcc: [u8; 4]) -> Option<Self> {
        match &fourcc {
            b"MJPG" => Some(Self::Jpeg),
            b"RAW " => Some(Self::Raw),
            _ => None,
        }
    }

    /// Checks that this codec can work with the given geometry and options.
    pub fn check(self, width: u32, height: u32, options: &CompressionOptions) -> PipelineResult<()> {
        if width == 0 || height == 0 {
            return Err(PipelineError::SessionCreationFailure(format!(
                "frame geometry {}x{} is empty",
                width, height
            )));
        }
        if options.quality == 0 || options.quality > 100 {
            return Err(PipelineError::SessionCreationFailure(format!(
                "quality {} is outside 1-100",
                options.quality
            )));
        }
        if !(options.frame_rate.is_finite() && options.frame_rate > 0.0) {
            return Err(PipelineError::SessionCreationFailure(format!(
                "frame rate {} must be positive",
                options.frame_rate
            )));
        }
        if self == Self::Jpeg && (width > MAX_JPEG_DIMENSION || height > MAX_JPEG_DIMENSION) {
            return Err(PipelineError::SessionCreationFailure(format!(
                "{}x{} exceeds the JPEG limit of {} pixels per side",
                width, height, MAX_JPEG_DIMENSION
            )));
        }
        Ok(())
    }

    /// Builds a codec instance bound to one frame geometry.
    pub fn build(
        self,
        width: u32,
        height: u32,
        format: PixelFormat,
        options: &CompressionOptions,
    ) -> PipelineResult<Box<dyn VideoCodec>> {
        self.check(width, height, options)?;
        let codec: Box<dyn VideoCodec> = match self {
            Self::Jpeg => Box::new(JpegCodec::new(width, height, format, options.quality)),
            Self::Raw => Box::new(RawCodec::new(width, height, format)),
        };
        Ok(codec)
    }
}

/// Compression settings handed to the codec
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CompressionOptions {
    /// JPEG quality (1-100)
    ///
    /// ## Quality Guidelines
    /// - 90-100: Visually lossless, larger files
    /// - 70-85: Good quality, reasonable size (80 recommended)
    /// - 50-70: Noticeable artifacts, small files
    pub quality: u8,

    /// Nominal frames per second, recorded in the container header
    pub frame_rate: f32,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            quality: 80,
            frame_rate: 30.0,
        }
    }
}

// ============================================
// CODEC INTERFACE
// ============================================

/// One compressed frame
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedFrame {
    /// Codec output
    pub data: Vec<u8>,

    /// Presentation timestamp in seconds
    pub timestamp: f64,

    /// Decodable on its own
    pub key_frame: bool,
}

/// A codec bound to one frame geometry.
///
/// Runs on the exporter's completion thread, hence `Send`.
pub trait VideoCodec: Send {
    fn codec_type(&self) -> CodecType;

    /// Compresses one frame.
    fn encode(&mut self, frame: &FrameBuffer, timestamp: f64) -> Result<EncodedFrame, CodecError>;

    /// Emits anything the codec is still holding on to.
    fn flush(&mut self) -> Result<Vec<EncodedFrame>, CodecError> {
        Ok(Vec::new())
    }
}

/// Errors during frame compression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    /// Buffer dimensions don't match what the codec was built for
    #[error("Invalid frame: expected {expected_width}x{expected_height}, got {width}x{height}")]
    GeometryMismatch {
        expected_width: u32,
        expected_height: u32,
        width: u32,
        height: u32,
    },

    /// Buffer byte length doesn't match its dimensions
    #[error("Invalid size: expected {expected} bytes, got {got}")]
    InvalidSize { expected: usize, got: usize },

    /// The encoder itself failed
    #[error("Encoding failed: {0}")]
    EncodingFailed(String),
}

/// Common geometry/size checks for built-in codecs.
pub(crate) fn check_frame(
    frame: &FrameBuffer,
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<(), CodecError> {
    if frame.width() != width || frame.height() != height {
        return Err(CodecError::GeometryMismatch {
            expected_width: width,
            expected_height: height,
            width: frame.width(),
            height: frame.height(),
        });
    }
    let expected = format.frame_bytes(width, height);
    if frame.pixels().len() != expected {
        return Err(CodecError::InvalidSize {
            expected,
            got: frame.pixels().len(),
        });
    }
    Ok(())
}

// ============================================
// RAW CODEC
// ============================================

/// Stores pixels uncompressed.
#[derive(Debug)]
pub struct RawCodec {
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl RawCodec {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }
}

impl VideoCodec for RawCodec {
    fn codec_type(&self) -> CodecType {
        CodecType::Raw
    }

    fn encode(&mut self, frame: &FrameBuffer, timestamp: f64) -> Result<EncodedFrame, CodecError> {
        check_frame(frame, self.width, self.height, self.format)?;
        Ok(EncodedFrame {
            data: frame.pixels().to_vec(),
            timestamp,
            key_frame: true,
        })
    }
}

// ============================================
// TESTS
// ============================================
