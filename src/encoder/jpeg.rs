//! # Motion-JPEG Codec
//!
//! Compresses every frame as an independent JPEG image.

use image::codecs::jpeg::JpegEncoder;
use image::ColorType;

use super::{check_frame, CodecError, CodecType, EncodedFrame, VideoCodec};
use crate::buffer::{FrameBuffer, PixelFormat};

/// Compresses raw RGBA/BGRA frames to JPEG.
///
/// ## Plain English
///
/// Raw frames are huge. This shrinks each one by 10-40x. There is no alpha
/// channel in JPEG, so it is dropped; BGRA input is reordered to RGB first.
pub struct JpegCodec {
    width: u32,
    height: u32,
    format: PixelFormat,
    quality: u8,
    /// RGB scratch space reused across frames
    rgb: Vec<u8>,
}

impl JpegCodec {
    /// Creates a codec for one frame geometry.
    ///
    /// Quality is clamped to 1-100.
    pub fn new(width: u32, height: u32, format: PixelFormat, quality: u8) -> Self {
        Self {
            width,
            height,
            format,
            quality: quality.clamp(1, 100),
            rgb: Vec::with_capacity(width as usize * height as usize * 3),
        }
    }

    /// Returns the quality setting.
    pub fn quality(&self) -> u8 {
        self.quality
    }

    fn load_rgb(&mut self, pixels: &[u8]) {
        self.rgb.clear();
        for px in pixels.chunks_exact(4) {
            match self.format {
                PixelFormat::Rgba8 => self.rgb.extend_from_slice(&[px[0], px[1], px[2]]),
                PixelFormat::Bgra8 => self.rgb.extend_from_slice(&[px[2], px[1], px[0]]),
            }
        }
    }
}

impl VideoCodec for JpegCodec {
    fn codec_type(&self) -> CodecType {
        CodecType::Jpeg
    }

    fn encode(&mut self, frame: &FrameBuffer, timestamp: f64) -> Result<EncodedFrame, CodecError> {
        check_frame(frame, self.width, self.height, self.format)?;
        self.load_rgb(frame.pixels());

        let mut data = Vec::new();
        JpegEncoder::new_with_quality(&mut data, self.quality)
            .encode(&self.rgb, self.width, self.height, ColorType::Rgb8)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        Ok(EncodedFrame {
            data,
            timestamp,
            key_frame: true,
        })
    }
}

// ============================================
// TESTS
// ============================================
