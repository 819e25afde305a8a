//! # Configuration Module
//!
//! This module handles all configurable settings for a capture pipeline.
//!
//! ## Plain English Explanation
//!
//! Before we start recording we need to decide a few things up front:
//! - How many frame buffers to keep in the pool (memory vs. slack)
//! - How big each frame is, and in what pixel layout
//! - Which codec compresses them, and how hard
//! - Where the movie file goes
//! - Whether a dedicated thread drains filled buffers, or the caller does

use std::path::PathBuf;
use std::time::Duration;

use crate::buffer::PixelFormat;
use crate::encoder::{CodecType, CompressionOptions};

/// Largest pool we agree to build.
///
/// A pool is a fixed ring: more than a few dozen buffers only hides a
/// consumer that can't keep up, while burning memory.
pub const MAX_POOL_SIZE: usize = 64;

// ============================================
// DRAIN MODE
// ============================================

/// How removing from the filled queue behaves when it is empty
///
/// ## Plain English
///
/// The free queue always blocks the producer (that's the backpressure).
/// The filled queue is different: a dedicated drain thread wants to sleep
/// until work shows up, while a caller that pumps frames by hand wants an
/// immediate "nothing to do" answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DrainMode {
    /// Wait until a filled buffer arrives (or the queue is closed)
    #[default]
    Blocking,

    /// Fail fast with `QueueEmpty`
    NonBlocking,
}

// ============================================
// MAIN CONFIGURATION
// ============================================

/// All configuration options for a capture pipeline
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    // ----------------------------------------
    // POOL SETTINGS
    // "How much memory to set aside"
    // ----------------------------------------
    /// Number of frame buffers allocated at startup
    ///
    /// ## Plain English
    /// This is how many frames can be "in the air" at once. When all of them
    /// are filled or being encoded, the producer waits.
    ///
    /// ## Limits
    /// - Minimum: 1
    /// - Maximum: [`MAX_POOL_SIZE`]
    /// - Default: 3
    pub pool_size: usize,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Byte layout of each pixel
    pub pixel_format: PixelFormat,

    // ----------------------------------------
    // COMPRESSION SETTINGS
    // ----------------------------------------
    /// Codec used by the compression session
    pub codec: CodecType,

    /// Quality and nominal frame rate handed to the codec
    pub options: CompressionOptions,

    // ----------------------------------------
    // OUTPUT SETTINGS
    // ----------------------------------------
    /// Destination movie file (overwritten if it exists)
    pub output_path: PathBuf,

    // ----------------------------------------
    // THREADING SETTINGS
    // ----------------------------------------
    /// Filled-queue behaviour when empty
    pub filled_mode: DrainMode,

    /// Spawn a dedicated thread that drains the filled queue
    ///
    /// ## Plain English
    /// When false, call `CapturePipeline::pump()` yourself.
    pub drain_thread: bool,

    /// Give up waiting for a free buffer after this long
    ///
    /// `None` waits forever, which is the normal backpressure behaviour.
    pub acquire_timeout: Option<Duration>,
}

impl PipelineConfig {
    /// Creates a configuration for the given geometry and output path,
    /// everything else at its default.
    pub fn new(width: u32, height: u32, output_path: impl Into<PathBuf>) -> Self {
        Self {
            width,
            height,
            output_path: output_path.into(),
            ..Self::default()
        }
    }

    /// A small pool with stronger compression.
    ///
    /// ## When to Use
    /// Large frames on a machine without much memory to spare.
    pub fn low_memory() -> Self {
        Self {
            pool_size: 2,
            options: CompressionOptions {
                quality: 60,
                ..CompressionOptions::default()
            },
            ..Self::default()
        }
    }

    /// A deeper pool and near-lossless JPEG.
    pub fn high_quality() -> Self {
        Self {
            pool_size: 8,
            options: CompressionOptions {
                quality: 95,
                ..CompressionOptions::default()
            },
            ..Self::default()
        }
    }

    /// Validates the configuration and returns errors if invalid
    ///
    /// ## Plain English
    /// Makes sure all settings are within reasonable bounds.
    /// Returns a list of problems, or empty if all is well.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.pool_size == 0 {
            errors.push(ConfigError::PoolTooSmall);
        }
        if self.pool_size > MAX_POOL_SIZE {
            errors.push(ConfigError::PoolTooLarge(self.pool_size));
        }

        if self.width == 0 || self.height == 0 {
            errors.push(ConfigError::InvalidGeometry(self.width, self.height));
        }

        if self.options.quality == 0 || self.options.quality > 100 {
            errors.push(ConfigError::InvalidQuality(self.options.quality));
        }

        if !(self.options.frame_rate > 0.0 && self.options.frame_rate <= 240.0) {
            errors.push(ConfigError::InvalidFrameRate(self.options.frame_rate));
        }

        // Fail-fast removal in a loop never sleeps
        if self.drain_thread && self.filled_mode == DrainMode::NonBlocking {
            errors.push(ConfigError::DrainThreadNeedsBlocking);
        }

        if self.output_path.as_os_str().is_empty() {
            errors.push(ConfigError::InvalidOutputPath(String::new()));
        }

        errors
    }

    /// Bytes in one uncompressed frame
    pub fn frame_bytes(&self) -> usize {
        self.pixel_format.frame_bytes(self.width, self.height)
    }

    /// Calculates memory held by the buffer pool
    ///
    /// ## Returns
    /// Pool memory in megabytes
    pub fn estimated_memory_mb(&self) -> f32 {
        (self.pool_size * self.frame_bytes()) as f32 / (1024.0 * 1024.0)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            // Pool: three 640x480 RGBA buffers
            pool_size: 3,
            width: 640,
            height: 480,
            pixel_format: PixelFormat::Rgba8,

            // Compression: motion JPEG at quality 80, 30 FPS
            codec: CodecType::Jpeg,
            options: CompressionOptions::default(),

            output_path: PathBuf::from("capture.reel"),

            // Threading: dedicated drain thread, wait forever for buffers
            filled_mode: DrainMode::Blocking,
            drain_thread: true,
            acquire_timeout: None,
        }
    }
}

// ============================================
// CONFIGURATION ERRORS
// ============================================

/// Errors that can occur with configuration values
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Pool needs at least one buffer
    PoolTooSmall,

    /// Pool is larger than [`MAX_POOL_SIZE`]
    PoolTooLarge(usize),

    /// Width or height is zero
    InvalidGeometry(u32, u32),

    /// Quality outside 1-100
    InvalidQuality(u8),

    /// Frame rate outside (0, 240]
    InvalidFrameRate(f32),

    /// A drain thread only makes sense with a blocking filled queue
    DrainThreadNeedsBlocking,

    /// Output path is empty or unusable
    InvalidOutputPath(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PoolTooSmall => write!(f, "Pool size must be at least 1"),
            Self::PoolTooLarge(val) => {
                write!(f, "Pool size {} is too large (maximum {})", val, MAX_POOL_SIZE)
            }
            Self::InvalidGeometry(w, h) => write!(f, "Frame geometry {}x{} is invalid", w, h),
            Self::InvalidQuality(val) => {
                write!(f, "Quality {} is outside valid range (1-100)", val)
            }
            Self::InvalidFrameRate(val) => {
                write!(f, "Frame rate {} is outside valid range (0-240]", val)
            }
            Self::DrainThreadNeedsBlocking => {
                write!(f, "Drain thread requires blocking filled-queue mode")
            }
            Self::InvalidOutputPath(path) => write!(f, "Output path '{}' is invalid", path),
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();

        assert_eq!(config.pool_size, 3);
        assert_eq!(config.filled_mode, DrainMode::Blocking);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(PipelineConfig::low_memory().validate().is_empty());
        assert!(PipelineConfig::high_quality().validate().is_empty());
    }

    #[test]
    fn test_memory_estimation() {
        let config = PipelineConfig::new(1024, 1024, "out.reel");
        // 3 buffers of 4 MiB each
        assert!((config.estimated_memory_mb() - 12.0).abs() < 0.01);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = PipelineConfig::default();

        config.pool_size = 0;
        assert!(config.validate().contains(&ConfigError::PoolTooSmall));

        config.pool_size = 3;
        assert!(config.validate().is_empty());

        config.width = 0;
        assert!(!config.validate().is_empty());
        config.width = 640;

        config.drain_thread = true;
        config.filled_mode = DrainMode::NonBlocking;
        assert_eq!(
            config.validate(),
            vec![ConfigError::DrainThreadNeedsBlocking]
        );

        config.drain_thread = false;
        assert!(config.validate().is_empty());
    }
}
