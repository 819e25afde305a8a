//! # Frame Buffer Types
//!
//! Pool-owned pixel buffers and the context that allocates them.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

// ============================================
// PIXEL FORMAT
// ============================================

/// Byte layout of one pixel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// Red, green, blue, alpha
    #[default]
    Rgba8,

    /// Blue, green, red, alpha (what most window systems hand out)
    Bgra8,
}

impl PixelFormat {
    /// Bytes used by a single pixel.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba8 | Self::Bgra8 => 4,
        }
    }

    /// Bytes in a tightly packed frame of the given size.
    pub fn frame_bytes(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

// ============================================
// FRAME BUFFER
// ============================================

/// One slot of the buffer pool.
///
/// ## Plain English
///
/// This is a reusable "canvas". The producer paints a frame on it, the
/// encoder copies it into the movie, and then it goes back on the shelf for
/// the next frame. It is never cloned: whoever holds the value is the only
/// one who can touch the pixels.
pub struct FrameBuffer {
    pool_id: u64,
    index: usize,
    width: u32,
    height: u32,
    format: PixelFormat,
    pixels: Vec<u8>,
}

impl FrameBuffer {
    pub(crate) fn new(
        pool_id: u64,
        index: usize,
        width: u32,
        height: u32,
        format: PixelFormat,
        pixels: Vec<u8>,
    ) -> Self {
        Self {
            pool_id,
            index,
            width,
            height,
            format,
            pixels,
        }
    }

    /// Stable slot number assigned when the pool was built.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Id of the pool that owns this buffer.
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    /// Copies a whole frame into the buffer.
    ///
    /// Returns false (and leaves the buffer untouched) when `src` is not
    /// exactly one frame long.
    pub fn fill_from(&mut self, src: &[u8]) -> bool {
        if src.len() != self.pixels.len() {
            return false;
        }
        self.pixels.copy_from_slice(src);
        true
    }

    /// Paints every pixel with the same 4-byte value.
    pub fn fill_with(&mut self, pixel: [u8; 4]) {
        for chunk in self.pixels.chunks_exact_mut(4) {
            chunk.copy_from_slice(&pixel);
        }
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("pool_id", &self.pool_id)
            .field("index", &self.index)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

// ============================================
// TIMESTAMPED FRAME
// ============================================

/// A filled buffer plus its presentation time.
#[derive(Debug)]
pub struct TimestampedFrame {
    pub buffer: FrameBuffer,

    /// Presentation timestamp in seconds
    pub timestamp: f64,
}

impl TimestampedFrame {
    pub fn new(buffer: FrameBuffer, timestamp: f64) -> Self {
        Self { buffer, timestamp }
    }

    /// Drops the timestamp and gives the buffer back.
    pub fn into_buffer(self) -> FrameBuffer {
        self.buffer
    }
}

// ============================================
// RENDER CONTEXT
// ============================================

/// Supplies pixel storage for pool slots.
///
/// ## Plain English
///
/// Where the memory comes from is not our business: it could be plain heap,
/// a GPU-shared surface, or a slice of a mapped file. The pool calls this
/// once per slot at startup and never again.
pub trait RenderContext {
    /// Returns zeroed storage for one frame, or a reason it can't.
    fn allocate(&self, width: u32, height: u32, format: PixelFormat) -> Result<Vec<u8>, String>;
}

/// Heap-backed render context with an optional byte budget.
#[derive(Debug, Default)]
pub struct HeapRenderContext {
    budget: Option<usize>,
    used: AtomicUsize,
}

impl HeapRenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuses allocations once `bytes` have been handed out.
    pub fn with_budget(bytes: usize) -> Self {
        Self {
            budget: Some(bytes),
            used: AtomicUsize::new(0),
        }
    }

    /// Total bytes handed out so far.
    pub fn bytes_allocated(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

impl RenderContext for HeapRenderContext {
    fn allocate(&self, width: u32, height: u32, format: PixelFormat) -> Result<Vec<u8>, String> {
        let len = format.frame_bytes(width, height);
        if len == 0 {
            return Err(format!("empty frame geometry {}x{}", width, height));
        }

        let used = self.used.load(Ordering::Relaxed);
        if let Some(budget) = self.budget {
            if used + len > budget {
                return Err(format!(
                    "budget exhausted: {} of {} bytes used, {} more requested",
                    used, budget, len
                ));
            }
        }

        self.used.fetch_add(len, Ordering::Relaxed);
        Ok(vec![0u8; len])
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_bytes() {
        // 64 x 64 x 4 = 16384 bytes
        assert_eq!(PixelFormat::Rgba8.frame_bytes(64, 64), 16384);
        assert_eq!(PixelFormat::Bgra8.bytes_per_pixel(), 4);
    }

    #[test]
    fn test_fill_from() {
        let mut buffer = FrameBuffer::new(1, 0, 2, 2, PixelFormat::Rgba8, vec![0u8; 16]);
        assert!(!buffer.fill_from(&[1u8; 4]));
        assert!(buffer.pixels().iter().all(|&b| b == 0));

        assert!(buffer.fill_from(&[9u8; 16]));
        assert!(buffer.pixels().iter().all(|&b| b == 9));
        assert_eq!(buffer.stride(), 8);
    }

    #[test]
    fn test_fill_with() {
        let mut buffer = FrameBuffer::new(1, 0, 2, 1, PixelFormat::Rgba8, vec![0u8; 8]);
        buffer.fill_with([1, 2, 3, 4]);
        assert_eq!(buffer.pixels(), &[1, 2, 3, 4, 1, 2, 3, 4]);
    }

    #[test]
    fn test_heap_budget() {
        let context = HeapRenderContext::with_budget(2 * 16384);
        assert!(context.allocate(64, 64, PixelFormat::Rgba8).is_ok());
        assert!(context.allocate(64, 64, PixelFormat::Rgba8).is_ok());
        assert!(context.allocate(64, 64, PixelFormat::Rgba8).is_err());
        assert_eq!(context.bytes_allocated(), 2 * 16384);
    }

    #[test]
    fn test_heap_rejects_empty_geometry() {
        let context = HeapRenderContext::new();
        assert!(context.allocate(0, 64, PixelFormat::Rgba8).is_err());
    }
}
