//! # Frame Buffer Module
//!
//! This module provides the fixed pool of frame buffers and the two queues
//! they circulate through.
//!
//! ## Plain English Explanation
//!
//! Imagine a laundromat with exactly three baskets. You take an empty
//! basket (free queue), fill it with clothes (a frame), and leave it by
//! the washer (filled queue). The washer empties the basket and puts it back
//! on the empty stack. If all three baskets are in use, you wait. Nobody
//! ever buys a fourth basket.
//!
//! ```text
//!        ┌──────────── free queue ◀────────────┐
//!        │                                     │
//!        ▼                                     │
//!    producer ──▶ filled queue ──▶ exporter ──▶ completion thread
//! ```

mod controller;
mod frame;
mod queue;

pub use controller::{PoolCensus, QueueController, SlotLocation};
pub use frame::{FrameBuffer, HeapRenderContext, PixelFormat, RenderContext, TimestampedFrame};
pub use queue::BufferQueue;
