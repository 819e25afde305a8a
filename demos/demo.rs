//! # reelpipe Demo
//!
//! Paints a moving gradient into pooled buffers for a few seconds, streams
//! it to a Motion-JPEG movie, then reads the movie back.
//!
//! Run with: `cargo run --example demo [output-dir]`

use std::env;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reelpipe::{
    storage, CapturePipeline, FrameBuffer, HeapRenderContext, MovieReader, PipelineConfig,
};

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;
const FPS: u32 = 30;
const SECONDS: u32 = 3;

fn main() -> Result<()> {
    reelpipe::init_logging();

    let output_dir = env::args().nth(1).unwrap_or_else(|| "captures".to_string());
    let path = storage::generate_filename(&output_dir);

    let mut config = PipelineConfig::new(WIDTH, HEIGHT, &path);
    config.options.frame_rate = FPS as f32;

    println!("reelpipe demo");
    println!("   Geometry: {}x{} @ {} FPS", WIDTH, HEIGHT, FPS);
    println!("   Pool: {} buffers (~{:.1} MB)", config.pool_size, config.estimated_memory_mb());
    println!("   Output: {}", path.display());
    println!();

    let pipeline = CapturePipeline::start(config, &HeapRenderContext::new())
        .context("starting pipeline")?;

    let started = Instant::now();
    let frame_interval = Duration::from_secs(1) / FPS;

    for i in 0..(FPS * SECONDS) {
        let mut buffer = pipeline.acquire_buffer().context("waiting for a buffer")?;
        paint_gradient(&mut buffer, i);

        let timestamp = i as f64 / FPS as f64;
        if let Err(rejected) = pipeline.submit_frame(buffer, timestamp) {
            let (error, frame) = rejected.into_parts();
            eprintln!("   frame {} refused: {}", i, error);
            let _ = pipeline.release_unused(frame.into_buffer());
        }

        if i > 0 && i % FPS == 0 {
            let stats = pipeline.stats();
            println!(
                "   {}s | submitted {} | encoded {} | in flight {}",
                i / FPS,
                stats.frames_submitted,
                stats.export.encoded,
                stats.census.in_flight()
            );
        }

        thread::sleep(frame_interval / 4);
    }

    pipeline.shutdown().context("shutting down")?;
    let stats = pipeline.stats();

    println!();
    println!("Capture finished in {:.2}s", started.elapsed().as_secs_f64());
    println!("   Frames encoded: {}", stats.export.encoded);
    println!("   Frames dropped: {}", stats.export.dropped);
    println!("   Bytes written:  {}", stats.export.bytes_written);

    let reader = MovieReader::open(&path).context("reading movie back")?;
    println!(
        "   Read back {} frames, {:.2}s of video",
        reader.frame_count(),
        reader.duration()
    );

    Ok(())
}

/// A diagonal gradient that scrolls one pixel per frame.
fn paint_gradient(buffer: &mut FrameBuffer, frame_number: u32) {
    let width = buffer.width() as usize;
    for (i, px) in buffer.pixels_mut().chunks_exact_mut(4).enumerate() {
        let x = i % width;
        let y = i / width;
        px[0] = ((x + frame_number as usize) % 256) as u8;
        px[1] = ((y + frame_number as usize) % 256) as u8;
        px[2] = (frame_number % 256) as u8;
        px[3] = 255;
    }
}
