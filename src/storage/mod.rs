//! # Storage Module
//!
//! File-system helpers around movie output.
//!
//! ## Plain English
//!
//! Before writing a movie we make sure its folder exists, and when the
//! caller doesn't care about the name we pick one from the current time.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;

/// File extension used for movie files.
pub const MOVIE_EXTENSION: &str = "reel";

/// Generates a timestamped path for a new movie inside `output_directory`.
///
/// Format: `movie_YYYYMMDD_HHMMSS.reel`
pub fn generate_filename(output_directory: impl AsRef<Path>) -> PathBuf {
    let now = Local::now();
    let filename = format!("movie_{}.{}", now.format("%Y%m%d_%H%M%S"), MOVIE_EXTENSION);
    output_directory.as_ref().join(filename)
}

/// Ensures a directory exists.
fn ensure_directory(path: impl AsRef<Path>) -> io::Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        log::info!("Creating output directory: {:?}", path);
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Ensures the directory that will hold `file` exists.
pub fn ensure_parent_directory(file: impl AsRef<Path>) -> io::Result<()> {
    match file.as_ref().parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_directory(parent),
        _ => Ok(()),
    }
}

// ============================================
// TESTS
// ============================================
