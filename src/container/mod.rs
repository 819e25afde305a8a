//! # Movie Container Module
//!
//! Writes encoded frames into a single `.reel` file and reads them back.
//!
//! ## Plain English Explanation
//!
//! Encoded frames are like loose pages. The container binds them into one
//! book: a cover page saying what codec and size the pictures are, then
//! every page with its timestamp, then a back cover with the page count so
//! a reader can tell if the book was cut short.
//!
//! ```text
//!   ┌──────────┬─────────────────────────┬─────┬──────────────┐
//!   │  header  │ pts | flags | len | data │ ... │ END! | count │
//!   └──────────┴─────────────────────────┴─────┴──────────────┘
//! ```
//!
//! All integers are little endian.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::encoder::{CodecType, EncodedFrame};
use crate::error::{ContainerErrorKind, PipelineError, PipelineResult};
use crate::storage;

const MAGIC: &[u8; 4] = b"REEL";
const TRAILER_MAGIC: &[u8; 4] = b"END!";
/// Current container version
pub const FORMAT_VERSION: u16 = 1;

const HEADER_LEN: usize = 4 + 2 + 4 + 4 + 4 + 4;
const RECORD_HEADER_LEN: usize = 8 + 1 + 4;
const TRAILER_LEN: usize = 4 + 4;

const FLAG_KEY_FRAME: u8 = 0x01;

// ============================================
// HEADER
// ============================================

/// What every frame in the file looks like.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MovieHeader {
    pub codec: CodecType,
    pub width: u32,
    pub height: u32,
    /// Nominal frames per second
    pub frame_rate: f32,
}

impl MovieHeader {
    fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(MAGIC);
        out[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        out[6..10].copy_from_slice(&self.codec.fourcc());
        out[10..14].copy_from_slice(&self.width.to_le_bytes());
        out[14..18].copy_from_slice(&self.height.to_le_bytes());
        out[18..22].copy_from_slice(&self.frame_rate.to_le_bytes());
        out
    }

    fn parse(bytes: &[u8]) -> PipelineResult<Self> {
        if bytes.len() < 4 || &bytes[0..4] != MAGIC {
            return Err(container_error(ContainerErrorKind::BadMagic));
        }
        if bytes.len() < HEADER_LEN {
            return Err(container_error(ContainerErrorKind::Truncated {
                offset: bytes.len(),
            }));
        }

        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != FORMAT_VERSION {
            return Err(container_error(ContainerErrorKind::UnsupportedVersion(version)));
        }

        let fourcc = [bytes[6], bytes[7], bytes[8], bytes[9]];
        let codec = CodecType::from_fourcc(fourcc)
            .ok_or_else(|| container_error(ContainerErrorKind::UnknownCodec(fourcc)))?;

        Ok(Self {
            codec,
            width: read_u32(bytes, 10),
            height: read_u32(bytes, 14),
            frame_rate: f32::from_le_bytes([bytes[18], bytes[19], bytes[20], bytes[21]]),
        })
    }
}

fn container_error(kind: ContainerErrorKind) -> PipelineError {
    PipelineError::Container(kind)
}

/// Caller guarantees `bytes` holds at least `at + 4` bytes.
fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

// ============================================
// WRITER
// ============================================

/// Receives encoded frames in presentation order.
///
/// Runs on the exporter's completion thread, hence `Send`.
pub trait ContainerWriter: Send {
    /// Appends one frame after all previous ones.
    fn append(&mut self, frame: &EncodedFrame) -> PipelineResult<()>;

    /// Writes any trailer, flushes and closes. Later calls do nothing.
    fn close(&mut self) -> PipelineResult<()>;

    fn frames_written(&self) -> u32;

    fn bytes_written(&self) -> u64;
}

/// Writes a `.reel` file on disk.
pub struct MovieFileWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    frames: u32,
    bytes: u64,
}

impl MovieFileWriter {
    /// Creates the file, replacing anything already at `path`, and writes
    /// the header.
    ///
    /// Missing parent directories are created.
    pub fn create(path: impl AsRef<Path>, header: MovieHeader) -> PipelineResult<Self> {
        let path = path.as_ref().to_path_buf();
        let creation_failure = |source| PipelineError::FileCreationFailure {
            path: path.clone(),
            source,
        };

        storage::ensure_parent_directory(&path).map_err(creation_failure)?;
        let file = File::create(&path).map_err(creation_failure)?;

        let mut file = BufWriter::new(file);
        file.write_all(&header.to_bytes()).map_err(creation_failure)?;

        log::debug!(
            "Created movie file {:?}: {:?} {}x{}",
            path,
            header.codec,
            header.width,
            header.height
        );

        Ok(Self {
            path,
            file: Some(file),
            frames: 0,
            bytes: HEADER_LEN as u64,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ContainerWriter for MovieFileWriter {
    fn append(&mut self, frame: &EncodedFrame) -> PipelineResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| container_error(ContainerErrorKind::Closed))?;

        let flags = if frame.key_frame { FLAG_KEY_FRAME } else { 0 };
        let len = u32::try_from(frame.data.len()).map_err(|_| {
            PipelineError::SessionFailed(format!(
                "encoded frame of {} bytes is too large",
                frame.data.len()
            ))
        })?;

        file.write_all(&frame.timestamp.to_le_bytes())?;
        file.write_all(&[flags])?;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(&frame.data)?;

        self.frames += 1;
        self.bytes += (RECORD_HEADER_LEN + frame.data.len()) as u64;
        Ok(())
    }

    fn close(&mut self) -> PipelineResult<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };

        file.write_all(TRAILER_MAGIC)?;
        file.write_all(&self.frames.to_le_bytes())?;
        self.bytes += TRAILER_LEN as u64;

        let file = file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        log::info!(
            "Movie file closed with {} frames ({} bytes): {:?}",
            self.frames,
            self.bytes,
            self.path
        );
        Ok(())
    }

    fn frames_written(&self) -> u32 {
        self.frames
    }

    fn bytes_written(&self) -> u64 {
        self.bytes
    }
}

// ============================================
// READER
// ============================================

/// One frame as stored in the file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MovieFrame<'a> {
    pub timestamp: f64,
    pub key_frame: bool,
    pub data: &'a [u8],
}

#[derive(Clone, Copy, Debug)]
struct FrameRecord {
    timestamp: f64,
    key_frame: bool,
    offset: usize,
    len: usize,
}

/// Reads a finished `.reel` file through a memory map.
pub struct MovieReader {
    map: Mmap,
    header: MovieHeader,
    records: Vec<FrameRecord>,
}

impl MovieReader {
    /// Maps the file and indexes every frame.
    ///
    /// Fails if the magic, version or codec is wrong, or if the file ends
    /// before the trailer.
    pub fn open(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let file = File::open(path.as_ref())?;
        if file.metadata()?.len() == 0 {
            return Err(container_error(ContainerErrorKind::BadMagic));
        }

        // SAFETY: the mapping is read-only and this crate never writes a
        // movie file after closing it.
        let map = unsafe { Mmap::map(&file)? };

        let header = MovieHeader::parse(&map)?;
        let records = Self::index(&map)?;

        Ok(Self {
            map,
            header,
            records,
        })
    }

    fn index(bytes: &[u8]) -> PipelineResult<Vec<FrameRecord>> {
        let mut records = Vec::new();
        let mut at = HEADER_LEN;

        loop {
            let remaining = bytes.len() - at;

            // A record is always longer than the trailer
            if remaining == TRAILER_LEN && &bytes[at..at + 4] == TRAILER_MAGIC {
                let count = read_u32(bytes, at + 4) as usize;
                if count != records.len() {
                    return Err(container_error(ContainerErrorKind::Truncated { offset: at }));
                }
                return Ok(records);
            }

            if remaining < RECORD_HEADER_LEN {
                return Err(container_error(ContainerErrorKind::Truncated { offset: at }));
            }

            let mut pts = [0u8; 8];
            pts.copy_from_slice(&bytes[at..at + 8]);
            let flags = bytes[at + 8];
            let len = read_u32(bytes, at + 9) as usize;
            let offset = at + RECORD_HEADER_LEN;

            if bytes.len() - offset < len {
                return Err(container_error(ContainerErrorKind::Truncated { offset: at }));
            }

            records.push(FrameRecord {
                timestamp: f64::from_le_bytes(pts),
                key_frame: flags & FLAG_KEY_FRAME != 0,
                offset,
                len,
            });
            at = offset + len;
        }
    }

    pub fn header(&self) -> &MovieHeader {
        &self.header
    }

    pub fn frame_count(&self) -> usize {
        self.records.len()
    }

    /// Returns frame `index`, oldest first.
    pub fn frame(&self, index: usize) -> Option<MovieFrame<'_>> {
        self.records.get(index).map(|r| MovieFrame {
            timestamp: r.timestamp,
            key_frame: r.key_frame,
            data: &self.map[r.offset..r.offset + r.len],
        })
    }

    /// Iterates frames in file order.
    pub fn frames(&self) -> impl Iterator<Item = MovieFrame<'_>> + '_ {
        (0..self.records.len()).filter_map(move |i| self.frame(i))
    }

    /// Presentation timestamps in file order.
    pub fn timestamps(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.timestamp).collect()
    }

    /// Time between first and last frame, in seconds.
    pub fn duration(&self) -> f64 {
        match (self.records.first(), self.records.last()) {
            (Some(first), Some(last)) => last.timestamp - first.timestamp,
            _ => 0.0,
        }
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn header() -> MovieHeader {
        MovieHeader {
            codec: CodecType::Raw,
            width: 2,
            height: 2,
            frame_rate: 30.0,
        }
    }

    fn encoded(ts: f64, byte: u8) -> EncodedFrame {
        EncodedFrame {
            data: vec![byte; 16],
            timestamp: ts,
            key_frame: true,
        }
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.reel");

        let mut writer = MovieFileWriter::create(&path, header()).unwrap();
        writer.append(&encoded(0.0, 1)).unwrap();
        writer.append(&encoded(0.033, 2)).unwrap();
        writer.close().unwrap();
        assert_eq!(writer.frames_written(), 2);

        let reader = MovieReader::open(&path).unwrap();
        assert_eq!(reader.header(), &header());
        assert_eq!(reader.frame_count(), 2);
        assert_eq!(reader.timestamps(), vec![0.0, 0.033]);
        assert_eq!(reader.frame(1).unwrap().data, &[2u8; 16][..]);
        assert!((reader.duration() - 0.033).abs() < 1e-9);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            writer.bytes_written()
        );
    }

    #[test]
    fn test_create_truncates_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.reel");
        std::fs::write(&path, vec![0xAAu8; 4096]).unwrap();

        let mut writer = MovieFileWriter::create(&path, header()).unwrap();
        writer.close().unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, (HEADER_LEN + TRAILER_LEN) as u64);
        assert_eq!(MovieReader::open(&path).unwrap().frame_count(), 0);
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("clip.reel");
        let mut writer = MovieFileWriter::create(&path, header()).unwrap();
        writer.close().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_unwritable_path() {
        let dir = tempdir().unwrap();
        // A directory can't be opened as a file
        match MovieFileWriter::create(dir.path(), header()) {
            Err(PipelineError::FileCreationFailure { .. }) => {}
            other => panic!("expected FileCreationFailure, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_append_after_close() {
        let dir = tempdir().unwrap();
        let mut writer = MovieFileWriter::create(dir.path().join("c.reel"), header()).unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
        assert!(matches!(
            writer.append(&encoded(0.0, 0)),
            Err(PipelineError::Container(ContainerErrorKind::Closed))
        ));
    }

    #[test]
    fn test_reader_rejects_truncated_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cut.reel");

        let mut writer = MovieFileWriter::create(&path, header()).unwrap();
        writer.append(&encoded(0.0, 1)).unwrap();
        writer.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 12]).unwrap();

        assert!(matches!(
            MovieReader::open(&path),
            Err(PipelineError::Container(ContainerErrorKind::Truncated { .. }))
        ));
    }

    #[test]
    fn test_reader_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bogus.reel");
        std::fs::write(&path, b"not a movie at all, just text").unwrap();

        assert!(matches!(
            MovieReader::open(&path),
            Err(PipelineError::Container(ContainerErrorKind::BadMagic))
        ));
    }
}
