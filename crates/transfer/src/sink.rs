use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::{Bytes, BytesMut};
use stevedore_protocol::ByteRange;
use tracing::debug;

use crate::TransferError;
use crate::checksum::checksum_bytes;

/// Where a finished download ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    File(PathBuf),
    Memory(Bytes),
}

/// Destination for downloaded chunks.
///
/// Chunks may arrive in any order across runs; [`finish`](Self::finish)
/// assembles them by index.
pub trait ChunkSink: Send + Sync {
    /// Stores the bytes of chunk `index`, covering `range`.
    fn write_chunk(&self, index: u32, range: ByteRange, data: &[u8]) -> Result<(), TransferError>;

    /// Whether the sink still holds chunk `index` with the given SHA-256.
    ///
    /// Used on resume: chunks recorded complete but no longer held are
    /// downloaded again.
    fn holds_chunk(&self, index: u32, range: ByteRange, checksum: &str)
    -> Result<bool, TransferError>;

    /// Assembles the final artifact once every chunk is written.
    fn finish(&self, total_size: u64) -> Result<Artifact, TransferError>;

    /// Drops any partial data (on cancel).
    fn discard(&self) -> Result<(), TransferError>;

    /// Final path, if the artifact is a file.
    fn destination(&self) -> Option<PathBuf> {
        None
    }
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

/// Buffers chunks in memory keyed by index.
///
/// Buffers do not survive a restart; a resumed download re-fetches them.
#[derive(Default)]
pub struct MemorySink {
    chunks: Mutex<BTreeMap<u32, Bytes>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkSink for MemorySink {
    fn write_chunk(&self, index: u32, _range: ByteRange, data: &[u8]) -> Result<(), TransferError> {
        let mut chunks = self.chunks.lock().unwrap();
        chunks.insert(index, Bytes::copy_from_slice(data));
        Ok(())
    }

    fn holds_chunk(
        &self,
        index: u32,
        range: ByteRange,
        checksum: &str,
    ) -> Result<bool, TransferError> {
        let chunks = self.chunks.lock().unwrap();
        Ok(chunks
            .get(&index)
            .is_some_and(|b| b.len() as u64 == range.len() && checksum_bytes(b) == checksum))
    }

    fn finish(&self, total_size: u64) -> Result<Artifact, TransferError> {
        let chunks = self.chunks.lock().unwrap();
        let mut out = BytesMut::with_capacity(total_size as usize);
        for (expected, (index, data)) in chunks.iter().enumerate() {
            if *index != expected as u32 {
                return Err(TransferError::MissingChunk(expected as u32));
            }
            out.extend_from_slice(data);
        }
        if out.len() as u64 != total_size {
            return Err(TransferError::SizeMismatch {
                expected: total_size,
                actual: out.len() as u64,
            });
        }
        Ok(Artifact::Memory(out.freeze()))
    }

    fn discard(&self) -> Result<(), TransferError> {
        self.chunks.lock().unwrap().clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileSink
// ---------------------------------------------------------------------------

/// Writes chunks at their offsets into `<destination>.part`, renaming the
/// file into place on completion.
pub struct FileSink {
    destination: PathBuf,
    part_path: PathBuf,
    io: Mutex<()>,
}

impl FileSink {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        let destination = destination.into();
        let mut part = destination.clone().into_os_string();
        part.push(".part");
        Self {
            destination,
            part_path: PathBuf::from(part),
            io: Mutex::new(()),
        }
    }

    pub fn part_path(&self) -> &Path {
        &self.part_path
    }
}

impl ChunkSink for FileSink {
    fn write_chunk(&self, index: u32, range: ByteRange, data: &[u8]) -> Result<(), TransferError> {
        let _guard = self.io.lock().unwrap();

        if let Some(parent) = self.part_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.part_path)?;
        file.seek(SeekFrom::Start(range.start))?;
        file.write_all(data)?;
        file.sync_data()?;

        debug!(chunk = index, range = %range, path = %self.part_path.display(), "chunk spooled");
        Ok(())
    }

    fn holds_chunk(
        &self,
        _index: u32,
        range: ByteRange,
        checksum: &str,
    ) -> Result<bool, TransferError> {
        let _guard = self.io.lock().unwrap();

        let mut file = match std::fs::File::open(&self.part_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if file.metadata()?.len() < range.end {
            return Ok(false);
        }
        file.seek(SeekFrom::Start(range.start))?;
        let mut buf = vec![0u8; range.len() as usize];
        file.read_exact(&mut buf)?;
        Ok(checksum_bytes(&buf) == checksum)
    }

    fn finish(&self, total_size: u64) -> Result<Artifact, TransferError> {
        let _guard = self.io.lock().unwrap();

        if let Some(parent) = self.part_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // A zero-byte download never wrote a chunk.
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.part_path)?;
        let actual = file.metadata()?.len();
        if actual != total_size {
            return Err(TransferError::SizeMismatch {
                expected: total_size,
                actual,
            });
        }
        file.sync_all()?;
        drop(file);

        std::fs::rename(&self.part_path, &self.destination)?;
        Ok(Artifact::File(self.destination.clone()))
    }

    fn discard(&self) -> Result<(), TransferError> {
        let _guard = self.io.lock().unwrap();
        match std::fs::remove_file(&self.part_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn destination(&self) -> Option<PathBuf> {
        Some(self.destination.clone())
    }
}
