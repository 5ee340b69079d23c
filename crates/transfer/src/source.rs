use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use stevedore_protocol::{ByteRange, SourceRef};

use crate::TransferError;

/// Random-access provider of upload bytes.
///
/// Reads are blocking; the engine calls them from `spawn_blocking`.
pub trait ChunkSource: Send + Sync {
    /// Total size in bytes.
    fn size(&self) -> Result<u64, TransferError>;

    /// Reads exactly the bytes in `range`.
    fn read_range(&self, range: ByteRange) -> Result<Bytes, TransferError>;

    /// Persistable reference, if the source can be re-opened after a restart.
    fn source_ref(&self) -> Option<SourceRef> {
        None
    }
}

/// Local file read by offset. Re-openable, so uploads from it can
/// auto-resume.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    /// Opens `path`, failing early if it is not a readable file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let path = path.into();
        let meta = std::fs::metadata(&path)?;
        if !meta.is_file() {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a regular file: {}", path.display()),
            )));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChunkSource for FileSource {
    fn size(&self) -> Result<u64, TransferError> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    fn read_range(&self, range: ByteRange) -> Result<Bytes, TransferError> {
        let len = self.size()?;
        if range.end > len {
            return Err(TransferError::RangeOutOfBounds { range, len });
        }

        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(range.start))?;
        let mut buf = vec![0u8; range.len() as usize];
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn source_ref(&self) -> Option<SourceRef> {
        Some(SourceRef::File {
            path: self.path.clone(),
        })
    }
}

/// In-memory buffer. Not re-openable after a restart.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl ChunkSource for MemorySource {
    fn size(&self) -> Result<u64, TransferError> {
        Ok(self.data.len() as u64)
    }

    fn read_range(&self, range: ByteRange) -> Result<Bytes, TransferError> {
        let len = self.data.len() as u64;
        if range.end > len {
            return Err(TransferError::RangeOutOfBounds { range, len });
        }
        Ok(self.data.slice(range.start as usize..range.end as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn create_test_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[test]
    fn file_source_reads_ranges() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"AABBCCDDEE");

        let source = FileSource::open(&path).unwrap();
        assert_eq!(source.size().unwrap(), 10);
        assert_eq!(&source.read_range(ByteRange::new(0, 4)).unwrap()[..], b"AABB");
        assert_eq!(&source.read_range(ByteRange::new(8, 10)).unwrap()[..], b"EE");
        assert!(source.read_range(ByteRange::new(5, 5)).unwrap().is_empty());
    }

    #[test]
    fn file_source_rejects_out_of_bounds() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"0123");
        let source = FileSource::open(&path).unwrap();

        let err = source.read_range(ByteRange::new(2, 8)).unwrap_err();
        assert!(matches!(err, TransferError::RangeOutOfBounds { len: 4, .. }));
    }

    #[test]
    fn file_source_is_reopenable() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"x");
        let source = FileSource::open(&path).unwrap();
        assert_eq!(source.source_ref(), Some(SourceRef::File { path }));
    }

    #[test]
    fn file_source_rejects_directory_and_missing() {
        let dir = TempDir::new().unwrap();
        assert!(FileSource::open(dir.path()).is_err());
        assert!(FileSource::open(dir.path().join("missing.bin")).is_err());
    }

    #[test]
    fn memory_source_slices() {
        let source = MemorySource::new(b"0123456789".to_vec());
        assert_eq!(source.size().unwrap(), 10);
        assert_eq!(&source.read_range(ByteRange::new(6, 10)).unwrap()[..], b"6789");
        assert!(source.read_range(ByteRange::new(6, 11)).is_err());
        assert!(source.source_ref().is_none());
    }
}
