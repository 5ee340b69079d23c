//! Chunk planning, checksums, retry policy and chunk I/O.
//!
//! Everything in this crate is synchronous and transport-agnostic; the
//! engine drives it from async tasks.

mod checksum;
mod planner;
mod retry;
mod sink;
mod source;

pub use checksum::{ChecksumAlgorithm, checksum_bytes};
pub use planner::plan;
pub use retry::RetryPolicy;
pub use sink::{Artifact, ChunkSink, FileSink, MemorySink};
pub use source::{ChunkSource, FileSource, MemorySource};

/// Default upload chunk size: 10 MiB.
///
/// Stays above the usual 5 MiB multipart minimum part size.
pub const DEFAULT_UPLOAD_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Default download chunk size: 5 MiB.
pub const DEFAULT_DOWNLOAD_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch on chunk {0}")]
    ChecksumMismatch(u32),

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("range {range} out of bounds for source of {len} bytes")]
    RangeOutOfBounds {
        range: stevedore_protocol::ByteRange,
        len: u64,
    },

    #[error("plan needs {count} chunks, at most {limit} allowed")]
    TooManyChunks { count: u64, limit: u64 },

    #[error("missing chunk {0}")]
    MissingChunk(u32),

    #[error("artifact is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
}
