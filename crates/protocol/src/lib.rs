//! Persisted data model shared by every Stevedore crate.
//!
//! A [`TransferState`] is the single record the engine writes after each
//! chunk status change; everything needed to resume a transfer after a
//! restart lives here.

pub mod state;
pub mod types;

// Re-export primary types for convenience.
pub use state::{ChunkState, StateError, TransferState};
pub use types::{
    BackendSession, ByteRange, ChunkStatus, Direction, SourceRef, TransferId, TransferOutcome,
    TransferStatus, UploadReceipt,
};
