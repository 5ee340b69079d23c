//! Engine error types.

use stevedore_backend::BackendError;
use stevedore_protocol::TransferId;
use stevedore_store::StoreError;
use stevedore_transfer::TransferError;

/// Errors produced while driving a transfer.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("chunk I/O error: {0}")]
    Transfer(#[from] TransferError),

    #[error("upload {0} has no re-openable source; supply it again to resume")]
    SourceRequired(TransferId),

    #[error("source of {id} is {actual} bytes, transfer was planned for {expected}")]
    SourceMismatch {
        id: TransferId,
        expected: u64,
        actual: u64,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
