//! Backend error taxonomy.

/// Failures reported by storage backends and range readers.
///
/// Every variant carries the backend's own message. Only
/// [`ChunkTransfer`](Self::ChunkTransfer) is retried by the managers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("session init failed: {0}")]
    SessionInit(String),

    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("chunk transfer failed: {0}")]
    ChunkTransfer(String),

    #[error("finalization failed: {0}")]
    Finalization(String),

    #[error("quota or permission denied: {0}")]
    QuotaOrPermission(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ChunkTransfer(_))
    }

    /// The backend message without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::SessionInit(m)
            | Self::Authorization(m)
            | Self::ChunkTransfer(m)
            | Self::Finalization(m)
            | Self::QuotaOrPermission(m) => m,
        }
    }
}
