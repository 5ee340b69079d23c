use serde::{Deserialize, Serialize};
use stevedore_transfer::{DEFAULT_DOWNLOAD_CHUNK_SIZE, DEFAULT_UPLOAD_CHUNK_SIZE, RetryPolicy};

/// Tunables shared by the upload and download managers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bytes per upload part.
    pub upload_chunk_size: u64,
    /// Bytes per ranged read.
    pub download_chunk_size: u64,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            download_chunk_size: DEFAULT_DOWNLOAD_CHUNK_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}
