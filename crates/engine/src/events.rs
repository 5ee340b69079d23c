use std::path::PathBuf;

use bytes::Bytes;
use stevedore_protocol::{TransferId, UploadReceipt};
use stevedore_transfer::Artifact;

/// Result of [`start`](crate::UploadManager::start) and
/// [`start`](crate::DownloadManager::start).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome<T> {
    Completed(T),
    /// Stopped between chunks on request; `start` again to continue.
    Paused,
    /// Cancelled on request; the record has been removed.
    Cancelled,
}

impl<T> RunOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(v) => Some(v),
            _ => None,
        }
    }
}

/// What a finished download produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadArtifact {
    File(PathBuf),
    Memory(Bytes),
    /// The download completed in an earlier run and its in-memory bytes
    /// were handed out then.
    Delivered { size: u64 },
}

impl From<Artifact> for DownloadArtifact {
    fn from(artifact: Artifact) -> Self {
        match artifact {
            Artifact::File(path) => Self::File(path),
            Artifact::Memory(bytes) => Self::Memory(bytes),
        }
    }
}

/// Final result carried by [`TransferEvent::Completed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Upload(UploadReceipt),
    Download(DownloadArtifact),
}

/// Progress notifications, emitted in order from the manager's own task.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress {
        id: TransferId,
        /// 0-100.
        percent: f64,
        transferred: u64,
        total: u64,
    },
    ChunkCompleted {
        id: TransferId,
        index: u32,
        /// Number of chunks in the plan.
        total: u32,
    },
    Completed {
        id: TransferId,
        result: Completion,
    },
    Failed {
        id: TransferId,
        message: String,
    },
}

impl TransferEvent {
    pub fn id(&self) -> &TransferId {
        match self {
            Self::Progress { id, .. }
            | Self::ChunkCompleted { id, .. }
            | Self::Completed { id, .. }
            | Self::Failed { id, .. } => id,
        }
    }
}
