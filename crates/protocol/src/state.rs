use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    BackendSession, ByteRange, ChunkStatus, Direction, SourceRef, TransferId, TransferOutcome,
    TransferStatus,
};

/// Errors reported by [`TransferState::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("chunk {found} out of order (expected index {expected})")]
    IndexGap { expected: u32, found: u32 },

    #[error("chunk {index} starts at {start}, expected {expected}")]
    RangeGap { index: u32, start: u64, expected: u64 },

    #[error("chunks cover {covered} bytes of {total}")]
    Coverage { covered: u64, total: u64 },

    #[error("bytes transferred {recorded} differs from completed chunk total {actual}")]
    ByteCount { recorded: u64, actual: u64 },

    #[error("transfer marked completed with unfinished chunks")]
    PrematureCompletion,
}

/// One planned chunk of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkState {
    pub index: u32,
    pub range: ByteRange,
    pub status: ChunkStatus,
    /// Content digest, set once the chunk is completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

impl ChunkState {
    pub fn new(index: u32, range: ByteRange) -> Self {
        Self {
            index,
            range,
            status: ChunkStatus::Pending,
            checksum: None,
            retry_count: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.range.len()
    }

    pub fn is_completed(&self) -> bool {
        self.status == ChunkStatus::Completed
    }

    /// 1-based part number used by multipart backends.
    pub fn part_number(&self) -> u32 {
        self.index + 1
    }
}

/// Persisted record of one transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferState {
    pub id: TransferId,
    pub direction: Direction,
    pub resource_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// `None` until known (downloads learn it from a size fetch).
    pub total_size: Option<u64>,
    #[serde(default)]
    pub chunk_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<std::path::PathBuf>,
    #[serde(default)]
    pub chunks: Vec<ChunkState>,
    #[serde(default)]
    pub bytes_transferred: u64,
    pub status: TransferStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_session: Option<BackendSession>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TransferOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl TransferState {
    /// Creates a pending, unplanned record.
    pub fn new(id: TransferId, direction: Direction, resource_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            direction,
            resource_name: resource_name.into(),
            content_type: None,
            total_size: None,
            chunk_size: 0,
            source: None,
            destination: None,
            chunks: Vec::new(),
            bytes_transferred: 0,
            status: TransferStatus::Pending,
            created_at: now,
            updated_at: now,
            backend_session: None,
            tag: None,
            outcome: None,
            last_error: None,
        }
    }

    /// Refreshes `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn set_status(&mut self, status: TransferStatus) {
        self.status = status;
        self.touch();
    }

    /// Installs a chunk plan for a known total size.
    pub fn set_plan(&mut self, total_size: u64, chunk_size: u64, chunks: Vec<ChunkState>) {
        self.total_size = Some(total_size);
        self.chunk_size = chunk_size;
        self.chunks = chunks;
        self.recompute_bytes();
        self.touch();
    }

    pub fn is_planned(&self) -> bool {
        self.total_size.is_some() && !self.chunks.is_empty()
    }

    /// Recomputes `bytes_transferred` from completed chunks.
    pub fn recompute_bytes(&mut self) {
        self.bytes_transferred = self
            .chunks
            .iter()
            .filter(|c| c.is_completed())
            .map(ChunkState::size)
            .sum();
    }

    /// Marks a chunk completed and credits its bytes.
    pub fn complete_chunk(&mut self, index: u32, checksum: String) {
        if let Some(chunk) = self.chunks.get_mut(index as usize) {
            if chunk.is_completed() {
                return;
            }
            chunk.status = ChunkStatus::Completed;
            chunk.checksum = Some(checksum);
            self.bytes_transferred += chunk.size();
        }
        self.touch();
    }

    pub fn set_chunk_status(&mut self, index: u32, status: ChunkStatus) {
        if let Some(chunk) = self.chunks.get_mut(index as usize) {
            chunk.status = status;
        }
        self.touch();
    }

    /// Returns incomplete chunks to `Pending` so a new run re-attempts them.
    ///
    /// Failed chunks get a fresh retry budget; chunks left `Active` by a crash
    /// are treated as never started. Returns how many chunks were reset.
    pub fn reset_unfinished_chunks(&mut self) -> usize {
        let mut reset = 0;
        for chunk in &mut self.chunks {
            match chunk.status {
                ChunkStatus::Failed => {
                    chunk.status = ChunkStatus::Pending;
                    chunk.retry_count = 0;
                    reset += 1;
                }
                ChunkStatus::Active => {
                    chunk.status = ChunkStatus::Pending;
                    reset += 1;
                }
                ChunkStatus::Pending | ChunkStatus::Completed => {}
            }
        }
        if reset > 0 {
            self.touch();
        }
        reset
    }

    /// Indices of chunks that still need transferring, in order.
    pub fn remaining_chunks(&self) -> Vec<u32> {
        self.chunks
            .iter()
            .filter(|c| !c.is_completed())
            .map(|c| c.index)
            .collect()
    }

    pub fn all_chunks_completed(&self) -> bool {
        !self.chunks.is_empty() && self.chunks.iter().all(ChunkState::is_completed)
    }

    /// Checksums of every chunk in index order (`None` for unfinished chunks).
    pub fn ordered_checksums(&self) -> Vec<Option<String>> {
        self.chunks.iter().map(|c| c.checksum.clone()).collect()
    }

    /// Progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        match self.total_size {
            Some(0) if self.all_chunks_completed() => 100.0,
            Some(total) if total > 0 => self.bytes_transferred as f64 / total as f64 * 100.0,
            _ => 0.0,
        }
    }

    /// Checks the plan and byte-count invariants.
    pub fn validate(&self) -> Result<(), StateError> {
        let Some(total) = self.total_size else {
            return Ok(());
        };
        if self.chunks.is_empty() {
            return Ok(());
        }

        let mut expected_start = 0u64;
        for (position, chunk) in self.chunks.iter().enumerate() {
            let expected = position as u32;
            if chunk.index != expected {
                return Err(StateError::IndexGap {
                    expected,
                    found: chunk.index,
                });
            }
            if chunk.range.start != expected_start {
                return Err(StateError::RangeGap {
                    index: chunk.index,
                    start: chunk.range.start,
                    expected: expected_start,
                });
            }
            expected_start = chunk.range.end;
        }
        if expected_start != total {
            return Err(StateError::Coverage {
                covered: expected_start,
                total,
            });
        }

        let actual: u64 = self
            .chunks
            .iter()
            .filter(|c| c.is_completed())
            .map(ChunkState::size)
            .sum();
        if actual != self.bytes_transferred {
            return Err(StateError::ByteCount {
                recorded: self.bytes_transferred,
                actual,
            });
        }

        if self.status == TransferStatus::Completed && !self.all_chunks_completed() {
            return Err(StateError::PrematureCompletion);
        }
        Ok(())
    }
}
