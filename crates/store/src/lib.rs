//! Durable transfer state store and the registry built on top of it.
//!
//! The engine only talks to the [`StateStore`] trait, so the same manager
//! logic runs over a JSON file, an embedded database, or anything else
//! that can keep a record per transfer id.

mod json;
mod memory;
mod registry;

use stevedore_protocol::{TransferId, TransferState, TransferStatus};

pub use json::{JsonFileStore, config_dir, default_state_path};
pub use memory::MemoryStore;
pub use registry::TransferRegistry;

/// Errors from state store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: TransferId, reason: String },
}

/// Which statuses a listing should include.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StatusFilter {
    #[default]
    Any,
    /// Pending, in-progress and paused.
    Active,
    Only(Vec<TransferStatus>),
}

impl StatusFilter {
    pub fn matches(&self, status: TransferStatus) -> bool {
        match self {
            Self::Any => true,
            Self::Active => status.is_active(),
            Self::Only(set) => set.contains(&status),
        }
    }
}

/// Persistent key-value store of transfer records, keyed by transfer id.
///
/// Each `save` must be durable before it returns. The store does no per-id
/// locking: one manager owns an id at a time and the last write wins.
/// Writes to different ids must not interfere with each other.
pub trait StateStore: Send + Sync {
    fn save(&self, state: &TransferState) -> Result<(), StoreError>;

    fn get(&self, id: &TransferId) -> Result<Option<TransferState>, StoreError>;

    /// Removes a record. Deleting an unknown id is not an error.
    fn delete(&self, id: &TransferId) -> Result<(), StoreError>;

    /// Records matching `status` and, if given, `tag`, oldest first.
    fn list(
        &self,
        status: &StatusFilter,
        tag: Option<&str>,
    ) -> Result<Vec<TransferState>, StoreError>;
}

/// Shared filter used by the store implementations.
pub(crate) fn filter_sorted<'a>(
    records: impl Iterator<Item = &'a TransferState>,
    status: &StatusFilter,
    tag: Option<&str>,
) -> Vec<TransferState> {
    let mut out: Vec<TransferState> = records
        .filter(|s| status.matches(s.status))
        .filter(|s| tag.is_none_or(|t| s.tag.as_deref() == Some(t)))
        .cloned()
        .collect();
    out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    out
}
