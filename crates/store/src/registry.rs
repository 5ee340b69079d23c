use std::sync::Arc;

use stevedore_protocol::{TransferId, TransferState, TransferStatus};
use tracing::info;

use crate::{StateStore, StatusFilter, StoreError};

/// Read-mostly view over the store for discovering and cleaning up
/// transfers across restarts.
#[derive(Clone)]
pub struct TransferRegistry {
    store: Arc<dyn StateStore>,
}

impl TransferRegistry {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Transfers that are pending, in progress or paused.
    pub fn list_active(&self, tag: Option<&str>) -> Result<Vec<TransferState>, StoreError> {
        self.store.list(&StatusFilter::Active, tag)
    }

    pub fn list(
        &self,
        filter: &StatusFilter,
        tag: Option<&str>,
    ) -> Result<Vec<TransferState>, StoreError> {
        self.store.list(filter, tag)
    }

    pub fn get(&self, id: &TransferId) -> Result<Option<TransferState>, StoreError> {
        self.store.get(id)
    }

    /// Deletes a record. Returns whether it existed.
    pub fn remove(&self, id: &TransferId) -> Result<bool, StoreError> {
        let existed = self.store.get(id)?.is_some();
        if existed {
            self.store.delete(id)?;
            info!(transfer = %id, "removed transfer record");
        }
        Ok(existed)
    }

    /// Deletes every completed or failed record, optionally limited to a tag.
    /// Returns how many were removed.
    pub fn prune_finished(&self, tag: Option<&str>) -> Result<usize, StoreError> {
        let finished = self.store.list(
            &StatusFilter::Only(vec![TransferStatus::Completed, TransferStatus::Failed]),
            tag,
        )?;
        for state in &finished {
            self.store.delete(&state.id)?;
        }
        if !finished.is_empty() {
            info!(count = finished.len(), "pruned finished transfers");
        }
        Ok(finished.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use stevedore_protocol::Direction;

    fn seeded() -> TransferRegistry {
        let store = Arc::new(MemoryStore::new());
        for (id, status, tag) in [
            ("p", TransferStatus::Pending, Some("game")),
            ("r", TransferStatus::InProgress, None),
            ("z", TransferStatus::Paused, Some("game")),
            ("c", TransferStatus::Completed, Some("game")),
            ("f", TransferStatus::Failed, None),
        ] {
            let mut s = TransferState::new(id.into(), Direction::Upload, id);
            s.status = status;
            s.tag = tag.map(str::to_string);
            store.save(&s).unwrap();
        }
        TransferRegistry::new(store)
    }

    #[test]
    fn list_active_excludes_terminal() {
        let registry = seeded();
        let active = registry.list_active(None).unwrap();
        assert_eq!(active.len(), 3);
        assert!(active.iter().all(|s| s.status.is_active()));
    }

    #[test]
    fn list_active_by_tag() {
        let registry = seeded();
        let active = registry.list_active(Some("game")).unwrap();
        let mut ids: Vec<_> = active.iter().map(|s| s.id.as_str().to_string()).collect();
        ids.sort();
        assert_eq!(ids, vec!["p", "z"]);
    }

    #[test]
    fn remove_reports_existence() {
        let registry = seeded();
        assert!(registry.remove(&"c".into()).unwrap());
        assert!(!registry.remove(&"c".into()).unwrap());
        assert!(registry.get(&"c".into()).unwrap().is_none());
    }

    #[test]
    fn prune_finished_keeps_active() {
        let registry = seeded();
        assert_eq!(registry.prune_finished(None).unwrap(), 2);
        assert_eq!(registry.list(&StatusFilter::Any, None).unwrap().len(), 3);
        assert_eq!(registry.prune_finished(None).unwrap(), 0);
    }

    #[test]
    fn prune_finished_by_tag() {
        let registry = seeded();
        assert_eq!(registry.prune_finished(Some("game")).unwrap(), 1);
        assert!(registry.get(&"f".into()).unwrap().is_some());
    }
}
