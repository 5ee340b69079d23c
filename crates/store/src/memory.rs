use std::collections::HashMap;
use std::sync::RwLock;

use stevedore_protocol::{TransferId, TransferState};

use crate::{StateStore, StatusFilter, StoreError, filter_sorted};

/// In-process store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<TransferId, TransferState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for MemoryStore {
    fn save(&self, state: &TransferState) -> Result<(), StoreError> {
        self.records
            .write()
            .unwrap()
            .insert(state.id.clone(), state.clone());
        Ok(())
    }

    fn get(&self, id: &TransferId) -> Result<Option<TransferState>, StoreError> {
        Ok(self.records.read().unwrap().get(id).cloned())
    }

    fn delete(&self, id: &TransferId) -> Result<(), StoreError> {
        self.records.write().unwrap().remove(id);
        Ok(())
    }

    fn list(
        &self,
        status: &StatusFilter,
        tag: Option<&str>,
    ) -> Result<Vec<TransferState>, StoreError> {
        let records = self.records.read().unwrap();
        Ok(filter_sorted(records.values(), status, tag))
    }
}
