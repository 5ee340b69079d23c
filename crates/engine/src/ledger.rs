//! Persistence and event plumbing shared by both managers.

use std::sync::{Arc, RwLock};

use stevedore_protocol::{TransferId, TransferState};
use stevedore_store::StateStore;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::EngineError;
use crate::events::TransferEvent;

pub(crate) struct Ledger {
    id: TransferId,
    store: Arc<dyn StateStore>,
    snapshot: RwLock<Option<TransferState>>,
    events: Option<mpsc::Sender<TransferEvent>>,
}

impl Ledger {
    pub(crate) fn new(id: TransferId, store: Arc<dyn StateStore>) -> Self {
        Self {
            id,
            store,
            snapshot: RwLock::new(None),
            events: None,
        }
    }

    pub(crate) fn id(&self) -> &TransferId {
        &self.id
    }

    pub(crate) fn set_events(&mut self, tx: mpsc::Sender<TransferEvent>) {
        self.events = Some(tx);
    }

    /// Reads the persisted record and refreshes the snapshot.
    pub(crate) fn load(&self) -> Result<Option<TransferState>, EngineError> {
        let state = self.store.get(&self.id)?;
        if let Some(s) = &state {
            *self.snapshot.write().unwrap() = Some(s.clone());
        }
        Ok(state)
    }

    /// Durably saves `state`, then publishes it as the current snapshot.
    pub(crate) fn persist(&self, state: &TransferState) -> Result<(), EngineError> {
        self.store.save(state)?;
        *self.snapshot.write().unwrap() = Some(state.clone());
        Ok(())
    }

    /// Like [`persist`](Self::persist) but only logs a failure. Used while
    /// already reporting another error.
    pub(crate) fn persist_quietly(&self, state: &TransferState) {
        if let Err(e) = self.persist(state) {
            warn!(transfer = %self.id, error = %e, "failed to persist transfer state");
        }
    }

    pub(crate) fn delete(&self) -> Result<(), EngineError> {
        self.store.delete(&self.id)?;
        *self.snapshot.write().unwrap() = None;
        Ok(())
    }

    /// Latest known state: the in-memory snapshot, else the store.
    pub(crate) fn current(&self) -> Result<Option<TransferState>, EngineError> {
        if let Some(s) = self.snapshot.read().unwrap().clone() {
            return Ok(Some(s));
        }
        self.load()
    }

    pub(crate) async fn emit(&self, event: TransferEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    /// Emits progress and chunk-completed events for chunk `index`.
    pub(crate) async fn emit_chunk_done(&self, state: &TransferState, index: u32) {
        self.emit(TransferEvent::Progress {
            id: self.id.clone(),
            percent: state.percentage(),
            transferred: state.bytes_transferred,
            total: state.total_size.unwrap_or(0),
        })
        .await;
        self.emit(TransferEvent::ChunkCompleted {
            id: self.id.clone(),
            index,
            total: state.chunks.len() as u32,
        })
        .await;
    }
}
