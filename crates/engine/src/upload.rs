//! Resumable multipart upload.
//!
//! `UploadManager` drives one transfer: it opens a backend session, sends
//! the planned chunks strictly in index order, persisting the record after
//! every step, and finalizes once every chunk is confirmed. Any run can stop
//! (pause, crash, failure) and a later [`UploadManager::start`] continues
//! with the chunks that are not yet completed.

use std::sync::Arc;

use bytes::Bytes;
use stevedore_backend::{PartUpload, QuotaGate, StorageBackend, Unlimited};
use stevedore_protocol::{
    BackendSession, ByteRange, ChunkStatus, Direction, SourceRef, TransferId, TransferOutcome,
    TransferState, TransferStatus, UploadReceipt,
};
use stevedore_store::StateStore;
use stevedore_transfer::{ChecksumAlgorithm, ChunkSource, FileSource, TransferError, plan};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::attempts::with_retries;
use crate::config::EngineConfig;
use crate::control::TransferControl;
use crate::error::EngineError;
use crate::events::{Completion, RunOutcome, TransferEvent};
use crate::ledger::Ledger;

/// Describes a new upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    /// Object name at the backend.
    pub name: String,
    pub content_type: Option<String>,
    pub tag: Option<String>,
}

impl UploadRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content_type: None,
            tag: None,
        }
    }
}

pub struct UploadManager {
    ledger: Ledger,
    backend: Arc<dyn StorageBackend>,
    source: Option<Arc<dyn ChunkSource>>,
    request: Option<UploadRequest>,
    quota: Arc<dyn QuotaGate>,
    config: EngineConfig,
    control: TransferControl,
    run_lock: tokio::sync::Mutex<()>,
}

impl UploadManager {
    /// Manager for a new upload of `source`. If the store already holds a
    /// record for `id`, that record is continued instead.
    pub fn new(
        id: TransferId,
        request: UploadRequest,
        source: Arc<dyn ChunkSource>,
        backend: Arc<dyn StorageBackend>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let mut manager = Self::build(id, backend, store);
        manager.request = Some(request);
        manager.source = Some(source);
        manager
    }

    /// Manager for an upload persisted by an earlier run.
    ///
    /// Without [`with_source`](Self::with_source), the recorded file path is
    /// re-opened on start.
    pub fn resume(
        id: TransferId,
        backend: Arc<dyn StorageBackend>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, EngineError> {
        let manager = Self::build(id, backend, store);
        match manager.ledger.load()? {
            Some(state) if state.direction == Direction::Upload => Ok(manager),
            Some(_) => Err(EngineError::InvalidState(format!(
                "transfer {} is not an upload",
                manager.ledger.id()
            ))),
            None => Err(EngineError::InvalidState(format!(
                "no persisted transfer {}",
                manager.ledger.id()
            ))),
        }
    }

    fn build(id: TransferId, backend: Arc<dyn StorageBackend>, store: Arc<dyn StateStore>) -> Self {
        Self {
            ledger: Ledger::new(id, store),
            backend,
            source: None,
            request: None,
            quota: Arc::new(Unlimited),
            config: EngineConfig::default(),
            control: TransferControl::new(),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn ChunkSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_quota(mut self, quota: Arc<dyn QuotaGate>) -> Self {
        self.quota = quota;
        self
    }

    /// Sends [`TransferEvent`]s to `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<TransferEvent>) -> Self {
        self.ledger.set_events(tx);
        self
    }

    pub fn id(&self) -> &TransferId {
        self.ledger.id()
    }

    /// Handle for pausing or cancelling from another task.
    pub fn control(&self) -> TransferControl {
        self.control.clone()
    }

    /// Latest persisted state, `None` once cancelled.
    pub fn get_state(&self) -> Result<Option<TransferState>, EngineError> {
        self.ledger.current()
    }

    /// Runs the upload until it completes, pauses, is cancelled or fails.
    ///
    /// Calling `start` on a completed upload returns the recorded receipt
    /// without contacting the backend.
    pub async fn start(&self) -> Result<RunOutcome<UploadReceipt>, EngineError> {
        let _run = self.run_lock.lock().await;
        self.control.clear_pause();

        if self.control.is_cancelled() {
            self.discard().await?;
            return Ok(RunOutcome::Cancelled);
        }

        let mut state = self.load_or_create()?;
        if state.status == TransferStatus::Completed {
            return match &state.outcome {
                Some(TransferOutcome::Uploaded(receipt)) => {
                    debug!(transfer = %state.id, "upload already completed");
                    Ok(RunOutcome::Completed(receipt.clone()))
                }
                _ => Err(EngineError::InvalidState(format!(
                    "completed upload {} has no receipt",
                    state.id
                ))),
            };
        }

        match self.drive(&mut state).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.fail(&mut state, &e).await;
                Err(e)
            }
        }
    }

    /// Requests a pause. A running upload stops after its current chunk;
    /// an idle one is marked paused right away.
    pub async fn pause(&self) -> Result<(), EngineError> {
        self.control.request_pause();
        if let Ok(_run) = self.run_lock.try_lock()
            && let Some(mut state) = self.ledger.load()?
            && state.status.is_active()
            && state.status != TransferStatus::Paused
        {
            state.set_status(TransferStatus::Paused);
            self.ledger.persist(&state)?;
        }
        Ok(())
    }

    /// Cancels the upload: waits for an in-flight chunk to settle, aborts
    /// the backend session (best effort) and deletes the record.
    pub async fn cancel(&self) -> Result<(), EngineError> {
        self.control.request_cancel();
        let _run = self.run_lock.lock().await;
        self.discard().await
    }

    fn load_or_create(&self) -> Result<TransferState, EngineError> {
        if let Some(state) = self.ledger.load()? {
            return Ok(state);
        }
        let request = self.request.as_ref().ok_or_else(|| {
            EngineError::InvalidState(format!("no persisted transfer {}", self.ledger.id()))
        })?;

        let mut state = TransferState::new(
            self.ledger.id().clone(),
            Direction::Upload,
            request.name.clone(),
        );
        state.content_type = request.content_type.clone();
        state.tag = request.tag.clone();
        state.source = self.source.as_ref().and_then(|s| s.source_ref());
        self.ledger.persist(&state)?;
        info!(transfer = %state.id, name = %state.resource_name, "created upload");
        Ok(state)
    }

    async fn resolve_source(
        &self,
        state: &TransferState,
    ) -> Result<Arc<dyn ChunkSource>, EngineError> {
        if let Some(source) = &self.source {
            return Ok(Arc::clone(source));
        }
        match &state.source {
            Some(SourceRef::File { path }) => {
                let path = path.clone();
                let source = tokio::task::spawn_blocking(move || FileSource::open(path)).await??;
                Ok(Arc::new(source))
            }
            _ => Err(EngineError::SourceRequired(state.id.clone())),
        }
    }

    /// Plans a new upload or checks the source against an existing plan,
    /// then readies unfinished chunks for this run.
    fn prepare(
        &self,
        state: &mut TransferState,
        source: &dyn ChunkSource,
    ) -> Result<(), EngineError> {
        let size = source.size()?;

        match state.total_size {
            Some(expected) if state.is_planned() => {
                if expected != size {
                    return Err(EngineError::SourceMismatch {
                        id: state.id.clone(),
                        expected,
                        actual: size,
                    });
                }
            }
            _ => {
                let chunks = plan(size, self.config.upload_chunk_size)?;
                if let Some(limit) = self.backend.max_parts()
                    && chunks.len() > limit as usize
                {
                    return Err(TransferError::TooManyChunks {
                        count: chunks.len() as u64,
                        limit: u64::from(limit),
                    }
                    .into());
                }
                debug!(transfer = %state.id, size, chunks = chunks.len(), "planned upload");
                state.set_plan(size, self.config.upload_chunk_size, chunks);
            }
        }
        if state.source.is_none() {
            state.source = source.source_ref();
        }

        let reset = state.reset_unfinished_chunks();
        if reset > 0 {
            debug!(transfer = %state.id, reset, "reset unfinished chunks");
        }
        state.last_error = None;
        state.set_status(TransferStatus::InProgress);
        self.ledger.persist(state)
    }

    /// Opens the source, readies the plan and runs it.
    async fn drive(
        &self,
        state: &mut TransferState,
    ) -> Result<RunOutcome<UploadReceipt>, EngineError> {
        let source = self.resolve_source(state).await?;
        self.prepare(state, source.as_ref())?;
        self.run(state, source).await
    }

    async fn run(
        &self,
        state: &mut TransferState,
        source: Arc<dyn ChunkSource>,
    ) -> Result<RunOutcome<UploadReceipt>, EngineError> {
        let session = match &state.backend_session {
            Some(session) => session.clone(),
            None => {
                let session = self
                    .backend
                    .open_session(&state.resource_name, state.content_type.as_deref())
                    .await?;
                state.backend_session = Some(session.clone());
                state.touch();
                self.ledger.persist(state)?;
                session
            }
        };

        let algorithm = self.backend.checksum_algorithm();

        for index in state.remaining_chunks() {
            if let Some(outcome) = self.interrupted(state).await? {
                return Ok(outcome);
            }

            let range = state.chunks[index as usize].range;
            let (data, checksum) = read_chunk(&source, range, algorithm).await?;

            state.set_chunk_status(index, ChunkStatus::Active);
            self.ledger.persist(state)?;

            let confirmed = self
                .send_chunk(state, &session, index, data, checksum)
                .await?;

            state.complete_chunk(index, confirmed);
            self.ledger.persist(state)?;
            debug!(
                transfer = %state.id,
                chunk = index,
                transferred = state.bytes_transferred,
                "chunk uploaded"
            );
            self.ledger.emit_chunk_done(state, index).await;
        }

        if let Some(outcome) = self.interrupted(state).await? {
            return Ok(outcome);
        }

        let checksums = state
            .ordered_checksums()
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                EngineError::InvalidState(format!("{}: finalizing with unfinished chunks", state.id))
            })?;

        let receipt = self.backend.finalize_session(&session, checksums).await?;

        state.outcome = Some(TransferOutcome::Uploaded(receipt.clone()));
        state.set_status(TransferStatus::Completed);
        self.ledger.persist(state)?;
        info!(
            transfer = %state.id,
            file_id = %receipt.file_id,
            bytes = state.bytes_transferred,
            "upload completed"
        );
        self.ledger
            .emit(TransferEvent::Completed {
                id: state.id.clone(),
                result: Completion::Upload(receipt.clone()),
            })
            .await;
        Ok(RunOutcome::Completed(receipt))
    }

    /// Sends one chunk with retries, holding a quota reservation for it.
    async fn send_chunk(
        &self,
        state: &mut TransferState,
        session: &BackendSession,
        index: u32,
        data: Bytes,
        checksum: String,
    ) -> Result<String, EngineError> {
        let cost = data.len() as u64;
        let part_number = state.chunks[index as usize].part_number();
        let id = state.id.clone();

        if let Err(e) = self.quota.check_and_reserve(cost) {
            state.set_chunk_status(index, ChunkStatus::Failed);
            return Err(e.into());
        }

        let backend = &self.backend;
        let ledger = &self.ledger;
        let result = with_retries(
            &self.config.retry,
            &id,
            index,
            |_| {
                state.chunks[index as usize].retry_count += 1;
                state.touch();
                ledger.persist_quietly(state);
            },
            move || {
                let part = PartUpload {
                    part_number,
                    data: data.clone(),
                    checksum: checksum.clone(),
                };
                async move {
                    let target = backend.part_upload_target(session).await?;
                    backend.upload_part(&target, part).await
                }
            },
        )
        .await;

        match result {
            Ok(confirmed) => {
                self.quota.commit(cost);
                Ok(confirmed)
            }
            Err(e) => {
                self.quota.release(cost);
                state.set_chunk_status(index, ChunkStatus::Failed);
                Err(e.into())
            }
        }
    }

    /// Honours a pending cancel or pause request between chunks.
    async fn interrupted(
        &self,
        state: &mut TransferState,
    ) -> Result<Option<RunOutcome<UploadReceipt>>, EngineError> {
        if self.control.is_cancelled() {
            self.discard().await?;
            return Ok(Some(RunOutcome::Cancelled));
        }
        if self.control.is_pause_requested() {
            state.set_status(TransferStatus::Paused);
            self.ledger.persist(state)?;
            info!(transfer = %state.id, done = state.bytes_transferred, "upload paused");
            return Ok(Some(RunOutcome::Paused));
        }
        Ok(None)
    }

    /// Aborts the backend session and removes the record.
    async fn discard(&self) -> Result<(), EngineError> {
        let Some(state) = self.ledger.load()? else {
            return Ok(());
        };
        if state.status != TransferStatus::Completed
            && let Some(session) = &state.backend_session
            && let Err(e) = self.backend.abort_session(session).await
        {
            warn!(transfer = %state.id, session = session.session_id(), error = %e, "abort failed");
        }
        self.ledger.delete()?;
        info!(transfer = %state.id, "upload cancelled");
        Ok(())
    }

    async fn fail(&self, state: &mut TransferState, error: &EngineError) {
        warn!(transfer = %state.id, error = %error, "upload failed");
        state.last_error = Some(error.to_string());
        state.set_status(TransferStatus::Failed);
        self.ledger.persist_quietly(state);
        self.ledger
            .emit(TransferEvent::Failed {
                id: state.id.clone(),
                message: error.to_string(),
            })
            .await;
    }
}

/// Reads and fingerprints one chunk off the async runtime.
async fn read_chunk(
    source: &Arc<dyn ChunkSource>,
    range: ByteRange,
    algorithm: ChecksumAlgorithm,
) -> Result<(Bytes, String), EngineError> {
    let source = Arc::clone(source);
    let read = tokio::task::spawn_blocking(move || {
        let data = source.read_range(range)?;
        let checksum = algorithm.digest(&data);
        Ok::<_, stevedore_transfer::TransferError>((data, checksum))
    });
    Ok(read.await??)
}
