//! Resumable ranged download.
//!
//! Mirrors the upload manager: the resource is planned into byte ranges,
//! each range is fetched with retries and handed to a [`ChunkSink`], and
//! the record is persisted after every chunk. Only the URL and the plan
//! are needed to continue, so downloads resume without caller input.

use std::sync::Arc;

use stevedore_backend::{QuotaGate, RangeReader, Unlimited};
use stevedore_protocol::{
    ChunkStatus, Direction, SourceRef, TransferId, TransferOutcome, TransferState, TransferStatus,
};
use stevedore_store::StateStore;
use stevedore_transfer::{ChunkSink, FileSink, MemorySink, checksum_bytes, plan};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::attempts::with_retries;
use crate::config::EngineConfig;
use crate::control::TransferControl;
use crate::error::EngineError;
use crate::events::{Completion, DownloadArtifact, RunOutcome, TransferEvent};
use crate::ledger::Ledger;

/// Describes a new download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    /// Display name recorded with the transfer.
    pub name: String,
    /// Known size; fetched on first start when `None`.
    pub size: Option<u64>,
    pub tag: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            size: None,
            tag: None,
        }
    }
}

pub struct DownloadManager {
    ledger: Ledger,
    reader: Arc<dyn RangeReader>,
    sink: Arc<dyn ChunkSink>,
    request: Option<DownloadRequest>,
    quota: Arc<dyn QuotaGate>,
    config: EngineConfig,
    control: TransferControl,
    run_lock: tokio::sync::Mutex<()>,
}

impl DownloadManager {
    /// Manager for a new download into `sink`. If the store already holds a
    /// record for `id`, that record is continued instead.
    pub fn new(
        id: TransferId,
        request: DownloadRequest,
        sink: Arc<dyn ChunkSink>,
        reader: Arc<dyn RangeReader>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            ledger: Ledger::new(id, store),
            reader,
            sink,
            request: Some(request),
            quota: Arc::new(Unlimited),
            config: EngineConfig::default(),
            control: TransferControl::new(),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Manager for a download persisted by an earlier run.
    ///
    /// Bytes go to the recorded destination file, or to a fresh
    /// [`MemorySink`] when the download was kept in memory.
    pub fn resume(
        id: TransferId,
        reader: Arc<dyn RangeReader>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, EngineError> {
        let ledger = Ledger::new(id, store);
        let state = match ledger.load()? {
            Some(state) if state.direction == Direction::Download => state,
            Some(state) => {
                return Err(EngineError::InvalidState(format!(
                    "transfer {} is not a download",
                    state.id
                )));
            }
            None => {
                return Err(EngineError::InvalidState(format!(
                    "no persisted transfer {}",
                    ledger.id()
                )));
            }
        };

        let sink: Arc<dyn ChunkSink> = match &state.destination {
            Some(path) => Arc::new(FileSink::new(path)),
            None => Arc::new(MemorySink::new()),
        };

        Ok(Self {
            ledger,
            reader,
            sink,
            request: None,
            quota: Arc::new(Unlimited),
            config: EngineConfig::default(),
            control: TransferControl::new(),
            run_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn ChunkSink>) -> Self {
        self.sink = sink;
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

    pub fn control(&self) -> TransferControl {
        self.control.clone()
    }

    /// Latest persisted state, `None` once cancelled.
    pub fn get_state(&self) -> Result<Option<TransferState>, EngineError> {
        self.ledger.current()
    }

    /// Runs the download until it completes, pauses, is cancelled or fails.
    pub async fn start(&self) -> Result<RunOutcome<DownloadArtifact>, EngineError> {
        let _run = self.run_lock.lock().await;
        self.control.clear_pause();

        if self.control.is_cancelled() {
            self.discard().await?;
            return Ok(RunOutcome::Cancelled);
        }

        let mut state = self.load_or_create()?;
        if state.status == TransferStatus::Completed {
            return match &state.outcome {
                Some(TransferOutcome::Downloaded { path: Some(path), .. }) => {
                    Ok(RunOutcome::Completed(DownloadArtifact::File(path.clone())))
                }
                Some(TransferOutcome::Downloaded { size, path: None }) => {
                    Ok(RunOutcome::Completed(DownloadArtifact::Delivered { size: *size }))
                }
                _ => Err(EngineError::InvalidState(format!(
                    "completed download {} has no outcome",
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

    /// Requests a pause. A running download stops after its current chunk;
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

    /// Cancels the download, drops spooled bytes and deletes the record.
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
            Direction::Download,
            request.name.clone(),
        );
        state.source = Some(SourceRef::Url {
            url: request.url.clone(),
        });
        state.total_size = request.size;
        state.destination = self.sink.destination();
        state.tag = request.tag.clone();
        self.ledger.persist(&state)?;
        info!(transfer = %state.id, url = %request.url, "created download");
        Ok(state)
    }

    async fn drive(
        &self,
        state: &mut TransferState,
    ) -> Result<RunOutcome<DownloadArtifact>, EngineError> {
        let url = match &state.source {
            Some(SourceRef::Url { url }) => url.clone(),
            _ => {
                return Err(EngineError::InvalidState(format!(
                    "download {} has no source URL",
                    state.id
                )));
            }
        };
        self.run(state, &url).await
    }

    async fn run(
        &self,
        state: &mut TransferState,
        url: &str,
    ) -> Result<RunOutcome<DownloadArtifact>, EngineError> {
        if !state.is_planned() {
            let total = match state.total_size {
                Some(total) => total,
                None => {
                    let total = self.reader.fetch_size(url).await?;
                    debug!(transfer = %state.id, total, "fetched download size");
                    total
                }
            };
            let chunks = plan(total, self.config.download_chunk_size)?;
            state.set_plan(total, self.config.download_chunk_size, chunks);
            self.ledger.persist(state)?;
        }

        let lost = self.verify_spooled(state).await?;
        if lost > 0 {
            info!(transfer = %state.id, lost, "re-fetching chunks missing from the sink");
        }
        state.reset_unfinished_chunks();
        state.last_error = None;
        state.set_status(TransferStatus::InProgress);
        self.ledger.persist(state)?;

        for index in state.remaining_chunks() {
            if let Some(outcome) = self.interrupted(state).await? {
                return Ok(outcome);
            }

            let range = state.chunks[index as usize].range;
            let data = if range.is_empty() {
                bytes::Bytes::new()
            } else {
                state.set_chunk_status(index, ChunkStatus::Active);
                self.ledger.persist(state)?;
                self.fetch_chunk(state, url, index).await?
            };

            let sink = Arc::clone(&self.sink);
            let checksum = tokio::task::spawn_blocking(move || {
                sink.write_chunk(index, range, &data)?;
                Ok::<_, stevedore_transfer::TransferError>(checksum_bytes(&data))
            })
            .await??;

            state.complete_chunk(index, checksum);
            self.ledger.persist(state)?;
            debug!(
                transfer = %state.id,
                chunk = index,
                transferred = state.bytes_transferred,
                "chunk downloaded"
            );
            self.ledger.emit_chunk_done(state, index).await;
        }

        if let Some(outcome) = self.interrupted(state).await? {
            return Ok(outcome);
        }

        let total = state.total_size.unwrap_or(0);
        let sink = Arc::clone(&self.sink);
        let artifact = tokio::task::spawn_blocking(move || sink.finish(total)).await??;
        let artifact = DownloadArtifact::from(artifact);

        state.outcome = Some(TransferOutcome::Downloaded {
            size: total,
            path: match &artifact {
                DownloadArtifact::File(path) => Some(path.clone()),
                _ => None,
            },
        });
        state.set_status(TransferStatus::Completed);
        self.ledger.persist(state)?;
        info!(transfer = %state.id, bytes = total, "download completed");
        self.ledger
            .emit(TransferEvent::Completed {
                id: state.id.clone(),
                result: Completion::Download(artifact.clone()),
            })
            .await;
        Ok(RunOutcome::Completed(artifact))
    }

    /// Fetches one non-empty chunk with retries under a quota reservation.
    async fn fetch_chunk(
        &self,
        state: &mut TransferState,
        url: &str,
        index: u32,
    ) -> Result<bytes::Bytes, EngineError> {
        let range = state.chunks[index as usize].range;
        let cost = range.len();
        let id = state.id.clone();

        if let Err(e) = self.quota.check_and_reserve(cost) {
            state.set_chunk_status(index, ChunkStatus::Failed);
            return Err(e.into());
        }

        let reader = &self.reader;
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
            move || reader.read_range(url, range),
        )
        .await;

        match result {
            Ok(data) => {
                self.quota.commit(cost);
                Ok(data)
            }
            Err(e) => {
                self.quota.release(cost);
                state.set_chunk_status(index, ChunkStatus::Failed);
                Err(e.into())
            }
        }
    }

    /// Demotes completed chunks whose bytes the sink no longer holds.
    /// Returns how many were demoted.
    async fn verify_spooled(&self, state: &mut TransferState) -> Result<usize, EngineError> {
        let completed: Vec<_> = state
            .chunks
            .iter()
            .filter(|c| c.is_completed())
            .map(|c| (c.index, c.range, c.checksum.clone()))
            .collect();
        if completed.is_empty() {
            return Ok(0);
        }

        let sink = Arc::clone(&self.sink);
        let missing = tokio::task::spawn_blocking(move || {
            let mut missing = Vec::new();
            for (index, range, checksum) in completed {
                let held = match &checksum {
                    Some(sum) => sink.holds_chunk(index, range, sum)?,
                    None => false,
                };
                if !held {
                    missing.push(index);
                }
            }
            Ok::<_, stevedore_transfer::TransferError>(missing)
        })
        .await??;

        for &index in &missing {
            let chunk = &mut state.chunks[index as usize];
            chunk.status = ChunkStatus::Pending;
            chunk.checksum = None;
        }
        if !missing.is_empty() {
            state.recompute_bytes();
            state.touch();
        }
        Ok(missing.len())
    }

    async fn interrupted(
        &self,
        state: &mut TransferState,
    ) -> Result<Option<RunOutcome<DownloadArtifact>>, EngineError> {
        if self.control.is_cancelled() {
            self.discard().await?;
            return Ok(Some(RunOutcome::Cancelled));
        }
        if self.control.is_pause_requested() {
            state.set_status(TransferStatus::Paused);
            self.ledger.persist(state)?;
            info!(transfer = %state.id, done = state.bytes_transferred, "download paused");
            return Ok(Some(RunOutcome::Paused));
        }
        Ok(None)
    }

    /// Drops spooled bytes and removes the record.
    async fn discard(&self) -> Result<(), EngineError> {
        let Some(state) = self.ledger.load()? else {
            return Ok(());
        };
        if state.status != TransferStatus::Completed {
            let sink = Arc::clone(&self.sink);
            if let Err(e) = tokio::task::spawn_blocking(move || sink.discard()).await? {
                warn!(transfer = %state.id, error = %e, "failed to discard partial download");
            }
        }
        self.ledger.delete()?;
        info!(transfer = %state.id, "download cancelled");
        Ok(())
    }

    async fn fail(&self, state: &mut TransferState, error: &EngineError) {
        warn!(transfer = %state.id, error = %error, "download failed");
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
