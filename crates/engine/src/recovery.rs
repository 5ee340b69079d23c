//! Startup recovery: continue whatever the previous process left active.

use std::sync::Arc;

use stevedore_backend::{RangeReader, StorageBackend};
use stevedore_protocol::{Direction, SourceRef, TransferId};
use stevedore_store::TransferRegistry;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::download::DownloadManager;
use crate::error::EngineError;
use crate::events::{Completion, RunOutcome};
use crate::upload::UploadManager;

/// What [`recover`] did with each active record.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Transfers that were run, with how their run ended.
    pub resumed: Vec<(TransferId, RunOutcome<Completion>)>,
    pub failed: Vec<(TransferId, EngineError)>,
    /// Uploads from memory; the caller must supply the bytes again via
    /// [`UploadManager::with_source`].
    pub needs_source: Vec<TransferId>,
}

/// Resumes every active transfer in the registry, one after another.
///
/// Downloads always resume. Uploads resume when their source is a recorded
/// file path and are listed in `needs_source` otherwise.
pub async fn recover(
    registry: &TransferRegistry,
    backend: Arc<dyn StorageBackend>,
    reader: Arc<dyn RangeReader>,
    config: &EngineConfig,
    tag: Option<&str>,
) -> Result<RecoveryReport, EngineError> {
    let active = registry.list_active(tag)?;
    let mut report = RecoveryReport::default();
    if active.is_empty() {
        return Ok(report);
    }
    info!(count = active.len(), "recovering active transfers");

    for state in active {
        let id = state.id.clone();
        let store = Arc::clone(registry.store());

        let result = match state.direction {
            Direction::Download => match DownloadManager::resume(id.clone(), reader.clone(), store)
            {
                Ok(mgr) => run_download(mgr.with_config(config.clone())).await,
                Err(e) => Err(e),
            },
            Direction::Upload => {
                if !matches!(state.source, Some(SourceRef::File { .. })) {
                    info!(transfer = %id, "upload needs its source supplied again");
                    report.needs_source.push(id);
                    continue;
                }
                match UploadManager::resume(id.clone(), backend.clone(), store) {
                    Ok(mgr) => run_upload(mgr.with_config(config.clone())).await,
                    Err(e) => Err(e),
                }
            }
        };

        match result {
            Ok(outcome) => report.resumed.push((id, outcome)),
            Err(e) => {
                warn!(transfer = %id, error = %e, "recovery failed");
                report.failed.push((id, e));
            }
        }
    }

    Ok(report)
}

async fn run_download(mgr: DownloadManager) -> Result<RunOutcome<Completion>, EngineError> {
    Ok(match mgr.start().await? {
        RunOutcome::Completed(artifact) => RunOutcome::Completed(Completion::Download(artifact)),
        RunOutcome::Paused => RunOutcome::Paused,
        RunOutcome::Cancelled => RunOutcome::Cancelled,
    })
}

async fn run_upload(mgr: UploadManager) -> Result<RunOutcome<Completion>, EngineError> {
    Ok(match mgr.start().await? {
        RunOutcome::Completed(receipt) => RunOutcome::Completed(Completion::Upload(receipt)),
        RunOutcome::Paused => RunOutcome::Paused,
        RunOutcome::Cancelled => RunOutcome::Cancelled,
    })
}
