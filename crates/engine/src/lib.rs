//! Resumable chunked transfers.
//!
//! [`UploadManager`] splits a source into parts and pushes them through a
//! [`StorageBackend`](stevedore_backend::StorageBackend) multipart session;
//! [`DownloadManager`] pulls byte ranges through a
//! [`RangeReader`](stevedore_backend::RangeReader). Both persist their
//! progress after every chunk, so a transfer interrupted by a crash, a pause
//! or a failure continues where it stopped.

mod attempts;
pub mod config;
pub mod control;
pub mod download;
pub mod error;
pub mod events;
mod ledger;
pub mod recovery;
pub mod upload;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use control::TransferControl;
pub use download::{DownloadManager, DownloadRequest};
pub use error::EngineError;
pub use events::{Completion, DownloadArtifact, RunOutcome, TransferEvent};
pub use recovery::{RecoveryReport, recover};
pub use upload::{UploadManager, UploadRequest};
