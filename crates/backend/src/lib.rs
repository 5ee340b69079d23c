//! Storage backends and download transports.
//!
//! Managers in `stevedore-engine` are written against the traits here:
//! [`StorageBackend`] for multipart uploads, [`RangeReader`] for ranged
//! downloads and [`QuotaGate`] for admission control. `B2Backend` and
//! `HttpRangeReader` are the reqwest-based implementations.

pub mod b2;
pub mod error;
pub mod http_range;
pub mod quota;

#[cfg(test)]
mod test_server;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use stevedore_protocol::{BackendSession, ByteRange, UploadReceipt};
use stevedore_transfer::ChecksumAlgorithm;

pub use b2::{B2Backend, B2Config};
pub use error::BackendError;
pub use http_range::HttpRangeReader;
pub use quota::{ByteBudget, QuotaGate, Unlimited};

/// Boxed future returned by the backend traits.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// Where and how to send one part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartTarget {
    pub upload_url: String,
    pub auth_token: String,
}

/// One part of a multipart upload.
#[derive(Debug, Clone)]
pub struct PartUpload {
    /// 1-based.
    pub part_number: u32,
    pub data: Bytes,
    /// Hex digest computed with [`StorageBackend::checksum_algorithm`].
    pub checksum: String,
}

/// Multipart upload API of a remote object store.
pub trait StorageBackend: Send + Sync {
    /// Starts a multipart session for `name`.
    fn open_session<'a>(
        &'a self,
        name: &'a str,
        content_type: Option<&'a str>,
    ) -> BackendFuture<'a, BackendSession>;

    /// Requests a fresh upload target for the next part.
    fn part_upload_target<'a>(
        &'a self,
        session: &'a BackendSession,
    ) -> BackendFuture<'a, PartTarget>;

    /// Sends one part and returns the checksum the backend confirmed.
    fn upload_part<'a>(
        &'a self,
        target: &'a PartTarget,
        part: PartUpload,
    ) -> BackendFuture<'a, String>;

    /// Completes the session with every part checksum in part order.
    fn finalize_session<'a>(
        &'a self,
        session: &'a BackendSession,
        checksums: Vec<String>,
    ) -> BackendFuture<'a, UploadReceipt>;

    /// Discards the session and any parts uploaded so far.
    fn abort_session<'a>(&'a self, session: &'a BackendSession) -> BackendFuture<'a, ()>;

    /// Digest the backend expects for each part.
    fn checksum_algorithm(&self) -> ChecksumAlgorithm;

    /// Most parts one session accepts, if the backend caps it.
    fn max_parts(&self) -> Option<u32> {
        None
    }
}

/// Random-access reads of a remote resource.
pub trait RangeReader: Send + Sync {
    /// Total size of the resource in bytes.
    fn fetch_size<'a>(&'a self, url: &'a str) -> BackendFuture<'a, u64>;

    /// Reads exactly the bytes in `range`.
    fn read_range<'a>(&'a self, url: &'a str, range: ByteRange) -> BackendFuture<'a, Bytes>;
}
