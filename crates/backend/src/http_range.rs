//! Ranged HTTP reads for downloads.

use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, RANGE};
use stevedore_protocol::ByteRange;
use tracing::debug;

use crate::error::BackendError;
use crate::{BackendFuture, RangeReader};

/// [`RangeReader`] over plain HTTP(S) `Range` requests.
#[derive(Clone)]
pub struct HttpRangeReader {
    http: reqwest::Client,
}

impl HttpRangeReader {
    pub fn new() -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BackendError::SessionInit(format!("HTTP client: {e}")))?;
        Ok(Self { http })
    }

    /// Uses a preconfigured HTTP client (custom headers, proxies, timeouts).
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn size_of(&self, url: &str) -> Result<u64, BackendError> {
        let resp = self
            .http
            .head(url)
            .send()
            .await
            .map_err(|e| BackendError::SessionInit(format!("HEAD {url}: {e}")))?;
        let status = resp.status();
        if status.is_success()
            && let Some(len) = header_u64(resp.headers(), CONTENT_LENGTH)
        {
            debug!(url, size = len, "size via HEAD");
            return Ok(len);
        }
        check_access(status, url)?;

        // Some servers refuse HEAD or omit the length; ask for one byte
        // and read the total from Content-Range.
        let resp = self
            .http
            .get(url)
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(|e| BackendError::SessionInit(format!("GET {url}: {e}")))?;
        let status = resp.status();
        check_access(status, url)?;

        let size = match status {
            StatusCode::PARTIAL_CONTENT | StatusCode::RANGE_NOT_SATISFIABLE => {
                content_range_total(resp.headers())
            }
            StatusCode::OK => header_u64(resp.headers(), CONTENT_LENGTH),
            _ => None,
        };
        let size = size.ok_or_else(|| {
            BackendError::SessionInit(format!("{url}: size unknown (HTTP {status})"))
        })?;
        debug!(url, size, "size via ranged GET");
        Ok(size)
    }

    async fn fetch(&self, url: &str, range: ByteRange) -> Result<Bytes, BackendError> {
        let Some(last) = range.last_byte() else {
            return Ok(Bytes::new());
        };

        let resp = self
            .http
            .get(url)
            .header(RANGE, format!("bytes={}-{last}", range.start))
            .send()
            .await
            .map_err(|e| BackendError::ChunkTransfer(format!("GET {url} {range}: {e}")))?;
        let status = resp.status();
        check_access(status, url)?;

        let whole = status == StatusCode::OK && range.start == 0;
        if status != StatusCode::PARTIAL_CONTENT && !whole {
            return Err(BackendError::ChunkTransfer(format!(
                "GET {url} {range}: unexpected HTTP {status}"
            )));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| BackendError::ChunkTransfer(format!("GET {url} {range}: {e}")))?;
        if body.len() as u64 != range.len() {
            return Err(BackendError::ChunkTransfer(format!(
                "GET {url} {range}: got {} bytes, expected {}",
                body.len(),
                range.len()
            )));
        }
        Ok(body)
    }
}

impl RangeReader for HttpRangeReader {
    fn fetch_size<'a>(&'a self, url: &'a str) -> BackendFuture<'a, u64> {
        Box::pin(self.size_of(url))
    }

    fn read_range<'a>(&'a self, url: &'a str, range: ByteRange) -> BackendFuture<'a, Bytes> {
        Box::pin(self.fetch(url, range))
    }
}

/// Rejects authorization and permission failures regardless of phase.
fn check_access(status: StatusCode, url: &str) -> Result<(), BackendError> {
    match status {
        StatusCode::UNAUTHORIZED => Err(BackendError::Authorization(format!("{url}: HTTP 401"))),
        StatusCode::FORBIDDEN => Err(BackendError::QuotaOrPermission(format!("{url}: HTTP 403"))),
        _ => Ok(()),
    }
}

fn header_u64(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Total from `Content-Range: bytes 0-0/1234` or `bytes */1234`.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}
