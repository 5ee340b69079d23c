//! Backblaze B2 large-file client.
//!
//! Implements [`StorageBackend`] over the native B2 API
//! (`b2_start_large_file`, `b2_get_upload_part_url`, `b2_upload_part`,
//! `b2_finish_large_file`, `b2_cancel_large_file`). Account authorization
//! happens elsewhere; the client is handed an API URL and an account token.

use std::fmt;
use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use stevedore_protocol::{BackendSession, UploadReceipt};
use stevedore_transfer::ChecksumAlgorithm;
use tracing::{debug, info};

use crate::error::BackendError;
use crate::{BackendFuture, PartTarget, PartUpload, StorageBackend};

const API_PREFIX: &str = "/b2api/v2";

/// Parts per large file allowed by B2.
const MAX_PARTS: u32 = 10_000;

/// Lets B2 pick the content type from the file name.
const AUTO_CONTENT_TYPE: &str = "b2/x-auto";

/// B2 error codes that mean the account or key may not write.
const QUOTA_CODES: &[&str] = &[
    "cap_exceeded",
    "storage_cap_exceeded",
    "transaction_cap_exceeded",
    "access_denied",
];

/// Connection settings for one bucket.
#[derive(Clone, Serialize, Deserialize)]
pub struct B2Config {
    /// `apiUrl` from `b2_authorize_account`.
    pub api_url: String,
    /// Account authorization token.
    pub auth_token: String,
    pub bucket_id: String,
    /// Needed, with `download_url`, to build public file URLs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl fmt::Debug for B2Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("B2Config")
            .field("api_url", &self.api_url)
            .field("auth_token", &"<redacted>")
            .field("bucket_id", &self.bucket_id)
            .field("bucket_name", &self.bucket_name)
            .field("download_url", &self.download_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartLargeFileRequest<'a> {
    bucket_id: &'a str,
    file_name: &'a str,
    content_type: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileIdRequest<'a> {
    file_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FinishLargeFileRequest<'a> {
    file_id: &'a str,
    part_sha1_array: &'a [String],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileInfo {
    file_id: String,
    #[serde(default)]
    file_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadPartUrl {
    upload_url: String,
    authorization_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadedPart {
    content_sha1: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Which API call failed; decides the error category for failures that are
/// not authorization or quota problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    PartUrl,
    Part,
    Finish,
    Cancel,
}

impl Phase {
    fn error(self, detail: String) -> BackendError {
        match self {
            Self::Start => BackendError::SessionInit(detail),
            // A part target is a per-chunk credential; failing to get one is
            // not retried.
            Self::PartUrl => BackendError::Authorization(detail),
            Self::Part => BackendError::ChunkTransfer(detail),
            Self::Finish | Self::Cancel => BackendError::Finalization(detail),
        }
    }
}

/// Maps a failed B2 response onto the error taxonomy.
fn classify(phase: Phase, status: u16, body: &str) -> BackendError {
    let (code, message) = match serde_json::from_str::<ErrorBody>(body) {
        Ok(e) => (e.code, e.message),
        Err(_) => (String::new(), body.trim().to_string()),
    };
    let detail = if code.is_empty() {
        format!("HTTP {status}: {message}")
    } else {
        format!("{code} ({status}): {message}")
    };

    if status == 401 {
        return BackendError::Authorization(detail);
    }
    if status == 403 || QUOTA_CODES.contains(&code.as_str()) {
        return BackendError::QuotaOrPermission(detail);
    }
    phase.error(detail)
}

fn transport(phase: Phase, err: reqwest::Error) -> BackendError {
    phase.error(format!("request failed: {err}"))
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// B2 large-file backend.
pub struct B2Backend {
    http: reqwest::Client,
    config: B2Config,
}

impl B2Backend {
    pub fn new(config: B2Config) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BackendError::SessionInit(format!("HTTP client: {e}")))?;
        Ok(Self::with_client(config, http))
    }

    /// Uses a preconfigured HTTP client.
    pub fn with_client(config: B2Config, http: reqwest::Client) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &B2Config {
        &self.config
    }

    /// Performs an authenticated JSON API call.
    async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        phase: Phase,
        operation: &str,
        request: &Req,
    ) -> Result<Resp, BackendError> {
        let url = format!(
            "{}{API_PREFIX}/{operation}",
            self.config.api_url.trim_end_matches('/')
        );
        let resp = self
            .http
            .post(&url)
            .header(AUTHORIZATION, &self.config.auth_token)
            .json(request)
            .send()
            .await
            .map_err(|e| transport(phase, e))?;
        let status = resp.status();

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify(phase, status.as_u16(), &body));
        }

        resp.json::<Resp>().await.map_err(|e| transport(phase, e))
    }

    async fn start_large_file(
        &self,
        name: &str,
        content_type: Option<&str>,
    ) -> Result<BackendSession, BackendError> {
        let req = StartLargeFileRequest {
            bucket_id: &self.config.bucket_id,
            file_name: name,
            content_type: content_type.unwrap_or(AUTO_CONTENT_TYPE),
        };
        let info: FileInfo = self.call(Phase::Start, "b2_start_large_file", &req).await?;
        info!(file_id = %info.file_id, name, "started B2 large file");
        Ok(BackendSession::Backblaze {
            file_id: info.file_id,
        })
    }

    async fn get_upload_part_url(&self, file_id: &str) -> Result<PartTarget, BackendError> {
        let url: UploadPartUrl = self
            .call(
                Phase::PartUrl,
                "b2_get_upload_part_url",
                &FileIdRequest { file_id },
            )
            .await?;
        Ok(PartTarget {
            upload_url: url.upload_url,
            auth_token: url.authorization_token,
        })
    }

    async fn send_part(&self, target: &PartTarget, part: PartUpload) -> Result<String, BackendError> {
        let phase = Phase::Part;
        let part_number = part.part_number;
        let size = part.data.len();
        let expected = part.checksum.clone();

        let resp = self
            .http
            .post(&target.upload_url)
            .header(AUTHORIZATION, &target.auth_token)
            .header("X-Bz-Part-Number", part_number.to_string())
            .header("X-Bz-Content-Sha1", &expected)
            .body(part.data)
            .send()
            .await
            .map_err(|e| transport(phase, e))?;
        let status = resp.status();

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify(phase, status.as_u16(), &body));
        }

        let uploaded: UploadedPart = resp.json().await.map_err(|e| transport(phase, e))?;
        if !uploaded.content_sha1.eq_ignore_ascii_case(&expected) {
            return Err(BackendError::ChunkTransfer(format!(
                "part {part_number}: backend confirmed sha1 {} but {expected} was sent",
                uploaded.content_sha1
            )));
        }

        debug!(part = part_number, bytes = size, "uploaded B2 part");
        Ok(uploaded.content_sha1)
    }

    async fn finish_large_file(
        &self,
        file_id: &str,
        checksums: &[String],
    ) -> Result<UploadReceipt, BackendError> {
        let req = FinishLargeFileRequest {
            file_id,
            part_sha1_array: checksums,
        };
        let info: FileInfo = self
            .call(Phase::Finish, "b2_finish_large_file", &req)
            .await?;
        info!(file_id = %info.file_id, parts = checksums.len(), "finished B2 large file");
        Ok(UploadReceipt {
            public_reference: self.public_reference(&info.file_name),
            file_id: info.file_id,
        })
    }

    async fn cancel_large_file(&self, file_id: &str) -> Result<(), BackendError> {
        let _: FileInfo = self
            .call(Phase::Cancel, "b2_cancel_large_file", &FileIdRequest { file_id })
            .await?;
        info!(file_id, "cancelled B2 large file");
        Ok(())
    }

    /// Friendly download URL when the bucket name and download URL are
    /// known, otherwise a `b2://` reference.
    fn public_reference(&self, file_name: &str) -> String {
        match (&self.config.download_url, &self.config.bucket_name) {
            (Some(base), Some(bucket)) => {
                format!("{}/file/{bucket}/{file_name}", base.trim_end_matches('/'))
            }
            _ => format!("b2://{}/{file_name}", self.config.bucket_id),
        }
    }
}

impl StorageBackend for B2Backend {
    fn open_session<'a>(
        &'a self,
        name: &'a str,
        content_type: Option<&'a str>,
    ) -> BackendFuture<'a, BackendSession> {
        Box::pin(self.start_large_file(name, content_type))
    }

    fn part_upload_target<'a>(
        &'a self,
        session: &'a BackendSession,
    ) -> BackendFuture<'a, PartTarget> {
        Box::pin(self.get_upload_part_url(session.session_id()))
    }

    fn upload_part<'a>(
        &'a self,
        target: &'a PartTarget,
        part: PartUpload,
    ) -> BackendFuture<'a, String> {
        Box::pin(self.send_part(target, part))
    }

    fn finalize_session<'a>(
        &'a self,
        session: &'a BackendSession,
        checksums: Vec<String>,
    ) -> BackendFuture<'a, UploadReceipt> {
        Box::pin(async move {
            self.finish_large_file(session.session_id(), &checksums)
                .await
        })
    }

    fn abort_session<'a>(&'a self, session: &'a BackendSession) -> BackendFuture<'a, ()> {
        Box::pin(self.cancel_large_file(session.session_id()))
    }

    fn checksum_algorithm(&self) -> ChecksumAlgorithm {
        ChecksumAlgorithm::Sha1
    }

    fn max_parts(&self) -> Option<u32> {
        Some(MAX_PARTS)
    }
}
