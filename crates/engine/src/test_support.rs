//! Scriptable backend and range reader used by the manager tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use stevedore_backend::{
    BackendError, BackendFuture, PartTarget, PartUpload, RangeReader, StorageBackend,
};
use stevedore_protocol::{BackendSession, ByteRange, UploadReceipt};
use stevedore_transfer::{ChecksumAlgorithm, RetryPolicy};
use tokio::sync::{Notify, mpsc};

use crate::config::EngineConfig;
use crate::events::TransferEvent;

/// Small chunks and millisecond backoff.
pub(crate) fn fast_config(chunk_size: u64) -> EngineConfig {
    EngineConfig {
        upload_chunk_size: chunk_size,
        download_chunk_size: chunk_size,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        },
    }
}

/// Drains an event channel once every sender is gone.
pub(crate) async fn collect_events(mut rx: mpsc::Receiver<TransferEvent>) -> Vec<TransferEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

type PartHook = Box<dyn Fn(u32) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Open,
    Target,
    /// Successfully uploaded part number.
    Part(u32),
    Finalize(Vec<String>),
    Abort,
}

// ---------------------------------------------------------------------------
// MockBackend
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct MockBackend {
    calls: Mutex<Vec<Call>>,
    attempts: Mutex<HashMap<u32, u32>>,
    part_failures: Mutex<HashMap<u32, VecDeque<BackendError>>>,
    open_failure: Mutex<Option<BackendError>>,
    finalize_failure: Mutex<Option<BackendError>>,
    target_failure: Mutex<Option<BackendError>>,
    abort_failure: Mutex<Option<BackendError>>,
    max_parts: Mutex<Option<u32>>,
    hook: Mutex<Option<Arc<PartHook>>>,
    gate: Mutex<Option<(u32, Arc<Notify>, Arc<Notify>)>>,
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues errors returned by successive attempts at `part`.
    pub(crate) fn fail_part(&self, part: u32, errors: impl IntoIterator<Item = BackendError>) {
        self.part_failures
            .lock()
            .unwrap()
            .entry(part)
            .or_default()
            .extend(errors);
    }

    pub(crate) fn fail_open(&self, err: BackendError) {
        *self.open_failure.lock().unwrap() = Some(err);
    }

    /// Fails the next finalize call.
    pub(crate) fn fail_finalize(&self, err: BackendError) {
        *self.finalize_failure.lock().unwrap() = Some(err);
    }

    /// Fails the next part target request.
    pub(crate) fn fail_target(&self, err: BackendError) {
        *self.target_failure.lock().unwrap() = Some(err);
    }

    pub(crate) fn set_max_parts(&self, limit: u32) {
        *self.max_parts.lock().unwrap() = Some(limit);
    }

    pub(crate) fn fail_abort(&self, err: BackendError) {
        *self.abort_failure.lock().unwrap() = Some(err);
    }

    /// Runs `hook` at the start of every part attempt.
    pub(crate) fn on_part(&self, hook: impl Fn(u32) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Arc::new(Box::new(hook)));
    }

    /// Holds the first attempt at `part` until released. Returns the
    /// (entered, release) pair.
    pub(crate) fn block_part(&self, part: u32) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some((part, entered.clone(), release.clone()));
        (entered, release)
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub(crate) fn uploaded_parts(&self) -> Vec<u32> {
        self.parts_since(0)
    }

    /// Part numbers uploaded after the first `from` calls.
    pub(crate) fn parts_since(&self, from: usize) -> Vec<u32> {
        self.calls.lock().unwrap()[from..]
            .iter()
            .filter_map(|c| match c {
                Call::Part(n) => Some(*n),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn part_attempts(&self, part: u32) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(&part)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn finalized(&self) -> Option<Vec<String>> {
        self.calls.lock().unwrap().iter().rev().find_map(|c| match c {
            Call::Finalize(sums) => Some(sums.clone()),
            _ => None,
        })
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl StorageBackend for MockBackend {
    fn open_session<'a>(
        &'a self,
        name: &'a str,
        _content_type: Option<&'a str>,
    ) -> BackendFuture<'a, BackendSession> {
        self.record(Call::Open);
        let failure = self.open_failure.lock().unwrap().take();
        Box::pin(async move {
            match failure {
                Some(err) => Err(err),
                None => Ok(BackendSession::Backblaze {
                    file_id: format!("file-{name}"),
                }),
            }
        })
    }

    fn part_upload_target<'a>(
        &'a self,
        session: &'a BackendSession,
    ) -> BackendFuture<'a, PartTarget> {
        self.record(Call::Target);
        let failure = self.target_failure.lock().unwrap().take();
        Box::pin(async move {
            match failure {
                Some(err) => Err(err),
                None => Ok(PartTarget {
                    upload_url: format!("mock://{}", session.session_id()),
                    auth_token: "part-token".into(),
                }),
            }
        })
    }

    fn upload_part<'a>(
        &'a self,
        _target: &'a PartTarget,
        part: PartUpload,
    ) -> BackendFuture<'a, String> {
        Box::pin(async move {
            let number = part.part_number;
            *self.attempts.lock().unwrap().entry(number).or_default() += 1;

            let hook = self.hook.lock().unwrap().clone();
            if let Some(hook) = hook {
                hook(number);
            }

            let gate = match &*self.gate.lock().unwrap() {
                Some((p, entered, release)) if *p == number => {
                    Some((entered.clone(), release.clone()))
                }
                _ => None,
            };
            if let Some((entered, release)) = gate {
                *self.gate.lock().unwrap() = None;
                entered.notify_one();
                release.notified().await;
            }

            let failure = self
                .part_failures
                .lock()
                .unwrap()
                .get_mut(&number)
                .and_then(VecDeque::pop_front);
            if let Some(err) = failure {
                return Err(err);
            }

            let digest = ChecksumAlgorithm::Sha1.digest(&part.data);
            if digest != part.checksum {
                return Err(BackendError::ChunkTransfer("checksum mismatch".into()));
            }
            self.record(Call::Part(number));
            Ok(digest)
        })
    }

    fn finalize_session<'a>(
        &'a self,
        session: &'a BackendSession,
        checksums: Vec<String>,
    ) -> BackendFuture<'a, UploadReceipt> {
        self.record(Call::Finalize(checksums));
        let failure = self.finalize_failure.lock().unwrap().take();
        Box::pin(async move {
            match failure {
                Some(err) => Err(err),
                None => Ok(UploadReceipt {
                    file_id: session.session_id().to_string(),
                    public_reference: format!("mock://{}", session.session_id()),
                }),
            }
        })
    }

    fn abort_session<'a>(&'a self, _session: &'a BackendSession) -> BackendFuture<'a, ()> {
        self.record(Call::Abort);
        let failure = self.abort_failure.lock().unwrap().take();
        Box::pin(async move {
            match failure {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    fn checksum_algorithm(&self) -> ChecksumAlgorithm {
        ChecksumAlgorithm::Sha1
    }

    fn max_parts(&self) -> Option<u32> {
        *self.max_parts.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// MockReader
// ---------------------------------------------------------------------------

/// Serves ranges of an in-memory resource.
pub(crate) struct MockReader {
    data: Bytes,
    size_fetches: Mutex<u32>,
    reads: Mutex<Vec<ByteRange>>,
    failures: Mutex<HashMap<u64, VecDeque<BackendError>>>,
    hook: Mutex<Option<Arc<PartHook>>>,
}

impl MockReader {
    pub(crate) fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            size_fetches: Mutex::new(0),
            reads: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            hook: Mutex::new(None),
        }
    }

    /// Queues errors for successive reads starting at `offset`.
    pub(crate) fn fail_at(&self, offset: u64, errors: impl IntoIterator<Item = BackendError>) {
        self.failures
            .lock()
            .unwrap()
            .entry(offset)
            .or_default()
            .extend(errors);
    }

    /// Runs `hook` with the range start at the beginning of every read.
    pub(crate) fn on_read(&self, hook: impl Fn(u32) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Arc::new(Box::new(hook)));
    }

    pub(crate) fn size_fetches(&self) -> u32 {
        *self.size_fetches.lock().unwrap()
    }

    /// Every read attempt, in order.
    pub(crate) fn reads(&self) -> Vec<ByteRange> {
        self.reads.lock().unwrap().clone()
    }
}

impl RangeReader for MockReader {
    fn fetch_size<'a>(&'a self, _url: &'a str) -> BackendFuture<'a, u64> {
        *self.size_fetches.lock().unwrap() += 1;
        let size = self.data.len() as u64;
        Box::pin(async move { Ok(size) })
    }

    fn read_range<'a>(&'a self, _url: &'a str, range: ByteRange) -> BackendFuture<'a, Bytes> {
        self.reads.lock().unwrap().push(range);
        let hook = self.hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(range.start as u32);
        }
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&range.start)
            .and_then(VecDeque::pop_front);
        let result = match failure {
            Some(err) => Err(err),
            None if range.end as usize <= self.data.len() => {
                Ok(self.data.slice(range.start as usize..range.end as usize))
            }
            None => Err(BackendError::ChunkTransfer(format!("{range} out of bounds"))),
        };
        Box::pin(async move { result })
    }
}
