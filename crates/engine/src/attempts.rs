use std::future::Future;

use stevedore_backend::BackendError;
use stevedore_protocol::TransferId;
use stevedore_transfer::RetryPolicy;
use tracing::{debug, warn};

/// Runs one chunk operation under `policy`.
///
/// `on_failure` sees every failed attempt, including the last. Only
/// retryable errors lead to another attempt; anything else is returned at
/// once.
pub(crate) async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    transfer: &TransferId,
    chunk: u32,
    mut on_failure: impl FnMut(&BackendError),
    mut op: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if let Some(delay) = policy.delay_before_attempt(attempt) {
            debug!(
                transfer = %transfer,
                chunk,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "backing off before retry"
            );
            tokio::time::sleep(delay).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                on_failure(&e);
                if e.is_retryable() && policy.allows_retry_after(attempt) {
                    warn!(transfer = %transfer, chunk, attempt, error = %e, "chunk attempt failed");
                    continue;
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let mut failures = 0;
        let started = tokio::time::Instant::now();

        let result = with_retries(
            &policy,
            &"t".into(),
            0,
            |_| failures += 1,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(BackendError::ChunkTransfer("503".into()))
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(failures, 2);
        // 2 s before attempt 2, 4 s before attempt 3.
        assert!(started.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_max_attempts() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retries(
            &policy,
            &"t".into(),
            0,
            |_| {},
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::ChunkTransfer("timeout".into())) }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retries(
            &RetryPolicy::default(),
            &"t".into(),
            0,
            |_| {},
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(BackendError::Authorization("expired".into())) }
            },
        )
        .await;

        assert!(matches!(result, Err(BackendError::Authorization(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
