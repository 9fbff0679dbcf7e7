//! Bounded retry with linear backoff, applied around every chunk attempt.

use super::api::TransferError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Retry decision function: up to `max_attempts` tries, with a delay of
/// `attempt × backoff_unit` after each retryable failure. Fatal errors and
/// cancellation never consume retry budget.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay inserted after failed attempt number `attempt` (1-based):
    /// 1s, 2s, 3s with the default unit.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_unit * attempt
    }

    /// `Some(delay)` if the failure should be retried, `None` to give up.
    pub fn next_delay(&self, attempt: u32, error: &TransferError) -> Option<Duration> {
        if !error.is_retryable() || attempt >= self.max_attempts {
            return None;
        }
        Some(self.delay_for(attempt))
    }
}

/// Drive `op` under `policy`.
///
/// Cancellation — raised inside the operation or during a backoff wait —
/// short-circuits immediately; it is a deliberate pause, not a failure.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(TransferError::Cancelled) => return Err(TransferError::Cancelled),
            Err(err) => match policy.next_delay(attempt, &err) {
                Some(delay) => {
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                None => return Err(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_unit: Duration::from_millis(1),
        }
    }

    #[test]
    fn backoff_schedule_is_linear() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(3));
    }

    #[test]
    fn fatal_errors_do_not_retry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(1, &TransferError::NotFoundOrExpired), None);
        assert_eq!(
            policy.next_delay(1, &TransferError::Validation("bad".into())),
            None
        );
        assert!(policy.next_delay(1, &TransferError::Transient(503)).is_some());
        assert_eq!(policy.next_delay(3, &TransferError::Transient(503)), None);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = calls.clone();
        let result = with_retry(fast_policy(), &cancel, move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TransferError::Transient(503))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = calls.clone();
        let result: Result<(), _> = with_retry(fast_policy(), &cancel, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TransferError::Transient(500))
            }
        })
        .await;
        assert!(matches!(result, Err(TransferError::Transient(500))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_error_aborts_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let counter = calls.clone();
        let result: Result<(), _> = with_retry(fast_policy(), &cancel, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TransferError::NotFoundOrExpired)
            }
        })
        .await;
        assert!(matches!(result, Err(TransferError::NotFoundOrExpired)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_without_consuming_budget() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_retry(fast_policy(), &cancel, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TransferError::Transient(503))
            }
        })
        .await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
        // the attempt itself ran once; the backoff wait observed the token
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
