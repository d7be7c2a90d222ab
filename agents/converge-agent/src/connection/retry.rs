//! Retry Executor
//!
//! Bounded-attempt exponential backoff around fallible control plane calls,
//! plus the HTTP status classification shared by every reporting path.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backoff configuration for a retried operation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total number of calls, including the first one
    pub max_attempts: u32,
    /// Sleep before the first retry
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after every retry
    pub backoff_factor: f64,
    /// Whether 4xx responses are retried (true) or treated as permanent
    pub retry_client_errors: bool,
}

impl Default for RetryPolicy {
    /// 5 attempts, 1s initial delay, factor 3: sleeps of 1s, 3s, 9s, 27s.
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            backoff_factor: 3.0,
            retry_client_errors: true,
        }
    }
}

impl RetryPolicy {
    fn next_delay(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.backoff_factor)
            .unwrap_or(current)
    }
}

/// How a response status should be treated by the retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Transient,
    Permanent,
}

/// Classify a response status.
///
/// `0` stands for "no response at all" (transport failure).
pub fn classify_status(status: u16, retry_client_errors: bool) -> StatusClass {
    match status {
        0 => StatusClass::Transient,
        500..=u16::MAX => StatusClass::Transient,
        400..=499 if retry_client_errors => StatusClass::Transient,
        400..=499 => StatusClass::Permanent,
        _ => StatusClass::Success,
    }
}

/// A response status the retry layer did not accept
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("control plane responded with status {status}")]
pub struct StatusError {
    pub status: u16,
    pub permanent: bool,
}

/// Turn a status into `Ok(())` or a [`StatusError`] suitable for [`retry`].
pub fn check_status(status: u16, retry_client_errors: bool) -> Result<(), StatusError> {
    match classify_status(status, retry_client_errors) {
        StatusClass::Success => Ok(()),
        StatusClass::Transient => Err(StatusError {
            status,
            permanent: false,
        }),
        StatusClass::Permanent => Err(StatusError {
            status,
            permanent: true,
        }),
    }
}

/// Why a retried operation gave up
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("operation cancelled during backoff")]
    Cancelled,

    #[error("permanent failure: {0:#}")]
    Permanent(#[source] anyhow::Error),

    #[error("giving up after {attempts} attempt(s): {source:#}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
}

fn is_permanent(err: &anyhow::Error) -> bool {
    err.downcast_ref::<StatusError>()
        .is_some_and(|status| status.permanent)
}

/// Run `op` until it succeeds, fails permanently, or the attempt budget is spent.
///
/// Backoff sleeps race against `cancel`, so shutdown never waits out the chain.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.initial_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if is_permanent(&err) {
            warn!(attempt, error = %err, "Operation failed permanently");
            return Err(RetryError::Permanent(err));
        }

        if attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                source: err,
            });
        }

        warn!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Operation failed, retrying"
        );

        tokio::select! {
            biased;

            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        delay = policy.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn failing_status(status: u16, policy: &RetryPolicy) -> anyhow::Result<()> {
        check_status(status, policy.retry_client_errors)?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts_with_backoff() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<(), _> = retry(&policy, &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("boom")) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(started.elapsed() >= Duration::from_secs(40));
        match result {
            Err(RetryError::Exhausted { attempts, source }) => {
                assert_eq!(attempts, 5);
                assert_eq!(source.to_string(), "boom");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_success() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result = retry(&policy, &CancellationToken::new(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    failing_status(503, &RetryPolicy::default())?;
                }
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_status_classification_boundaries() {
        assert_eq!(classify_status(0, true), StatusClass::Transient);
        assert_eq!(classify_status(499, true), StatusClass::Transient);
        assert_eq!(classify_status(500, true), StatusClass::Transient);
        assert_eq!(classify_status(200, true), StatusClass::Success);
        assert_eq!(classify_status(201, true), StatusClass::Success);
        assert_eq!(classify_status(400, false), StatusClass::Permanent);
        assert_eq!(classify_status(503, false), StatusClass::Transient);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retried_statuses_use_full_budget() {
        let policy = RetryPolicy::default();
        for status in [0u16, 499, 500] {
            let calls = AtomicU32::new(0);
            let result = retry(&policy, &CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { failing_status(status, &RetryPolicy::default()) }
            })
            .await;
            assert!(result.is_err(), "status {status}");
            assert_eq!(calls.load(Ordering::SeqCst), 5, "status {status}");
        }
        for status in [200u16, 201] {
            let calls = AtomicU32::new(0);
            let result = retry(&policy, &CancellationToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { failing_status(status, &RetryPolicy::default()) }
            })
            .await;
            assert!(result.is_ok(), "status {status}");
            assert_eq!(calls.load(Ordering::SeqCst), 1, "status {status}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_permanent_when_configured() {
        let policy = RetryPolicy {
            retry_client_errors: false,
            ..RetryPolicy::default()
        };
        let calls = AtomicU32::new(0);

        let result = retry(&policy, &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { failing_status(404, &policy) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let counter = calls.clone();
        let result: Result<(), _> = retry(&policy, &cancel, || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("down")) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        // t=0 first call, t=1 second call, cancelled while sleeping 3s
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
