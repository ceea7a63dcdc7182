//! Retry engine.
//!
//! Every source message runs through here: up to `steps` attempts, each with
//! a fresh per-attempt timeout, separated by jittered exponential backoff.
//! Shutdown aborts both the sleep and the in-flight attempt, and is reported
//! as cancellation rather than as the last attempt's error.

use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::broadcast;

use dataflow_core::backoff::Backoff;

/// The timeout applied to each individual processing attempt.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);

/// The terminal outcome of an exhausted or canceled retry sequence.
#[derive(Debug, Error)]
pub enum RetryError {
    /// Shutdown was triggered while the message was in flight.
    #[error("message processing canceled by shutdown")]
    Canceled,
    /// All attempts failed; carries the final attempt's error.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u64, last: anyhow::Error },
}

/// Per-message retry policy.
pub struct RetryPolicy {
    backoff: Backoff,
    attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Create a new instance.
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            attempt_timeout: ATTEMPT_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_attempt_timeout(backoff: Backoff, attempt_timeout: Duration) -> Self {
        Self { backoff, attempt_timeout }
    }

    /// Run the given attempt until success, exhaustion or shutdown.
    ///
    /// On success, returns the number of retries (attempts beyond the first)
    /// which were needed.
    pub async fn execute<F>(&self, shutdown: &mut broadcast::Receiver<()>, mut attempt: F) -> Result<u64, RetryError>
    where
        F: FnMut() -> BoxFuture<'static, anyhow::Result<()>>,
    {
        let mut state = self.backoff.build();
        let mut retries = 0u64;
        loop {
            let outcome = tokio::select! {
                outcome = tokio::time::timeout(self.attempt_timeout, attempt()) => outcome,
                _ = shutdown.recv() => return Err(RetryError::Canceled),
            };
            let err = match outcome {
                Ok(Ok(())) => return Ok(retries),
                Ok(Err(err)) => err,
                Err(_elapsed) => anyhow::anyhow!("attempt timed out after {:?}", self.attempt_timeout),
            };
            if state.steps_remaining() <= 1 {
                return Err(RetryError::Exhausted {
                    attempts: retries + 1,
                    last: err,
                });
            }
            let interval = state.step();
            tracing::warn!(error = ?err, retries, interval = ?interval, "message processing failed, backing off");
            retries += 1;
            tokio::select! {
                _ = tokio::time::sleep(interval) => (),
                _ = shutdown.recv() => return Err(RetryError::Canceled),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn fast_backoff(steps: u64) -> Backoff {
        Backoff {
            duration: "1ms".into(),
            steps,
            factor_percentage: 100,
            jitter_percentage: 0,
        }
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let (tx, mut rx) = broadcast::channel(1);
        let _tx = tx;
        let policy = RetryPolicy::new(fast_backoff(3));
        let retries = policy.execute(&mut rx, || Box::pin(async { Ok(()) })).await.expect("expected success");
        assert_eq!(retries, 0);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let (tx, mut rx) = broadcast::channel(1);
        let _tx = tx;
        let attempts = Arc::new(AtomicU64::new(0));
        let policy = RetryPolicy::new(fast_backoff(5));
        let counter = attempts.clone();
        let retries = policy
            .execute(&mut rx, move || {
                let counter = counter.clone();
                Box::pin(async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("transient failure");
                    }
                    Ok(())
                })
            })
            .await
            .expect("expected eventual success");
        assert_eq!(retries, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let (tx, mut rx) = broadcast::channel(1);
        let _tx = tx;
        let policy = RetryPolicy::new(fast_backoff(3));
        let err = policy
            .execute(&mut rx, || Box::pin(async { anyhow::bail!("persistent failure") }))
            .await
            .expect_err("expected exhaustion");
        match err {
            RetryError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(last.to_string().contains("persistent failure"), "unexpected error: {}", last);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn shutdown_cancels_the_sleep() {
        let (tx, mut rx) = broadcast::channel(1);
        let policy = RetryPolicy::new(Backoff {
            duration: "10s".into(),
            steps: 10,
            factor_percentage: 100,
            jitter_percentage: 0,
        });
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _res = tx.send(());
        });
        let err = policy
            .execute(&mut rx, || Box::pin(async { anyhow::bail!("failure before the long sleep") }))
            .await
            .expect_err("expected cancellation");
        assert!(matches!(err, RetryError::Canceled), "expected cancellation, got {:?}", err);
    }

    #[tokio::test]
    async fn attempt_timeout_counts_as_failure() {
        let (tx, mut rx) = broadcast::channel(1);
        let _tx = tx;
        let policy = RetryPolicy::with_attempt_timeout(fast_backoff(2), Duration::from_millis(10));
        let err = policy
            .execute(&mut rx, || Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }))
            .await
            .expect_err("expected exhaustion via timeouts");
        assert!(matches!(err, RetryError::Exhausted { .. }), "expected exhaustion, got {:?}", err);
    }
}
