//! Retry loop and the reusable [`RetryWrapper`].

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tether_core::{Classify, RetryPolicy};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use super::error::RetryError;

/// A policy bound to a label, callable any number of times.
///
/// Catalog-backed wrappers come from
/// [`RetryPolicyEngine::wrapper`](crate::RetryPolicyEngine::wrapper);
/// ad-hoc ones from [`create_custom_decorator`].
///
/// [`create_custom_decorator`]: crate::RetryPolicyEngine::create_custom_decorator
#[derive(Clone, Debug)]
pub struct RetryWrapper {
    label: String,
    policy: Arc<RetryPolicy>,
    correlation_id: Option<String>,
}

impl RetryWrapper {
    /// Wrap `policy` under `label` (used in logs and metrics).
    pub fn new(label: impl Into<String>, policy: Arc<RetryPolicy>) -> Self {
        Self {
            label: label.into(),
            policy,
            correlation_id: None,
        }
    }

    /// Attach a correlation id to every log line of this wrapper.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Service class or custom label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The bound policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Correlation id, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Run `op` under the bound policy.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        self.run(None, op).await
    }

    /// Run `op` under the bound policy, giving up when `cancel` fires.
    pub async fn call_cancellable<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        self.run(Some(cancel), op).await
    }

    async fn run<T, E, F, Fut>(
        &self,
        cancel: Option<&CancellationToken>,
        op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let span = info_span!(
            "retry",
            service_class = %self.label,
            correlation_id = self.correlation_id.as_deref().unwrap_or(""),
        );
        run_with_policy(&self.label, &self.policy, cancel, op)
            .instrument(span)
            .await
    }
}

/// Attempt `op` up to `policy.max_attempts()` times.
///
/// Non-retryable failures return on first occurrence. Between attempts the
/// loop sleeps the (optionally jittered) backoff delay; a fired `cancel`
/// token ends the call with [`RetryError::Cancelled`].
pub(crate) async fn run_with_policy<T, E, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 1;

    loop {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(RetryError::Cancelled {
                attempts: attempt - 1,
            });
        }

        metrics::counter!("retry_attempts_total", "service_class" => label.to_string())
            .increment(1);

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let kind = err.error_kind();
        if !policy.retries(kind) {
            warn!(
                service_class = label,
                attempt,
                max_attempts,
                error_kind = %kind,
                error = %err,
                "non-retryable failure"
            );
            return Err(RetryError::Fatal(err));
        }

        if attempt >= max_attempts {
            metrics::counter!("retry_exhausted_total", "service_class" => label.to_string())
                .increment(1);
            warn!(
                service_class = label,
                attempt,
                max_attempts,
                error_kind = %kind,
                error = %err,
                "retries exhausted"
            );
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last_error: err,
            });
        }

        let delay = policy.delay_with_random(attempt, rand::random::<f64>());
        debug!(
            service_class = label,
            attempt,
            max_attempts,
            error_kind = %kind,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "retryable failure, backing off"
        );

        if !wait(delay, cancel).await {
            debug!(service_class = label, attempt, "retry cancelled during backoff");
            return Err(RetryError::Cancelled { attempts: attempt });
        }
        attempt += 1;
    }
}

/// Sleep for `delay`. Returns `false` if cancelled first.
async fn wait(delay: Duration, cancel: Option<&CancellationToken>) -> bool {
    match cancel {
        Some(token) => tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = token.cancelled() => false,
        },
        None => {
            tokio::time::sleep(delay).await;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tether_core::{DependencyError, ErrorKind};

    fn policy(max_attempts: u32) -> Arc<RetryPolicy> {
        Arc::new(
            RetryPolicy::new(
                max_attempts,
                Duration::from_millis(100),
                Duration::from_secs(1),
                2.0,
                true,
                [ErrorKind::Timeout],
            )
            .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn wrapper_is_reusable() {
        let wrapper = RetryWrapper::new("custom", policy(2)).with_correlation_id("req-1");
        assert_eq!(wrapper.label(), "custom");
        assert_eq!(wrapper.correlation_id(), Some("req-1"));

        for _ in 0..3 {
            let calls = AtomicU32::new(0);
            let result: Result<u32, RetryError<DependencyError>> = wrapper
                .call(|| async {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n == 1 {
                        Err(DependencyError::new(ErrorKind::Timeout, "slow"))
                    } else {
                        Ok(n)
                    }
                })
                .await;
            assert_eq!(result.unwrap(), 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn jittered_waits_stay_within_cap() {
        let wrapper = RetryWrapper::new("custom", policy(5));
        let start = tokio::time::Instant::now();
        let result: Result<(), RetryError<DependencyError>> = wrapper
            .call(|| async { Err(DependencyError::new(ErrorKind::Timeout, "slow")) })
            .await;
        assert_matches!(result, Err(RetryError::Exhausted { attempts: 5, .. }));
        // 100 + 200 + 400 + 800 ms upper bound, plus timer slack
        assert!(start.elapsed() <= Duration::from_millis(1_500 + 10));
    }

    #[tokio::test(start_paused = true)]
    async fn pre_cancelled_token_makes_no_attempt() {
        let wrapper = RetryWrapper::new("custom", policy(3));
        let token = CancellationToken::new();
        token.cancel();
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<DependencyError>> = wrapper
            .call_cancellable(&token, || async {
                let _ = calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_matches!(result, Err(RetryError::Cancelled { attempts: 0 }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
