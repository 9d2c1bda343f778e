//! Bounded, fixed-interval retry for polling eventually-consistent state.
//!
//! Freshly booted machines take a short and bounded time to start services,
//! propagate mounts, or ship logs. Callers wrap the idempotent check in
//! [`retry`] and get a predictable worst-case latency of
//! `(attempts - 1) * delay` on top of the check's own cost. There is no
//! backoff and no jitter.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// Attempt count and delay for a fixed-interval retry loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of invocations, including the first one.
    pub attempts: u32,
    /// Pause between consecutive invocations.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy. An attempt count of zero is treated as one.
    #[must_use]
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Runs `op` under this policy.
    ///
    /// # Errors
    ///
    /// Returns the error of the final attempt when every attempt fails.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        retry(self.attempts, self.delay, op).await
    }
}

/// Invokes `op` until it succeeds or `attempts` invocations have been made,
/// sleeping `delay` between invocations.
///
/// The sleep is an async suspension, so dropping the returned future (for
/// example under `tokio::time::timeout`) cancels the loop between attempts.
///
/// # Errors
///
/// Returns the error of the final attempt when every attempt fails.
pub async fn retry<T, E, F, Fut>(attempts: u32, delay: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let limit = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= limit => return Err(err),
            Err(_) => {
                tracing::debug!(attempt, attempts = limit, ?delay, "attempt failed; retrying");
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use rstest::rstest;
    use tokio::time::Instant;

    use super::*;

    fn failing_until(
        calls: Arc<AtomicU32>,
        failures: u32,
    ) -> impl FnMut() -> std::future::Ready<Result<u32, String>> {
        move || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= failures {
                std::future::ready(Err(format!("failure {call}")))
            } else {
                std::future::ready(Ok(call))
            }
        }
    }

    #[rstest]
    #[case(0, 5)]
    #[case(2, 5)]
    #[case(4, 5)]
    #[tokio::test(start_paused = true)]
    async fn succeeds_after_k_failures(#[case] failures: u32, #[case] attempts: u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let delay = Duration::from_secs(1);
        let start = Instant::now();

        let op = failing_until(Arc::clone(&calls), failures);
        let result = retry(attempts, delay, op).await;

        assert_eq!(result, Ok(failures + 1));
        assert_eq!(calls.load(Ordering::SeqCst), failures + 1);
        assert_eq!(start.elapsed(), delay * failures);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_error_after_exhausting_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let op = failing_until(Arc::clone(&calls), u32::MAX);
        let result = retry(3, Duration::from_secs(2), op).await;

        assert_eq!(result, Err(String::from("failure 3")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_still_invokes_once() {
        let calls = Arc::new(AtomicU32::new(0));

        let op = failing_until(Arc::clone(&calls), u32::MAX);
        let result = retry(0, Duration::from_secs(1), op).await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_between_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(10, Duration::from_secs(5));

        let outcome = tokio::time::timeout(
            Duration::from_secs(7),
            policy.run(failing_until(Arc::clone(&calls), u32::MAX)),
        )
        .await;

        assert!(outcome.is_err(), "retry loop should be cancelled");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
