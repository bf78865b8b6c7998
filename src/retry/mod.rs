use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum RetryError<E: fmt::Display> {
    #[error("timed out after {timeout:?}, last error: {}", display_last(.last_error))]
    TimedOut {
        timeout: Duration,
        last_error: Option<E>,
    },
}

fn display_last<E: fmt::Display>(last_error: &Option<E>) -> String {
    match last_error {
        Some(e) => e.to_string(),
        None => "none".to_string(),
    }
}

impl<E: fmt::Display> RetryError<E> {
    /// The error reported by the last failed probe, if any
    pub fn into_last_error(self) -> Option<E> {
        match self {
            Self::TimedOut { last_error, .. } => last_error,
        }
    }
}

/// Call `probe` every `interval` until it yields a value or `timeout` elapses.
///
/// Probe errors do not stop the loop; the most recent one is returned in
/// [`RetryError::TimedOut`] once the deadline passes. The probe always runs
/// at least once.
pub async fn poll_until_some_or_timeout<T, E, F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut probe: F,
) -> Result<T, RetryError<E>>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = Instant::now() + timeout;
    let mut last_error = None;

    loop {
        match probe().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {},
            Err(e) => last_error = Some(e),
        }

        if Instant::now() >= deadline {
            return Err(RetryError::TimedOut {
                timeout,
                last_error,
            });
        }

        tokio::time::sleep(interval).await;
    }
}

/// Call `probe` every `interval` until it returns `true` or `timeout` elapses.
pub async fn retry_until_true_or_timeout<E, F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut probe: F,
) -> Result<(), RetryError<E>>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    poll_until_some_or_timeout(timeout, interval, || {
        let attempt = probe();
        async move { attempt.await.map(|done| done.then_some(())) }
    })
    .await
}
