//! Retry-with-timeout utility shared by stabilization, job polling and
//! node liveness waits.

use std::future::Future;
use std::time::{Duration, Instant};

/// Outcome of a bounded retry loop.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    /// The predicate produced a value before the deadline.
    Complete(T),

    /// The deadline passed without the predicate producing a value.
    TimedOut { elapsed: Duration, retries: u32 },
}

impl<T> RetryOutcome<T> {
    pub fn is_complete(&self) -> bool {
        matches!(self, RetryOutcome::Complete(_))
    }

    /// Convert to Option, discarding timeout diagnostics.
    pub fn complete(self) -> Option<T> {
        match self {
            RetryOutcome::Complete(v) => Some(v),
            RetryOutcome::TimedOut { .. } => None,
        }
    }
}

/// Repeatedly run `f` until it returns `Some`, sleeping `interval` between
/// attempts, for at most `timeout`.
///
/// `f` receives the number of retries so far, so callers can run periodic
/// side work (e.g. a log scan every Nth attempt). The first attempt runs
/// immediately; the timeout is checked before each sleep so a zero timeout
/// still gets one attempt.
pub async fn retry_until<T, F, Fut>(
    mut f: F,
    interval: Duration,
    timeout: Duration,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = Instant::now();
    let mut retries: u32 = 0;

    loop {
        if let Some(v) = f(retries).await {
            return RetryOutcome::Complete(v);
        }

        if start.elapsed() >= timeout {
            return RetryOutcome::TimedOut {
                elapsed: start.elapsed(),
                retries,
            };
        }

        tokio::time::sleep(interval).await;
        retries += 1;
    }
}
