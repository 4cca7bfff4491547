//! Fixed-interval polling and retry bounded by a deadline.
//!
//! Both helpers race every attempt and every wait against a cancellation
//! token and an absolute deadline, so a caller never blocks past either.
//!
//! # Example
//!
//! ```ignore
//! use matchlink::retry::{poll_until, PollStatus};
//!
//! let endpoint = poll_until(
//!     Duration::from_secs(5),
//!     Instant::now() + Duration::from_secs(600),
//!     &cancel,
//!     "run_match",
//!     || async {
//!         let response = api.run_match(&token, &request).await?;
//!         Ok(if response.endpoint.is_empty() {
//!             PollStatus::Pending
//!         } else {
//!             PollStatus::Ready(response)
//!         })
//!     },
//! )
//! .await?;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Outcome of a single poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus<T> {
    /// The awaited value is available
    Ready(T),
    /// Not yet, ask again after the interval
    Pending,
}

/// Why a polled or retried operation stopped without a value
#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation failed in a way that retrying cannot fix
    Failed(E),
    /// The deadline elapsed first
    DeadlineExceeded {
        /// Attempts that completed before the deadline
        attempts: u32,
        /// Most recent transient failure, if any
        last_error: Option<E>,
    },
    /// The cancellation token fired first
    Cancelled,
}

enum Interrupt {
    Deadline,
    Cancelled,
}

async fn interruptible<Fut: Future>(
    deadline: Instant,
    cancel: &CancellationToken,
    fut: Fut,
) -> Result<Fut::Output, Interrupt> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        _ = tokio::time::sleep_until(deadline) => Err(Interrupt::Deadline),
        out = fut => Ok(out),
    }
}

/// Poll an operation at a fixed interval until it reports ready.
///
/// The first poll happens immediately. An `Err` from the operation ends
/// polling at once; only `PollStatus::Pending` leads to another round.
pub async fn poll_until<F, Fut, T, E>(
    interval: Duration,
    deadline: Instant,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollStatus<T>, E>>,
    E: Display,
{
    let mut attempts = 0u32;

    loop {
        let status = match interruptible(deadline, cancel, operation()).await {
            Ok(status) => status,
            Err(interrupt) => return Err(interrupted(interrupt, attempts, None)),
        };
        attempts += 1;

        match status {
            Ok(PollStatus::Ready(value)) => return Ok(value),
            Ok(PollStatus::Pending) => {
                debug!(
                    operation = %operation_name,
                    attempt = attempts,
                    interval_ms = interval.as_millis(),
                    "Not ready, polling again"
                );
            }
            Err(e) => {
                error!(
                    operation = %operation_name,
                    attempt = attempts,
                    error = %e,
                    "Poll failed"
                );
                return Err(RetryError::Failed(e));
            }
        }

        if let Err(interrupt) =
            interruptible(deadline, cancel, tokio::time::sleep(interval)).await
        {
            return Err(interrupted(interrupt, attempts, None));
        }
    }
}

/// Retry an operation at a fixed delay until it succeeds or the deadline passes.
///
/// Failures for which `is_transient` returns false are returned immediately.
pub async fn retry_until<F, Fut, T, E, P>(
    delay: Duration,
    deadline: Instant,
    cancel: &CancellationToken,
    operation_name: &str,
    is_transient: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let mut attempts = 0u32;
    let mut last_error = None;

    loop {
        let outcome = match interruptible(deadline, cancel, operation()).await {
            Ok(outcome) => outcome,
            Err(interrupt) => return Err(interrupted(interrupt, attempts, last_error)),
        };
        attempts += 1;

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if !is_transient(&e) => {
                error!(
                    operation = %operation_name,
                    attempt = attempts,
                    error = %e,
                    "Operation failed permanently"
                );
                return Err(RetryError::Failed(e));
            }
            Err(e) => {
                warn!(
                    operation = %operation_name,
                    attempt = attempts,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );
                last_error = Some(e);
            }
        }

        if let Err(interrupt) = interruptible(deadline, cancel, tokio::time::sleep(delay)).await {
            return Err(interrupted(interrupt, attempts, last_error));
        }
    }
}

fn interrupted<E>(interrupt: Interrupt, attempts: u32, last_error: Option<E>) -> RetryError<E> {
    match interrupt {
        Interrupt::Cancelled => RetryError::Cancelled,
        Interrupt::Deadline => RetryError::DeadlineExceeded {
            attempts,
            last_error,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_poll_ready_after_pending_rounds() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let result: Result<&str, RetryError<&str>> = poll_until(
            Duration::from_secs(5),
            Instant::now() + Duration::from_secs(600),
            &cancel,
            "op",
            || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Ok(PollStatus::Pending)
                    } else {
                        Ok(PollStatus::Ready("endpoint"))
                    }
                }
            },
        )
        .await;

        assert!(matches!(result, Ok("endpoint")));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        // Two waits of five seconds between three polls
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_error_stops_immediately() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        let result: Result<(), RetryError<&str>> = poll_until(
            Duration::from_secs(5),
            Instant::now() + Duration::from_secs(600),
            &cancel,
            "op",
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("rpc unavailable")
                }
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Failed("rpc unavailable"))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_deadline_exceeded() {
        let cancel = CancellationToken::new();

        let result: Result<(), RetryError<&str>> = poll_until(
            Duration::from_secs(5),
            Instant::now() + Duration::from_secs(12),
            &cancel,
            "op",
            || async { Ok(PollStatus::Pending) },
        )
        .await;

        match result {
            Err(RetryError::DeadlineExceeded { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected deadline, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_cancelled() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let result: Result<(), RetryError<&str>> = poll_until(
            Duration::from_secs(5),
            Instant::now() + Duration::from_secs(600),
            &cancel,
            "op",
            || async { Ok(PollStatus::Pending) },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        let result: Result<i32, RetryError<&str>> = retry_until(
            Duration::from_secs(1),
            Instant::now() + Duration::from_secs(120),
            &cancel,
            "op",
            |_| true,
            || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("connection refused")
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert!(matches!(result, Ok(42)));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_permanent_failure_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        let result: Result<i32, RetryError<&str>> = retry_until(
            Duration::from_secs(1),
            Instant::now() + Duration::from_secs(120),
            &cancel,
            "op",
            |e: &&str| *e != "bad config",
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("bad config")
                }
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Failed("bad config"))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_deadline_carries_last_error() {
        let cancel = CancellationToken::new();

        let result: Result<i32, RetryError<&str>> = retry_until(
            Duration::from_secs(1),
            Instant::now() + Duration::from_millis(3500),
            &cancel,
            "op",
            |_| true,
            || async { Err("connection refused") },
        )
        .await;

        match result {
            Err(RetryError::DeadlineExceeded {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last_error, Some("connection refused"));
            }
            other => panic!("expected deadline, got {other:?}"),
        }
    }
}
