//! Retrying fallible operations until they settle.
//!
//! [`retry_when`] runs an operation repeatedly, consulting a caller
//! predicate after every attempt, until the predicate ends the loop or the
//! timeout elapses. The deadline never cuts an attempt short: an in-flight
//! attempt is allowed to complete, and once the deadline has passed the
//! operation gets exactly one final attempt before a timeout is reported,
//! so an operation that succeeds at the buzzer is not discarded.

use std::{future::Future, time::Duration};

use tokio::time::{sleep, sleep_until, Instant};

use crate::{backoff::Backoff, Error, Result, UserError};

/// A predicate's decision about one observed outcome.
#[derive(Debug)]
pub enum Verdict {
    /// Run the operation again after the next backoff wait.
    ///
    /// When the outcome is an error it is remembered and reported if the
    /// deadline elapses first. `error` overrides what is remembered, which
    /// matters when a successful outcome is the reason to keep going.
    Retry { error: Option<Error> },
    /// End the loop. The outcome is surfaced as-is unless `error` replaces
    /// it.
    Stop { error: Option<Error> },
}

impl Verdict {
    /// Run the operation again.
    pub fn retry() -> Self {
        Verdict::Retry { error: None }
    }

    /// Run the operation again, remembering `error` as the reason.
    pub fn retry_with(error: Error) -> Self {
        Verdict::Retry { error: Some(error) }
    }

    /// End the loop with the outcome as-is.
    pub fn stop() -> Self {
        Verdict::Stop { error: None }
    }

    /// End the loop with `error` instead of the outcome.
    pub fn stop_with(error: Error) -> Self {
        Verdict::Stop { error: Some(error) }
    }
}

fn conclude<T>(outcome: Result<T>, replacement: Option<Error>) -> Result<T> {
    match replacement {
        Some(error) => Err(error),
        None => outcome,
    }
}

/// Runs `op` until `predicate` ends the loop or `timeout` elapses, pacing
/// attempts with `pace`.
///
/// Attempts are strictly sequential within one call; the loop sleeps
/// between them and the deadline is the only cancellation mechanism. Once
/// the next attempt would land on or past the deadline, the loop sleeps out
/// the remainder and gives `op` one final attempt. If the predicate still
/// wants to retry after that, an [`Error::Timeout`] carrying the most
/// recently observed error is returned.
pub async fn retry_when_paced<T, F, Fut, P>(
    timeout: Duration,
    pace: Backoff,
    mut op: F,
    mut predicate: P,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: FnMut(&Result<T>) -> Verdict,
{
    let deadline = Instant::now() + timeout;
    let mut remembered: Option<Error> = None;
    let mut tick: u32 = 0;

    loop {
        let wait = pace.wait_before(tick);
        if Instant::now() + wait >= deadline {
            sleep_until(deadline).await;
            log::trace!("deadline reached after {timeout:?}, giving one final attempt");
            let outcome = op().await;
            return match predicate(&outcome) {
                Verdict::Stop { error } => conclude(outcome, error),
                Verdict::Retry { error } => {
                    let last_error = error
                        .or(outcome.err())
                        .or(remembered)
                        .map(|e| Box::new(e) as Box<dyn UserError>);
                    Err(Error::Timeout {
                        timeout,
                        expected: Vec::new(),
                        last_status: None,
                        last_error,
                    })
                }
            };
        }
        if !wait.is_zero() {
            log::trace!("waiting {wait:?} before next attempt");
            sleep(wait).await;
        }
        let outcome = op().await;
        match predicate(&outcome) {
            Verdict::Stop { error } => return conclude(outcome, error),
            Verdict::Retry { error } => {
                if let Some(error) = error.or(outcome.err()) {
                    remembered = Some(error);
                }
            }
        }
        tick += 1;
    }
}

/// [`retry_when_paced`] with the default backoff.
pub async fn retry_when<T, F, Fut, P>(timeout: Duration, op: F, predicate: P) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: FnMut(&Result<T>) -> Verdict,
{
    retry_when_paced(timeout, Backoff::default(), op, predicate).await
}

/// Retries while the operation reports the resource missing.
///
/// Reading back a freshly created resource is the canonical use: the
/// platform acknowledged the create, but describe calls still come back
/// not-found until the change propagates.
pub async fn retry_while_not_found<T, F, Fut>(timeout: Duration, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_when(timeout, op, |outcome| match outcome {
        Err(error) if error.is_not_found() => Verdict::retry(),
        _ => Verdict::stop(),
    })
    .await
}

/// Retries not-found reads only when `new_resource` says the resource was
/// just created; for pre-existing resources a not-found is terminal like
/// any other error.
pub async fn retry_when_new_resource_not_found<T, F, Fut>(
    timeout: Duration,
    new_resource: bool,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_when(timeout, op, move |outcome| match outcome {
        Err(error) if new_resource && error.is_not_found() => Verdict::retry(),
        _ => Verdict::stop(),
    })
    .await
}

/// Retries while the operation keeps finding a resource that is expected
/// to disappear, succeeding once a read reports it missing.
///
/// When the deadline elapses with the resource still present, the timeout
/// reports "found resource" rather than a bare deadline message.
pub async fn retry_until_not_found<T, F, Fut>(timeout: Duration, op: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let result = retry_when(timeout, op, |outcome| match outcome {
        Ok(_) => Verdict::retry_with(Error::FoundResource),
        Err(_) => Verdict::stop(),
    })
    .await;
    match result {
        // Disappearance is the success condition here.
        Err(error) if error.is_not_found() => Ok(()),
        Err(error) => Err(error),
        Ok(_) => Err(Error::FoundResource),
    }
}

/// Retries while the operation's error message contains `needle`.
///
/// Some platforms surface propagation delay as a soft failure with no
/// structured classification, e.g. a role that exists but is not yet
/// assumable, leaving the message as the only thing to match on.
pub async fn retry_when_message_contains<T, F, Fut>(
    timeout: Duration,
    needle: impl Into<String>,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let needle = needle.into();
    retry_when(timeout, op, move |outcome| match outcome {
        Err(error) if error.to_string().contains(&needle) => Verdict::retry(),
        _ => Verdict::stop(),
    })
    .await
}

/// A predicate requiring `occurrences` uninterrupted successes.
///
/// A not-found observation resets the streak and keeps the loop alive; any
/// other error ends the loop. Zero occurrences is normalized to one.
pub fn consecutive_successes<T>(occurrences: u32) -> impl FnMut(&Result<T>) -> Verdict {
    let required = occurrences.max(1);
    let mut streak = 0;
    move |outcome| match outcome {
        Ok(_) => {
            streak += 1;
            if streak >= required {
                Verdict::stop()
            } else {
                Verdict::retry()
            }
        }
        Err(error) if error.is_not_found() => {
            streak = 0;
            Verdict::retry()
        }
        Err(_) => Verdict::stop(),
    }
}

#[cfg(test)]
mod test {
    use std::cell::Cell;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn returns_immediately_on_first_success() {
        let _ = env_logger::builder().try_init();
        let start = Instant::now();
        let calls = Cell::new(0u32);
        let op = || {
            calls.set(calls.get() + 1);
            async { Ok(7) }
        };
        let got = retry_when(Duration::from_secs(30), op, |_| Verdict::stop())
            .await
            .unwrap();
        assert_eq!(7, got);
        assert_eq!(1, calls.get());
        assert_eq!(
            Duration::ZERO,
            start.elapsed(),
            "a first-try success must not sleep at all"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_lands_on_the_deadline() {
        let _ = env_logger::builder().try_init();
        let start = Instant::now();
        let timeout = Duration::from_secs(5);
        let interval = Duration::from_secs(1);
        let calls = Cell::new(0u32);
        let op = || {
            calls.set(calls.get() + 1);
            async { Ok(()) }
        };
        let err = retry_when_paced(
            timeout,
            Backoff::default().with_poll_interval(interval),
            op,
            |_| Verdict::retry(),
        )
        .await
        .unwrap_err();
        assert!(err.is_timeout());
        let elapsed = start.elapsed();
        assert!(elapsed >= timeout, "never reports a timeout early");
        assert!(elapsed <= timeout + interval, "reports within one interval");
        assert_eq!(Duration::from_secs(5), elapsed);
        assert_eq!(6, calls.get(), "attempts at 0..5s plus the final one");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_carries_the_last_observed_error() {
        let _ = env_logger::builder().try_init();
        let op = || async { Err::<(), Error>(Error::not_found()) };
        let err = retry_when_paced(
            Duration::from_secs(3),
            Backoff::default().with_poll_interval(Duration::from_secs(1)),
            op,
            |_| Verdict::retry(),
        )
        .await
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("timed out after 3s"), "got: {msg}");
        assert!(msg.contains("couldn't find resource"), "got: {msg}");
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_retries_until_visible() {
        let _ = env_logger::builder().try_init();
        let calls = Cell::new(0u32);
        let op = || {
            let n = calls.get();
            calls.set(n + 1);
            async move {
                if n < 3 {
                    Err(Error::not_found())
                } else {
                    Ok("ready")
                }
            }
        };
        let got = retry_while_not_found(Duration::from_secs(60), op)
            .await
            .unwrap();
        assert_eq!("ready", got);
        assert_eq!(4, calls.get(), "three misses and the hit");
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_successes_reset_on_interruption() {
        let _ = env_logger::builder().try_init();
        let calls = Cell::new(0u32);
        let op = || {
            let n = calls.get();
            calls.set(n + 1);
            async move {
                if n == 2 {
                    Err(Error::not_found())
                } else {
                    Ok(n)
                }
            }
        };
        let got = retry_when(Duration::from_secs(120), op, consecutive_successes(3))
            .await
            .unwrap();
        assert_eq!(5, got, "two successes, a miss, then three in a row");
        assert_eq!(6, calls.get());
    }

    #[tokio::test(start_paused = true)]
    async fn until_not_found_succeeds_once_gone() {
        let _ = env_logger::builder().try_init();
        let calls = Cell::new(0u32);
        let op = || {
            let n = calls.get();
            calls.set(n + 1);
            async move {
                if n < 2 {
                    Ok("still here")
                } else {
                    Err(Error::not_found())
                }
            }
        };
        retry_until_not_found(Duration::from_secs(60), op)
            .await
            .unwrap();
        assert_eq!(3, calls.get());
    }

    #[tokio::test(start_paused = true)]
    async fn until_not_found_reports_still_found_on_timeout() {
        let _ = env_logger::builder().try_init();
        let calls = Cell::new(0u32);
        let op = || {
            calls.set(calls.get() + 1);
            async { Ok("stuck") }
        };
        let err = retry_until_not_found(Duration::from_secs(3), op)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(
            err.to_string().contains("found resource"),
            "a disappearance wait names the stuck resource: {err}"
        );
        assert!(calls.get() > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_pass_through_the_predicate_untouched() {
        let _ = env_logger::builder().try_init();
        let calls = Cell::new(0u32);
        let op = || {
            calls.set(calls.get() + 1);
            async { Err::<(), Error>(Error::other("boom")) }
        };
        let err = retry_when(Duration::from_secs(30), op, |_| Verdict::stop())
            .await
            .unwrap_err();
        assert_eq!("boom", err.to_string());
        assert_eq!(1, calls.get(), "a terminal error ends the loop at once");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_with_replaces_the_outcome() {
        let _ = env_logger::builder().try_init();
        let op = || async { Ok(13) };
        let err = retry_when(Duration::from_secs(30), op, |_| {
            Verdict::stop_with(Error::other("replaced"))
        })
        .await
        .unwrap_err();
        assert_eq!("replaced", err.to_string());
    }

    #[tokio::test(start_paused = true)]
    async fn new_resource_gates_not_found_retries() {
        let _ = env_logger::builder().try_init();
        let calls = Cell::new(0u32);
        let op = || {
            let n = calls.get();
            calls.set(n + 1);
            async move {
                if n == 0 {
                    Err(Error::not_found())
                } else {
                    Ok(n)
                }
            }
        };
        let err = retry_when_new_resource_not_found(Duration::from_secs(30), false, op)
            .await
            .unwrap_err();
        assert!(err.is_not_found(), "existing resources fail fast");
        assert_eq!(1, calls.get());

        calls.set(0);
        let op = || {
            let n = calls.get();
            calls.set(n + 1);
            async move {
                if n == 0 {
                    Err(Error::not_found())
                } else {
                    Ok(n)
                }
            }
        };
        let got = retry_when_new_resource_not_found(Duration::from_secs(30), true, op)
            .await
            .unwrap();
        assert_eq!(1, got, "new resources get the retry allowance");
        assert_eq!(2, calls.get());
    }

    #[tokio::test(start_paused = true)]
    async fn message_matching_retries_soft_failures() {
        let _ = env_logger::builder().try_init();
        let calls = Cell::new(0u32);
        let op = || {
            let n = calls.get();
            calls.set(n + 1);
            async move {
                if n < 2 {
                    Err(Error::other("throttled: try again shortly"))
                } else {
                    Ok(n)
                }
            }
        };
        let got = retry_when_message_contains(Duration::from_secs(60), "throttled", op)
            .await
            .unwrap();
        assert_eq!(2, got);
        assert_eq!(3, calls.get());

        let op = || async { Err::<u32, Error>(Error::other("access denied")) };
        let err = retry_when_message_contains(Duration::from_secs(60), "throttled", op)
            .await
            .unwrap_err();
        assert_eq!("access denied", err.to_string(), "non-matching errors are terminal");
    }
}
