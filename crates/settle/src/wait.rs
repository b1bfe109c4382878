//! Waiting for a resource to reach a target status.
//!
//! Platform operations report progress through a status string on the
//! resource itself: a table is `CREATING` until it is `ACTIVE`, a connector
//! moves through `PROVISIONING` into `RUNNING` or `FAILED`, a deleted
//! record stays `DELETING` until describe calls stop finding it at all.
//! [`StateChange`] describes one such transition and polls a caller-supplied
//! refresh function until the resource settles.

use std::{future::Future, time::Duration};

use tokio::time::{sleep, sleep_until, Instant};

use crate::{backoff::Backoff, Error, Result, UserError};

/// Consecutive not-found refreshes tolerated before a wait with a
/// non-empty target gives up on the resource ever appearing.
const DEFAULT_NOT_FOUND_CHECKS: u32 = 20;

/// The terminal observation of a successful wait.
#[derive(Debug)]
pub enum Settled<T> {
    /// The resource reported a status in the target set.
    Reached { value: T, status: String },
    /// The resource disappeared, which a disappearance wait counts as
    /// success.
    Gone,
}

impl<T> Settled<T> {
    /// The refreshed value, unless the resource is gone.
    pub fn into_value(self) -> Option<T> {
        match self {
            Settled::Reached { value, .. } => Some(value),
            Settled::Gone => None,
        }
    }

    /// The status that ended the wait, if the resource still exists.
    pub fn status(&self) -> Option<&str> {
        match self {
            Settled::Reached { status, .. } => Some(status.as_str()),
            Settled::Gone => None,
        }
    }
}

/// Configuration for one status-transition wait.
///
/// `pending` holds the statuses a resource passes through while an
/// operation is in flight, `target` the statuses that mean it finished.
/// [`StateChange::wait`] polls a refresh function until a target status is
/// observed, the resource definitively fails, or the timeout elapses.
#[derive(Clone, Debug)]
pub struct StateChange {
    pending: Vec<String>,
    target: Vec<String>,
    timeout: Duration,
    pace: Backoff,
    not_found_checks: u32,
    continuous_target: u32,
}

impl StateChange {
    pub fn new(
        pending: impl IntoIterator<Item = impl Into<String>>,
        target: impl IntoIterator<Item = impl Into<String>>,
        timeout: Duration,
    ) -> Self {
        StateChange {
            pending: pending.into_iter().map(Into::into).collect(),
            target: target.into_iter().map(Into::into).collect(),
            timeout,
            pace: Backoff::default(),
            not_found_checks: DEFAULT_NOT_FOUND_CHECKS,
            continuous_target: 1,
        }
    }

    /// A wait that succeeds when the resource disappears.
    ///
    /// The refresh function keeps reporting statuses in `pending` while
    /// teardown is in flight; the wait ends on the first not-found
    /// observation (or several consecutive ones, under
    /// [`StateChange::with_continuous_target`]).
    pub fn until_gone(
        pending: impl IntoIterator<Item = impl Into<String>>,
        timeout: Duration,
    ) -> Self {
        Self::new(pending, std::iter::empty::<&str>(), timeout)
    }

    /// Replaces the default pacing.
    pub fn with_backoff(mut self, pace: Backoff) -> Self {
        self.pace = pace;
        self
    }

    /// Sets how many consecutive not-found refreshes a wait with a
    /// non-empty target tolerates before failing. Defaults to 20.
    pub fn with_not_found_checks(mut self, checks: u32) -> Self {
        self.not_found_checks = checks;
        self
    }

    /// Requires a target observation to hold for `occurrences` consecutive
    /// refreshes. Defaults to one; zero is normalized to one.
    pub fn with_continuous_target(mut self, occurrences: u32) -> Self {
        self.continuous_target = occurrences;
        self
    }

    /// Polls `refresh` until the resource settles.
    ///
    /// `refresh` reports the resource and its current status; an error
    /// classified by [`Error::is_not_found`] is the disappearance
    /// observation and any other error ends the wait immediately. A status
    /// in neither set is fatal when a pending set was declared, and
    /// tolerated as in-flight when the pending set is empty. A target
    /// observation must hold for the configured number of consecutive
    /// refreshes; pending and not-found observations reset that count.
    ///
    /// A resource missing for more consecutive refreshes than the
    /// not-found allowance fails the wait with [`Error::NotFound`]. When
    /// the deadline fires, `refresh` gets one final look; if that look
    /// does not settle the wait, the result is an [`Error::Timeout`]
    /// carrying the last observed status and error.
    pub async fn wait<T, F, Fut>(mut self, mut refresh: F) -> Result<Settled<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(T, String)>>,
    {
        self.continuous_target = self.continuous_target.max(1);
        let deadline = Instant::now() + self.timeout;
        if self.target.is_empty() {
            log::debug!("waiting for resource to be gone (pending {:?})", self.pending);
        } else {
            log::debug!(
                "waiting for status to become {:?} (pending {:?})",
                self.target,
                self.pending
            );
        }

        let mut progress = Progress::default();
        let mut tick: u32 = 0;
        loop {
            // Confirmation of a held target status re-checks at the floor
            // instead of riding the growth curve.
            let wait = if progress.streak > 0 {
                self.pace.confirm_interval()
            } else {
                self.pace.wait_before(tick)
            };
            if Instant::now() + wait >= deadline {
                sleep_until(deadline).await;
                log::warn!(
                    "wait timed out after {:?}, giving one final refresh",
                    self.timeout
                );
                return match self.observe(&mut progress, refresh().await)? {
                    Step::Done(settled) => Ok(settled),
                    Step::Continue => Err(Error::Timeout {
                        timeout: self.timeout,
                        expected: self.target.clone(),
                        last_status: progress.last_status,
                        last_error: progress
                            .last_error
                            .map(|error| Box::new(error) as Box<dyn UserError>),
                    }),
                };
            }
            if !wait.is_zero() {
                log::trace!("waiting {wait:?} before next refresh");
                sleep(wait).await;
            }
            match self.observe(&mut progress, refresh().await)? {
                Step::Done(settled) => return Ok(settled),
                Step::Continue => {}
            }
            tick += 1;
        }
    }

    fn observe<T>(&self, progress: &mut Progress, outcome: Result<(T, String)>) -> Result<Step<T>> {
        match outcome {
            Err(error) if error.is_not_found() => {
                if self.target.is_empty() {
                    progress.streak += 1;
                    log::trace!(
                        "resource gone ({} of {} confirmations)",
                        progress.streak,
                        self.continuous_target
                    );
                    if progress.streak >= self.continuous_target {
                        return Ok(Step::Done(Settled::Gone));
                    }
                } else {
                    progress.streak = 0;
                    progress.not_found_ticks += 1;
                    if progress.not_found_ticks > self.not_found_checks {
                        return Err(Error::NotFound {
                            retries: progress.not_found_ticks as usize,
                        });
                    }
                }
                progress.last_error = Some(error);
                Ok(Step::Continue)
            }
            Err(error) => Err(error),
            Ok((value, status)) => {
                progress.last_status = Some(status.clone());
                progress.not_found_ticks = 0;
                if self.target.iter().any(|t| *t == status) {
                    progress.streak += 1;
                    log::trace!(
                        "target status '{status}' held {} of {} times",
                        progress.streak,
                        self.continuous_target
                    );
                    if progress.streak >= self.continuous_target {
                        return Ok(Step::Done(Settled::Reached { value, status }));
                    }
                    Ok(Step::Continue)
                } else if self.pending.iter().any(|p| *p == status) {
                    log::trace!("pending status '{status}'");
                    progress.streak = 0;
                    Ok(Step::Continue)
                } else if self.pending.is_empty() {
                    // Without a pending set, any unrecognized status counts
                    // as still in flight.
                    progress.streak = 0;
                    Ok(Step::Continue)
                } else {
                    Err(Error::UnexpectedStatus {
                        status,
                        expected: self.target.clone(),
                        last_error: None,
                    })
                }
            }
        }
    }
}

#[derive(Default)]
struct Progress {
    streak: u32,
    not_found_ticks: u32,
    last_status: Option<String>,
    last_error: Option<Error>,
}

enum Step<T> {
    Done(Settled<T>),
    Continue,
}
