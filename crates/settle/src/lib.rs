//! # Settle
//!
//! Settle is a library for waiting out eventual consistency when driving
//! remote platform APIs from Rust. It grew out of Infrastructure as Code
//! tooling, where nearly every interesting operation is asynchronous on the
//! platform side: a freshly created database is not yet queryable, a deleted
//! DNS record lingers in describe calls, a certificate flips from `PENDING`
//! to `ISSUED` at the platform's leisure. Settle provides the small set of
//! control-flow primitives those tools reach for on every resource: bounded
//! retries and status polling, with the pacing and error classification kept
//! in one place instead of hand-rolled at each call site.
//!
//! ## Key Features
//!
//! - **Bounded retries**: run a fallible async operation until a predicate
//!   stops it or a deadline elapses, with one final attempt after the
//!   deadline so a just-completed operation is never thrown away.
//! - **Status waits**: poll a refresh function tracking a resource's status
//!   string through pending states into a target state, or until the
//!   resource disappears entirely.
//! - **Deterministic pacing**: a documented exponential backoff with a floor
//!   and a cap, overridable with a fixed poll interval per call.
//!
//! ## Usage
//!
//! Settle is typically used inside the provider layer of an IaC program:
//! the function that creates a platform resource follows up with a status
//! wait, the function that deletes one follows up with a disappearance
//! wait, and reads of freshly created resources retry while the platform
//! still reports them missing.
//!
//! ### Concepts
//!
//! Settle operates on caller-supplied async closures and never touches the
//! network itself:
//!
//! - **Operation**: a closure producing a future that resolves to a
//!   `Result`. Invoked once per tick; never invoked concurrently with
//!   itself.
//! - **Predicate**: a closure inspecting each outcome and answering
//!   "run again" or "stop", optionally overriding the error that is
//!   eventually surfaced. See [`retry::Verdict`].
//! - **Refresh**: the status-wait flavor of an operation, returning the
//!   current object together with its status string. See
//!   [`wait::StateChange`].
//!
//! An example usage can be found in `crates/settle/src/test.rs`,
//! demonstrating the find/status/wait pattern against a fictional platform,
//! and `crates/settle-example` drives the same pattern from a CLI.
//!
//! ## Error Handling
//!
//! Settle exposes a comprehensive error enum [`Error`], which encompasses
//! all errors produced by the primitives themselves and carries caller
//! errors through unmodified. Classification helpers such as
//! [`Error::is_not_found`] are what the retry and wait loops use to decide
//! whether an observation is terminal, and caller predicates can compose
//! them the same way.

use std::time::Duration;

pub mod backoff;
pub mod retry;
pub mod wait;

/// Marker trait for userland errors.
pub trait UserError: core::fmt::Display + core::fmt::Debug + 'static {}
impl<T: core::fmt::Display + core::fmt::Debug + 'static> UserError for T {}

/// Top-level error enum that encompasses all errors.
#[derive(snafu::Snafu, Debug)]
pub enum Error {
    #[snafu(display("{source}:\n{}",
                source.chain()
                    .map(|e| format!("{e}"))
                    .collect::<Vec<_>>()
                    .join("\n -> ")))]
    Settle { source: anyhow::Error },

    /// The queried resource does not currently exist.
    #[snafu(display("couldn't find resource{}", if *retries == 0 {
        String::new()
    } else {
        format!(" ({retries} retries)")
    }))]
    NotFound { retries: usize },

    /// The deadline elapsed before the operation settled.
    ///
    /// Carries the last observed status and error, when there were any, for
    /// diagnostics.
    #[snafu(display("{}", timeout_display(timeout, expected, last_status, last_error)))]
    Timeout {
        timeout: Duration,
        expected: Vec<String>,
        last_status: Option<String>,
        last_error: Option<Box<dyn UserError>>,
    },

    /// A refresh reported a status outside both the pending and the target
    /// sets.
    #[snafu(display("unexpected status '{status}', wanted target '{}'{}",
        expected.join(", "),
        error_suffix(last_error)))]
    UnexpectedStatus {
        status: String,
        expected: Vec<String>,
        last_error: Option<Box<dyn UserError>>,
    },

    /// A read still finds a resource that was expected to be gone.
    #[snafu(display("found resource"))]
    FoundResource,

    /// A query expected to match exactly one resource matched none.
    #[snafu(display("empty result"))]
    EmptyResult,

    /// A query expected to match exactly one resource matched several.
    #[snafu(display("too many results: wanted 1, got {count}"))]
    TooManyResults { count: usize },

    /// The caller's own error, passed through unmodified.
    #[snafu(display("{error}"))]
    Op { error: Box<dyn UserError> },
}

impl From<anyhow::Error> for Error {
    fn from(source: anyhow::Error) -> Self {
        Error::Settle { source }
    }
}

impl Error {
    /// A bare not-found classification, for call sites mapping a platform's
    /// own "no such entity" error.
    pub fn not_found() -> Self {
        Error::NotFound { retries: 0 }
    }

    /// Wraps any userland error for passthrough.
    pub fn other(error: impl UserError) -> Self {
        Error::Op {
            error: Box::new(error),
        }
    }

    /// Whether this error means "the queried resource does not currently
    /// exist".
    ///
    /// The retry and wait loops treat this classification as transient;
    /// everything else is terminal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Whether this error means a deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Attaches `error` to a [`Error::Timeout`] or
    /// [`Error::UnexpectedStatus`] that doesn't already carry one.
    ///
    /// Call sites use this to decorate a failed wait with the resource's own
    /// reported reason, e.g. a status message from the final describe call.
    pub fn with_last_error(mut self, error: impl UserError) -> Self {
        match &mut self {
            Error::Timeout { last_error, .. } | Error::UnexpectedStatus { last_error, .. } => {
                if last_error.is_none() {
                    *last_error = Some(Box::new(error));
                }
            }
            _ => {}
        }
        self
    }
}

fn error_suffix(last_error: &Option<Box<dyn UserError>>) -> String {
    last_error
        .as_ref()
        .map(|error| format!(": {error}"))
        .unwrap_or_default()
}

fn timeout_display(
    timeout: &Duration,
    expected: &[String],
    last_status: &Option<String>,
    last_error: &Option<Box<dyn UserError>>,
) -> String {
    let mut msg = match expected {
        [] => format!("timed out after {timeout:?}"),
        _ => format!(
            "timed out after {timeout:?} waiting for status to become '{}'",
            expected.join(", ")
        ),
    };
    if let Some(status) = last_status {
        msg.push_str(&format!(" (last status '{status}')"));
    }
    msg.push_str(&error_suffix(last_error));
    msg
}

type Result<T, E = Error> = core::result::Result<T, E>;

/// Asserts that a query matched exactly one resource, returning it.
///
/// Reads that filter server-side often come back as a list that the caller
/// knows should hold a single element. An empty list maps to
/// [`Error::EmptyResult`] and a longer one to [`Error::TooManyResults`].
pub fn single<T>(mut results: Vec<T>) -> Result<T> {
    match results.len() {
        1 => Ok(results.remove(0)),
        0 => EmptyResultSnafu.fail(),
        got => TooManyResultsSnafu { count: got }.fail(),
    }
}
