//! Error model shared by every operator edge.
//!
//! Errors travel downstream as a single terminal signal. Operators may convert
//! them to completions ([`ignore_errors`](crate::flow::Flow::ignore_errors)) or
//! to handled side effects ([`when`](crate::flow::Flow::when)), which suppresses
//! propagation but still terminates the edge. [`FlowError::Fatal`] is never
//! swallowed by either.

use std::{any::Any, time::Duration};

/// Terminal error carried by the `Error` signal of an edge.
///
/// Cloneable so a single failure can fan out to many downstream edges
/// (broadcast seats, partition lanes).
#[derive(Debug, Clone, thiserror::Error)]
pub enum FlowError {
    /// The signal protocol was violated: zero/negative request, a second
    /// terminal, or `on_next` after a terminal.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A constructor or operation received an argument it cannot accept.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// A user-supplied closure panicked inside an operator.
    #[error("user callback failed: {0}")]
    User(String),

    /// No activity within the configured bound.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A dispatcher queue rejected a submission (full or shut down).
    #[error("dispatcher `{dispatcher}` overflowed")]
    Overflow { dispatcher: String },

    /// Internal invariant violation. Logged to the error sink and never
    /// converted to a completion.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Discriminant of [`FlowError`], used for selective handling
/// ([`when`](crate::flow::Flow::when)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Protocol,
    IllegalArgument,
    User,
    Timeout,
    Overflow,
    Fatal,
}

impl FlowError {
    /// Returns the kind discriminant of this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            FlowError::Protocol(_) => ErrorKind::Protocol,
            FlowError::IllegalArgument(_) => ErrorKind::IllegalArgument,
            FlowError::User(_) => ErrorKind::User,
            FlowError::Timeout(_) => ErrorKind::Timeout,
            FlowError::Overflow { .. } => ErrorKind::Overflow,
            FlowError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// True for errors that must never be swallowed by error-handling
    /// operators.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, FlowError::Fatal(_))
    }

    pub(crate) fn overflow(dispatcher: &str) -> Self {
        FlowError::Overflow {
            dispatcher: dispatcher.to_owned(),
        }
    }
}

/// Runs a user-supplied closure behind a catch barrier.
///
/// A panic must never unwind past the operator into a dispatcher worker
/// (it would kill the worker); it is converted into [`FlowError::User`]
/// and surfaced through `on_error`.
pub(crate) fn catch_user<R>(f: impl FnOnce() -> R) -> Result<R, FlowError> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f))
        .map_err(|payload| FlowError::User(panic_message(payload.as_ref())))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "user callback panicked".to_owned()
    }
}

/// Reports a fatal invariant violation to the error sink.
pub(crate) fn report_fatal(context: &str, detail: &str) {
    tracing::error!(context, detail, "fatal invariant violation");
}
