//! The four-signal protocol every operator node obeys.
//!
//! A publisher→subscriber edge carries three downstream signals (`Next`,
//! `Error`, `Complete`) and two upstream ones (`request(n)`, `cancel`):
//!
//! ```text
//!            on_next / on_error / on_complete
//!  ┌───────────┐ ────────────────────────────► ┌────────────┐
//!  │ Publisher │                               │ Subscriber │
//!  └───────────┘ ◄──────────────────────────── └────────────┘
//!                     request(n) / cancel
//! ```
//!
//! ## Contract
//!
//! - `subscribe` synchronously invokes `on_subscribe(subscription)`; no `Next`
//!   is delivered before that callback returns.
//! - `request(0)` is a protocol error, surfaced as `Error(IllegalArgument)`.
//! - `cancel` is idempotent; after it returns at most one already-in-flight
//!   signal may still arrive.
//! - Exactly one terminal (`Error` or `Complete`) per edge, and no `Next`
//!   after it. Both are enforced by [`Gate`], the per-edge state machine.

use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use crate::error::FlowError;

/// A discrete event on a publisher→subscriber edge.
#[derive(Debug, Clone)]
pub enum Signal<T> {
    Next(T),
    Error(FlowError),
    Complete,
}

impl<T> Signal<T> {
    /// True for `Error` and `Complete`.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Signal::Error(_) | Signal::Complete)
    }
}

/// Downstream half of an edge. Operators implement this towards their
/// upstream; terminal consumers implement it at the end of the graph.
pub trait Subscriber<T>: Send + Sync {
    /// Invoked synchronously from `subscribe`, handing over the upstream
    /// handle. Demand may be requested from inside this callback.
    fn on_subscribe(&self, subscription: Subscription);

    fn on_next(&self, value: T);

    fn on_error(&self, error: FlowError);

    fn on_complete(&self);
}

/// Upstream half of an edge.
pub trait Publisher<T>: Send + Sync {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}

/// Receiver of `request`/`cancel` deliveries; implemented by sources and by
/// operators that re-account demand.
pub trait Upstream: Send + Sync {
    fn request(&self, n: u64);

    fn cancel(&self);
}

/// The bidirectional handle between a subscriber and its immediate upstream.
///
/// Cloneable so an operator can retain it (to cancel on user error or to
/// replace credit for discarded elements) while also passing it downstream.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<dyn Upstream>,
}

impl Subscription {
    pub fn new(inner: Arc<dyn Upstream>) -> Self {
        Self { inner }
    }

    /// Authorizes `n` more `Next` signals. The upstream may deliver them
    /// synchronously from inside this call.
    #[inline]
    pub fn request(&self, n: u64) {
        self.inner.request(n);
    }

    /// Idempotent. Propagates upstream immediately.
    #[inline]
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Subscription")
    }
}

/// Lifecycle of an operator edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Ready = 0,
    Subscribed = 1,
    Running = 2,
    Completed = 3,
    Errored = 4,
    Cancelled = 5,
}

impl Lifecycle {
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Lifecycle::Completed | Lifecycle::Errored | Lifecycle::Cancelled
        )
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Ready,
            1 => Lifecycle::Subscribed,
            2 => Lifecycle::Running,
            3 => Lifecycle::Completed,
            4 => Lifecycle::Errored,
            _ => Lifecycle::Cancelled,
        }
    }
}

/// Atomic per-edge state machine enforcing the protocol's two hard rules:
/// exactly one terminal per edge, and no `Next` after a terminal.
///
/// Transitions: `Ready → Subscribed → Running → {Completed, Errored,
/// Cancelled}`. The terminal transition is claimed by compare-and-swap, so
/// under racing producers exactly one wins and delivers the terminal.
pub struct Gate(AtomicU8);

impl Gate {
    pub const fn new() -> Self {
        Self(AtomicU8::new(Lifecycle::Ready as u8))
    }

    #[inline]
    pub fn state(&self) -> Lifecycle {
        Lifecycle::from_u8(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Marks the edge bound to an upstream. False if it already was (at most
    /// one active upstream subscription per operator).
    pub fn mark_subscribed(&self) -> bool {
        self.0
            .compare_exchange(
                Lifecycle::Ready as u8,
                Lifecycle::Subscribed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Gate for `Next` delivery: transitions to `Running` on the first signal
    /// and refuses once a terminal has been claimed.
    pub fn accepts_next(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if Lifecycle::from_u8(current).is_terminal() {
                return false;
            }
            if current == Lifecycle::Running as u8 {
                return true;
            }
            match self.0.compare_exchange_weak(
                current,
                Lifecycle::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }

    /// Claims the terminal transition. Returns true for the single winner,
    /// which is then responsible for delivering the terminal signal.
    pub fn try_terminate(&self, to: Lifecycle) -> bool {
        debug_assert!(to.is_terminal());
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if Lifecycle::from_u8(current).is_terminal() {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// Error sink for terminals that lost the race against cancellation or an
/// earlier terminal. Dropping them is part of the contract; fatal ones are
/// still reported loudly.
pub(crate) fn drop_late_terminal(error: Option<&FlowError>) {
    match error {
        Some(e) if e.is_fatal() => {
            crate::error::report_fatal("late terminal", &e.to_string());
        }
        Some(e) => tracing::warn!(error = %e, "dropping terminal on settled edge"),
        None => tracing::trace!("dropping completion on settled edge"),
    }
}

/// Validates a `request` amount. Zero credit is a protocol error the caller
/// surfaces as `Error(IllegalArgument)` downstream.
pub(crate) fn checked_request(n: u64) -> Result<u64, FlowError> {
    if n == 0 {
        Err(FlowError::IllegalArgument(
            "request amount must be positive".into(),
        ))
    } else {
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    /// Only one of many racing terminals wins the gate
    #[test]
    fn test_single_terminal() {
        const RACERS: usize = 8;
        let gate = Arc::new(Gate::new());
        let winners: Vec<_> = (0..RACERS)
            .map(|i| {
                let gate = gate.clone();
                std::thread::spawn(move || {
                    let to = if i % 2 == 0 {
                        Lifecycle::Completed
                    } else {
                        Lifecycle::Errored
                    };
                    gate.try_terminate(to)
                })
            })
            .collect();

        let won = winners
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(won, 1);
        assert!(gate.is_terminal());
    }

    /// No `Next` is accepted after a terminal
    #[test]
    fn test_no_next_after_terminal() {
        let gate = Gate::new();
        assert!(gate.accepts_next());
        assert_eq!(gate.state(), Lifecycle::Running);

        assert!(gate.try_terminate(Lifecycle::Completed));
        assert!(!gate.accepts_next());
        assert!(!gate.try_terminate(Lifecycle::Errored));
    }

    /// An edge binds to at most one upstream
    #[test]
    fn test_single_subscription() {
        let gate = Gate::new();
        assert!(gate.mark_subscribed());
        assert!(!gate.mark_subscribed());
    }

    /// Zero requests are rejected as protocol errors
    #[test]
    fn test_zero_request() {
        assert!(checked_request(0).is_err());
        assert_eq!(checked_request(5).unwrap(), 5);
    }
}
