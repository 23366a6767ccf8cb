//! Execution contexts onto which operator work is submitted.
//!
//! A dispatcher accepts unit-of-work submissions and runs them on a
//! dispatcher-owned thread (or inline, for the caller variant). All variants
//! expose the same submit contract; they differ in ordering and parallelism:
//!
//! | Variant | Concurrency | Order across submissions | Per-submitter order |
//! |---------|-------------|--------------------------|---------------------|
//! | [`CallerDispatcher`] | caller thread | caller order | yes |
//! | [`ThreadDispatcher`] | 1 worker | FIFO global | yes |
//! | [`PoolDispatcher`]   | N workers | none | none |
//! | [`RingDispatcher`] (single-prod) | 1 consumer | FIFO | yes |
//! | [`RingDispatcher`] (multi-prod)  | 1 consumer | per-producer FIFO | yes |
//!
//! Bounded queues apply an [`OverflowPolicy`] when saturated; the operator
//! layer treats a rejected submission as a transport failure and surfaces
//! `Error(Overflow)` downstream.

mod pool;
pub mod ring;
mod sync;
mod thread;
mod wait;

pub use pool::PoolDispatcher;
pub use ring::{ProducerMode, RingDispatcher};
pub use sync::CallerDispatcher;
pub use thread::ThreadDispatcher;
pub use wait::WaitStrategy;

use std::time::Duration;

use crate::error::FlowError;

/// A unit of work submitted to a dispatcher.
pub type Task = Box<dyn FnOnce() + Send>;

/// An executor abstraction accepting unit-of-work submissions.
pub trait Dispatcher: Send + Sync {
    /// Name used in diagnostics and `Overflow` errors.
    fn name(&self) -> &str;

    /// Enqueues `task` for execution and returns immediately. The task runs
    /// on a dispatcher-owned thread (inline for the caller variant).
    ///
    /// Fails with [`FlowError::Overflow`] when the queue is saturated under
    /// the `Error` policy, or when the dispatcher has been shut down.
    fn dispatch(&self, task: Task) -> Result<(), FlowError>;

    /// True when the calling thread is one of this dispatcher's workers.
    /// Used by operators to avoid redundant re-submission.
    fn in_context(&self) -> bool;

    /// Stops accepting submissions, drains existing tasks up to `timeout`,
    /// then abandons the workers. Returns whether the queue drained cleanly.
    fn shutdown(&self, timeout: Duration) -> bool;
}

impl dyn Dispatcher {
    /// Shorthand submitting `move || consumer(data)`.
    pub fn dispatch_with<T: Send + 'static>(
        &self,
        data: T,
        consumer: impl FnOnce(T) + Send + 'static,
    ) -> Result<(), FlowError> {
        self.dispatch(Box::new(move || consumer(data)))
    }
}

/// What a bounded queue does with a submission that finds it full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Block the submitter until space frees up.
    #[default]
    Block,
    /// Reject the submission; the operator layer surfaces `Error(Overflow)`.
    Error,
    /// Silently drop the incoming task.
    DropNewest,
    /// Evict the oldest queued task, then enqueue the incoming one.
    DropOldest,
}

pub(crate) mod context {
    //! Worker-context tracking for `in_context`.
    //!
    //! Each dispatcher gets a process-unique id; its workers stamp that id
    //! into a thread-local on startup, making the membership test exact
    //! (thread names or stack inspection would not survive nesting).

    use std::{
        cell::Cell,
        sync::atomic::{AtomicU64, Ordering},
    };

    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    thread_local! {
        static CURRENT: Cell<u64> = const { Cell::new(0) };
    }

    #[derive(Debug, Clone, Copy)]
    pub(crate) struct ContextId(u64);

    impl ContextId {
        pub(crate) fn allocate() -> Self {
            Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
        }

        /// Stamps the calling thread as belonging to this dispatcher.
        pub(crate) fn enter(self) {
            CURRENT.set(self.0);
        }

        pub(crate) fn is_current(self) -> bool {
            CURRENT.get() == self.0
        }
    }
}

pub(crate) mod latch {
    //! Condvar latch workers arrive at when they exit, so `shutdown` can
    //! await drain completion with a bound.

    use std::time::Duration;

    use parking_lot::{Condvar, Mutex};

    pub(crate) struct ShutdownLatch {
        remaining: Mutex<usize>,
        cond: Condvar,
    }

    impl ShutdownLatch {
        pub(crate) fn new(workers: usize) -> Self {
            Self {
                remaining: Mutex::new(workers),
                cond: Condvar::new(),
            }
        }

        /// Called by a worker as its last action.
        pub(crate) fn arrive(&self) {
            let mut remaining = self.remaining.lock();
            *remaining = remaining.saturating_sub(1);
            self.cond.notify_all();
        }

        /// Waits until every worker has arrived. False on timeout.
        pub(crate) fn wait(&self, timeout: Duration) -> bool {
            let deadline = std::time::Instant::now() + timeout;
            let mut remaining = self.remaining.lock();
            while *remaining > 0 {
                if self.cond.wait_until(&mut remaining, deadline).timed_out() {
                    return *remaining == 0;
                }
            }
            true
        }
    }
}
