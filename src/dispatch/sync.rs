//! Inline dispatcher running tasks on the caller's thread.
//!
//! Submission order is execution order, with one twist: a task submitted
//! from *inside* another task (reentrant emission, e.g. a cyclic
//! broadcaster graph on a synchronous boundary) is not run recursively.
//! It is appended to a thread-local trampoline queue and drained after the
//! outermost frame unwinds, keeping stack depth flat and per-thread order
//! intact.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    time::Duration,
};

use super::{Dispatcher, Task};
use crate::error::FlowError;

thread_local! {
    static DRAINING: Cell<bool> = const { Cell::new(false) };
    static TRAMPOLINE: RefCell<VecDeque<Task>> = const { RefCell::new(VecDeque::new()) };
}

/// Synchronous variant: runs every task inline on the submitting thread.
pub struct CallerDispatcher {
    name: String,
}

impl CallerDispatcher {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for CallerDispatcher {
    fn default() -> Self {
        Self::new("caller")
    }
}

/// Clears the draining flag even if a task panics through the trampoline,
/// so the thread is not left permanently "emitting".
struct DrainGuard;

impl Drop for DrainGuard {
    fn drop(&mut self) {
        TRAMPOLINE.with_borrow_mut(|queue| queue.clear());
        DRAINING.set(false);
    }
}

impl Dispatcher for CallerDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, task: Task) -> Result<(), FlowError> {
        if DRAINING.get() {
            // Nested emission: defer to the outermost frame
            TRAMPOLINE.with_borrow_mut(|queue| queue.push_back(task));
            return Ok(());
        }

        DRAINING.set(true);
        let guard = DrainGuard;
        task();
        // Tasks queued by `task` (and by their successors) run here, in
        // submission order
        loop {
            let next = TRAMPOLINE.with_borrow_mut(|queue| queue.pop_front());
            match next {
                Some(task) => task(),
                None => break,
            }
        }
        drop(guard);
        Ok(())
    }

    /// The caller thread is always "in context".
    fn in_context(&self) -> bool {
        true
    }

    /// Nothing to drain: every task ran before its submission returned.
    fn shutdown(&self, _timeout: Duration) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    /// Tasks run inline, before `dispatch` returns
    #[test]
    fn test_inline_execution() {
        let dispatcher = CallerDispatcher::default();
        let ran = Arc::new(AtomicUsize::new(0));
        let sink = ran.clone();
        dispatcher
            .dispatch(Box::new(move || {
                sink.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    /// Reentrant submissions are trampolined: the nested task runs after the
    /// outer one finishes, not inside it
    #[test]
    fn test_trampoline_flattens_recursion() {
        let dispatcher = Arc::new(CallerDispatcher::default());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let inner_order = order.clone();
        let reentrant = dispatcher.clone();
        let outer_order = order.clone();
        dispatcher
            .dispatch(Box::new(move || {
                outer_order.lock().push("outer-start");
                reentrant
                    .dispatch(Box::new(move || {
                        inner_order.lock().push("inner");
                    }))
                    .unwrap();
                outer_order.lock().push("outer-end");
            }))
            .unwrap();

        assert_eq!(*order.lock(), vec!["outer-start", "outer-end", "inner"]);
    }

    /// Deeply nested submissions stay iterative instead of growing the stack
    #[test]
    fn test_trampoline_depth() {
        const DEPTH: usize = 10_000;
        let dispatcher = Arc::new(CallerDispatcher::default());
        let count = Arc::new(AtomicUsize::new(0));

        fn submit(
            dispatcher: Arc<CallerDispatcher>,
            count: Arc<AtomicUsize>,
            remaining: usize,
        ) {
            if remaining == 0 {
                return;
            }
            let d = dispatcher.clone();
            let c = count.clone();
            dispatcher
                .dispatch(Box::new(move || {
                    c.fetch_add(1, Ordering::Relaxed);
                    submit(d.clone(), c.clone(), remaining - 1);
                }))
                .unwrap();
        }

        submit(dispatcher, count.clone(), DEPTH);
        assert_eq!(count.load(Ordering::Relaxed), DEPTH);
    }
}
