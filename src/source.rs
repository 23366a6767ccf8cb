//! Cold sources: per-subscribe producers driven entirely by demand.
//!
//! Each subscriber gets its own iterator instance; nothing is emitted until
//! credit arrives. Emission happens inside a flag-guarded drain loop:
//!
//! - a `request` issued from *within* `on_next` (the common synchronous
//!   consume pattern) finds the flag set, tops up the credit and returns;
//!   the outer drain frame picks the new credit up, so the stack stays flat
//! - a `request` from another thread either joins the same way or becomes
//!   the new drain frame when the current one has just released the flag
//!
//! The loop re-checks credit after releasing the flag, closing the window
//! where a concurrent grant would otherwise be stranded.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;

use crate::{
    demand::Demand,
    error::FlowError,
    signal::{
        Gate, Lifecycle, Publisher, Subscriber, Subscription, Upstream, checked_request,
        drop_late_terminal,
    },
};

type IterFactory<T> = Arc<dyn Fn() -> Box<dyn Iterator<Item = T> + Send> + Send + Sync>;

/// Finite cold publisher built from an iterator factory.
pub struct ColdSource<T> {
    make: IterFactory<T>,
}

impl<T: Send + 'static> ColdSource<T> {
    pub fn new(
        make: impl Fn() -> Box<dyn Iterator<Item = T> + Send> + Send + Sync + 'static,
    ) -> Self {
        Self {
            make: Arc::new(make),
        }
    }
}

impl<T: Send + 'static> Publisher<T> for ColdSource<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let driver = Arc::new(SourceDriver {
            iter: Mutex::new((self.make)()),
            demand: Demand::new(),
            gate: Gate::new(),
            draining: AtomicBool::new(false),
            downstream: subscriber.clone(),
        });
        driver.gate.mark_subscribed();
        subscriber.on_subscribe(Subscription::new(driver));
    }
}

struct SourceDriver<T> {
    iter: Mutex<Box<dyn Iterator<Item = T> + Send>>,
    demand: Demand,
    gate: Gate,
    draining: AtomicBool,
    downstream: Arc<dyn Subscriber<T>>,
}

impl<T: Send + 'static> SourceDriver<T> {
    fn drain(&self) {
        // Acquire pairs with the Release below: the winner sees all state
        // the previous drain frame published
        if self.draining.swap(true, Ordering::Acquire) {
            return;
        }
        loop {
            while !self.gate.is_terminal() && self.demand.try_take(1) {
                // The lock covers only the pull; `on_next` runs without it
                let next = self.iter.lock().next();
                match next {
                    Some(value) => {
                        if self.gate.accepts_next() {
                            self.downstream.on_next(value);
                        }
                    }
                    None => {
                        if self.gate.try_terminate(Lifecycle::Completed) {
                            self.downstream.on_complete();
                        }
                        break;
                    }
                }
            }
            self.draining.store(false, Ordering::Release);
            // Credit may have arrived between the last take and the release
            if self.gate.is_terminal() || self.demand.get() == 0 {
                break;
            }
            if self.draining.swap(true, Ordering::Acquire) {
                // Another frame took over
                break;
            }
        }
    }
}

impl<T: Send + 'static> Upstream for SourceDriver<T> {
    fn request(&self, n: u64) {
        match checked_request(n) {
            Ok(n) => {
                self.demand.add(n);
                self.drain();
            }
            Err(error) => {
                if self.gate.try_terminate(Lifecycle::Errored) {
                    self.downstream.on_error(error);
                } else {
                    drop_late_terminal(Some(&error));
                }
            }
        }
    }

    fn cancel(&self) {
        self.gate.try_terminate(Lifecycle::Cancelled);
        self.demand.clear();
    }
}

/// Publisher that fails every subscriber immediately.
pub struct FailedSource {
    error: FlowError,
}

impl FailedSource {
    pub fn new(error: FlowError) -> Self {
        Self { error }
    }
}

struct NoopUpstream;

impl Upstream for NoopUpstream {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {}
}

impl<T: Send + 'static> Publisher<T> for FailedSource {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        subscriber.on_subscribe(Subscription::new(Arc::new(NoopUpstream)));
        subscriber.on_error(self.error.clone());
    }
}
