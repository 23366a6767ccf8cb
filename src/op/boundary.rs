//! Boundary operator: shifts downstream signal delivery onto a dispatcher.
//!
//! Each upstream signal enqueues a delivery task; `request(n)` flows
//! upstream directly, never through the dispatcher — a saturated queue must
//! not be able to stall the demand path.
//!
//! Terminals are delivered after every prior `Next` on the edge, even when
//! the dispatcher itself gives no ordering guarantee: the boundary counts
//! in-flight deliveries, and the terminal task re-enqueues itself until the
//! count reaches zero.
//!
//! Each enqueued `Next` is already accounted against downstream demand by
//! the upstream's own bookkeeping; the boundary adds no credit of its own.
//! Dispatcher saturation is a transport failure: the edge fails with
//! `Error(Overflow)` and the upstream is cancelled.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use crate::{
    dispatch::Dispatcher,
    error::FlowError,
    op::EdgeCore,
    signal::{Lifecycle, Publisher, Subscriber, Subscription, drop_late_terminal},
};

/// Inserts an execution boundary in front of its downstream.
pub struct BoundaryFlow<T> {
    source: Arc<dyn Publisher<T>>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl<T: Send + Sync + 'static> BoundaryFlow<T> {
    pub fn new(source: Arc<dyn Publisher<T>>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { source, dispatcher }
    }
}

impl<T: Send + Sync + 'static> Publisher<T> for BoundaryFlow<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.source.subscribe(Arc::new(BoundarySubscriber {
            downstream: subscriber,
            dispatcher: self.dispatcher.clone(),
            core: EdgeCore::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }));
    }
}

struct BoundarySubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    dispatcher: Arc<dyn Dispatcher>,
    core: EdgeCore,
    /// `Next` deliveries enqueued but not yet run.
    in_flight: Arc<AtomicUsize>,
}

/// State of a terminal waiting for in-flight `Next` deliveries to land.
struct TerminalTask<T> {
    downstream: Arc<dyn Subscriber<T>>,
    dispatcher: Arc<dyn Dispatcher>,
    in_flight: Arc<AtomicUsize>,
    /// `None` = completion.
    error: Option<FlowError>,
}

impl<T: Send + Sync + 'static> TerminalTask<T> {
    fn deliver(&self) {
        match &self.error {
            Some(error) => self.downstream.on_error(error.clone()),
            None => self.downstream.on_complete(),
        }
    }

    /// Enqueues the terminal; the task re-enqueues itself while `Next`
    /// tasks are still running on other workers.
    fn schedule(self: Arc<Self>) {
        let task = self.clone();
        let enqueued = self.dispatcher.dispatch(Box::new(move || {
            // Acquire pairs with the fetch_sub at each delivery's end
            if task.in_flight.load(Ordering::Acquire) == 0 {
                task.deliver();
            } else {
                task.schedule();
            }
        }));
        if enqueued.is_err() {
            // Terminal already claimed by the caller; deliver inline rather
            // than lose it to the saturated queue
            self.deliver();
        }
    }
}

impl<T: Send + Sync + 'static> BoundarySubscriber<T> {
    /// Saturation path: settle the edge inline (the queue that just
    /// rejected a task cannot be asked to deliver the error).
    fn overflow(&self, error: FlowError) {
        if self.core.gate.try_terminate(Lifecycle::Errored) {
            self.core.cancel_upstream();
            self.downstream.on_error(error);
        } else {
            drop_late_terminal(Some(&error));
        }
    }

    fn terminal(&self, error: Option<FlowError>) {
        Arc::new(TerminalTask {
            downstream: self.downstream.clone(),
            dispatcher: self.dispatcher.clone(),
            in_flight: self.in_flight.clone(),
            error,
        })
        .schedule();
    }
}

impl<T: Send + Sync + 'static> Subscriber<T> for BoundarySubscriber<T> {
    fn on_subscribe(&self, subscription: Subscription) {
        if self.core.bind(&subscription) {
            // Demand bypasses the dispatcher: pass the upstream handle
            // through untouched
            self.downstream.on_subscribe(subscription);
        }
    }

    fn on_next(&self, value: T) {
        if !self.core.gate.accepts_next() {
            return;
        }
        let downstream = self.downstream.clone();
        let in_flight = self.in_flight.clone();
        in_flight.fetch_add(1, Ordering::AcqRel);
        let outcome = self.dispatcher.dispatch(Box::new(move || {
            downstream.on_next(value);
            in_flight.fetch_sub(1, Ordering::AcqRel);
        }));
        if let Err(error) = outcome {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            self.overflow(error);
        }
    }

    fn on_error(&self, error: FlowError) {
        if self.core.gate.try_terminate(Lifecycle::Errored) {
            self.terminal(Some(error));
        } else {
            drop_late_terminal(Some(&error));
        }
    }

    fn on_complete(&self) {
        if self.core.gate.try_terminate(Lifecycle::Completed) {
            self.terminal(None);
        } else {
            drop_late_terminal(None);
        }
    }
}
