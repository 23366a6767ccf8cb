//! Fan-in operators: merge and flat_map.
//!
//! Both interleave several upstream edges into one downstream edge through
//! a shared core: a single downstream credit counter, a pending queue for
//! emissions that arrive without credit (drained on later requests), and an
//! active-edge count that gates the completion.
//!
//! The first error wins: it cancels every other input and propagates once.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    demand::{Demand, UNBOUNDED},
    error::{FlowError, catch_user},
    op::EdgeCore,
    signal::{
        Gate, Lifecycle, Publisher, Subscriber, Subscription, Upstream, checked_request,
        drop_late_terminal,
    },
};

struct Queue<T> {
    items: std::collections::VecDeque<T>,
    draining: bool,
}

/// Shared fan-in state: one downstream edge fed by several upstreams.
struct MergeCore<T> {
    downstream: Arc<dyn Subscriber<T>>,
    gate: Gate,
    demand: Demand,
    queue: Mutex<Queue<T>>,
    /// Edges (inners, plus the outer for flat_map) still expected to
    /// complete.
    active: AtomicUsize,
    done: AtomicBool,
    /// Upstream subscriptions, for request forwarding and cancellation.
    upstreams: Mutex<Vec<Subscription>>,
}

impl<T: Send + 'static> MergeCore<T> {
    fn new(downstream: Arc<dyn Subscriber<T>>, active: usize) -> Arc<Self> {
        Arc::new(Self {
            downstream,
            gate: Gate::new(),
            demand: Demand::new(),
            queue: Mutex::new(Queue {
                items: std::collections::VecDeque::new(),
                draining: false,
            }),
            active: AtomicUsize::new(active),
            done: AtomicBool::new(active == 0),
            upstreams: Mutex::new(Vec::new()),
        })
    }

    /// Interleaves one value: straight through when there is credit and no
    /// backlog, queued otherwise (arrival order is preserved either way).
    fn emit(&self, value: T) {
        if self.gate.is_terminal() {
            return;
        }
        self.queue.lock().items.push_back(value);
        self.drain();
    }

    fn drain(&self) {
        let mut queue = self.queue.lock();
        if queue.draining {
            return;
        }
        queue.draining = true;
        loop {
            if self.gate.is_terminal() {
                queue.items.clear();
                break;
            }
            if !queue.items.is_empty() && self.demand.try_take(1) {
                if let Some(value) = queue.items.pop_front() {
                    drop(queue);
                    if self.gate.accepts_next() {
                        self.downstream.on_next(value);
                    }
                    queue = self.queue.lock();
                }
                continue;
            }
            if queue.items.is_empty()
                && self.done.load(Ordering::Acquire)
                && self.gate.try_terminate(Lifecycle::Completed)
            {
                drop(queue);
                self.downstream.on_complete();
                queue = self.queue.lock();
            }
            break;
        }
        queue.draining = false;
    }

    /// First error cancels the remaining inputs and settles the edge.
    fn fail(&self, error: FlowError) {
        if self.gate.try_terminate(Lifecycle::Errored) {
            self.cancel_upstreams();
            self.queue.lock().items.clear();
            self.downstream.on_error(error);
        } else {
            drop_late_terminal(Some(&error));
        }
    }

    fn edge_completed(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.store(true, Ordering::Release);
            self.drain();
        }
    }

    fn edge_added(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    fn attach(&self, subscription: &Subscription) {
        self.upstreams.lock().push(subscription.clone());
        // Late-arriving inputs inherit the credit already granted
        let outstanding = self.demand.get();
        if outstanding > 0 {
            subscription.request(outstanding);
        }
    }

    fn cancel_upstreams(&self) {
        // Drained outside the lock: cancellation may reach back into this
        // core from the same thread
        let upstreams: Vec<Subscription> = {
            let mut upstreams = self.upstreams.lock();
            upstreams.drain(..).collect()
        };
        for subscription in upstreams {
            subscription.cancel();
        }
    }
}

/// Downstream-facing subscription of a fan-in edge.
struct MergeUpstream<T> {
    core: Arc<MergeCore<T>>,
}

impl<T: Send + 'static> Upstream for MergeUpstream<T> {
    fn request(&self, n: u64) {
        match checked_request(n) {
            Ok(n) => {
                self.core.demand.add(n);
                // Every input gets the full credit; the shared counter keeps
                // the downstream edge bounded and the queue absorbs the rest.
                // Snapshot first: forwarding can synchronously re-enter this
                // request path (e.g. through a downstream filter)
                let upstreams: Vec<Subscription> = self.core.upstreams.lock().clone();
                for subscription in upstreams {
                    subscription.request(n);
                }
                self.core.drain();
            }
            Err(error) => self.core.fail(error),
        }
    }

    fn cancel(&self) {
        if self.core.gate.try_terminate(Lifecycle::Cancelled) {
            self.core.cancel_upstreams();
            self.core.queue.lock().items.clear();
            self.core.demand.clear();
        }
    }
}

/// One input edge of a fan-in.
struct InnerSubscriber<T> {
    core: Arc<MergeCore<T>>,
    bound: AtomicBool,
}

impl<T: Send + 'static> InnerSubscriber<T> {
    fn new(core: Arc<MergeCore<T>>) -> Arc<Self> {
        Arc::new(Self {
            core,
            bound: AtomicBool::new(false),
        })
    }
}

impl<T: Send + 'static> Subscriber<T> for InnerSubscriber<T> {
    fn on_subscribe(&self, subscription: Subscription) {
        if self.bound.swap(true, Ordering::AcqRel) {
            subscription.cancel();
            return;
        }
        self.core.attach(&subscription);
    }

    fn on_next(&self, value: T) {
        self.core.emit(value);
    }

    fn on_error(&self, error: FlowError) {
        self.core.fail(error);
    }

    fn on_complete(&self) {
        self.core.edge_completed();
    }
}

// ---------------------------------------------------------------------------
// merge
// ---------------------------------------------------------------------------

/// Subscribes to all inputs and interleaves their `Next` signals in arrival
/// order. Completes when every input has completed.
pub struct MergeFlow<T> {
    sources: Vec<Arc<dyn Publisher<T>>>,
}

impl<T: Send + 'static> MergeFlow<T> {
    pub fn new(sources: Vec<Arc<dyn Publisher<T>>>) -> Self {
        Self { sources }
    }
}

impl<T: Send + 'static> Publisher<T> for MergeFlow<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let core = MergeCore::new(subscriber.clone(), self.sources.len());
        subscriber.on_subscribe(Subscription::new(Arc::new(MergeUpstream {
            core: core.clone(),
        })));
        for source in &self.sources {
            source.subscribe(InnerSubscriber::new(core.clone()));
        }
        // Zero inputs complete immediately (once demand-independent)
        if self.sources.is_empty() {
            core.drain();
        }
    }
}

// ---------------------------------------------------------------------------
// flat_map
// ---------------------------------------------------------------------------

/// Maps each outer element to a publisher and merges all of them. The
/// completion requires the outer and every inner to complete.
pub struct FlatMapFlow<I, O> {
    source: Arc<dyn Publisher<I>>,
    f: Arc<dyn Fn(I) -> Arc<dyn Publisher<O>> + Send + Sync>,
}

impl<I: Send + 'static, O: Send + 'static> FlatMapFlow<I, O> {
    pub fn new(
        source: Arc<dyn Publisher<I>>,
        f: impl Fn(I) -> Arc<dyn Publisher<O>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            f: Arc::new(f),
        }
    }
}

impl<I: Send + 'static, O: Send + 'static> Publisher<O> for FlatMapFlow<I, O> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<O>>) {
        // The outer edge counts as one active edge
        let core = MergeCore::new(subscriber.clone(), 1);
        subscriber.on_subscribe(Subscription::new(Arc::new(MergeUpstream {
            core: core.clone(),
        })));
        self.source.subscribe(Arc::new(OuterSubscriber {
            core,
            f: self.f.clone(),
            edge: EdgeCore::new(),
        }));
    }
}

struct OuterSubscriber<I, O> {
    core: Arc<MergeCore<O>>,
    f: Arc<dyn Fn(I) -> Arc<dyn Publisher<O>> + Send + Sync>,
    edge: EdgeCore,
}

impl<I: Send + 'static, O: Send + 'static> Subscriber<I> for OuterSubscriber<I, O> {
    fn on_subscribe(&self, subscription: Subscription) {
        if !self.edge.bind(&subscription) {
            return;
        }
        // The outer pulls eagerly: element credit cannot be derived from
        // downstream credit, which counts merged inner emissions
        subscription.request(UNBOUNDED);
    }

    fn on_next(&self, value: I) {
        if self.core.gate.is_terminal() {
            return;
        }
        match catch_user(|| (self.f)(value)) {
            Ok(inner) => {
                self.core.edge_added();
                inner.subscribe(InnerSubscriber::new(self.core.clone()));
            }
            Err(error) => {
                self.edge.cancel_upstream();
                self.core.fail(error);
            }
        }
    }

    fn on_error(&self, error: FlowError) {
        self.core.fail(error);
    }

    fn on_complete(&self) {
        self.core.edge_completed();
    }
}
