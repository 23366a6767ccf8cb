//! Fluent graph construction façade.
//!
//! A [`Flow`] wraps a publisher and exposes the operator family as chainable
//! methods. The builder itself is thin: every method wires up one operator
//! node and returns the new stage. Graphs start emitting per-subscriber
//! (cold sources) or on push (broadcasters); nothing flows until a terminal
//! subscriber expresses demand.
//!
//! ```text
//! Flow::just(["1", "2", "3"])        // cold source
//!     .map(|s| s.parse().unwrap_or(0))
//!     .filter(|n| n % 2 == 1)
//!     .scan(0, |acc, n| acc + n)
//!     .consume(|total| println!("{total}"));
//! ```

use std::{
    hash::{Hash, Hasher},
    sync::Arc,
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::{
    broadcast::Broadcaster,
    demand::UNBOUNDED,
    dispatch::Dispatcher,
    error::{ErrorKind, FlowError, catch_user},
    op::{
        accumulate::{ReduceFlow, ScanFlow},
        batch::BufferFlow,
        boundary::BoundaryFlow,
        merge::{FlatMapFlow, MergeFlow},
        moving::MovingWindowFlow,
        partition::PartitionFlow,
        timing::{SampleFlow, TimeoutFlow},
        transform::{FilterFlow, MapFlow, ObserveFlow, RescueFlow},
        window::WindowFlow,
    },
    op::EdgeCore,
    signal::{Lifecycle, Publisher, Subscriber, Subscription},
    source::ColdSource,
    timer::TimerService,
};

/// A composable stage of a dataflow graph.
pub struct Flow<T> {
    inner: Arc<dyn Publisher<T>>,
}

impl<T> Clone for Flow<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Flow<T> {
    pub fn from_publisher(inner: Arc<dyn Publisher<T>>) -> Self {
        Self { inner }
    }

    pub fn publisher(&self) -> Arc<dyn Publisher<T>> {
        self.inner.clone()
    }

    /// Finite cold source of the given values followed by `Complete`.
    pub fn just(values: impl IntoIterator<Item = T>) -> Self
    where
        T: Clone,
    {
        let values: Vec<T> = values.into_iter().collect();
        Self::from_publisher(Arc::new(ColdSource::new(move || {
            Box::new(values.clone().into_iter())
        })))
    }

    /// Iterable cold source; the iterable is cloned per subscriber.
    pub fn from_iter<I>(iterable: I) -> Self
    where
        I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
        I::IntoIter: Send,
    {
        Self::from_publisher(Arc::new(ColdSource::new(move || {
            Box::new(iterable.clone().into_iter())
        })))
    }

    /// Mutable hot source plus the flow reading from it.
    pub fn broadcast() -> (Broadcaster<T>, Self)
    where
        T: Clone,
    {
        let broadcaster = Broadcaster::new();
        let flow = Self::from_publisher(Arc::new(broadcaster.clone()));
        (broadcaster, flow)
    }

    /// Source that fails every subscriber with `error` immediately.
    pub fn fail(error: FlowError) -> Self {
        Self::from_publisher(Arc::new(crate::source::FailedSource::new(error)))
    }

    // -- stateless transforms ------------------------------------------------

    pub fn map<O: Send + Sync + 'static>(
        &self,
        f: impl Fn(T) -> O + Send + Sync + 'static,
    ) -> Flow<O> {
        Flow::from_publisher(Arc::new(MapFlow::new(self.inner.clone(), f)))
    }

    pub fn filter(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Flow<T> {
        Flow::from_publisher(Arc::new(FilterFlow::new(self.inner.clone(), predicate)))
    }

    pub fn observe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Flow<T> {
        Flow::from_publisher(Arc::new(ObserveFlow::new(self.inner.clone(), callback)))
    }

    /// Swallows any non-fatal error and completes instead.
    pub fn ignore_errors(&self) -> Flow<T> {
        Flow::from_publisher(Arc::new(RescueFlow::ignore(self.inner.clone())))
    }

    /// Handles errors of `kind` with `handler`, completing the stream.
    pub fn when(
        &self,
        kind: ErrorKind,
        handler: impl Fn(FlowError) + Send + Sync + 'static,
    ) -> Flow<T> {
        Flow::from_publisher(Arc::new(RescueFlow::when(self.inner.clone(), kind, handler)))
    }

    // -- stateful transforms -------------------------------------------------

    pub fn scan<O: Clone + Send + Sync + 'static>(
        &self,
        seed: O,
        f: impl Fn(O, T) -> O + Send + Sync + 'static,
    ) -> Flow<O> {
        Flow::from_publisher(Arc::new(ScanFlow::new(self.inner.clone(), seed, f)))
    }

    /// Like [`scan`](Self::scan), additionally emitting the seed first.
    pub fn scan_emitting_seed<O: Clone + Send + Sync + 'static>(
        &self,
        seed: O,
        f: impl Fn(O, T) -> O + Send + Sync + 'static,
    ) -> Flow<O> {
        Flow::from_publisher(Arc::new(
            ScanFlow::new(self.inner.clone(), seed, f).emitting_seed(),
        ))
    }

    pub fn reduce<O: Clone + Send + Sync + 'static>(
        &self,
        seed: O,
        f: impl Fn(O, T) -> O + Send + Sync + 'static,
    ) -> Flow<O> {
        Flow::from_publisher(Arc::new(ReduceFlow::seeded(self.inner.clone(), seed, f)))
    }

    /// Seedless fold; an empty input completes without emitting.
    pub fn reduce_with(&self, f: impl Fn(T, T) -> T + Send + Sync + 'static) -> Flow<T>
    where
        T: Clone,
    {
        Flow::from_publisher(Arc::new(ReduceFlow::unseeded(self.inner.clone(), f)))
    }

    // -- aggregators ---------------------------------------------------------

    pub fn buffer(&self, size: usize) -> Flow<Vec<T>> {
        Flow::from_publisher(Arc::new(BufferFlow::new(self.inner.clone(), size)))
    }

    /// Buffer with a timer flush `timeout` after each buffer's first
    /// element.
    pub fn buffer_timeout(
        &self,
        size: usize,
        timeout: Duration,
        timer: &Arc<TimerService>,
    ) -> Flow<Vec<T>> {
        Flow::from_publisher(Arc::new(
            BufferFlow::new(self.inner.clone(), size).with_timeout(timeout, timer.clone()),
        ))
    }

    pub fn window(&self, size: usize) -> Flow<Flow<T>> {
        Flow::from_publisher(Arc::new(WindowFlow::new(self.inner.clone(), size)))
    }

    pub fn moving_window(
        &self,
        period: Duration,
        delay: Duration,
        backlog: usize,
        timer: &Arc<TimerService>,
    ) -> Flow<Vec<T>>
    where
        T: Clone,
    {
        Flow::from_publisher(Arc::new(MovingWindowFlow::new(
            self.inner.clone(),
            period,
            delay,
            backlog,
            timer.clone(),
        )))
    }

    // -- fan-in --------------------------------------------------------------

    /// Interleaves several flows; completes when all complete.
    pub fn merge(flows: impl IntoIterator<Item = Flow<T>>) -> Flow<T> {
        let sources = flows.into_iter().map(|flow| flow.inner).collect();
        Flow::from_publisher(Arc::new(MergeFlow::new(sources)))
    }

    pub fn merge_with(&self, other: Flow<T>) -> Flow<T> {
        Flow::merge([self.clone(), other])
    }

    pub fn flat_map<O: Send + Sync + 'static>(
        &self,
        f: impl Fn(T) -> Flow<O> + Send + Sync + 'static,
    ) -> Flow<O> {
        Flow::from_publisher(Arc::new(FlatMapFlow::new(self.inner.clone(), move |v| {
            f(v).inner
        })))
    }

    // -- fan-out -------------------------------------------------------------

    /// Round-robin fan-out into `lanes` sub-streams.
    pub fn partition(&self, lanes: usize) -> Flow<Flow<T>> {
        Flow::from_publisher(Arc::new(PartitionFlow::new(self.inner.clone(), lanes)))
    }

    /// Keyed fan-out: equal keys route to the same lane.
    pub fn partition_by<K: Hash>(
        &self,
        lanes: usize,
        key: impl Fn(&T) -> K + Send + Sync + 'static,
    ) -> Flow<Flow<T>> {
        Flow::from_publisher(Arc::new(PartitionFlow::keyed(
            self.inner.clone(),
            lanes,
            move |value| {
                let mut hasher = std::hash::DefaultHasher::new();
                key(value).hash(&mut hasher);
                hasher.finish()
            },
        )))
    }

    // -- timing --------------------------------------------------------------

    /// First element of each period window.
    pub fn sample_first(&self, period: Duration, timer: &Arc<TimerService>) -> Flow<T> {
        Flow::from_publisher(Arc::new(SampleFlow::first(
            self.inner.clone(),
            period,
            timer.clone(),
        )))
    }

    /// Last element of each period window, emitted at the boundary.
    pub fn sample(&self, period: Duration, timer: &Arc<TimerService>) -> Flow<T> {
        Flow::from_publisher(Arc::new(SampleFlow::last(
            self.inner.clone(),
            period,
            timer.clone(),
        )))
    }

    /// Fails with `Error(Timeout)` when the stream goes quiet for
    /// `duration`.
    pub fn timeout(&self, duration: Duration, timer: &Arc<TimerService>) -> Flow<T> {
        Flow::from_publisher(Arc::new(TimeoutFlow::new(
            self.inner.clone(),
            duration,
            timer.clone(),
        )))
    }

    // -- boundary & consumption ----------------------------------------------

    /// Shifts downstream signal delivery onto `dispatcher`.
    pub fn dispatch_on(&self, dispatcher: &Arc<dyn Dispatcher>) -> Flow<T> {
        Flow::from_publisher(Arc::new(BoundaryFlow::new(
            self.inner.clone(),
            dispatcher.clone(),
        )))
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.inner.subscribe(subscriber);
    }

    /// Terminal subscriber with unbounded demand; errors go to the log sink.
    pub fn consume(&self, next: impl Fn(T) + Send + Sync + 'static) {
        self.subscribe(Arc::new(ConsumeSubscriber {
            next: Box::new(next),
            error: None,
            complete: None,
            core: EdgeCore::new(),
        }));
    }

    /// Terminal subscriber with explicit error and completion callbacks.
    pub fn consume_each(
        &self,
        next: impl Fn(T) + Send + Sync + 'static,
        error: impl Fn(FlowError) + Send + Sync + 'static,
        complete: impl Fn() + Send + Sync + 'static,
    ) {
        self.subscribe(Arc::new(ConsumeSubscriber {
            next: Box::new(next),
            error: Some(Box::new(error)),
            complete: Some(Box::new(complete)),
            core: EdgeCore::new(),
        }));
    }
}

impl Flow<i64> {
    /// Integer cold source: `start, start+1, …` for `count` elements.
    pub fn range(start: i64, count: u64) -> Flow<i64> {
        Flow::from_publisher(Arc::new(ColdSource::new(move || {
            Box::new((0..count).map(move |offset| start + offset as i64))
        })))
    }
}

struct ConsumeSubscriber<T> {
    next: Box<dyn Fn(T) + Send + Sync>,
    error: Option<Box<dyn Fn(FlowError) + Send + Sync>>,
    complete: Option<Box<dyn Fn() + Send + Sync>>,
    core: EdgeCore,
}

impl<T: Send + 'static> Subscriber<T> for ConsumeSubscriber<T> {
    fn on_subscribe(&self, subscription: Subscription) {
        if self.core.bind(&subscription) {
            subscription.request(UNBOUNDED);
        }
    }

    fn on_next(&self, value: T) {
        if !self.core.gate.accepts_next() {
            return;
        }
        if let Err(error) = catch_user(|| (self.next)(value)) {
            // The callback is the end of the line; nothing downstream to
            // fail, so cancel and report
            self.core.gate.try_terminate(Lifecycle::Errored);
            self.core.cancel_upstream();
            tracing::warn!(%error, "consumer callback failed, cancelling");
        }
    }

    fn on_error(&self, error: FlowError) {
        if !self.core.gate.try_terminate(Lifecycle::Errored) {
            return;
        }
        match &self.error {
            Some(callback) => {
                if let Err(handler_error) = catch_user(|| callback(error)) {
                    tracing::warn!(error = %handler_error, "error callback failed");
                }
            }
            None => tracing::warn!(%error, "unhandled stream error at consumer"),
        }
    }

    fn on_complete(&self) {
        if !self.core.gate.try_terminate(Lifecycle::Completed) {
            return;
        }
        if let Some(callback) = &self.complete
            && let Err(error) = catch_user(callback)
        {
            tracing::warn!(%error, "completion callback failed");
        }
    }
}

/// Blocking terminal subscriber for tests: gathers values and awaits the
/// terminal on a condvar.
pub struct Collector<T> {
    state: Mutex<CollectorState<T>>,
    cond: Condvar,
    initial_demand: u64,
}

struct CollectorState<T> {
    values: Vec<T>,
    /// `Some(None)` = completed, `Some(Some(e))` = errored.
    terminal: Option<Option<FlowError>>,
    subscription: Option<Subscription>,
}

impl<T: Send + 'static> Collector<T> {
    /// Requests unbounded demand at subscription.
    pub fn unbounded() -> Arc<Self> {
        Self::with_demand(UNBOUNDED)
    }

    /// Requests exactly `demand` at subscription (0 requests nothing).
    pub fn with_demand(demand: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CollectorState {
                values: Vec::new(),
                terminal: None,
                subscription: None,
            }),
            cond: Condvar::new(),
            initial_demand: demand,
        })
    }

    pub fn request(&self, n: u64) {
        let subscription = self.state.lock().subscription.clone();
        if let Some(subscription) = subscription {
            subscription.request(n);
        }
    }

    pub fn cancel(&self) {
        let subscription = self.state.lock().subscription.clone();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    pub fn values(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.state.lock().values.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminal.is_some()
    }

    pub fn error(&self) -> Option<FlowError> {
        self.state.lock().terminal.clone().flatten()
    }

    /// Waits for a terminal. `None` means the timeout elapsed first.
    pub fn await_terminal(&self, timeout: Duration) -> Option<Option<FlowError>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.terminal.is_none() {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return state.terminal.clone();
            }
        }
        state.terminal.clone()
    }

    /// Test assertion helper: waits for completion and returns the values.
    ///
    /// # Panics
    /// When the stream errors or the timeout elapses.
    pub fn await_complete(&self, timeout: Duration) -> Vec<T>
    where
        T: Clone,
    {
        match self.await_terminal(timeout) {
            Some(None) => self.values(),
            Some(Some(error)) => panic!("stream failed: {error}"),
            None => panic!("stream did not terminate within {timeout:?}"),
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for Collector<T> {
    fn on_subscribe(&self, subscription: Subscription) {
        self.state.lock().subscription = Some(subscription.clone());
        if self.initial_demand > 0 {
            subscription.request(self.initial_demand);
        }
    }

    fn on_next(&self, value: T) {
        let mut state = self.state.lock();
        if state.terminal.is_some() {
            return;
        }
        state.values.push(value);
        self.cond.notify_all();
    }

    fn on_error(&self, error: FlowError) {
        let mut state = self.state.lock();
        if state.terminal.is_none() {
            state.terminal = Some(Some(error));
            self.cond.notify_all();
        }
    }

    fn on_complete(&self) {
        let mut state = self.state.lock();
        if state.terminal.is_none() {
            state.terminal = Some(None);
            self.cond.notify_all();
        }
    }
}
