//! Stateless transforms: map, filter, observe, ignore_errors, when.
//!
//! These operators pass the upstream subscription straight through, so
//! demand flows 1:1 — with one exception: `filter` re-requests a credit for
//! every element it discards, keeping downstream pacing intact.
//!
//! Every user closure runs behind the catch barrier; a panic becomes
//! `Error(User)` downstream and cancels the upstream.

use std::sync::Arc;

use crate::{
    error::{ErrorKind, FlowError, catch_user},
    op::EdgeCore,
    signal::{Lifecycle, Publisher, Subscriber, Subscription, drop_late_terminal},
};

macro_rules! forward_terminal {
    ($ty:ident $(< $($param:ident),+ >)?) => {
        impl$(<$($param: Send + 'static),+>)? $ty$(<$($param),+>)? {
            fn fail(&self, error: FlowError) {
                if self.core.gate.try_terminate(Lifecycle::Errored) {
                    self.core.cancel_upstream();
                    self.downstream.on_error(error);
                } else {
                    drop_late_terminal(Some(&error));
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// map
// ---------------------------------------------------------------------------

/// Applies a pure function to each `Next`.
pub struct MapFlow<I, O> {
    source: Arc<dyn Publisher<I>>,
    f: Arc<dyn Fn(I) -> O + Send + Sync>,
}

impl<I: Send + 'static, O: Send + 'static> MapFlow<I, O> {
    pub fn new(
        source: Arc<dyn Publisher<I>>,
        f: impl Fn(I) -> O + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            f: Arc::new(f),
        }
    }
}

impl<I: Send + 'static, O: Send + 'static> Publisher<O> for MapFlow<I, O> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<O>>) {
        self.source.subscribe(Arc::new(MapSubscriber {
            downstream: subscriber,
            f: self.f.clone(),
            core: EdgeCore::new(),
        }));
    }
}

struct MapSubscriber<I, O> {
    downstream: Arc<dyn Subscriber<O>>,
    f: Arc<dyn Fn(I) -> O + Send + Sync>,
    core: EdgeCore,
}

forward_terminal!(MapSubscriber<I, O>);

impl<I: Send + 'static, O: Send + 'static> Subscriber<I> for MapSubscriber<I, O> {
    fn on_subscribe(&self, subscription: Subscription) {
        if self.core.bind(&subscription) {
            self.downstream.on_subscribe(subscription);
        }
    }

    fn on_next(&self, value: I) {
        if !self.core.gate.accepts_next() {
            return;
        }
        match catch_user(|| (self.f)(value)) {
            Ok(mapped) => self.downstream.on_next(mapped),
            Err(error) => self.fail(error),
        }
    }

    fn on_error(&self, error: FlowError) {
        if self.core.gate.try_terminate(Lifecycle::Errored) {
            self.downstream.on_error(error);
        } else {
            drop_late_terminal(Some(&error));
        }
    }

    fn on_complete(&self) {
        if self.core.gate.try_terminate(Lifecycle::Completed) {
            self.downstream.on_complete();
        } else {
            drop_late_terminal(None);
        }
    }
}

// ---------------------------------------------------------------------------
// filter
// ---------------------------------------------------------------------------

/// Emits elements matching the predicate; a discarded element's credit is
/// replaced with an extra `request(1)` upstream.
pub struct FilterFlow<T> {
    source: Arc<dyn Publisher<T>>,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
}

impl<T: Send + 'static> FilterFlow<T> {
    pub fn new(
        source: Arc<dyn Publisher<T>>,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            predicate: Arc::new(predicate),
        }
    }
}

impl<T: Send + 'static> Publisher<T> for FilterFlow<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.source.subscribe(Arc::new(FilterSubscriber {
            downstream: subscriber,
            predicate: self.predicate.clone(),
            core: EdgeCore::new(),
        }));
    }
}

struct FilterSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    core: EdgeCore,
}

forward_terminal!(FilterSubscriber<T>);

impl<T: Send + 'static> Subscriber<T> for FilterSubscriber<T> {
    fn on_subscribe(&self, subscription: Subscription) {
        if self.core.bind(&subscription) {
            self.downstream.on_subscribe(subscription);
        }
    }

    fn on_next(&self, value: T) {
        if !self.core.gate.accepts_next() {
            return;
        }
        match catch_user(|| (self.predicate)(&value)) {
            Ok(true) => self.downstream.on_next(value),
            Ok(false) => self.core.replace_credit(),
            Err(error) => self.fail(error),
        }
    }

    fn on_error(&self, error: FlowError) {
        if self.core.gate.try_terminate(Lifecycle::Errored) {
            self.downstream.on_error(error);
        } else {
            drop_late_terminal(Some(&error));
        }
    }

    fn on_complete(&self) {
        if self.core.gate.try_terminate(Lifecycle::Completed) {
            self.downstream.on_complete();
        } else {
            drop_late_terminal(None);
        }
    }
}

// ---------------------------------------------------------------------------
// observe
// ---------------------------------------------------------------------------

/// Side-effect callback with element pass-through.
pub struct ObserveFlow<T> {
    source: Arc<dyn Publisher<T>>,
    callback: Arc<dyn Fn(&T) + Send + Sync>,
}

impl<T: Send + 'static> ObserveFlow<T> {
    pub fn new(
        source: Arc<dyn Publisher<T>>,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            callback: Arc::new(callback),
        }
    }
}

impl<T: Send + 'static> Publisher<T> for ObserveFlow<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.source.subscribe(Arc::new(ObserveSubscriber {
            downstream: subscriber,
            callback: self.callback.clone(),
            core: EdgeCore::new(),
        }));
    }
}

struct ObserveSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    callback: Arc<dyn Fn(&T) + Send + Sync>,
    core: EdgeCore,
}

forward_terminal!(ObserveSubscriber<T>);

impl<T: Send + 'static> Subscriber<T> for ObserveSubscriber<T> {
    fn on_subscribe(&self, subscription: Subscription) {
        if self.core.bind(&subscription) {
            self.downstream.on_subscribe(subscription);
        }
    }

    fn on_next(&self, value: T) {
        if !self.core.gate.accepts_next() {
            return;
        }
        match catch_user(|| (self.callback)(&value)) {
            Ok(()) => self.downstream.on_next(value),
            Err(error) => self.fail(error),
        }
    }

    fn on_error(&self, error: FlowError) {
        if self.core.gate.try_terminate(Lifecycle::Errored) {
            self.downstream.on_error(error);
        } else {
            drop_late_terminal(Some(&error));
        }
    }

    fn on_complete(&self) {
        if self.core.gate.try_terminate(Lifecycle::Completed) {
            self.downstream.on_complete();
        } else {
            drop_late_terminal(None);
        }
    }
}

// ---------------------------------------------------------------------------
// ignore_errors / when
// ---------------------------------------------------------------------------

/// Error handling mode of [`RescueFlow`].
enum Rescue {
    /// Swallow every non-fatal error and complete.
    All,
    /// Swallow errors of one kind, after running the handler.
    Kind {
        kind: ErrorKind,
        handler: Arc<dyn Fn(FlowError) + Send + Sync>,
    },
}

/// Converts matching upstream errors into completions.
pub struct RescueFlow<T> {
    source: Arc<dyn Publisher<T>>,
    rescue: Arc<Rescue>,
}

impl<T: Send + 'static> RescueFlow<T> {
    /// `ignore_errors`: swallow the error, cancel upstream, complete.
    pub fn ignore(source: Arc<dyn Publisher<T>>) -> Self {
        Self {
            source,
            rescue: Arc::new(Rescue::All),
        }
    }

    /// `when`: handle errors of `kind`, complete instead of propagating.
    pub fn when(
        source: Arc<dyn Publisher<T>>,
        kind: ErrorKind,
        handler: impl Fn(FlowError) + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            rescue: Arc::new(Rescue::Kind {
                kind,
                handler: Arc::new(handler),
            }),
        }
    }
}

impl<T: Send + 'static> Publisher<T> for RescueFlow<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.source.subscribe(Arc::new(RescueSubscriber {
            downstream: subscriber,
            rescue: self.rescue.clone(),
            core: EdgeCore::new(),
        }));
    }
}

struct RescueSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    rescue: Arc<Rescue>,
    core: EdgeCore,
}

impl<T: Send + 'static> Subscriber<T> for RescueSubscriber<T> {
    fn on_subscribe(&self, subscription: Subscription) {
        if self.core.bind(&subscription) {
            self.downstream.on_subscribe(subscription);
        }
    }

    fn on_next(&self, value: T) {
        if self.core.gate.accepts_next() {
            self.downstream.on_next(value);
        }
    }

    fn on_error(&self, error: FlowError) {
        // Fatal errors pass through every rescue
        let swallow = !error.is_fatal()
            && match &*self.rescue {
                Rescue::All => true,
                Rescue::Kind { kind, .. } => error.kind() == *kind,
            };

        if !self.core.gate.try_terminate(if swallow {
            Lifecycle::Completed
        } else {
            Lifecycle::Errored
        }) {
            drop_late_terminal(Some(&error));
            return;
        }

        if swallow {
            self.core.cancel_upstream();
            if let Rescue::Kind { handler, .. } = &*self.rescue
                && let Err(handler_error) = catch_user(|| handler(error))
            {
                tracing::warn!(error = %handler_error, "error handler failed");
            }
            self.downstream.on_complete();
        } else {
            self.downstream.on_error(error);
        }
    }

    fn on_complete(&self) {
        if self.core.gate.try_terminate(Lifecycle::Completed) {
            self.downstream.on_complete();
        } else {
            drop_late_terminal(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{flow::Collector, source::ColdSource};

    fn digits() -> Arc<dyn Publisher<&'static str>> {
        Arc::new(ColdSource::new(|| {
            Box::new(["1", "2", "3", "4", "5"].into_iter())
        }))
    }

    /// map transforms every element and completes
    #[test]
    fn test_map() {
        let mapped = MapFlow::new(digits(), |s| s.parse::<i64>().unwrap_or(0));
        let collector = Collector::unbounded();
        mapped.subscribe(collector.clone());
        assert_eq!(
            collector.await_complete(Duration::from_secs(1)),
            vec![1, 2, 3, 4, 5]
        );
    }

    /// A panicking mapper surfaces `Error(User)` and stops emission
    #[test]
    fn test_map_user_error() {
        let mapped = MapFlow::new(digits(), |s| {
            let n = s.parse::<i64>().unwrap_or(0);
            assert!(n < 3, "third element is unacceptable");
            n
        });
        let collector = Collector::unbounded();
        mapped.subscribe(collector.clone());

        match collector.await_terminal(Duration::from_secs(1)) {
            Some(Some(FlowError::User(_))) => {}
            other => panic!("unexpected terminal: {other:?}"),
        }
        assert_eq!(collector.values(), vec![1, 2]);
    }

    /// filter discards non-matching elements and still completes; with
    /// bounded demand the replaced credit keeps elements flowing
    #[test]
    fn test_filter_replaces_credit() {
        let evens = FilterFlow::new(
            Arc::new(ColdSource::new(|| Box::new(1..=10))),
            |n: &i64| n % 2 == 0,
        );
        let collector = Collector::with_demand(5);
        evens.subscribe(collector.clone());
        assert_eq!(
            collector.await_complete(Duration::from_secs(1)),
            vec![2, 4, 6, 8, 10]
        );
    }

    /// observe sees each element without changing the stream
    #[test]
    fn test_observe_passthrough() {
        use std::sync::atomic::{AtomicI64, Ordering};

        let seen = Arc::new(AtomicI64::new(0));
        let sink = seen.clone();
        let observed = ObserveFlow::new(
            Arc::new(ColdSource::new(|| Box::new(1..=4))),
            move |n: &i64| {
                sink.fetch_add(*n, Ordering::SeqCst);
            },
        );
        let collector = Collector::unbounded();
        observed.subscribe(collector.clone());

        assert_eq!(
            collector.await_complete(Duration::from_secs(1)),
            vec![1, 2, 3, 4]
        );
        assert_eq!(seen.load(Ordering::SeqCst), 10);
    }

    /// ignore_errors substitutes a completion for the error
    #[test]
    fn test_ignore_errors() {
        let flaky = MapFlow::new(digits(), |s| {
            let n: i64 = s.parse().unwrap_or(0);
            assert!(n < 4, "overflow");
            n
        });
        let rescued = RescueFlow::ignore(Arc::new(flaky));
        let collector = Collector::unbounded();
        rescued.subscribe(collector.clone());

        assert_eq!(collector.await_complete(Duration::from_secs(1)), vec![1, 2, 3]);
    }

    /// when() handles only its kind; other kinds propagate
    #[test]
    fn test_when_selective() {
        let handled = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let sink = handled.clone();
        let rescued = RescueFlow::when(
            Arc::new(crate::source::FailedSource::new(FlowError::User(
                "bad input".into(),
            ))),
            ErrorKind::User,
            move |error| sink.lock().push(error.to_string()),
        );
        let collector = Collector::<i64>::unbounded();
        rescued.subscribe(collector.clone());
        assert_eq!(
            collector.await_complete(Duration::from_secs(1)),
            Vec::<i64>::new()
        );
        assert_eq!(handled.lock().len(), 1);

        let unhandled = RescueFlow::when(
            Arc::new(crate::source::FailedSource::new(FlowError::Fatal(
                "broken".into(),
            ))),
            ErrorKind::User,
            |_| {},
        );
        let collector = Collector::<i64>::unbounded();
        unhandled.subscribe(collector.clone());
        match collector.await_terminal(Duration::from_secs(1)) {
            Some(Some(FlowError::Fatal(_))) => {}
            other => panic!("unexpected terminal: {other:?}"),
        }
    }
}
