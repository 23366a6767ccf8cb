//! Stateful transforms: scan and reduce.
//!
//! Both fold a running accumulator over the input; `scan` emits it per
//! element, `reduce` only at completion. The accumulator is per-subscriber
//! state behind the operator mutex (upstream may run on any thread).

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;

use crate::{
    demand::UNBOUNDED,
    error::{FlowError, catch_user},
    op::{
        EdgeCore,
        unicast::{Listeners, Unicast, UnicastPublisher},
    },
    signal::{Lifecycle, Publisher, Subscriber, Subscription, Upstream, drop_late_terminal},
};

// ---------------------------------------------------------------------------
// scan
// ---------------------------------------------------------------------------

/// Emits `acc = f(acc, v)` for every input element. Optionally emits the
/// seed itself before any input (consuming one downstream credit).
pub struct ScanFlow<I, O> {
    source: Arc<dyn Publisher<I>>,
    seed: O,
    f: Arc<dyn Fn(O, I) -> O + Send + Sync>,
    emit_seed: bool,
}

impl<I: Send + 'static, O: Clone + Send + Sync + 'static> ScanFlow<I, O> {
    pub fn new(
        source: Arc<dyn Publisher<I>>,
        seed: O,
        f: impl Fn(O, I) -> O + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            seed,
            f: Arc::new(f),
            emit_seed: false,
        }
    }

    /// Configures the seed to be emitted ahead of the first folded value.
    pub fn emitting_seed(mut self) -> Self {
        self.emit_seed = true;
        self
    }
}

impl<I: Send + 'static, O: Clone + Send + Sync + 'static> Publisher<O> for ScanFlow<I, O> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<O>>) {
        let seed_emit = self.emit_seed.then(|| {
            Arc::new(SeedEmit {
                seed: self.seed.clone(),
                emitted: AtomicBool::new(false),
            })
        });
        self.source.subscribe(Arc::new(ScanSubscriber {
            downstream: subscriber,
            f: self.f.clone(),
            acc: Mutex::new(self.seed.clone()),
            core: Arc::new(EdgeCore::new()),
            seed_emit,
        }));
    }
}

struct SeedEmit<O> {
    seed: O,
    emitted: AtomicBool,
}

struct ScanSubscriber<I, O> {
    downstream: Arc<dyn Subscriber<O>>,
    f: Arc<dyn Fn(O, I) -> O + Send + Sync>,
    acc: Mutex<O>,
    core: Arc<EdgeCore>,
    seed_emit: Option<Arc<SeedEmit<O>>>,
}

/// Downstream-facing subscription: intercepts the first request to slot the
/// seed emission in, then forwards credit upstream unchanged.
struct ScanUpstream<O> {
    core: Arc<EdgeCore>,
    downstream: Arc<dyn Subscriber<O>>,
    seed_emit: Option<Arc<SeedEmit<O>>>,
}

impl<O: Clone + Send + Sync + 'static> Upstream for ScanUpstream<O> {
    fn request(&self, n: u64) {
        if n > 0
            && let Some(emit) = &self.seed_emit
            && !emit.emitted.swap(true, Ordering::AcqRel)
            && self.core.gate.accepts_next()
        {
            self.downstream.on_next(emit.seed.clone());
            // The seed consumed one downstream credit
            if n == UNBOUNDED {
                self.core.request_upstream(UNBOUNDED);
            } else if n > 1 {
                self.core.request_upstream(n - 1);
            }
            return;
        }
        // Zero requests flow upstream too; the source surfaces the protocol
        // error back down through this edge
        self.core.request_upstream(n);
    }

    fn cancel(&self) {
        self.core.gate.try_terminate(Lifecycle::Cancelled);
        self.core.cancel_upstream();
    }
}

impl<I: Send + 'static, O: Clone + Send + Sync + 'static> Subscriber<I>
    for ScanSubscriber<I, O>
{
    fn on_subscribe(&self, subscription: Subscription) {
        if self.core.bind(&subscription) {
            self.downstream.on_subscribe(Subscription::new(Arc::new(ScanUpstream {
                core: self.core.clone(),
                downstream: self.downstream.clone(),
                seed_emit: self.seed_emit.clone(),
            })));
        }
    }

    fn on_next(&self, value: I) {
        if !self.core.gate.accepts_next() {
            return;
        }
        let folded = {
            let mut acc = self.acc.lock();
            match catch_user(|| (self.f)(acc.clone(), value)) {
                Ok(next) => {
                    *acc = next.clone();
                    Ok(next)
                }
                Err(error) => Err(error),
            }
        };
        match folded {
            Ok(next) => self.downstream.on_next(next),
            Err(error) => {
                if self.core.gate.try_terminate(Lifecycle::Errored) {
                    self.core.cancel_upstream();
                    self.downstream.on_error(error);
                } else {
                    drop_late_terminal(Some(&error));
                }
            }
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
// reduce
// ---------------------------------------------------------------------------

/// Folds the whole input and emits the final accumulator at completion.
///
/// Downstream demand converts to unbounded upstream demand at the first
/// request (the fold needs the entire stream either way); the result is
/// buffered through an inner unicast so it is only delivered against real
/// downstream credit.
pub struct ReduceFlow<I, O> {
    source: Arc<dyn Publisher<I>>,
    initial: Option<O>,
    fold: Arc<dyn Fn(Option<O>, I) -> O + Send + Sync>,
}

impl<I: Send + 'static, O: Clone + Send + Sync + 'static> ReduceFlow<I, O> {
    /// Seeded fold: empty input emits the seed.
    pub fn seeded(
        source: Arc<dyn Publisher<I>>,
        seed: O,
        f: impl Fn(O, I) -> O + Send + Sync + 'static,
    ) -> Self {
        let fallback = seed.clone();
        Self {
            source,
            initial: Some(seed),
            fold: Arc::new(move |acc, value| f(acc.unwrap_or_else(|| fallback.clone()), value)),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ReduceFlow<T, T> {
    /// Seedless fold: the first element becomes the accumulator; empty
    /// input emits nothing.
    pub fn unseeded(
        source: Arc<dyn Publisher<T>>,
        f: impl Fn(T, T) -> T + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            initial: None,
            fold: Arc::new(move |acc, value| match acc {
                Some(acc) => f(acc, value),
                None => value,
            }),
        }
    }
}

impl<I: Send + 'static, O: Clone + Send + Sync + 'static> Publisher<O> for ReduceFlow<I, O> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<O>>) {
        let core = Arc::new(EdgeCore::new());
        let fired = Arc::new(AtomicBool::new(false));

        let output = Unicast::with_listeners(Listeners {
            on_request: Some(Box::new({
                let core = core.clone();
                let fired = fired.clone();
                move |_n| {
                    // The fold needs the whole stream; fire once
                    if !fired.swap(true, Ordering::AcqRel) {
                        core.request_upstream(UNBOUNDED);
                    }
                }
            })),
            on_cancel: Some(Box::new({
                let core = core.clone();
                move || core.cancel_upstream()
            })),
        });

        // Bind the upstream first so a synchronous downstream request finds
        // it in place
        self.source.subscribe(Arc::new(ReduceSubscriber {
            output: output.clone(),
            fold: self.fold.clone(),
            acc: Mutex::new(self.initial.clone()),
            core,
        }));
        UnicastPublisher(output).subscribe(subscriber);
    }
}

struct ReduceSubscriber<I, O> {
    output: Arc<Unicast<O>>,
    fold: Arc<dyn Fn(Option<O>, I) -> O + Send + Sync>,
    acc: Mutex<Option<O>>,
    core: Arc<EdgeCore>,
}

impl<I: Send + 'static, O: Clone + Send + Sync + 'static> Subscriber<I>
    for ReduceSubscriber<I, O>
{
    fn on_subscribe(&self, subscription: Subscription) {
        self.core.bind(&subscription);
    }

    fn on_next(&self, value: I) {
        if !self.core.gate.accepts_next() {
            return;
        }
        let failed = {
            let mut acc = self.acc.lock();
            match catch_user(|| (self.fold)(acc.take(), value)) {
                Ok(next) => {
                    *acc = Some(next);
                    None
                }
                Err(error) => Some(error),
            }
        };
        if let Some(error) = failed
            && self.core.gate.try_terminate(Lifecycle::Errored)
        {
            self.core.cancel_upstream();
            self.output.finish(Some(error));
        }
    }

    fn on_error(&self, error: FlowError) {
        if self.core.gate.try_terminate(Lifecycle::Errored) {
            *self.acc.lock() = None;
            self.output.finish(Some(error));
        } else {
            drop_late_terminal(Some(&error));
        }
    }

    fn on_complete(&self) {
        if self.core.gate.try_terminate(Lifecycle::Completed) {
            if let Some(result) = self.acc.lock().take() {
                self.output.push(result);
            }
            self.output.finish(None);
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

    fn one_to_five() -> Arc<dyn Publisher<i64>> {
        Arc::new(ColdSource::new(|| Box::new(1..=5)))
    }

    /// scan emits the running fold per element
    #[test]
    fn test_scan_running_sum() {
        let scan = ScanFlow::new(one_to_five(), 0i64, |acc, v| acc + v);
        let collector = Collector::unbounded();
        scan.subscribe(collector.clone());
        assert_eq!(
            collector.await_complete(Duration::from_secs(1)),
            vec![1, 3, 6, 10, 15]
        );
    }

    /// seed emission leads the stream and consumes one credit
    #[test]
    fn test_scan_emits_seed() {
        let scan = ScanFlow::new(one_to_five(), 100i64, |acc, v| acc + v).emitting_seed();
        let collector = Collector::with_demand(3);
        scan.subscribe(collector.clone());
        assert_eq!(collector.values(), vec![100, 101, 103]);
    }

    /// reduce emits only the final accumulator, then completes
    #[test]
    fn test_reduce_seeded() {
        let reduce = ReduceFlow::seeded(one_to_five(), 0i64, |acc, v| acc + v);
        let collector = Collector::unbounded();
        reduce.subscribe(collector.clone());
        assert_eq!(collector.await_complete(Duration::from_secs(1)), vec![15]);
    }

    /// a seeded reduce over empty input emits the seed
    #[test]
    fn test_reduce_empty_seeded() {
        let empty: Arc<dyn Publisher<i64>> =
            Arc::new(ColdSource::new(|| Box::new(std::iter::empty())));
        let reduce = ReduceFlow::seeded(empty, 7i64, |acc, v| acc + v);
        let collector = Collector::unbounded();
        reduce.subscribe(collector.clone());
        assert_eq!(collector.await_complete(Duration::from_secs(1)), vec![7]);
    }

    /// an unseeded reduce over empty input emits nothing
    #[test]
    fn test_reduce_empty_unseeded() {
        let empty: Arc<dyn Publisher<i64>> =
            Arc::new(ColdSource::new(|| Box::new(std::iter::empty())));
        let reduce = ReduceFlow::unseeded(empty, |acc, v| acc + v);
        let collector = Collector::unbounded();
        reduce.subscribe(collector.clone());
        assert_eq!(
            collector.await_complete(Duration::from_secs(1)),
            Vec::<i64>::new()
        );
    }

    /// reduce produces the same final value as the last emission of a
    /// seeded scan
    #[test]
    fn test_reduce_matches_scan_last() {
        let scan = ScanFlow::new(one_to_five(), 1i64, |acc, v| acc * v);
        let scanned = Collector::unbounded();
        scan.subscribe(scanned.clone());

        let reduce = ReduceFlow::seeded(one_to_five(), 1i64, |acc, v| acc * v);
        let reduced = Collector::unbounded();
        reduce.subscribe(reduced.clone());

        let scan_last = *scanned
            .await_complete(Duration::from_secs(1))
            .last()
            .expect("non-empty scan");
        assert_eq!(reduced.await_complete(Duration::from_secs(1)), vec![scan_last]);
    }

    /// a panicking fold surfaces `Error(User)` and cancels upstream
    #[test]
    fn test_reduce_user_error() {
        let reduce = ReduceFlow::seeded(one_to_five(), 0i64, |acc, v| {
            assert!(v < 4, "fold blew up");
            acc + v
        });
        let collector = Collector::unbounded();
        reduce.subscribe(collector.clone());
        match collector.await_terminal(Duration::from_secs(1)) {
            Some(Some(FlowError::User(_))) => {}
            other => panic!("unexpected terminal: {other:?}"),
        }
    }
}
