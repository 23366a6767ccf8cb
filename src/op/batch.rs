//! Buffering aggregator: collects elements into lists of `size`, with an
//! optional timer-driven flush.
//!
//! Downstream demand for one list converts to upstream demand for `size`
//! elements. Flushed lists travel through an inner unicast, so they are
//! only delivered against real downstream credit even when a timer flush
//! produces more, smaller lists than the size-trigger would have.
//!
//! ## Close race
//!
//! The size trigger and the timeout can fire for the same buffer. Each
//! flush bumps an epoch under the state mutex and the timer callback
//! carries the epoch it was armed for; the losing trigger no-ops, so
//! exactly one flush happens. Timeouts never flush an empty buffer.

use std::{
    sync::{Arc, OnceLock, Weak},
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    demand::UNBOUNDED,
    error::FlowError,
    op::{
        EdgeCore,
        unicast::{Listeners, Unicast, UnicastPublisher},
    },
    signal::{Lifecycle, Publisher, Subscriber, Subscription, drop_late_terminal},
    timer::{TimerRegistration, TimerService},
};

/// Accumulates up to `size` elements and emits them as one list.
pub struct BufferFlow<T> {
    source: Arc<dyn Publisher<T>>,
    size: usize,
    timeout: Option<(Duration, Arc<TimerService>)>,
}

impl<T: Send + Sync + 'static> BufferFlow<T> {
    pub fn new(source: Arc<dyn Publisher<T>>, size: usize) -> Self {
        assert!(size > 0, "buffer size must be positive");
        Self {
            source,
            size,
            timeout: None,
        }
    }

    /// Also flushes `timeout` after the first element of the current
    /// buffer arrived.
    pub fn with_timeout(mut self, timeout: Duration, timer: Arc<TimerService>) -> Self {
        self.timeout = Some((timeout, timer));
        self
    }
}

struct BatchState<T> {
    items: Vec<T>,
    /// Bumped on every flush; stale timer callbacks compare and bail.
    epoch: u64,
    armed: Option<TimerRegistration>,
}

impl<T> BatchState<T> {
    fn disarm(&mut self) {
        if let Some(registration) = self.armed.take() {
            registration.cancel();
        }
    }
}

struct BufferSubscriber<T> {
    output: Arc<Unicast<Vec<T>>>,
    state: Arc<Mutex<BatchState<T>>>,
    core: Arc<EdgeCore>,
    size: usize,
    timeout: Option<(Duration, Arc<TimerService>)>,
    weak_self: OnceLock<Weak<BufferSubscriber<T>>>,
}

impl<T: Send + Sync + 'static> Publisher<Vec<T>> for BufferFlow<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Vec<T>>>) {
        let core = Arc::new(EdgeCore::new());
        let state = Arc::new(Mutex::new(BatchState {
            items: Vec::new(),
            epoch: 0,
            armed: None,
        }));

        let size = self.size as u64;
        let output = Unicast::with_listeners(Listeners {
            on_request: Some(Box::new({
                let core = core.clone();
                move |n| {
                    // One list downstream is `size` elements upstream
                    core.request_upstream(if n == UNBOUNDED {
                        UNBOUNDED
                    } else {
                        n.saturating_mul(size)
                    });
                }
            })),
            on_cancel: Some(Box::new({
                let core = core.clone();
                let state = state.clone();
                move || {
                    state.lock().disarm();
                    core.cancel_upstream();
                }
            })),
        });

        let buffer = Arc::new(BufferSubscriber {
            output: output.clone(),
            state,
            core,
            size: self.size,
            timeout: self.timeout.clone(),
            weak_self: OnceLock::new(),
        });
        let _ = buffer.weak_self.set(Arc::downgrade(&buffer));

        self.source.subscribe(buffer);
        UnicastPublisher(output).subscribe(subscriber);
    }
}

impl<T: Send + Sync + 'static> BufferSubscriber<T> {
    /// Size-triggered or terminal flush: takes whatever has accumulated.
    fn flush_now(&self) {
        let batch = {
            let mut state = self.state.lock();
            if state.items.is_empty() {
                return;
            }
            state.epoch += 1;
            state.disarm();
            std::mem::take(&mut state.items)
        };
        // Pushed without the state lock: the unicast drain may re-enter
        // `request` and pull more elements up through this operator
        self.output.push(batch);
    }

    /// Timer-triggered flush, valid only for the epoch it was armed in.
    fn flush_epoch(&self, expected: u64) {
        let batch = {
            let mut state = self.state.lock();
            if state.epoch != expected || state.items.is_empty() {
                return;
            }
            state.epoch += 1;
            state.armed = None;
            std::mem::take(&mut state.items)
        };
        self.output.push(batch);
    }

    fn arm(&self, state: &mut BatchState<T>) {
        let Some((timeout, timer)) = &self.timeout else {
            return;
        };
        let Some(weak) = self.weak_self.get() else {
            return;
        };
        let weak = weak.clone();
        let expected = state.epoch;
        state.armed = Some(timer.schedule(
            move || {
                if let Some(buffer) = weak.upgrade() {
                    buffer.flush_epoch(expected);
                }
            },
            *timeout,
        ));
    }
}

impl<T: Send + Sync + 'static> Subscriber<T> for BufferSubscriber<T> {
    fn on_subscribe(&self, subscription: Subscription) {
        self.core.bind(&subscription);
    }

    fn on_next(&self, value: T) {
        if !self.core.gate.accepts_next() {
            return;
        }
        let full = {
            let mut state = self.state.lock();
            state.items.push(value);
            if state.items.len() == 1 {
                // Timeout counts from the first element of this buffer
                self.arm(&mut state);
            }
            state.items.len() >= self.size
        };
        if full {
            self.flush_now();
        }
    }

    fn on_error(&self, error: FlowError) {
        if self.core.gate.try_terminate(Lifecycle::Errored) {
            let mut state = self.state.lock();
            state.disarm();
            state.items.clear();
            drop(state);
            self.output.finish(Some(error));
        } else {
            drop_late_terminal(Some(&error));
        }
    }

    fn on_complete(&self) {
        if self.core.gate.try_terminate(Lifecycle::Completed) {
            // Partial buffers flush at completion (non-empty only)
            self.flush_now();
            self.state.lock().disarm();
            self.output.finish(None);
        } else {
            drop_late_terminal(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{flow::Collector, source::ColdSource};

    fn count_to(n: i64) -> Arc<dyn Publisher<i64>> {
        Arc::new(ColdSource::new(move || Box::new(0..n)))
    }

    /// Full buffers have exactly `size` elements; the final partial one
    /// flushes at completion
    #[test]
    fn test_size_flush_and_partial() {
        let buffered = BufferFlow::new(count_to(10), 4);
        let collector = Collector::unbounded();
        buffered.subscribe(collector.clone());

        assert_eq!(
            collector.await_complete(Duration::from_secs(1)),
            vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]
        );
    }

    /// Concatenating all buffers reproduces the input sequence exactly
    #[test]
    fn test_conservation() {
        let buffered = BufferFlow::new(count_to(100), 7);
        let collector = Collector::unbounded();
        buffered.subscribe(collector.clone());

        let flat: Vec<i64> = collector
            .await_complete(Duration::from_secs(1))
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(flat, (0..100).collect::<Vec<_>>());
    }

    /// An exact multiple of `size` produces no empty trailing buffer
    #[test]
    fn test_no_empty_flush() {
        let buffered = BufferFlow::new(count_to(8), 4);
        let collector = Collector::unbounded();
        buffered.subscribe(collector.clone());

        assert_eq!(
            collector.await_complete(Duration::from_secs(1)),
            vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]]
        );
    }

    /// The timer flushes a buffer that never reaches `size`
    #[test]
    fn test_timeout_flush() {
        let timer = Arc::new(TimerService::with_resolution(Duration::from_millis(1)));
        let broadcaster = crate::broadcast::Broadcaster::new();
        let buffered = BufferFlow::new(
            Arc::new(broadcaster.clone()),
            1000,
        )
        .with_timeout(Duration::from_millis(20), timer);

        let collector = Collector::unbounded();
        buffered.subscribe(collector.clone());

        broadcaster.broadcast_next(1);
        broadcaster.broadcast_next(2);
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(collector.values(), vec![vec![1, 2]]);

        broadcaster.broadcast_next(3);
        broadcaster.broadcast_complete();
        assert_eq!(
            collector.await_complete(Duration::from_secs(1)),
            vec![vec![1, 2], vec![3]]
        );
    }

    /// When the size trigger wins, the stale timer callback no-ops
    #[test]
    fn test_flush_race_single_flush() {
        let timer = Arc::new(TimerService::with_resolution(Duration::from_millis(1)));
        let broadcaster = crate::broadcast::Broadcaster::new();
        let buffered = BufferFlow::new(Arc::new(broadcaster.clone()), 2)
            .with_timeout(Duration::from_millis(30), timer);

        let collector = Collector::unbounded();
        buffered.subscribe(collector.clone());

        // Fills the buffer before the timeout elapses
        broadcaster.broadcast_next(1);
        broadcaster.broadcast_next(2);
        std::thread::sleep(Duration::from_millis(100));

        broadcaster.broadcast_complete();
        assert_eq!(
            collector.await_complete(Duration::from_secs(1)),
            vec![vec![1, 2]]
        );
    }
}
