//! Windowing aggregator: like buffer, but each window is emitted as an
//! inner sub-stream publisher instead of a list.
//!
//! Subscribers of an inner stream observe `Next* Complete`. Inner streams
//! buffer until their subscriber arrives and defer their completion behind
//! buffered elements, so a consumer that subscribes from the outer
//! `on_next` never misses a signal.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    demand::UNBOUNDED,
    error::FlowError,
    flow::Flow,
    op::{
        EdgeCore,
        unicast::{Listeners, Unicast, UnicastPublisher},
    },
    signal::{Lifecycle, Publisher, Subscriber, Subscription, drop_late_terminal},
};

/// Splits the input into consecutive windows of `size` elements, emitting
/// one inner publisher per window.
pub struct WindowFlow<T> {
    source: Arc<dyn Publisher<T>>,
    size: usize,
}

impl<T: Send + Sync + 'static> WindowFlow<T> {
    pub fn new(source: Arc<dyn Publisher<T>>, size: usize) -> Self {
        assert!(size > 0, "window size must be positive");
        Self { source, size }
    }
}

struct PaneState<T> {
    current: Option<Arc<Unicast<T>>>,
    filled: usize,
}

struct WindowSubscriber<T> {
    outer: Arc<Unicast<Flow<T>>>,
    state: Mutex<PaneState<T>>,
    core: Arc<EdgeCore>,
    size: usize,
}

impl<T: Send + Sync + 'static> Publisher<Flow<T>> for WindowFlow<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Flow<T>>>) {
        let core = Arc::new(EdgeCore::new());
        let size = self.size as u64;

        let outer = Unicast::with_listeners(Listeners {
            on_request: Some(Box::new({
                let core = core.clone();
                move |n| {
                    // One window downstream is `size` elements upstream
                    core.request_upstream(if n == UNBOUNDED {
                        UNBOUNDED
                    } else {
                        n.saturating_mul(size)
                    });
                }
            })),
            on_cancel: Some(Box::new({
                let core = core.clone();
                move || core.cancel_upstream()
            })),
        });

        self.source.subscribe(Arc::new(WindowSubscriber {
            outer: outer.clone(),
            state: Mutex::new(PaneState {
                current: None,
                filled: 0,
            }),
            core,
            size: self.size,
        }));
        UnicastPublisher(outer).subscribe(subscriber);
    }
}

impl<T: Send + Sync + 'static> Subscriber<T> for WindowSubscriber<T> {
    fn on_subscribe(&self, subscription: Subscription) {
        self.core.bind(&subscription);
    }

    fn on_next(&self, value: T) {
        if !self.core.gate.accepts_next() {
            return;
        }
        // Transitions are decided under the lock; pushes happen outside it
        // (inner drains may re-enter `request` through this operator)
        let (opened, pane, closes) = {
            let mut state = self.state.lock();
            let opened = if state.current.is_none() {
                let pane = Unicast::new();
                state.current = Some(pane.clone());
                state.filled = 0;
                Some(pane)
            } else {
                None
            };
            let pane = state.current.clone();
            state.filled += 1;
            let closes = state.filled >= self.size;
            if closes {
                state.current = None;
                state.filled = 0;
            }
            (opened, pane, closes)
        };

        if let Some(pane) = opened {
            self.outer
                .push(Flow::from_publisher(Arc::new(UnicastPublisher(pane))));
        }
        if let Some(pane) = pane {
            pane.push(value);
            if closes {
                pane.finish(None);
            }
        }
    }

    fn on_error(&self, error: FlowError) {
        if self.core.gate.try_terminate(Lifecycle::Errored) {
            let pane = self.state.lock().current.take();
            if let Some(pane) = pane {
                pane.finish(Some(error.clone()));
            }
            self.outer.finish(Some(error));
        } else {
            drop_late_terminal(Some(&error));
        }
    }

    fn on_complete(&self) {
        if self.core.gate.try_terminate(Lifecycle::Completed) {
            let pane = self.state.lock().current.take();
            if let Some(pane) = pane {
                pane.finish(None);
            }
            self.outer.finish(None);
        } else {
            drop_late_terminal(None);
        }
    }
}
