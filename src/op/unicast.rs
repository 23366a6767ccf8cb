//! Single-subscriber buffered publisher backing inner sub-streams.
//!
//! Window panes and partition lanes hand one of these to their downstream
//! as a `Next`. The consumer may subscribe later than signals arrive, so
//! the unicast buffers until a subscriber exists, then delivers per its
//! demand. A buffered terminal is deferred behind the queued elements and
//! delivered once demand has drained them.

use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;

use crate::{
    demand::Demand,
    error::FlowError,
    signal::{Publisher, Subscriber, Subscription, Upstream, checked_request},
};

/// Hooks the owning operator uses to observe its inner stream's edge.
#[derive(Default)]
pub(crate) struct Listeners {
    /// Invoked after credit is granted, with the grant amount.
    pub(crate) on_request: Option<Box<dyn Fn(u64) + Send + Sync>>,
    /// Invoked once, when the inner subscriber cancels.
    pub(crate) on_cancel: Option<Box<dyn Fn() + Send + Sync>>,
}

struct State<T> {
    queue: VecDeque<T>,
    subscriber: Option<Arc<dyn Subscriber<T>>>,
    /// `Some(None)` = completion, `Some(Some(e))` = error.
    terminal: Option<Option<FlowError>>,
    terminal_delivered: bool,
    cancelled: bool,
    draining: bool,
}

pub(crate) struct Unicast<T> {
    state: Mutex<State<T>>,
    demand: Demand,
    listeners: Listeners,
}

impl<T: Send + 'static> Unicast<T> {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_listeners(Listeners::default())
    }

    pub(crate) fn with_listeners(listeners: Listeners) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                subscriber: None,
                terminal: None,
                terminal_delivered: false,
                cancelled: false,
                draining: false,
            }),
            demand: Demand::new(),
            listeners,
        })
    }

    /// Queues a value (or delivers it straight through when the subscriber
    /// has credit). Ignored after a terminal or cancellation.
    pub(crate) fn push(&self, value: T) {
        {
            let mut state = self.state.lock();
            if state.cancelled || state.terminal.is_some() {
                return;
            }
            state.queue.push_back(value);
        }
        self.drain();
    }

    /// Settles the stream. The terminal queues behind buffered elements;
    /// the first call wins.
    pub(crate) fn finish(&self, error: Option<FlowError>) {
        {
            let mut state = self.state.lock();
            if state.cancelled || state.terminal.is_some() {
                return;
            }
            state.terminal = Some(error);
        }
        self.drain();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    fn cancel(&self) {
        let first = {
            let mut state = self.state.lock();
            let first = !state.cancelled;
            state.cancelled = true;
            state.queue.clear();
            first
        };
        self.demand.clear();
        if first && let Some(on_cancel) = &self.listeners.on_cancel {
            on_cancel();
        }
    }

    fn drain(&self) {
        let mut state = self.state.lock();
        if state.draining {
            return;
        }
        state.draining = true;
        loop {
            if state.cancelled {
                state.queue.clear();
                break;
            }
            let Some(subscriber) = state.subscriber.clone() else {
                break;
            };
            if !state.queue.is_empty() && self.demand.try_take(1) {
                if let Some(value) = state.queue.pop_front() {
                    // Deliver without the lock: `on_next` may re-enter
                    // through `request`
                    drop(state);
                    subscriber.on_next(value);
                    state = self.state.lock();
                }
                continue;
            }
            if state.queue.is_empty()
                && !state.terminal_delivered
                && let Some(terminal) = state.terminal.clone()
            {
                state.terminal_delivered = true;
                drop(state);
                match terminal {
                    Some(error) => subscriber.on_error(error),
                    None => subscriber.on_complete(),
                }
                state = self.state.lock();
            }
            break;
        }
        state.draining = false;
    }
}

struct Handle<T> {
    unicast: Arc<Unicast<T>>,
}

impl<T: Send + 'static> Upstream for Handle<T> {
    fn request(&self, n: u64) {
        match checked_request(n) {
            Ok(n) => {
                self.unicast.demand.add(n);
                if let Some(on_request) = &self.unicast.listeners.on_request {
                    on_request(n);
                }
                self.unicast.drain();
            }
            Err(error) => self.unicast.finish(Some(error)),
        }
    }

    fn cancel(&self) {
        self.unicast.cancel();
    }
}

struct NoopUpstream;

impl Upstream for NoopUpstream {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {}
}

/// Publisher face of a [`Unicast`], handed downstream as an inner-stream
/// value.
pub(crate) struct UnicastPublisher<T>(pub(crate) Arc<Unicast<T>>);

impl<T: Send + 'static> Publisher<T> for UnicastPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let accepted = {
            let mut state = self.0.state.lock();
            if state.subscriber.is_some() {
                false
            } else {
                state.subscriber = Some(subscriber.clone());
                true
            }
        };

        if !accepted {
            subscriber.on_subscribe(Subscription::new(Arc::new(NoopUpstream)));
            subscriber.on_error(FlowError::Protocol(
                "inner stream supports a single subscriber".into(),
            ));
            return;
        }

        subscriber.on_subscribe(Subscription::new(Arc::new(Handle {
            unicast: self.0.clone(),
        })));
        // Deliver anything buffered before the subscriber arrived
        self.0.drain();
    }
}
