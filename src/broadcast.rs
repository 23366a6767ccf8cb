//! Hot source: a sink + source pushing into all current subscribers.
//!
//! Broadcast signals are delivered to whoever is subscribed at emission
//! time; there is no replay for late subscribers. A subscriber without
//! outstanding credit at delivery time has that `Next` dropped (hot-stream
//! policy: the producer is never paced by its slowest consumer).
//!
//! ## Seat list
//!
//! Subscribers sit in a copy-on-write list (`arc-swap`): subscribe and
//! cancel swap in a new list, emission iterates an immutable snapshot.
//! Cancelling therefore never blocks an in-progress delivery.
//!
//! ## Reentrant emission
//!
//! Cyclic graphs (broadcaster → operator → same broadcaster) would recurse
//! through `broadcast_next`. Emissions go through a small trampoline
//! instead: an `emitting` flag plus a pending queue, appended to by nested
//! calls and drained iteratively by the outermost frame.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::{
    demand::Demand,
    error::FlowError,
    signal::{
        Gate, Lifecycle, Publisher, Signal, Subscriber, Subscription, Upstream,
        checked_request, drop_late_terminal,
    },
};

struct Seat<T> {
    id: u64,
    subscriber: Arc<dyn Subscriber<T>>,
    demand: Demand,
    gate: Gate,
}

struct Inner<T> {
    seats: ArcSwap<Vec<Arc<Seat<T>>>>,
    next_seat_id: AtomicU64,
    /// Sink-side gate: claimed by the first terminal broadcast.
    sink: Gate,
    /// Terminal kept for subscribers arriving after settlement.
    settled: Mutex<Option<Option<FlowError>>>,
    emitting: AtomicBool,
    pending: Mutex<VecDeque<Signal<T>>>,
}

/// Mutable hot publisher. Cloning shares the same seat list.
pub struct Broadcaster<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                seats: ArcSwap::from_pointee(Vec::new()),
                next_seat_id: AtomicU64::new(0),
                sink: Gate::new(),
                settled: Mutex::new(None),
                emitting: AtomicBool::new(false),
                pending: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Pushes a value to all current subscribers. Dropped entirely once the
    /// broadcaster is settled; dropped per-subscriber when a seat has no
    /// outstanding credit.
    pub fn broadcast_next(&self, value: T) {
        if self.inner.sink.is_terminal() {
            tracing::warn!("broadcast_next on settled broadcaster, dropping");
            return;
        }
        self.inner.emit(Signal::Next(value));
    }

    pub fn broadcast_error(&self, error: FlowError) {
        if self.inner.sink.try_terminate(Lifecycle::Errored) {
            self.inner.emit(Signal::Error(error));
        } else {
            drop_late_terminal(Some(&error));
        }
    }

    pub fn broadcast_complete(&self) {
        if self.inner.sink.try_terminate(Lifecycle::Completed) {
            self.inner.emit(Signal::Complete);
        } else {
            drop_late_terminal(None);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.seats.load().len()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Inner<T> {
    /// Trampoline entry: enqueue, then drain unless a frame below us on
    /// this or another thread already is.
    fn emit(&self, signal: Signal<T>) {
        self.pending.lock().push_back(signal);
        if self.emitting.swap(true, Ordering::Acquire) {
            return;
        }
        loop {
            let next = self.pending.lock().pop_front();
            match next {
                Some(signal) => self.deliver(signal),
                None => {
                    self.emitting.store(false, Ordering::Release);
                    // A nested emit may have queued between the pop and the
                    // release; retake the flag or leave it to the newcomer
                    if self.pending.lock().is_empty()
                        || self.emitting.swap(true, Ordering::Acquire)
                    {
                        break;
                    }
                }
            }
        }
    }

    fn deliver(&self, signal: Signal<T>) {
        match signal {
            Signal::Next(value) => {
                let seats = self.seats.load();
                for seat in seats.iter() {
                    if seat.demand.try_take(1) && seat.gate.accepts_next() {
                        seat.subscriber.on_next(value.clone());
                    } else {
                        tracing::trace!(seat = seat.id, "no credit, dropping hot signal");
                    }
                }
            }
            Signal::Error(error) => {
                *self.settled.lock() = Some(Some(error.clone()));
                let seats = self.seats.swap(Arc::new(Vec::new()));
                for seat in seats.iter() {
                    if seat.gate.try_terminate(Lifecycle::Errored) {
                        seat.subscriber.on_error(error.clone());
                    }
                }
            }
            Signal::Complete => {
                *self.settled.lock() = Some(None);
                let seats = self.seats.swap(Arc::new(Vec::new()));
                for seat in seats.iter() {
                    if seat.gate.try_terminate(Lifecycle::Completed) {
                        seat.subscriber.on_complete();
                    }
                }
            }
        }
    }

    fn remove_seat(&self, id: u64) {
        self.seats.rcu(|seats| {
            seats
                .iter()
                .filter(|seat| seat.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
    }
}

struct SeatHandle<T> {
    seat: Arc<Seat<T>>,
    inner: Arc<Inner<T>>,
}

impl<T: Clone + Send + Sync + 'static> Upstream for SeatHandle<T> {
    fn request(&self, n: u64) {
        match checked_request(n) {
            Ok(n) => {
                self.seat.demand.add(n);
            }
            Err(error) => {
                if self.seat.gate.try_terminate(Lifecycle::Errored) {
                    self.inner.remove_seat(self.seat.id);
                    self.seat.subscriber.on_error(error);
                } else {
                    drop_late_terminal(Some(&error));
                }
            }
        }
    }

    fn cancel(&self) {
        if self.seat.gate.try_terminate(Lifecycle::Cancelled) {
            self.seat.demand.clear();
            self.inner.remove_seat(self.seat.id);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Publisher<T> for Broadcaster<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let seat = Arc::new(Seat {
            id: self.inner.next_seat_id.fetch_add(1, Ordering::Relaxed),
            subscriber: subscriber.clone(),
            demand: Demand::new(),
            gate: Gate::new(),
        });
        seat.gate.mark_subscribed();
        subscriber.on_subscribe(Subscription::new(Arc::new(SeatHandle {
            seat: seat.clone(),
            inner: self.inner.clone(),
        })));

        // A settled broadcaster terminates late subscribers immediately
        if let Some(terminal) = self.inner.settled.lock().clone() {
            if seat.gate.try_terminate(match terminal {
                Some(_) => Lifecycle::Errored,
                None => Lifecycle::Completed,
            }) {
                match terminal {
                    Some(error) => subscriber.on_error(error),
                    None => subscriber.on_complete(),
                }
            }
            return;
        }

        self.inner.seats.rcu(|seats| {
            let mut seats = seats.iter().cloned().collect::<Vec<_>>();
            if !seat.gate.is_terminal() {
                seats.push(seat.clone());
            }
            seats
        });

        // Settlement may have raced the insertion; the seat list was already
        // swapped out, so deliver the terminal here instead
        if let Some(terminal) = self.inner.settled.lock().clone() {
            self.inner.remove_seat(seat.id);
            if seat.gate.try_terminate(match terminal {
                Some(_) => Lifecycle::Errored,
                None => Lifecycle::Completed,
            }) {
                match terminal {
                    Some(error) => subscriber.on_error(error),
                    None => subscriber.on_complete(),
                }
            }
        }
    }
}
