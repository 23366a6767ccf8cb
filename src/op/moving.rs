//! Moving-window aggregator: a ring of the most recent `backlog` values,
//! snapshotted on a periodic timer tick.
//!
//! The arrival pointer is an atomic counter; the derived index is
//! `pointer mod backlog`. Slot writes are serialized by the operator mutex
//! (the pointer alone cannot prevent tearing for non-primitive payloads).
//! Once at least `backlog` values arrived, a snapshot reads
//! `[idx..backlog) ++ [0..idx)` — arrival order. Before that, only the
//! populated prefix is read: snapshots have length `min(arrived, backlog)`.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    demand::{Demand, UNBOUNDED},
    error::FlowError,
    op::EdgeCore,
    signal::{
        Lifecycle, Publisher, Subscriber, Subscription, Upstream, checked_request,
        drop_late_terminal,
    },
    timer::{TimerRegistration, TimerService},
};

/// Emits, every `period`, a list of the `backlog` most recent inputs in
/// arrival order. The ring is not cleared by a tick.
pub struct MovingWindowFlow<T> {
    source: Arc<dyn Publisher<T>>,
    period: Duration,
    delay: Duration,
    backlog: usize,
    timer: Arc<TimerService>,
}

impl<T: Clone + Send + Sync + 'static> MovingWindowFlow<T> {
    pub fn new(
        source: Arc<dyn Publisher<T>>,
        period: Duration,
        delay: Duration,
        backlog: usize,
        timer: Arc<TimerService>,
    ) -> Self {
        assert!(backlog > 0, "backlog must be positive");
        Self {
            source,
            period,
            delay,
            backlog,
            timer,
        }
    }
}

struct MovingSubscriber<T> {
    downstream: Arc<dyn Subscriber<Vec<T>>>,
    slots: Mutex<Vec<Option<T>>>,
    /// Arrival counter; `pointer mod backlog` is the next write index.
    pointer: AtomicU64,
    demand: Demand,
    core: Arc<EdgeCore>,
    registration: Mutex<Option<TimerRegistration>>,
}

impl<T: Clone + Send + Sync + 'static> Publisher<Vec<T>> for MovingWindowFlow<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Vec<T>>>) {
        let moving = Arc::new(MovingSubscriber {
            downstream: subscriber,
            slots: Mutex::new(vec![None; self.backlog]),
            pointer: AtomicU64::new(0),
            demand: Demand::new(),
            core: Arc::new(EdgeCore::new()),
            registration: Mutex::new(None),
        });

        let tick = {
            let weak = Arc::downgrade(&moving);
            move || {
                if let Some(moving) = weak.upgrade() {
                    moving.tick();
                }
            }
        };
        *moving.registration.lock() =
            Some(self.timer.schedule_periodic(tick, self.delay, self.period));

        // Upstream first, so a synchronous downstream request finds it bound
        self.source.subscribe(moving.clone());
        let downstream = moving.downstream.clone();
        downstream.on_subscribe(Subscription::new(Arc::new(MovingUpstream {
            moving,
            fired: AtomicBool::new(false),
        })));
    }
}

impl<T: Clone + Send + Sync + 'static> MovingSubscriber<T> {
    /// Periodic snapshot: arrival order, populated slots only, ring kept.
    fn tick(&self) {
        if self.core.gate.is_terminal() {
            return;
        }
        let snapshot = {
            let slots = self.slots.lock();
            let arrived = self.pointer.load(Ordering::Acquire) as usize;
            if arrived == 0 {
                return;
            }
            let backlog = slots.len();
            let mut out = Vec::with_capacity(arrived.min(backlog));
            if arrived < backlog {
                for slot in slots.iter().take(arrived) {
                    out.extend(slot.clone());
                }
            } else {
                let idx = arrived % backlog;
                for slot in slots[idx..].iter().chain(slots[..idx].iter()) {
                    out.extend(slot.clone());
                }
            }
            out
        };
        if !snapshot.is_empty()
            && self.demand.try_take(1)
            && self.core.gate.accepts_next()
        {
            self.downstream.on_next(snapshot);
        }
    }

    fn disarm(&self) {
        if let Some(registration) = self.registration.lock().take() {
            registration.cancel();
        }
    }
}

struct MovingUpstream<T> {
    moving: Arc<MovingSubscriber<T>>,
    fired: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> Upstream for MovingUpstream<T> {
    fn request(&self, n: u64) {
        match checked_request(n) {
            Ok(n) => {
                self.moving.demand.add(n);
                // Sampling consumes the upstream freely; snapshots are paced
                // by downstream credit instead
                if !self.fired.swap(true, Ordering::AcqRel) {
                    self.moving.core.request_upstream(UNBOUNDED);
                }
            }
            Err(error) => {
                if self.moving.core.gate.try_terminate(Lifecycle::Errored) {
                    self.moving.disarm();
                    self.moving.core.cancel_upstream();
                    self.moving.downstream.on_error(error);
                } else {
                    drop_late_terminal(Some(&error));
                }
            }
        }
    }

    fn cancel(&self) {
        self.moving.core.gate.try_terminate(Lifecycle::Cancelled);
        self.moving.disarm();
        self.moving.core.cancel_upstream();
    }
}

impl<T: Clone + Send + Sync + 'static> Subscriber<T> for MovingSubscriber<T> {
    fn on_subscribe(&self, subscription: Subscription) {
        self.core.bind(&subscription);
    }

    fn on_next(&self, value: T) {
        if !self.core.gate.accepts_next() {
            return;
        }
        let mut slots = self.slots.lock();
        let backlog = slots.len() as u64;
        let pointer = self.pointer.load(Ordering::Acquire);
        slots[(pointer % backlog) as usize] = Some(value);
        // Publish the arrival only after the slot write settled
        self.pointer.store(pointer + 1, Ordering::Release);
    }

    fn on_error(&self, error: FlowError) {
        if self.core.gate.try_terminate(Lifecycle::Errored) {
            self.disarm();
            self.downstream.on_error(error);
        } else {
            drop_late_terminal(Some(&error));
        }
    }

    fn on_complete(&self) {
        if self.core.gate.try_terminate(Lifecycle::Completed) {
            self.disarm();
            self.downstream.on_complete();
        } else {
            drop_late_terminal(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broadcast::Broadcaster, flow::Collector};

    fn fast_timer() -> Arc<TimerService> {
        Arc::new(TimerService::with_resolution(Duration::from_millis(1)))
    }

    /// Before the ring fills, snapshots cover only the populated prefix
    #[test]
    fn test_partial_ring_snapshot() {
        let broadcaster = Broadcaster::new();
        let moving = MovingWindowFlow::new(
            Arc::new(broadcaster.clone()),
            Duration::from_millis(15),
            Duration::from_millis(15),
            4,
            fast_timer(),
        );
        let collector = Collector::unbounded();
        moving.subscribe(collector.clone());

        broadcaster.broadcast_next(1);
        broadcaster.broadcast_next(2);
        std::thread::sleep(Duration::from_millis(80));

        let snapshots = collector.values();
        assert!(!snapshots.is_empty());
        assert!(snapshots.iter().all(|s| *s == vec![1, 2]));
    }

    /// Once full, every snapshot holds the `backlog` most recent inputs in
    /// arrival order, and ticks do not clear the ring
    #[test]
    fn test_full_ring_snapshot() {
        let broadcaster = Broadcaster::new();
        let moving = MovingWindowFlow::new(
            Arc::new(broadcaster.clone()),
            Duration::from_millis(15),
            Duration::from_millis(15),
            3,
            fast_timer(),
        );
        let collector = Collector::unbounded();
        moving.subscribe(collector.clone());

        for n in 1..=5 {
            broadcaster.broadcast_next(n);
        }
        std::thread::sleep(Duration::from_millis(80));

        let snapshots = collector.values();
        assert!(!snapshots.is_empty());
        assert!(snapshots.iter().all(|s| *s == vec![3, 4, 5]));

        broadcaster.broadcast_next(6);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(collector.values().last(), Some(&vec![4, 5, 6]));
    }

    /// A terminal cancels the tick registration
    #[test]
    fn test_terminal_stops_ticks() {
        let broadcaster = Broadcaster::new();
        let moving = MovingWindowFlow::new(
            Arc::new(broadcaster.clone()),
            Duration::from_millis(10),
            Duration::from_millis(10),
            2,
            fast_timer(),
        );
        let collector = Collector::unbounded();
        moving.subscribe(collector.clone());

        broadcaster.broadcast_next(1);
        broadcaster.broadcast_complete();
        std::thread::sleep(Duration::from_millis(60));

        assert!(collector.is_terminated());
        let after = collector.values().len();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(collector.values().len(), after);
    }
}
