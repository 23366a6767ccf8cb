//! Timing operators: sample_first, sample, timeout.
//!
//! All three bind a timer registration at subscription time and cancel it
//! on any terminal or cancellation. The sampling pair consumes its upstream
//! freely (unbounded once downstream demand appears) and paces emission by
//! downstream credit at the window boundaries.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
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

/// Which element of each period window a sampler emits.
#[derive(Clone, Copy, PartialEq, Eq)]
enum SampleMode {
    /// First `Next` of the window, the rest dropped until it rolls.
    First,
    /// Last `Next` of the window, emitted at the boundary tick.
    Last,
}

/// Periodic down-sampler.
pub struct SampleFlow<T> {
    source: Arc<dyn Publisher<T>>,
    period: Duration,
    mode: SampleMode,
    timer: Arc<TimerService>,
}

impl<T: Send + Sync + 'static> SampleFlow<T> {
    /// `sample_first`: emit the first element of each period window.
    pub fn first(
        source: Arc<dyn Publisher<T>>,
        period: Duration,
        timer: Arc<TimerService>,
    ) -> Self {
        Self {
            source,
            period,
            mode: SampleMode::First,
            timer,
        }
    }

    /// `sample`: emit the last element of each period window at its end.
    pub fn last(
        source: Arc<dyn Publisher<T>>,
        period: Duration,
        timer: Arc<TimerService>,
    ) -> Self {
        Self {
            source,
            period,
            mode: SampleMode::Last,
            timer,
        }
    }
}

struct SampleSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    mode: SampleMode,
    /// `First`: window-open flag. Armed at subscription, re-armed per tick.
    open: AtomicBool,
    /// `Last`: candidate for the next boundary emission.
    held: Mutex<Option<T>>,
    demand: Demand,
    core: Arc<EdgeCore>,
    registration: Mutex<Option<TimerRegistration>>,
}

impl<T: Send + Sync + 'static> Publisher<T> for SampleFlow<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let sampler = Arc::new(SampleSubscriber {
            downstream: subscriber,
            mode: self.mode,
            open: AtomicBool::new(true),
            held: Mutex::new(None),
            demand: Demand::new(),
            core: Arc::new(EdgeCore::new()),
            registration: Mutex::new(None),
        });

        let tick = {
            let weak = Arc::downgrade(&sampler);
            move || {
                if let Some(sampler) = weak.upgrade() {
                    sampler.tick();
                }
            }
        };
        *sampler.registration.lock() =
            Some(self.timer.schedule_periodic(tick, self.period, self.period));

        self.source.subscribe(sampler.clone());
        let downstream = sampler.downstream.clone();
        downstream.on_subscribe(Subscription::new(Arc::new(SampleUpstream {
            sampler,
            fired: AtomicBool::new(false),
        })));
    }
}

impl<T: Send + Sync + 'static> SampleSubscriber<T> {
    fn tick(&self) {
        if self.core.gate.is_terminal() {
            return;
        }
        match self.mode {
            SampleMode::First => {
                // New window: the next arrival may pass
                self.open.store(true, Ordering::Release);
            }
            SampleMode::Last => {
                let held = self.held.lock().take();
                if let Some(value) = held
                    && self.demand.try_take(1)
                    && self.core.gate.accepts_next()
                {
                    self.downstream.on_next(value);
                }
            }
        }
    }

    fn disarm(&self) {
        if let Some(registration) = self.registration.lock().take() {
            registration.cancel();
        }
    }
}

struct SampleUpstream<T> {
    sampler: Arc<SampleSubscriber<T>>,
    fired: AtomicBool,
}

impl<T: Send + Sync + 'static> Upstream for SampleUpstream<T> {
    fn request(&self, n: u64) {
        match checked_request(n) {
            Ok(n) => {
                self.sampler.demand.add(n);
                if !self.fired.swap(true, Ordering::AcqRel) {
                    self.sampler.core.request_upstream(UNBOUNDED);
                }
            }
            Err(error) => {
                if self.sampler.core.gate.try_terminate(Lifecycle::Errored) {
                    self.sampler.disarm();
                    self.sampler.core.cancel_upstream();
                    self.sampler.downstream.on_error(error);
                } else {
                    drop_late_terminal(Some(&error));
                }
            }
        }
    }

    fn cancel(&self) {
        self.sampler.core.gate.try_terminate(Lifecycle::Cancelled);
        self.sampler.disarm();
        *self.sampler.held.lock() = None;
        self.sampler.core.cancel_upstream();
    }
}

impl<T: Send + Sync + 'static> Subscriber<T> for SampleSubscriber<T> {
    fn on_subscribe(&self, subscription: Subscription) {
        self.core.bind(&subscription);
    }

    fn on_next(&self, value: T) {
        if !self.core.gate.accepts_next() {
            return;
        }
        match self.mode {
            SampleMode::First => {
                if self.open.swap(false, Ordering::AcqRel) && self.demand.try_take(1) {
                    self.downstream.on_next(value);
                }
                // Later arrivals in this window are dropped
            }
            SampleMode::Last => {
                *self.held.lock() = Some(value);
            }
        }
    }

    fn on_error(&self, error: FlowError) {
        if self.core.gate.try_terminate(Lifecycle::Errored) {
            self.disarm();
            *self.held.lock() = None;
            self.downstream.on_error(error);
        } else {
            drop_late_terminal(Some(&error));
        }
    }

    fn on_complete(&self) {
        if self.core.gate.try_terminate(Lifecycle::Completed) {
            self.disarm();
            // A held candidate still flushes at completion
            let held = self.held.lock().take();
            if let Some(value) = held
                && self.demand.try_take(1)
            {
                self.downstream.on_next(value);
            }
            self.downstream.on_complete();
        } else {
            drop_late_terminal(None);
        }
    }
}

// ---------------------------------------------------------------------------
// timeout
// ---------------------------------------------------------------------------

/// Pass-through that fails with `Error(Timeout)` when no `Next` arrives
/// within `duration` of the previous activity.
pub struct TimeoutFlow<T> {
    source: Arc<dyn Publisher<T>>,
    duration: Duration,
    timer: Arc<TimerService>,
}

impl<T: Send + Sync + 'static> TimeoutFlow<T> {
    pub fn new(
        source: Arc<dyn Publisher<T>>,
        duration: Duration,
        timer: Arc<TimerService>,
    ) -> Self {
        Self {
            source,
            duration,
            timer,
        }
    }
}

struct TimeoutSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    duration: Duration,
    timer: Arc<TimerService>,
    core: Arc<EdgeCore>,
    watchdog: Mutex<Option<TimerRegistration>>,
    weak_self: std::sync::OnceLock<std::sync::Weak<TimeoutSubscriber<T>>>,
}

impl<T: Send + Sync + 'static> Publisher<T> for TimeoutFlow<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let timeout = Arc::new(TimeoutSubscriber {
            downstream: subscriber,
            duration: self.duration,
            timer: self.timer.clone(),
            core: Arc::new(EdgeCore::new()),
            watchdog: Mutex::new(None),
            weak_self: std::sync::OnceLock::new(),
        });
        let _ = timeout.weak_self.set(Arc::downgrade(&timeout));
        self.source.subscribe(timeout);
    }
}

impl<T: Send + Sync + 'static> TimeoutSubscriber<T> {
    /// Re-arms the watchdog, cancelling the previous registration.
    fn arm(&self) {
        let Some(weak) = self.weak_self.get() else {
            return;
        };
        let weak = weak.clone();
        let duration = self.duration;
        let mut watchdog = self.watchdog.lock();
        if let Some(previous) = watchdog.take() {
            previous.cancel();
        }
        *watchdog = Some(self.timer.schedule(
            move || {
                if let Some(timeout) = weak.upgrade() {
                    timeout.expire(duration);
                }
            },
            duration,
        ));
    }

    fn expire(&self, duration: Duration) {
        if self.core.gate.try_terminate(Lifecycle::Errored) {
            self.core.cancel_upstream();
            self.downstream.on_error(FlowError::Timeout(duration));
        }
    }

    fn disarm(&self) {
        if let Some(registration) = self.watchdog.lock().take() {
            registration.cancel();
        }
    }
}

impl<T: Send + Sync + 'static> Subscriber<T> for TimeoutSubscriber<T> {
    fn on_subscribe(&self, subscription: Subscription) {
        if self.core.bind(&subscription) {
            // The clock starts at subscription, not at the first element
            self.arm();
            self.downstream.on_subscribe(subscription);
        }
    }

    fn on_next(&self, value: T) {
        if !self.core.gate.accepts_next() {
            return;
        }
        self.downstream.on_next(value);
        self.arm();
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
