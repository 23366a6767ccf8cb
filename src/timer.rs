//! Monotonic timer service driving the time-based operators.
//!
//! One dedicated thread owns a min-heap of deadlines and parks on a condvar
//! until the earliest one is due. Registered callbacks run on the timer's
//! own thread and must be cheap (operators take a short mutex or post a task
//! to a dispatcher).
//!
//! Periodic registrations fire at `origin + k·period`, offsets from the
//! registration instant rather than from the previous fire, so drift stays
//! bounded. A fire that comes due while the thread is behind is skipped
//! forward to the next future offset instead of bursting.

use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::error::catch_user;

/// Default minimum resolution: delays and periods are clamped up to this.
pub const DEFAULT_RESOLUTION: Duration = Duration::from_millis(50);

type TimerTask = Arc<dyn Fn() + Send + Sync>;

enum Schedule {
    Once,
    Periodic {
        origin: Instant,
        period: Duration,
        iteration: u32,
    },
}

struct Entry {
    due: Instant,
    /// Tie-break so equal deadlines fire in registration order.
    seq: u64,
    schedule: Schedule,
    handle: Arc<Handle>,
    task: TimerTask,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest deadline
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Handle {
    cancelled: AtomicBool,
}

/// Cancellation handle for a scheduled task.
///
/// `cancel` is idempotent; a fire already in flight may still complete once.
#[derive(Clone)]
pub struct TimerRegistration {
    handle: Arc<Handle>,
}

impl TimerRegistration {
    pub fn cancel(&self) {
        self.handle.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.cancelled.load(Ordering::Acquire)
    }
}

struct Inner {
    queue: Mutex<BinaryHeap<Entry>>,
    cond: Condvar,
    running: AtomicBool,
    next_seq: AtomicU64,
    resolution: Duration,
}

/// Monotonic scheduler with a dedicated thread.
pub struct TimerService {
    inner: Arc<Inner>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TimerService {
    pub fn new() -> Self {
        Self::with_resolution(DEFAULT_RESOLUTION)
    }

    /// A smaller resolution trades CPU for precision; tests use it to keep
    /// deadlines short.
    pub fn with_resolution(resolution: Duration) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(BinaryHeap::new()),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
            next_seq: AtomicU64::new(0),
            resolution,
        });

        let worker = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("corrente-timer".into())
                .spawn(move || run(&inner))
                .expect("failed to spawn timer thread")
        };

        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// One-shot. `delay` is clamped up to the resolution.
    pub fn schedule(
        &self,
        task: impl Fn() + Send + Sync + 'static,
        delay: Duration,
    ) -> TimerRegistration {
        let delay = delay.max(self.inner.resolution);
        self.push(Arc::new(task), Instant::now() + delay, Schedule::Once)
    }

    /// Recurring, first fire after `initial_delay`, then every `period`
    /// measured from the registration instant.
    pub fn schedule_periodic(
        &self,
        task: impl Fn() + Send + Sync + 'static,
        initial_delay: Duration,
        period: Duration,
    ) -> TimerRegistration {
        let period = period.max(self.inner.resolution);
        let initial_delay = initial_delay.max(self.inner.resolution);
        let origin = Instant::now();
        self.push(
            Arc::new(task),
            origin + initial_delay,
            Schedule::Periodic {
                origin,
                period,
                iteration: 0,
            },
        )
    }

    fn push(&self, task: TimerTask, due: Instant, schedule: Schedule) -> TimerRegistration {
        let handle = Arc::new(Handle {
            cancelled: AtomicBool::new(false),
        });
        let entry = Entry {
            due,
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            schedule,
            handle: handle.clone(),
            task,
        };
        self.inner.queue.lock().push(entry);
        self.inner.cond.notify_all();
        TimerRegistration { handle }
    }

    /// Stops the timer thread. Pending registrations are discarded.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.cond.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(inner: &Inner) {
    tracing::trace!("timer thread started");
    while inner.running.load(Ordering::Acquire) {
        let mut queue = inner.queue.lock();
        let now = Instant::now();

        // Deadline copied out so the heap is not borrowed across the pop
        let next_due = queue.peek().map(|entry| entry.due);
        let popped = match next_due {
            None => {
                inner.cond.wait(&mut queue);
                continue;
            }
            Some(due) if due > now => {
                let _ = inner.cond.wait_until(&mut queue, due);
                continue;
            }
            Some(_) => queue.pop(),
        };
        drop(queue);

        let Some(mut entry) = popped else { continue };
        if entry.handle.cancelled.load(Ordering::Acquire) {
            continue;
        }

        // Callbacks never unwind into the scheduling loop
        if let Err(error) = catch_user(|| (entry.task)()) {
            tracing::warn!(%error, "timer callback failed");
        }

        if let Schedule::Periodic {
            origin,
            period,
            ref mut iteration,
        } = entry.schedule
        {
            if !entry.handle.cancelled.load(Ordering::Acquire) {
                // Next wall-clock offset from registration; skip offsets the
                // thread has already fallen past
                let now = Instant::now();
                loop {
                    *iteration += 1;
                    entry.due = origin + period * *iteration;
                    if entry.due > now {
                        break;
                    }
                }
                inner.queue.lock().push(entry);
            }
        }
    }
    tracing::trace!("timer thread stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn fast_timer() -> TimerService {
        TimerService::with_resolution(Duration::from_millis(1))
    }

    /// A one-shot fires once, roughly at its deadline
    #[test]
    fn test_one_shot() {
        let timer = fast_timer();
        let fired = Arc::new(AtomicUsize::new(0));
        let sink = fired.clone();

        let start = Instant::now();
        timer.schedule(
            move || {
                sink.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(20),
        );

        thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    /// Periodic registrations keep firing until cancelled, and cancellation
    /// is idempotent
    #[test]
    fn test_periodic_and_cancel() {
        let timer = fast_timer();
        let fired = Arc::new(AtomicUsize::new(0));
        let sink = fired.clone();

        let registration = timer.schedule_periodic(
            move || {
                sink.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(5),
            Duration::from_millis(5),
        );

        thread::sleep(Duration::from_millis(100));
        registration.cancel();
        registration.cancel();
        let after_cancel = fired.load(Ordering::SeqCst);
        assert!(after_cancel >= 3, "expected several fires, got {after_cancel}");

        thread::sleep(Duration::from_millis(50));
        // At most one in-flight fire may land after cancel
        assert!(fired.load(Ordering::SeqCst) <= after_cancel + 1);
    }

    /// A cancelled one-shot never fires
    #[test]
    fn test_cancel_before_fire() {
        let timer = fast_timer();
        let fired = Arc::new(AtomicUsize::new(0));
        let sink = fired.clone();

        let registration = timer.schedule(
            move || {
                sink.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(50),
        );
        registration.cancel();

        thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    /// A panicking callback does not kill the timer thread
    #[test]
    fn test_callback_panic_contained() {
        let timer = fast_timer();
        timer.schedule(|| panic!("tick gone wrong"), Duration::from_millis(5));

        let fired = Arc::new(AtomicUsize::new(0));
        let sink = fired.clone();
        timer.schedule(
            move || {
                sink.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(20),
        );

        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    /// Deadlines fire in order even when registered out of order
    #[test]
    fn test_deadline_ordering() {
        let timer = fast_timer();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, delay_ms) in [("late", 60u64), ("early", 15), ("middle", 35)] {
            let order = order.clone();
            timer.schedule(
                move || order.lock().push(label),
                Duration::from_millis(delay_ms),
            );
        }

        thread::sleep(Duration::from_millis(150));
        assert_eq!(*order.lock(), vec!["early", "middle", "late"]);
    }
}
