//! Wait strategies for ring consumers and blocked producers.
//!
//! The strategy decides what a thread does when it finds no work (consumer)
//! or no space (producer on a full ring under the `Block` policy):
//!
//! | Strategy | Behavior | Best when |
//! |----------|----------|-----------|
//! | `BusySpin` | `hint::spin_loop` | Lowest latency, dedicated cores |
//! | `Yielding` | spin briefly, then `thread::yield_now` | Latency-sensitive, shared cores |
//! | `Sleeping` | spin, yield, then park ~50µs | Throughput with idle periods |
//! | `Blocking` | park on a condvar, woken per publish | Mostly-idle queues |
//!
//! `BusySpin` favors minimal latency over fairness and avoids
//! `thread::yield_now`, which may enter the scheduler and potentially
//! deschedule the thread.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// How a ring participant idles while waiting for progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitStrategy {
    /// Park on a condvar until a publish wakes the thread.
    #[default]
    Blocking,
    /// Spin with a CPU pause hint, never descheduling.
    BusySpin,
    /// Spin briefly, then yield the scheduler slice.
    Yielding,
    /// Spin, yield, then sleep in short increments.
    Sleeping,
}

const SPIN_LIMIT: u32 = 128;
const YIELD_LIMIT: u32 = 160;
const SLEEP_STEP: Duration = Duration::from_micros(50);

/// Condvar the `Blocking` strategy parks on; publishers signal it after
/// every store.
pub(crate) struct WaitSignal {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitSignal {
    pub(crate) fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        // Take the lock so a waiter between its recheck and `wait` cannot
        // miss the notification
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    fn park(&self) {
        let mut guard = self.lock.lock();
        // Bounded so a lost wakeup degrades to latency, never to a hang
        let _ = self.cond.wait_for(&mut guard, Duration::from_millis(1));
    }
}

impl WaitStrategy {
    /// One idle step. `spins` is the caller-owned backoff counter, reset on
    /// progress.
    pub(crate) fn idle(self, spins: &mut u32, signal: &WaitSignal) {
        match self {
            WaitStrategy::BusySpin => std::hint::spin_loop(),
            WaitStrategy::Yielding => {
                if *spins < SPIN_LIMIT {
                    *spins += 1;
                    std::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
            }
            WaitStrategy::Sleeping => {
                if *spins < SPIN_LIMIT {
                    *spins += 1;
                    std::hint::spin_loop();
                } else if *spins < YIELD_LIMIT {
                    *spins += 1;
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(SLEEP_STEP);
                }
            }
            WaitStrategy::Blocking => signal.park(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;

    /// A parked blocking waiter is released by `notify`
    #[test]
    fn test_blocking_wakeup() {
        let signal = Arc::new(WaitSignal::new());
        let released = Arc::new(AtomicBool::new(false));

        let waiter = {
            let signal = signal.clone();
            let released = released.clone();
            std::thread::spawn(move || {
                let mut spins = 0;
                while !released.load(Ordering::Acquire) {
                    WaitStrategy::Blocking.idle(&mut spins, &signal);
                }
            })
        };

        released.store(true, Ordering::Release);
        signal.notify();
        waiter.join().unwrap();
    }

    /// The sleeping strategy escalates through its backoff phases without
    /// losing the counter
    #[test]
    fn test_backoff_progression() {
        let signal = WaitSignal::new();
        let mut spins = 0;
        for _ in 0..(YIELD_LIMIT + 4) {
            WaitStrategy::Sleeping.idle(&mut spins, &signal);
        }
        assert_eq!(spins, YIELD_LIMIT);
    }
}
