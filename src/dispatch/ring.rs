//! Lock-free bounded ring dispatcher.
//!
//! A fixed-capacity ring of task slots drained by one consumer thread.
//! Capacity is a compile-time power of two so sequence numbers map to slots
//! with a bitwise AND.
//!
//! ```text
//!                  tail (producers claim here)
//!                  ↓
//! ┌───┬───┬───┬───┬───┬───┬───┬───┐
//! │ T │ T │ T │   │   │   │   │   │  Ring (N = 8)
//! └───┴───┴───┴───┴───┴───┴───┴───┘
//!   ↑
//!   head (consumer runs tasks from here)
//! ```
//!
//! ## Synchronization
//!
//! Producers and the consumer synchronize through per-slot sequence stamps
//! rather than by constantly loading each other's cursors:
//!
//! - Initial: slot index (`0, 1, 2, …, N-1`)
//! - After write: `tail + 1` (signals "task ready for the consumer")
//! - After run: `head + N` (signals "slot ready for the next writer lap")
//!
//! | Operation | Memory Ordering | Purpose |
//! |-----------|-----------------|---------|
//! | Load a stamp | `Acquire` | Observe the slot write it publishes |
//! | Store a stamp | `Release` | Publish the preceding slot write |
//! | Claim a ticket (multi-producer) | `Relaxed` CAS | Slot handoff is via stamps |
//!
//! In [`ProducerMode::Single`] the ticket counter is owned by one producer
//! and claimed with a plain store; in [`ProducerMode::Multi`] producers race
//! a compare-and-swap for tickets, which makes delivery per-producer FIFO.

use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use super::{
    Dispatcher, OverflowPolicy, Task, context::ContextId, latch::ShutdownLatch,
    wait::{WaitSignal, WaitStrategy},
};
use crate::error::FlowError;

/// How many threads may submit concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProducerMode {
    /// Exactly one submitting thread; ticket claims are plain stores.
    Single,
    /// Any number of submitting threads; ticket claims race a CAS.
    #[default]
    Multi,
}

/// A slot with a sequence stamp for Vyukov-style synchronization.
struct Slot<T> {
    /// See the module docs for the stamp protocol.
    stamp: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new(stamp: usize) -> Self {
        Self {
            stamp: AtomicUsize::new(stamp),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    #[inline]
    fn load_stamp(&self) -> usize {
        self.stamp.load(Ordering::Acquire)
    }

    #[inline]
    fn store_stamp(&self, stamp: usize) {
        self.stamp.store(stamp, Ordering::Release);
    }

    /// # Safety
    /// - Caller must hold the claimed ticket for this slot (no concurrent
    ///   access) and must not overwrite an unread value.
    #[inline]
    unsafe fn write(&self, value: T) {
        unsafe { std::ptr::write((*self.value.get()).as_mut_ptr(), value) };
    }

    /// # Safety
    /// - The slot must contain initialized data, observed via its stamp.
    #[inline]
    unsafe fn read(&self) -> T {
        unsafe { std::ptr::read((*self.value.get()).as_ptr()) }
    }

    /// # Safety
    /// - The slot must contain initialized data that will not be read again.
    #[inline]
    unsafe fn drop_in_place(&self) {
        unsafe { std::ptr::drop_in_place((*self.value.get()).as_mut_ptr()) };
    }
}

struct Core<const N: usize> {
    slots: [Slot<Task>; N],
    /// Next publish ticket. Multi-producer: CAS-claimed; single: plain store.
    tail: CachePadded<AtomicUsize>,
    /// Consumer cursor, only modified by the consumer thread.
    head: CachePadded<AtomicUsize>,
    accepting: CachePadded<AtomicBool>,
    /// Set when shutdown gave up draining; the consumer exits immediately.
    force_stop: AtomicBool,
    mode: ProducerMode,
    wait: WaitStrategy,
    policy: OverflowPolicy,
    signal: WaitSignal,
}

// Slots hold `UnsafeCell`s, but access is handed off through the stamp
// protocol: a slot is touched by exactly one thread between stamp updates.
unsafe impl<const N: usize> Sync for Core<N> {}
unsafe impl<const N: usize> Send for Core<N> {}

impl<const N: usize> Core<N> {
    const MASK: usize = N - 1;

    #[inline]
    fn slot(&self, seq: usize) -> &Slot<Task> {
        &self.slots[seq & Self::MASK]
    }

    /// Claims a ticket and writes the task. `Err(task)` when the ring is
    /// full (the caller applies the overflow policy).
    fn try_publish(&self, task: Task) -> Result<(), Task> {
        match self.mode {
            ProducerMode::Single => {
                // Single producer: the only thread modifying `tail`
                let tail = self.tail.load(Ordering::Relaxed);
                let slot = self.slot(tail);
                if slot.load_stamp() != tail {
                    // One full lap behind: slow consumer
                    return Err(task);
                }
                unsafe { slot.write(task) };
                slot.store_stamp(tail.wrapping_add(1));
                self.tail.store(tail.wrapping_add(1), Ordering::Release);
                Ok(())
            }
            ProducerMode::Multi => {
                loop {
                    let tail = self.tail.load(Ordering::Relaxed);
                    let slot = self.slot(tail);
                    let stamp = slot.load_stamp();
                    // Wrapping-safe signed distance between stamp and ticket
                    let diff = stamp.wrapping_sub(tail) as isize;
                    if diff == 0 {
                        // Free slot: race for the ticket
                        if self
                            .tail
                            .compare_exchange_weak(
                                tail,
                                tail.wrapping_add(1),
                                Ordering::Relaxed,
                                Ordering::Relaxed,
                            )
                            .is_ok()
                        {
                            unsafe { slot.write(task) };
                            slot.store_stamp(tail.wrapping_add(1));
                            return Ok(());
                        }
                        // Lost the ticket race; retry with the new tail
                    } else if diff < 0 {
                        return Err(task);
                    } else {
                        // Another producer claimed this ticket and has not
                        // stamped yet; retry
                        std::hint::spin_loop();
                    }
                }
            }
        }
    }

    /// Consumer: runs one task if ready. Only called from the worker thread.
    fn try_consume(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let slot = self.slot(head);
        if slot.load_stamp() != head.wrapping_add(1) {
            return false;
        }
        // Safe: the stamp says a producer finished writing this slot
        let task = unsafe { slot.read() };
        // Free the slot for the next writer lap
        slot.store_stamp(head.wrapping_add(N));
        self.head.store(head.wrapping_add(1), Ordering::Release);
        if self.policy == OverflowPolicy::Block {
            // A producer may be parked on a full ring
            self.signal.notify();
        }
        task();
        true
    }

    fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed) == self.tail.load(Ordering::Acquire)
    }
}

impl<const N: usize> Drop for Core<N> {
    fn drop(&mut self) {
        // Unexecuted tasks are found via the stamp protocol: a slot holds
        // data when its stamp is one ahead of its index position on the
        // current lap
        for (i, slot) in self.slots.iter().enumerate() {
            // Relaxed is fine: &mut self guarantees exclusive access
            let stamp = slot.stamp.load(Ordering::Relaxed);
            if (stamp & Self::MASK) == ((i + 1) & Self::MASK) {
                unsafe { slot.drop_in_place() };
            }
        }
    }
}

/// Bounded lock-free dispatcher with a dedicated consumer thread.
///
/// `N` must be a power of two.
pub struct RingDispatcher<const N: usize> {
    name: String,
    core: Arc<Core<N>>,
    ctx: ContextId,
    latch: Arc<ShutdownLatch>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<const N: usize> RingDispatcher<N> {
    const N_POWER_OF_2: bool = N.is_power_of_two();

    pub fn new(
        name: impl Into<String>,
        mode: ProducerMode,
        wait: WaitStrategy,
        policy: OverflowPolicy,
    ) -> Self {
        assert!(Self::N_POWER_OF_2, "N must be power of 2");
        assert!(N >= 2, "N must be at least 2");
        assert!(
            policy != OverflowPolicy::DropOldest,
            "ring dispatcher cannot evict the queue head"
        );
        let name = name.into();
        let core = Arc::new(Core {
            slots: std::array::from_fn(Slot::new),
            tail: CachePadded::new(AtomicUsize::new(0)),
            head: CachePadded::new(AtomicUsize::new(0)),
            accepting: CachePadded::new(AtomicBool::new(true)),
            force_stop: AtomicBool::new(false),
            mode,
            wait,
            policy,
            signal: WaitSignal::new(),
        });
        let ctx = ContextId::allocate();
        let latch = Arc::new(ShutdownLatch::new(1));

        let worker = {
            let core = core.clone();
            let latch = latch.clone();
            let worker_name = format!("{name}-ring");
            thread::Builder::new()
                .name(worker_name.clone())
                .spawn(move || {
                    ctx.enter();
                    tracing::trace!(worker = %worker_name, capacity = N, "ring consumer started");
                    let mut spins = 0u32;
                    loop {
                        // Force-stop preempts the backlog; a clean shutdown
                        // drains it first
                        if core.force_stop.load(Ordering::Acquire) {
                            break;
                        }
                        if core.try_consume() {
                            spins = 0;
                            continue;
                        }
                        if !core.accepting.load(Ordering::Acquire) && core.is_empty() {
                            break;
                        }
                        core.wait.idle(&mut spins, &core.signal);
                    }
                    latch.arrive();
                    tracing::trace!(worker = %worker_name, "ring consumer stopped");
                })
                .expect("failed to spawn ring consumer")
        };

        Self {
            name,
            core,
            ctx,
            latch,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Dispatcher for RingDispatcher<N> {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, task: Task) -> Result<(), FlowError> {
        if !self.core.accepting.load(Ordering::Acquire) {
            return Err(FlowError::overflow(&self.name));
        }

        let mut task = task;
        let mut spins = 0u32;
        loop {
            match self.core.try_publish(task) {
                Ok(()) => {
                    if self.core.wait == WaitStrategy::Blocking {
                        self.core.signal.notify();
                    }
                    return Ok(());
                }
                Err(back) => match self.core.policy {
                    OverflowPolicy::Error => {
                        return Err(FlowError::overflow(&self.name));
                    }
                    OverflowPolicy::DropNewest => {
                        tracing::trace!(dispatcher = %self.name, "ring full, dropping newest task");
                        return Ok(());
                    }
                    // Block: idle and retry, bailing out if the dispatcher
                    // shuts down underneath us
                    _ => {
                        if !self.core.accepting.load(Ordering::Acquire) {
                            return Err(FlowError::overflow(&self.name));
                        }
                        self.core.wait.idle(&mut spins, &self.core.signal);
                        task = back;
                    }
                },
            }
        }
    }

    fn in_context(&self) -> bool {
        self.ctx.is_current()
    }

    fn shutdown(&self, timeout: Duration) -> bool {
        self.core.accepting.store(false, Ordering::Release);
        self.core.signal.notify();
        let drained = self.latch.wait(timeout);
        if !drained {
            // Give up on the backlog; remaining tasks are dropped when the
            // core drops
            self.core.force_stop.store(true, Ordering::Release);
            self.core.signal.notify();
        } else if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        drained
    }
}

macro_rules! define_capacity_aliases {
    ($($n:literal),* $(,)?) => {
        paste::paste! {
            $(
                #[doc = concat!("Ring dispatcher with capacity ", $n, ".")]
                pub type [<RingDispatcher $n>] = RingDispatcher<$n>;
            )*
        }
    };
}

// Aliases for the capacities the environment factory rounds to
define_capacity_aliases!(2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192);

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    /// Single-producer delivery preserves submission order
    #[test]
    fn test_single_producer_fifo() {
        const TASKS: usize = 5_000;
        let dispatcher = RingDispatcher::<64>::new(
            "spsc",
            ProducerMode::Single,
            WaitStrategy::Blocking,
            OverflowPolicy::Block,
        );
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..TASKS {
            let seen = seen.clone();
            dispatcher
                .dispatch(Box::new(move || seen.lock().push(i)))
                .unwrap();
        }

        assert!(dispatcher.shutdown(Duration::from_secs(5)));
        let seen = seen.lock();
        assert_eq!(seen.len(), TASKS);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    /// Multi-producer mode loses no tasks under contention and keeps
    /// per-producer order
    #[test]
    fn test_multi_producer() {
        const PER_PRODUCER: usize = 2_000;
        const PRODUCERS: usize = 4;
        let dispatcher = Arc::new(RingDispatcher::<256>::new(
            "mpsc",
            ProducerMode::Multi,
            WaitStrategy::Yielding,
            OverflowPolicy::Block,
        ));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let dispatcher = dispatcher.clone();
                let seen = seen.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let seen = seen.clone();
                        dispatcher
                            .dispatch(Box::new(move || seen.lock().push((p, i))))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in producers {
            handle.join().unwrap();
        }

        assert!(dispatcher.shutdown(Duration::from_secs(5)));
        let seen = seen.lock();
        assert_eq!(seen.len(), PER_PRODUCER * PRODUCERS);
        for p in 0..PRODUCERS {
            let per: Vec<_> = seen.iter().filter(|(owner, _)| *owner == p).collect();
            assert!(per.windows(2).all(|w| w[0].1 < w[1].1));
        }
    }

    /// The `Error` policy surfaces overflow when the consumer cannot keep up
    #[test]
    fn test_overflow_error() {
        let dispatcher = RingDispatcher::<2>::new(
            "tiny-ring",
            ProducerMode::Multi,
            WaitStrategy::BusySpin,
            OverflowPolicy::Error,
        );
        let (block_tx, block_rx) = crossbeam_channel::bounded::<()>(0);

        dispatcher
            .dispatch(Box::new(move || {
                let _ = block_rx.recv();
            }))
            .unwrap();

        let mut overflowed = false;
        for _ in 0..64 {
            if dispatcher.dispatch(Box::new(|| {})).is_err() {
                overflowed = true;
                break;
            }
        }
        assert!(overflowed);
        block_tx.send(()).unwrap();
        dispatcher.shutdown(Duration::from_secs(1));
    }

    /// Unexecuted tasks are dropped (not leaked) when the ring is abandoned
    #[test]
    fn test_drop_unexecuted_tasks() {
        struct DropCounter(Arc<AtomicUsize>);
        impl Drop for DropCounter {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let dispatcher = RingDispatcher::<8>::new(
                "leak-check",
                ProducerMode::Multi,
                WaitStrategy::Blocking,
                OverflowPolicy::Error,
            );
            let (block_tx, block_rx) = crossbeam_channel::bounded::<()>(0);
            dispatcher
                .dispatch(Box::new(move || {
                    let _ = block_rx.recv_timeout(Duration::from_secs(2));
                }))
                .unwrap();
            thread::sleep(Duration::from_millis(50));

            for _ in 0..4 {
                let counter = DropCounter(drops.clone());
                let _ = dispatcher.dispatch(Box::new(move || {
                    // Keeps the counter alive inside the unexecuted task
                    let _held = &counter;
                }));
            }

            // Abandon without draining
            assert!(!dispatcher.shutdown(Duration::from_millis(50)));
            drop(block_tx);
            thread::sleep(Duration::from_millis(100));
        }
        assert_eq!(drops.load(Ordering::SeqCst), 4);
    }
}
