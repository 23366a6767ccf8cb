//! Single-threaded dispatcher: one worker draining a FIFO queue.
//!
//! ```text
//!  ┌─────────────┐      flume channel      ┌────────────────┐
//!  │  Operators   │ ──────  Job  ─────────► │  Worker thread  │
//!  │ (any thread) │                         │  (single)       │
//!  └─────────────┘                         └────────────────┘
//! ```
//!
//! Global FIFO: tasks run in the exact order their submissions were
//! accepted, regardless of the submitting thread. This is the ordered
//! boundary most operator graphs shift their downstream work onto.
//!
//! Shutdown enqueues a `Stop` sentinel behind all accepted work, so the
//! drain is complete precisely when the worker reaches the sentinel.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;

use super::{
    Dispatcher, OverflowPolicy, Task, context::ContextId, latch::ShutdownLatch,
};
use crate::error::FlowError;

enum Job {
    Run(Task),
    Stop,
}

/// FIFO dispatcher owning a single named worker thread.
pub struct ThreadDispatcher {
    name: String,
    tx: flume::Sender<Job>,
    /// Producer-side handle used only by the `DropOldest` policy to evict
    /// the head of a full queue.
    steal: flume::Receiver<Job>,
    policy: OverflowPolicy,
    accepting: AtomicBool,
    ctx: ContextId,
    latch: Arc<ShutdownLatch>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ThreadDispatcher {
    /// Unbounded FIFO queue; submissions never block.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_queue(name, None, OverflowPolicy::Block)
    }

    /// Bounded queue (`capacity = Some(n)`) with the given overflow policy.
    pub fn with_queue(
        name: impl Into<String>,
        capacity: Option<usize>,
        policy: OverflowPolicy,
    ) -> Self {
        let name = name.into();
        let (tx, rx) = match capacity {
            Some(bound) => flume::bounded(bound),
            None => flume::unbounded(),
        };
        let ctx = ContextId::allocate();
        let latch = Arc::new(ShutdownLatch::new(1));

        let worker = {
            let rx = rx.clone();
            let latch = latch.clone();
            let worker_name = format!("{name}-worker");
            thread::Builder::new()
                .name(worker_name.clone())
                .spawn(move || {
                    ctx.enter();
                    tracing::trace!(worker = %worker_name, "dispatcher worker started");
                    for job in rx.iter() {
                        match job {
                            Job::Run(task) => task(),
                            Job::Stop => break,
                        }
                    }
                    latch.arrive();
                    tracing::trace!(worker = %worker_name, "dispatcher worker stopped");
                })
                .expect("failed to spawn dispatcher worker")
        };

        Self {
            name,
            tx,
            steal: rx,
            policy,
            accepting: AtomicBool::new(true),
            ctx,
            latch,
            worker: Mutex::new(Some(worker)),
        }
    }
}

impl Dispatcher for ThreadDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, task: Task) -> Result<(), FlowError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(FlowError::overflow(&self.name));
        }

        let mut job = Job::Run(task);
        match self.policy {
            OverflowPolicy::Block => self
                .tx
                .send(job)
                .map_err(|_| FlowError::overflow(&self.name)),
            OverflowPolicy::Error => match self.tx.try_send(job) {
                Ok(()) => Ok(()),
                Err(_) => Err(FlowError::overflow(&self.name)),
            },
            OverflowPolicy::DropNewest => match self.tx.try_send(job) {
                Ok(()) => Ok(()),
                Err(flume::TrySendError::Full(_)) => {
                    tracing::trace!(dispatcher = %self.name, "queue full, dropping newest task");
                    Ok(())
                }
                Err(flume::TrySendError::Disconnected(_)) => {
                    Err(FlowError::overflow(&self.name))
                }
            },
            OverflowPolicy::DropOldest => loop {
                match self.tx.try_send(job) {
                    Ok(()) => return Ok(()),
                    Err(flume::TrySendError::Full(back)) => {
                        // Evict the head; the worker may win the race, in
                        // which case the queue has space anyway
                        let _ = self.steal.try_recv();
                        job = back;
                    }
                    Err(flume::TrySendError::Disconnected(_)) => {
                        return Err(FlowError::overflow(&self.name));
                    }
                }
            },
        }
    }

    fn in_context(&self) -> bool {
        self.ctx.is_current()
    }

    fn shutdown(&self, timeout: Duration) -> bool {
        if self.accepting.swap(false, Ordering::AcqRel) {
            // FIFO puts the sentinel behind every accepted task
            let _ = self.tx.send(Job::Stop);
        }
        let drained = self.latch.wait(timeout);
        if drained {
            if let Some(handle) = self.worker.lock().take() {
                let _ = handle.join();
            }
        }
        drained
    }
}
