//! Work-stealing pool dispatcher: N workers pulling from one shared queue.
//!
//! Tasks may run in parallel and there is no ordering guarantee across
//! submissions, not even per submitter. Operators downstream of this
//! boundary must not rely on arrival order.

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

/// Multi-worker dispatcher over a shared MPMC queue.
pub struct PoolDispatcher {
    name: String,
    tx: flume::Sender<Job>,
    steal: flume::Receiver<Job>,
    policy: OverflowPolicy,
    accepting: AtomicBool,
    ctx: ContextId,
    workers: usize,
    latch: Arc<ShutdownLatch>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl PoolDispatcher {
    /// Unbounded queue drained by `workers` threads.
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        Self::with_queue(name, workers, None, OverflowPolicy::Block)
    }

    pub fn with_queue(
        name: impl Into<String>,
        workers: usize,
        capacity: Option<usize>,
        policy: OverflowPolicy,
    ) -> Self {
        assert!(workers > 0, "worker count must be positive");
        let name = name.into();
        let (tx, rx) = match capacity {
            Some(bound) => flume::bounded(bound),
            None => flume::unbounded(),
        };
        let ctx = ContextId::allocate();
        let latch = Arc::new(ShutdownLatch::new(workers));

        let handles = (0..workers)
            .map(|i| {
                let rx = rx.clone();
                let latch = latch.clone();
                let worker_name = format!("{name}-worker-{i}");
                thread::Builder::new()
                    .name(worker_name.clone())
                    .spawn(move || {
                        ctx.enter();
                        tracing::trace!(worker = %worker_name, "pool worker started");
                        for job in rx.iter() {
                            match job {
                                Job::Run(task) => task(),
                                Job::Stop => break,
                            }
                        }
                        latch.arrive();
                        tracing::trace!(worker = %worker_name, "pool worker stopped");
                    })
                    .expect("failed to spawn pool worker")
            })
            .collect();

        Self {
            name,
            tx,
            steal: rx,
            policy,
            accepting: AtomicBool::new(true),
            ctx,
            workers,
            latch,
            handles: Mutex::new(handles),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }
}

impl Dispatcher for PoolDispatcher {
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
            // One sentinel per worker, queued behind all accepted work
            for _ in 0..self.workers {
                let _ = self.tx.send(Job::Stop);
            }
        }
        let drained = self.latch.wait(timeout);
        if drained {
            for handle in self.handles.lock().drain(..) {
                let _ = handle.join();
            }
        }
        drained
    }
}
