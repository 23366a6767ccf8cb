//! Environment: the explicit registry of named dispatchers and the shared
//! timer service.
//!
//! The environment is an ordinary object threaded through construction —
//! there is no process-global registry in the core. Code that wants a
//! default can create one `Environment` at its own top level and pass it
//! down.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::{Mutex, RwLock};

use crate::{
    dispatch::{
        CallerDispatcher, Dispatcher, OverflowPolicy, PoolDispatcher, ProducerMode,
        RingDispatcher, ThreadDispatcher, WaitStrategy,
    },
    error::FlowError,
    timer::{DEFAULT_RESOLUTION, TimerService},
};

/// Which dispatcher implementation a [`DispatcherConfig`] builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatcherKind {
    /// Inline on the caller ([`CallerDispatcher`]).
    Caller,
    /// One worker, global FIFO ([`ThreadDispatcher`]).
    #[default]
    Thread,
    /// Worker pool, no ordering ([`PoolDispatcher`]).
    Pool,
    /// Bounded lock-free ring ([`RingDispatcher`]).
    Ring,
}

/// Factory settings for a named dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub name: String,
    pub kind: DispatcherKind,
    pub worker_count: usize,
    /// `None` = unbounded (queue-backed kinds only; rings are always
    /// bounded and round up to a power of two).
    pub queue_size: Option<usize>,
    pub producer_type: ProducerMode,
    pub wait_strategy: WaitStrategy,
    pub overflow: OverflowPolicy,
}

impl DispatcherConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DispatcherKind::default(),
            worker_count: 1,
            queue_size: None,
            producer_type: ProducerMode::default(),
            wait_strategy: WaitStrategy::default(),
            overflow: OverflowPolicy::default(),
        }
    }

    pub fn kind(mut self, kind: DispatcherKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self
    }

    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = Some(size);
        self
    }

    pub fn producer_type(mut self, mode: ProducerMode) -> Self {
        self.producer_type = mode;
        self
    }

    pub fn wait_strategy(mut self, strategy: WaitStrategy) -> Self {
        self.wait_strategy = strategy;
        self
    }

    pub fn overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = policy;
        self
    }
}

const DEFAULT_RING_CAPACITY: usize = 1024;

/// Builds a ring dispatcher for the nearest power-of-two capacity.
fn build_ring(config: &DispatcherConfig) -> Arc<dyn Dispatcher> {
    let requested = config.queue_size.unwrap_or(DEFAULT_RING_CAPACITY);
    let capacity = requested.next_power_of_two().clamp(2, 8192);
    macro_rules! ring_for {
        ($($n:literal),* $(,)?) => {
            match capacity {
                $(
                    $n => Arc::new(RingDispatcher::<$n>::new(
                        config.name.clone(),
                        config.producer_type,
                        config.wait_strategy,
                        config.overflow,
                    )) as Arc<dyn Dispatcher>,
                )*
                _ => unreachable!("capacity clamped to a covered power of two"),
            }
        };
    }
    ring_for!(2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192)
}

struct EnvironmentInner {
    dispatchers: RwLock<HashMap<String, Arc<dyn Dispatcher>>>,
    timer: Mutex<Option<Arc<TimerService>>>,
    timer_resolution: Duration,
}

/// Shared handle to a dispatcher registry + timer.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvironmentInner>,
}

impl Environment {
    pub fn new() -> Self {
        Self::with_timer_resolution(DEFAULT_RESOLUTION)
    }

    pub fn with_timer_resolution(resolution: Duration) -> Self {
        Self {
            inner: Arc::new(EnvironmentInner {
                dispatchers: RwLock::new(HashMap::new()),
                timer: Mutex::new(None),
                timer_resolution: resolution,
            }),
        }
    }

    /// Builds a dispatcher from `config` and registers it under its name.
    /// Fails when the name is already taken.
    pub fn create(&self, config: DispatcherConfig) -> Result<Arc<dyn Dispatcher>, FlowError> {
        let dispatcher: Arc<dyn Dispatcher> = match config.kind {
            DispatcherKind::Caller => Arc::new(CallerDispatcher::new(config.name.clone())),
            DispatcherKind::Thread => Arc::new(ThreadDispatcher::with_queue(
                config.name.clone(),
                config.queue_size,
                config.overflow,
            )),
            DispatcherKind::Pool => Arc::new(PoolDispatcher::with_queue(
                config.name.clone(),
                config.worker_count,
                config.queue_size,
                config.overflow,
            )),
            DispatcherKind::Ring => build_ring(&config),
        };
        self.register(config.name, dispatcher.clone())?;
        Ok(dispatcher)
    }

    /// Registers an externally-built dispatcher under `name`.
    pub fn register(
        &self,
        name: impl Into<String>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<(), FlowError> {
        let name = name.into();
        let mut dispatchers = self.inner.dispatchers.write();
        if dispatchers.contains_key(&name) {
            return Err(FlowError::IllegalArgument(format!(
                "dispatcher `{name}` is already registered"
            )));
        }
        dispatchers.insert(name, dispatcher);
        Ok(())
    }

    /// Looks up a dispatcher by name.
    pub fn dispatcher(&self, name: &str) -> Option<Arc<dyn Dispatcher>> {
        self.inner.dispatchers.read().get(name).cloned()
    }

    /// The shared timer service, started on first use.
    pub fn timer(&self) -> Arc<TimerService> {
        let mut timer = self.inner.timer.lock();
        timer
            .get_or_insert_with(|| {
                Arc::new(TimerService::with_resolution(self.inner.timer_resolution))
            })
            .clone()
    }

    /// Drains every registered dispatcher (each gets `timeout`) and stops
    /// the timer. Returns whether all queues drained cleanly.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let dispatchers: Vec<_> = {
            let mut map = self.inner.dispatchers.write();
            map.drain().collect()
        };
        let mut clean = true;
        for (name, dispatcher) in dispatchers {
            if !dispatcher.shutdown(timeout) {
                tracing::warn!(dispatcher = %name, "queue did not drain before timeout");
                clean = false;
            }
        }
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.shutdown();
        }
        clean
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}
