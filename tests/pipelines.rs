//! End-to-end pipeline scenarios across operators, dispatchers and timers.

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use corrente::{Collector, Dispatcher, Flow, PoolDispatcher, TimerService};
use parking_lot::Mutex;

/// Opt-in diagnostics: `RUST_LOG=corrente=trace cargo test` shows worker
/// lifecycles and dropped-signal warnings.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Polls `check` until it returns true or the deadline passes.
fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

/// Map and sum: parse strings, emit the running total.
#[test]
fn map_and_sum() {
    let collector = Collector::unbounded();
    Flow::just(["1", "2", "3", "4", "5"])
        .map(|s: &str| s.parse::<i64>().unwrap_or(0))
        .scan(0i64, |acc, n| acc + n)
        .subscribe(collector.clone());

    assert_eq!(
        collector.await_complete(Duration::from_secs(2)),
        vec![1, 3, 6, 10, 15]
    );
}

/// Filter evens then fold them into a single sum.
#[test]
fn filter_evens_then_fold() {
    let collector = Collector::unbounded();
    Flow::just(["1", "2", "3", "4", "5"])
        .map(|s: &str| s.parse::<i64>().unwrap_or(0))
        .filter(|n| n % 2 == 0)
        .reduce(0i64, |acc, n| acc + n)
        .subscribe(collector.clone());

    assert_eq!(collector.await_complete(Duration::from_secs(2)), vec![6]);
}

/// Merge two sources and multiply everything together.
#[test]
fn merge_and_multiply() {
    let collector = Collector::unbounded();
    Flow::merge([Flow::just(["1", "2"]), Flow::just(["3", "4", "5"])])
        .map(|s: &str| s.parse::<i64>().unwrap_or(0))
        .reduce(1i64, |acc, n| acc * n)
        .subscribe(collector.clone());

    assert_eq!(collector.await_complete(Duration::from_secs(2)), vec![120]);
}

/// Partitioned fan-out over a pool dispatcher sees every element exactly
/// once.
#[test]
fn partition_preserves_count() {
    const TOTAL: usize = 10_000;

    init_tracing();
    let pool: Arc<dyn Dispatcher> = Arc::new(PoolDispatcher::new("partition-pool", 4));
    let (broadcaster, flow) = Flow::<i64>::broadcast();

    let outer = Collector::unbounded();
    flow.partition(2).subscribe(outer.clone());
    let lanes = outer.await_complete(Duration::from_secs(2));
    assert_eq!(lanes.len(), 2);

    let seen = Arc::new(Mutex::new(HashSet::new()));
    let duplicates = Arc::new(AtomicUsize::new(0));
    let count = Arc::new(AtomicUsize::new(0));
    for lane in lanes {
        let seen = seen.clone();
        let duplicates = duplicates.clone();
        let count = count.clone();
        lane.dispatch_on(&pool).consume(move |n| {
            if !seen.lock().insert(n) {
                duplicates.fetch_add(1, Ordering::SeqCst);
            }
            count.fetch_add(1, Ordering::SeqCst);
        });
    }

    for n in 0..TOTAL as i64 {
        broadcaster.broadcast_next(n);
    }
    broadcaster.broadcast_complete();

    assert!(
        wait_until(Duration::from_secs(10), || count.load(Ordering::SeqCst) == TOTAL),
        "saw {} of {TOTAL}",
        count.load(Ordering::SeqCst)
    );
    assert_eq!(duplicates.load(Ordering::SeqCst), 0);
    assert_eq!(seen.lock().len(), TOTAL);
    pool.shutdown(Duration::from_secs(2));
}

/// High-volume buffering with a timeout flush: every input lands in exactly
/// one buffer and nearly all buffers are full-sized.
#[test]
fn buffered_timeout() {
    const TOTAL: usize = 100_000;
    const BATCH: usize = 125;

    init_tracing();
    let timer = Arc::new(TimerService::new());
    let (broadcaster, flow) = Flow::<i64>::broadcast();

    let outer = Collector::unbounded();
    flow.buffer_timeout(BATCH, Duration::from_secs(1), &timer)
        .partition(2)
        .subscribe(outer.clone());
    let lanes = outer.await_complete(Duration::from_secs(2));

    let element_count = Arc::new(AtomicUsize::new(0));
    let full_buffers = Arc::new(AtomicUsize::new(0));
    let buffer_count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(HashSet::new()));
    let duplicates = Arc::new(AtomicUsize::new(0));
    for lane in lanes {
        let element_count = element_count.clone();
        let full_buffers = full_buffers.clone();
        let buffer_count = buffer_count.clone();
        let seen = seen.clone();
        let duplicates = duplicates.clone();
        lane.consume(move |batch: Vec<i64>| {
            buffer_count.fetch_add(1, Ordering::SeqCst);
            if batch.len() == BATCH {
                full_buffers.fetch_add(1, Ordering::SeqCst);
            }
            element_count.fetch_add(batch.len(), Ordering::SeqCst);
            let mut seen = seen.lock();
            for n in batch {
                if !seen.insert(n) {
                    duplicates.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
    }

    for n in 0..TOTAL as i64 {
        broadcaster.broadcast_next(n);
    }
    broadcaster.broadcast_complete();

    assert!(
        wait_until(Duration::from_secs(10), || {
            element_count.load(Ordering::SeqCst) == TOTAL
        }),
        "accounted {} of {TOTAL}",
        element_count.load(Ordering::SeqCst)
    );
    assert_eq!(duplicates.load(Ordering::SeqCst), 0);

    let buffers = buffer_count.load(Ordering::SeqCst);
    let full = full_buffers.load(Ordering::SeqCst);
    assert!(
        full * 10 >= buffers * 9,
        "only {full} of {buffers} buffers were full-sized"
    );
}

/// Window each hundred elements and reduce every window to its minimum.
#[test]
fn window_reduce() {
    let completions = Arc::new(AtomicUsize::new(0));

    let outer = Collector::unbounded();
    Flow::range(0, 1000).window(100).subscribe(outer.clone());

    let windows = outer.await_complete(Duration::from_secs(2));
    assert_eq!(windows.len(), 10);

    let mut minima = Vec::new();
    for window in windows {
        let collector = Collector::unbounded();
        window
            .reduce(i64::MAX, |acc, n| acc.min(n))
            .subscribe(collector.clone());
        let mut result = collector.await_complete(Duration::from_secs(2));
        completions.fetch_add(1, Ordering::SeqCst);
        assert_eq!(result.len(), 1);
        minima.append(&mut result);
    }

    assert_eq!(minima, (0..10).map(|k| k * 100).collect::<Vec<_>>());
    assert_eq!(completions.load(Ordering::SeqCst), 10);
}

/// Demand crossing an ordered boundary stays precise: a slow consumer
/// pulls one element at a time across the dispatcher.
#[test]
fn paced_pull_across_boundary() {
    use corrente::ThreadDispatcher;

    let dispatcher: Arc<dyn Dispatcher> = Arc::new(ThreadDispatcher::new("paced"));
    let collector = Collector::with_demand(1);
    Flow::range(0, 50)
        .dispatch_on(&dispatcher)
        .subscribe(collector.clone());

    // Pull the rest one by one
    for _ in 0..50 {
        collector.request(1);
        std::thread::sleep(Duration::from_millis(1));
    }

    assert!(wait_until(Duration::from_secs(5), || collector.is_terminated()));
    assert_eq!(
        collector.values(),
        (0..50).collect::<Vec<_>>()
    );
    dispatcher.shutdown(Duration::from_secs(2));
}

/// Timed operators compose with the environment's shared timer.
#[test]
fn environment_wiring() {
    use corrente::{DispatcherConfig, DispatcherKind, Environment};

    let env = Environment::with_timer_resolution(Duration::from_millis(1));
    let ring = env
        .create(
            DispatcherConfig::new("env-ring")
                .kind(DispatcherKind::Ring)
                .queue_size(256),
        )
        .unwrap();

    let (broadcaster, flow) = Flow::<i64>::broadcast();
    let collector = Collector::unbounded();
    flow.sample_first(Duration::from_millis(40), &env.timer())
        .dispatch_on(&ring)
        .subscribe(collector.clone());

    broadcaster.broadcast_next(1);
    broadcaster.broadcast_next(2);
    broadcaster.broadcast_complete();

    assert!(wait_until(Duration::from_secs(5), || collector.is_terminated()));
    assert_eq!(collector.values(), vec![1]);
    env.shutdown(Duration::from_secs(2));
}
