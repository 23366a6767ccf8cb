//! Pipeline throughput: synchronous operator chain vs. a ring boundary.

use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use criterion::{Criterion, criterion_group, criterion_main};
use corrente::{
    Collector, Dispatcher, Flow, OverflowPolicy, ProducerMode, RingDispatcher,
    WaitStrategy,
};

const ELEMENTS: u64 = 100_000;

/// Fully synchronous chain: source through map/filter/scan on the caller.
fn synchronous_chain(c: &mut Criterion) {
    c.bench_function("sync_map_filter_scan_100k", |b| {
        b.iter(|| {
            let total = Arc::new(AtomicI64::new(0));
            let sink = total.clone();
            Flow::range(0, ELEMENTS)
                .map(|n| n.wrapping_mul(3))
                .filter(|n| n % 2 == 0)
                .scan(0i64, |acc, n| acc.wrapping_add(n))
                .consume(move |n| {
                    sink.store(n, Ordering::Relaxed);
                });
            std::hint::black_box(total.load(Ordering::Relaxed))
        })
    });
}

/// The same chain crossing a busy-spin ring boundary.
fn ring_boundary(c: &mut Criterion) {
    c.bench_function("ring_boundary_100k", |b| {
        let ring: Arc<dyn Dispatcher> = Arc::new(RingDispatcher::<1024>::new(
            "bench-ring",
            ProducerMode::Single,
            WaitStrategy::BusySpin,
            OverflowPolicy::Block,
        ));
        b.iter(|| {
            let collector = Collector::unbounded();
            Flow::range(0, ELEMENTS)
                .map(|n| n.wrapping_mul(3))
                .dispatch_on(&ring)
                .subscribe(collector.clone());
            std::hint::black_box(collector.await_complete(Duration::from_secs(30)).len())
        });
        ring.shutdown(Duration::from_secs(5));
    });
}

criterion_group!(benches, synchronous_chain, ring_boundary);
criterion_main!(benches);
