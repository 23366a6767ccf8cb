//! Fan-out operator: routes each input to one of `n` lane sub-streams.
//!
//! Routing is by `key(v) mod n` when a key function is configured, and
//! round-robin otherwise. Each lane is an independently-demanded inner
//! stream; the operator requests from its upstream the *minimum* of the
//! credits its lanes have granted, so no lane is forced to buffer more
//! than its own subscriber asked for plus the skew between lanes.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    demand::{Demand, UNBOUNDED},
    error::{FlowError, catch_user},
    flow::Flow,
    op::{
        EdgeCore,
        unicast::{Listeners, Unicast, UnicastPublisher},
    },
    signal::{Lifecycle, Publisher, Subscriber, Subscription, drop_late_terminal},
};

/// Opens `n` sub-streams and routes every input to exactly one of them.
pub struct PartitionFlow<T> {
    source: Arc<dyn Publisher<T>>,
    lanes: usize,
    key: Option<Arc<dyn Fn(&T) -> u64 + Send + Sync>>,
}

impl<T: Send + Sync + 'static> PartitionFlow<T> {
    /// Round-robin routing.
    pub fn new(source: Arc<dyn Publisher<T>>, lanes: usize) -> Self {
        assert!(lanes > 0, "partition needs at least one lane");
        Self {
            source,
            lanes,
            key: None,
        }
    }

    /// Keyed routing: `key(v) mod n` picks the lane.
    pub fn keyed(
        source: Arc<dyn Publisher<T>>,
        lanes: usize,
        key: impl Fn(&T) -> u64 + Send + Sync + 'static,
    ) -> Self {
        assert!(lanes > 0, "partition needs at least one lane");
        Self {
            source,
            lanes,
            key: Some(Arc::new(key)),
        }
    }
}

struct LaneBook {
    /// Cumulative credit granted per lane (saturating at the sentinel).
    granted: Vec<Demand>,
    /// Credit already forwarded upstream = historical min over lanes.
    forwarded: Mutex<u64>,
}

impl LaneBook {
    /// Recomputes the min over live lanes and forwards the delta upstream.
    fn rebalance(&self, lanes: &[Arc<Unicast<impl Send + 'static>>], core: &EdgeCore) {
        let mut min = UNBOUNDED;
        let mut any_live = false;
        for (granted, lane) in self.granted.iter().zip(lanes) {
            if lane.is_cancelled() {
                continue;
            }
            any_live = true;
            min = min.min(granted.get());
        }
        if !any_live {
            return;
        }
        let delta = {
            let mut forwarded = self.forwarded.lock();
            if min <= *forwarded {
                return;
            }
            let delta = if min == UNBOUNDED {
                UNBOUNDED
            } else {
                min - *forwarded
            };
            *forwarded = min;
            delta
        };
        core.request_upstream(delta);
    }
}

struct PartitionSubscriber<T> {
    lanes: Vec<Arc<Unicast<T>>>,
    key: Option<Arc<dyn Fn(&T) -> u64 + Send + Sync>>,
    round_robin: AtomicUsize,
    core: Arc<EdgeCore>,
}

impl<T: Send + Sync + 'static> Publisher<Flow<T>> for PartitionFlow<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Flow<T>>>) {
        let core = Arc::new(EdgeCore::new());
        let book = Arc::new(LaneBook {
            granted: (0..self.lanes).map(|_| Demand::new()).collect(),
            forwarded: Mutex::new(0),
        });
        let live = Arc::new(AtomicUsize::new(self.lanes));

        // Lanes wired with demand/cancel hooks back into the shared book;
        // the lane vector is assembled first, the hooks see it via OnceLock
        let lane_cell: Arc<std::sync::OnceLock<Vec<Arc<Unicast<T>>>>> =
            Arc::new(std::sync::OnceLock::new());
        let lanes: Vec<Arc<Unicast<T>>> = (0..self.lanes)
            .map(|i| {
                Unicast::with_listeners(Listeners {
                    on_request: Some(Box::new({
                        let book = book.clone();
                        let core = core.clone();
                        let lane_cell = lane_cell.clone();
                        move |n| {
                            book.granted[i].add(n);
                            if let Some(lanes) = lane_cell.get() {
                                book.rebalance(lanes, &core);
                            }
                        }
                    })),
                    on_cancel: Some(Box::new({
                        let book = book.clone();
                        let core = core.clone();
                        let live = live.clone();
                        let lane_cell = lane_cell.clone();
                        move || {
                            if live.fetch_sub(1, Ordering::AcqRel) == 1 {
                                // Last lane gone: nothing left to route to
                                core.cancel_upstream();
                            } else if let Some(lanes) = lane_cell.get() {
                                // A cancelled lane no longer pins the min
                                book.rebalance(lanes, &core);
                            }
                        }
                    })),
                })
            })
            .collect();
        let _ = lane_cell.set(lanes.clone());

        self.source.subscribe(Arc::new(PartitionSubscriber {
            lanes: lanes.clone(),
            key: self.key.clone(),
            round_robin: AtomicUsize::new(0),
            core,
        }));

        // The outer stream: all lanes, then completion. Outer demand is
        // honored by the unicast buffering.
        let outer = Unicast::new();
        for lane in lanes {
            outer.push(Flow::from_publisher(Arc::new(UnicastPublisher(lane))));
        }
        outer.finish(None);
        UnicastPublisher(outer).subscribe(subscriber);
    }
}

impl<T: Send + Sync + 'static> PartitionSubscriber<T> {
    fn route(&self, value: &T) -> Result<usize, FlowError> {
        match &self.key {
            Some(key) => catch_user(|| (key)(value) as usize % self.lanes.len()),
            None => {
                Ok(self.round_robin.fetch_add(1, Ordering::Relaxed) % self.lanes.len())
            }
        }
    }
}

impl<T: Send + Sync + 'static> Subscriber<T> for PartitionSubscriber<T> {
    fn on_subscribe(&self, subscription: Subscription) {
        self.core.bind(&subscription);
    }

    fn on_next(&self, value: T) {
        if !self.core.gate.accepts_next() {
            return;
        }
        match self.route(&value) {
            Ok(index) => {
                let lane = &self.lanes[index];
                if lane.is_cancelled() {
                    // The element's credit came from the shared min; hand it
                    // back so live lanes keep flowing
                    tracing::trace!(lane = index, "lane cancelled, dropping element");
                    self.core.replace_credit();
                } else {
                    lane.push(value);
                }
            }
            Err(error) => {
                if self.core.gate.try_terminate(Lifecycle::Errored) {
                    self.core.cancel_upstream();
                    for lane in &self.lanes {
                        lane.finish(Some(error.clone()));
                    }
                } else {
                    drop_late_terminal(Some(&error));
                }
            }
        }
    }

    fn on_error(&self, error: FlowError) {
        if self.core.gate.try_terminate(Lifecycle::Errored) {
            for lane in &self.lanes {
                lane.finish(Some(error.clone()));
            }
        } else {
            drop_late_terminal(Some(&error));
        }
    }

    fn on_complete(&self) {
        if self.core.gate.try_terminate(Lifecycle::Completed) {
            for lane in &self.lanes {
                lane.finish(None);
            }
        } else {
            drop_late_terminal(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{flow::Collector, source::ColdSource};

    /// Subscribes every lane before awaiting any: upstream demand follows
    /// the minimum over lanes, so awaiting one-by-one would starve.
    fn collect_lanes(lanes: Vec<Flow<i64>>) -> Vec<Vec<i64>> {
        let collectors: Vec<_> = lanes
            .into_iter()
            .map(|lane| {
                let collector = Collector::unbounded();
                lane.subscribe(collector.clone());
                collector
            })
            .collect();
        collectors
            .into_iter()
            .map(|collector| collector.await_complete(Duration::from_secs(1)))
            .collect()
    }

    /// The union of lane emissions equals the source multiset
    #[test]
    fn test_partition_covers() {
        let partitioned = PartitionFlow::new(
            Arc::new(ColdSource::new(|| Box::new(0..100i64))),
            3,
        );
        let outer = Collector::unbounded();
        partitioned.subscribe(outer.clone());

        let lanes = outer.await_complete(Duration::from_secs(1));
        assert_eq!(lanes.len(), 3);

        let mut all: Vec<i64> = collect_lanes(lanes).into_iter().flatten().collect();
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }

    /// Keyed routing sends equal keys to the same lane
    #[test]
    fn test_keyed_routing() {
        let partitioned = PartitionFlow::keyed(
            Arc::new(ColdSource::new(|| Box::new(0..20i64))),
            2,
            |n: &i64| *n as u64,
        );
        let outer = Collector::unbounded();
        partitioned.subscribe(outer.clone());

        let lanes = collect_lanes(outer.await_complete(Duration::from_secs(1)));
        assert!(lanes[0].iter().all(|n| n % 2 == 0));
        assert!(lanes[1].iter().all(|n| n % 2 == 1));
        assert_eq!(lanes[0].len() + lanes[1].len(), 20);
    }

    /// Upstream demand follows the slowest lane
    #[test]
    fn test_min_demand() {
        let partitioned = PartitionFlow::new(
            Arc::new(ColdSource::new(|| Box::new(0..100i64))),
            2,
        );
        let outer = Collector::unbounded();
        partitioned.subscribe(outer.clone());
        let lanes = outer.await_complete(Duration::from_secs(1));

        // Only one lane expresses demand: the other's zero credit pins the
        // upstream request at zero, so nothing flows yet
        let eager = Collector::unbounded();
        lanes[0].clone().subscribe(eager.clone());
        assert_eq!(eager.values(), Vec::<i64>::new());

        // Once the second lane requests, elements flow to both
        let second = Collector::unbounded();
        lanes[1].clone().subscribe(second.clone());
        let first_values = eager.await_complete(Duration::from_secs(1));
        let second_values = second.await_complete(Duration::from_secs(1));
        assert_eq!(first_values.len() + second_values.len(), 100);
    }

    /// Terminals reach every lane exactly once
    #[test]
    fn test_terminal_fans_out() {
        let failing: Arc<dyn Publisher<i64>> = Arc::new(crate::source::FailedSource::new(
            FlowError::User("source broke".into()),
        ));
        let partitioned = PartitionFlow::new(failing, 2);
        let outer = Collector::unbounded();
        partitioned.subscribe(outer.clone());

        for lane in outer.await_complete(Duration::from_secs(1)) {
            let collector = Collector::<i64>::unbounded();
            lane.subscribe(collector.clone());
            match collector.await_terminal(Duration::from_secs(1)) {
                Some(Some(FlowError::User(_))) => {}
                other => panic!("unexpected terminal: {other:?}"),
            }
        }
    }
}
