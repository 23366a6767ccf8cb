//! Operator nodes: graph vertices implementing the signal protocol.
//!
//! Every operator is both a subscriber (to its upstream) and a publisher
//! (to its downstream), and enforces the common contract: at most one
//! active upstream subscription, downstream emission bounded by downstream
//! demand, exactly one terminal per edge.
//!
//! | Family | Operators | Module |
//! |--------|-----------|--------|
//! | Stateless transforms | map, filter, observe, ignore_errors, when | [`transform`] |
//! | Stateful transforms  | scan, reduce | [`accumulate`] |
//! | Aggregators          | buffer, window, moving_window | [`batch`], [`window`], [`moving`] |
//! | Fan-in               | merge, flat_map | [`merge`] |
//! | Fan-out              | partition | [`partition`] |
//! | Timing               | sample_first, sample, timeout | [`timing`] |
//! | Boundary             | dispatch_on | [`boundary`] |

pub mod accumulate;
pub mod batch;
pub mod boundary;
pub mod merge;
pub mod moving;
pub mod partition;
pub mod timing;
pub mod transform;
pub mod window;

pub(crate) mod unicast;

use std::sync::OnceLock;

use crate::signal::{Gate, Subscription};

/// Shared edge plumbing most operators embed: the lifecycle gate plus the
/// retained upstream handle (used to cancel on user error and to replace
/// credit for discarded elements).
pub(crate) struct EdgeCore {
    pub(crate) gate: Gate,
    pub(crate) upstream: OnceLock<Subscription>,
}

impl EdgeCore {
    pub(crate) fn new() -> Self {
        Self {
            gate: Gate::new(),
            upstream: OnceLock::new(),
        }
    }

    /// Binds the upstream; false when a second subscription raced in (it is
    /// cancelled here).
    pub(crate) fn bind(&self, subscription: &Subscription) -> bool {
        if !self.gate.mark_subscribed() {
            subscription.cancel();
            return false;
        }
        let _ = self.upstream.set(subscription.clone());
        true
    }

    pub(crate) fn cancel_upstream(&self) {
        if let Some(upstream) = self.upstream.get() {
            upstream.cancel();
        }
    }

    pub(crate) fn request_upstream(&self, n: u64) {
        if let Some(upstream) = self.upstream.get() {
            upstream.request(n);
        }
    }

    pub(crate) fn replace_credit(&self) {
        self.request_upstream(1);
    }
}
