//! Demand accounting for one publisher→subscriber edge.
//!
//! Demand is the number of `Next` signals a subscriber has authorized. It is
//! kept in an unsigned atomic so it can never go negative, and saturates at
//! the [`UNBOUNDED`] sentinel instead of wrapping.
//!
//! ## Synchronization
//!
//! | Operation | Memory Ordering | Purpose |
//! |-----------|-----------------|---------|
//! | `get`     | `Acquire`       | Observe credits granted by other threads |
//! | `add` / `try_take` | `AcqRel` CAS | Atomic compare-and-add, never wraps |
//!
//! The counter is cache-padded ([`CachePadded`](crossbeam_utils::CachePadded))
//! so producer-side consumption and consumer-side granting do not false-share
//! a line with neighbouring operator state.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Sentinel meaning "the subscriber has opted out of backpressure".
///
/// Once an edge reaches this value it stays there; taking credit from an
/// unbounded counter is a no-op.
pub const UNBOUNDED: u64 = u64::MAX;

/// Saturating atomic credit counter for one edge.
pub struct Demand(CachePadded<AtomicU64>);

impl Demand {
    pub const fn new() -> Self {
        Self(CachePadded::new(AtomicU64::new(0)))
    }

    /// Current outstanding credit.
    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_unbounded(&self) -> bool {
        self.get() == UNBOUNDED
    }

    /// Grants `n` more credits, saturating at [`UNBOUNDED`]. Returns the
    /// previous value.
    pub fn add(&self, n: u64) -> u64 {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                // Sticky: an unbounded edge never re-enters bounded accounting
                return current;
            }
            let next = current.saturating_add(n);
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(previous) => return previous,
                Err(seen) => current = seen,
            }
        }
    }

    /// Consumes `n` credits if available. On an unbounded edge this always
    /// succeeds without decrementing.
    pub fn try_take(&self, n: u64) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return true;
            }
            if current < n {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                current - n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }

    /// Drops all outstanding credit (used when an edge is cancelled).
    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }
}

impl Default for Demand {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Demand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let current = self.get();
        if current == UNBOUNDED {
            f.write_str("Demand(unbounded)")
        } else {
            write!(f, "Demand({current})")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    /// Granting and taking credit round-trips through the counter
    #[test]
    fn test_add_take() {
        let demand = Demand::new();
        assert_eq!(demand.get(), 0);
        assert!(!demand.try_take(1));

        demand.add(3);
        assert!(demand.try_take(2));
        assert!(demand.try_take(1));
        assert!(!demand.try_take(1));
    }

    /// The counter saturates at the sentinel instead of wrapping
    #[test]
    fn test_saturation() {
        let demand = Demand::new();
        demand.add(UNBOUNDED - 1);
        demand.add(100);
        assert_eq!(demand.get(), UNBOUNDED);

        // Unbounded is sticky: taking does not decrement
        assert!(demand.try_take(1));
        assert_eq!(demand.get(), UNBOUNDED);
    }

    /// Concurrent granting and taking never loses or invents credit
    #[test]
    fn test_concurrent_accounting() {
        const GRANTS: u64 = 10_000;
        const THREADS: usize = 4;

        let demand = Arc::new(Demand::new());
        let granters: Vec<_> = (0..THREADS)
            .map(|_| {
                let demand = demand.clone();
                std::thread::spawn(move || {
                    for _ in 0..GRANTS {
                        demand.add(1);
                    }
                })
            })
            .collect();

        let takers: Vec<_> = (0..THREADS)
            .map(|_| {
                let demand = demand.clone();
                std::thread::spawn(move || {
                    let mut taken = 0u64;
                    while taken < GRANTS {
                        if demand.try_take(1) {
                            taken += 1;
                        } else {
                            std::hint::spin_loop();
                        }
                    }
                })
            })
            .collect();

        for handle in granters.into_iter().chain(takers) {
            handle.join().unwrap();
        }
        assert_eq!(demand.get(), 0);
    }
}
