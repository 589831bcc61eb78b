//! Peer selection algorithms
//!
//! Both service providers and the gRPC picker select through the functions
//! here, so the weighted behavior is identical on both paths.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Load balancing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancingStrategy {
    /// Round-robin
    RoundRobin,
    /// Smooth weighted round-robin
    #[default]
    SmoothWeighted,
}

/// An entry that takes part in smooth weighted selection
pub trait Weighted {
    fn weight(&self) -> u32;
    fn current_weight_mut(&mut self) -> &mut i64;
}

/// Pick the next entry by smooth weighted round-robin
///
/// Every entry gains its weight, the largest running value wins (earliest
/// entry on ties) and pays back the total weight.
pub fn smooth_weighted_next<T: Weighted>(entries: &mut [T]) -> Option<usize> {
    let mut total: i64 = 0;
    let mut best: Option<(usize, i64)> = None;

    for (i, entry) in entries.iter_mut().enumerate() {
        let weight = i64::from(entry.weight());
        total += weight;
        let current = entry.current_weight_mut();
        *current += weight;
        if best.is_none_or(|(_, cw)| *current > cw) {
            best = Some((i, *current));
        }
    }

    let (index, _) = best?;
    *entries[index].current_weight_mut() -= total;
    Some(index)
}

/// Lock-free round-robin cursor
#[derive(Debug, Default)]
pub struct RoundRobin {
    index: AtomicUsize,
}

impl RoundRobin {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            index: AtomicUsize::new(0),
        }
    }

    /// Next index in `0..len`, `None` when `len` is zero
    pub fn next(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        Some(self.index.fetch_add(1, Ordering::AcqRel) % len)
    }
}
