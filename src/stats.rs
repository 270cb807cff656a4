//! Per-index diagnostic counters.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Cumulative work counters for one index. Monotonically increasing, never
/// persisted.
#[derive(Debug, Default)]
pub struct SearchCounters {
  distance_calls: AtomicU64,
  hops: AtomicU64,
}

impl SearchCounters {
  #[inline]
  pub(crate) fn record_distance_calls(&self, n: u64) {
    self.distance_calls.fetch_add(n, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn record_hop(&self) {
    self.hops.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> CounterSnapshot {
    CounterSnapshot {
      distance_calls: self.distance_calls.load(Ordering::Relaxed),
      hops: self.hops.load(Ordering::Relaxed),
    }
  }
}

/// Point-in-time view of [`SearchCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
  pub distance_calls: u64,
  pub hops: u64,
}
