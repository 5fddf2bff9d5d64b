//! Per-queue statistics.
//!
//! Counters are written by the dataplane worker only and sampled by the
//! stats reporter with relaxed loads; observed values are approximate.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::info;

#[derive(Debug, Default)]
pub struct QueueStats {
    pub bufs: AtomicU64,
    pub pkts: AtomicU64,
    pub batches: AtomicU64,
    pub kicks: AtomicU64,
    pub irqs: AtomicU64,
    pub drops: AtomicU64,
}

impl QueueStats {
    #[inline]
    pub fn add_bufs(&self, n: u64) {
        self.bufs.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_pkts(&self, n: u64) {
        self.pkts.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_batches(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_kicks(&self) {
        self.kicks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_irqs(&self) {
        self.irqs.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_drops(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bufs: self.bufs.load(Ordering::Relaxed),
            pkts: self.pkts.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            kicks: self.kicks.load(Ordering::Relaxed),
            irqs: self.irqs.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bufs: u64,
    pub pkts: u64,
    pub batches: u64,
    pub kicks: u64,
    pub irqs: u64,
    pub drops: u64,
}

impl StatsSnapshot {
    pub fn delta(&self, prev: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            bufs: self.bufs.wrapping_sub(prev.bufs),
            pkts: self.pkts.wrapping_sub(prev.pkts),
            batches: self.batches.wrapping_sub(prev.batches),
            kicks: self.kicks.wrapping_sub(prev.kicks),
            irqs: self.irqs.wrapping_sub(prev.irqs),
            drops: self.drops.wrapping_sub(prev.drops),
        }
    }
}

/// Rate reporter for one queue: keeps the previous sample and logs deltas.
pub struct StatsReporter {
    name: String,
    stats: Arc<QueueStats>,
    prev: StatsSnapshot,
    prev_ts: Instant,
}

impl StatsReporter {
    pub fn new(name: String, stats: Arc<QueueStats>) -> Self {
        Self {
            name,
            stats,
            prev: StatsSnapshot::default(),
            prev_ts: Instant::now(),
        }
    }

    /// Log the rates since the previous call.
    pub fn report(&mut self) {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.prev_ts).as_secs_f64() * 1e3;
        if elapsed_ms <= 0.0 {
            return;
        }

        let cur = self.stats.snapshot();
        let d = cur.delta(&self.prev);
        self.prev = cur;
        self.prev_ts = now;

        let (mut pkt_batch, mut buf_batch) = (0.0, 0.0);
        if d.batches > 0 {
            pkt_batch = d.pkts as f64 / d.batches as f64;
            buf_batch = d.bufs as f64 / d.batches as f64;
        }
        info!(
            queue = %self.name,
            kpps = d.pkts as f64 / elapsed_ms,
            kkicks = d.kicks as f64 / elapsed_ms,
            kirqs = d.irqs as f64 / elapsed_ms,
            pkt_batch,
            buf_batch,
            drops = d.drops,
            "queue rates"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_delta() {
        let stats = QueueStats::default();
        stats.add_pkts(10);
        stats.add_bufs(12);
        stats.inc_batches();
        let first = stats.snapshot();

        stats.add_pkts(5);
        stats.inc_irqs();
        let second = stats.snapshot();

        let d = second.delta(&first);
        assert_eq!(d.pkts, 5);
        assert_eq!(d.bufs, 0);
        assert_eq!(d.irqs, 1);
        assert_eq!(d.batches, 0);
    }
}
