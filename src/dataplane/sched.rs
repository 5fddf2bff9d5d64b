//! Egress scheduling: fixed packet-handle pool, deficit-round-robin flow
//! bank and the byte-time link pacer.
//!
//! The pool is sized to the sum of all guests' TX ring capacities, so an
//! acquired descriptor always finds a handle; returning a handle to the
//! pool is what makes the descriptor eligible for release to its guest.
//! Handles are pool indices, never pointers: the scheduler stays oblivious
//! of guest and ring ownership.

use tracing::trace;

use crate::tsc;

/// List terminator / invalid handle sentinel.
pub const NIL: u32 = u32::MAX;

/// A packet in flight between txq_acquire and txq_release.
#[derive(Debug, Clone, Copy)]
pub struct Pkt {
    /// Host pointer to the frame inside guest memory.
    pub ptr: *mut u8,
    pub len: u32,
    /// Index of the owning guest in the worker's batch.
    pub guest: u16,
    /// Queue index within the guest (single pair today).
    pub queue: u16,
    /// Transport cookie passed back on release.
    pub opaque_id: u64,
    pub flow_id: u32,
    next: u32,
}

/// Fixed-size arena of packet handles with an index-threaded free list.
pub struct PktPool {
    slots: Vec<Pkt>,
    free_head: u32,
    in_use: u32,
}

// Handles reference guest memory mappings that outlive the worker.
unsafe impl Send for PktPool {}

impl PktPool {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity < NIL as usize);
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(Pkt {
                ptr: std::ptr::null_mut(),
                len: 0,
                guest: 0,
                queue: 0,
                opaque_id: 0,
                flow_id: 0,
                next: if i + 1 < capacity { i as u32 + 1 } else { NIL },
            });
        }
        Self {
            slots,
            free_head: 0,
            in_use: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> u32 {
        self.in_use
    }

    pub fn alloc(&mut self) -> Option<u32> {
        let h = self.free_head;
        if h == NIL {
            return None;
        }
        self.free_head = self.slots[h as usize].next;
        self.slots[h as usize].next = NIL;
        self.in_use += 1;
        Some(h)
    }

    pub fn put(&mut self, h: u32) {
        self.slots[h as usize].next = self.free_head;
        self.free_head = h;
        self.in_use -= 1;
    }

    #[inline]
    pub fn get(&self, h: u32) -> &Pkt {
        &self.slots[h as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, h: u32) -> &mut Pkt {
        &mut self.slots[h as usize]
    }
}

struct Flow {
    head: u32,
    tail: u32,
    deficit: u64,
    quantum: u32,
    weight: u32,
}

/// Deficit round robin over a fixed set of flows.
///
/// A flow earns `quantum * weight` bytes of credit when the cursor reaches
/// it with `add_deficit_next` set; credit is spent per dequeued packet and
/// zeroed whenever the flow drains.
pub struct DrrScheduler {
    flows: Vec<Flow>,
    current: usize,
    total_queued: u32,
    add_deficit_next: bool,
}

impl DrrScheduler {
    pub fn new(quantum: u32, weights: &[u32]) -> Self {
        assert!(!weights.is_empty());
        let flows = weights
            .iter()
            .map(|&weight| Flow {
                head: NIL,
                tail: NIL,
                deficit: 0,
                quantum,
                weight,
            })
            .collect();
        Self {
            flows,
            current: 0,
            total_queued: 0,
            add_deficit_next: true,
        }
    }

    pub fn num_flows(&self) -> usize {
        self.flows.len()
    }

    pub fn total_queued(&self) -> u32 {
        self.total_queued
    }

    /// Append a handle to its flow. Fails (caller drops and releases) when
    /// the flow id is out of range.
    pub fn enqueue(&mut self, pool: &mut PktPool, h: u32) -> bool {
        let flow_id = pool.get(h).flow_id as usize;
        let Some(flow) = self.flows.get_mut(flow_id) else {
            trace!(flow_id, "enqueue to invalid flow");
            return false;
        };

        pool.get_mut(h).next = NIL;
        if flow.tail == NIL {
            flow.head = h;
        } else {
            let tail = flow.tail;
            pool.get_mut(tail).next = h;
        }
        flow.tail = h;
        self.total_queued += 1;
        true
    }

    #[inline]
    fn advance(&mut self) {
        self.current += 1;
        if self.current == self.flows.len() {
            self.current = 0;
        }
    }

    /// Dequeue the next handle under DRR order, or None if no flow can
    /// send. Visits each flow at most once.
    pub fn dequeue(&mut self, pool: &mut PktPool) -> Option<u32> {
        for _ in 0..self.flows.len() {
            let current = self.current;
            let flow = &mut self.flows[current];

            if flow.head == NIL {
                // An idle flow keeps no credit.
                flow.deficit = 0;
                self.add_deficit_next = true;
                self.advance();
                continue;
            }

            if self.add_deficit_next {
                flow.deficit += flow.quantum as u64 * flow.weight as u64;
            }

            let head = flow.head;
            let head_len = pool.get(head).len as u64;
            if flow.deficit < head_len {
                self.add_deficit_next = true;
                self.advance();
                continue;
            }

            flow.deficit -= head_len;
            flow.head = pool.get(head).next;
            if flow.head == NIL {
                flow.tail = NIL;
            }
            self.total_queued -= 1;

            if flow.head == NIL {
                flow.deficit = 0;
                self.add_deficit_next = true;
                self.advance();
            } else if pool.get(flow.head).len as u64 <= flow.deficit {
                self.add_deficit_next = false;
            } else {
                self.add_deficit_next = true;
                self.advance();
            }
            return Some(head);
        }
        None
    }
}

/// Byte-time link emulation and batch limiting for the dequeue loop.
pub struct LinkPacer {
    next_link_idle: u64,
    tsc_per_byte: f64,
    batch_limit: u32,
    interval_tsc: u64,
    pub stat_sched_idle: u64,
    pub stat_batch_full: u64,
    pub stat_early: u64,
}

impl LinkPacer {
    pub fn new(ticks_per_second: u64, bw: f64, interval_ns: u64, batch_limit: u32) -> Self {
        Self {
            next_link_idle: 0,
            tsc_per_byte: tsc::tsc_per_byte(ticks_per_second, bw),
            batch_limit,
            interval_tsc: tsc::ns_to_tsc(ticks_per_second, interval_ns),
            stat_sched_idle: 0,
            stat_batch_full: 0,
            stat_early: 0,
        }
    }

    /// Set the link-idle origin; must be called once before the first tick.
    pub fn start(&mut self, now: u64) {
        self.next_link_idle = now;
    }

    pub fn next_link_idle(&self) -> u64 {
        self.next_link_idle
    }

    pub fn batch_limit(&self) -> u32 {
        self.batch_limit
    }

    #[inline]
    pub fn can_dequeue(&self, now: u64, ndeq: u32) -> bool {
        self.next_link_idle <= now && ndeq < self.batch_limit
    }

    /// Account one sent packet against the emulated link.
    #[inline]
    pub fn account(&mut self, len: u32) {
        self.next_link_idle += (len as f64 * self.tsc_per_byte) as u64;
    }

    /// Sleep out the remainder of the scheduling interval.
    ///
    /// Idle link with a partial batch resets the idle origin to now (no
    /// traffic this interval); a full batch returns immediately to keep
    /// draining; a busy link sleeps until it goes idle.
    pub fn idle_sleep(&mut self, now: u64, ndeq: u32) {
        if self.next_link_idle <= now {
            if ndeq < self.batch_limit {
                self.next_link_idle = now;
                self.stat_sched_idle += 1;
                tsc::sleep_till(now + self.interval_tsc);
            } else {
                self.stat_batch_full += 1;
            }
        } else {
            self.stat_early += 1;
            tsc::sleep_till(self.next_link_idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_pkt(pool: &mut PktPool, flow_id: u32, len: u32) -> u32 {
        let h = pool.alloc().expect("pool slot");
        let pkt = pool.get_mut(h);
        pkt.ptr = std::ptr::null_mut();
        pkt.len = len;
        pkt.guest = 0;
        pkt.queue = 0;
        pkt.opaque_id = h as u64;
        pkt.flow_id = flow_id;
        h
    }

    #[test]
    fn test_pool_alloc_put() {
        let mut pool = PktPool::new(4);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.in_use(), 2);
        pool.put(a);
        assert_eq!(pool.in_use(), 1);
        // Freed slot is reused.
        assert_eq!(pool.alloc().unwrap(), a);
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut pool = PktPool::new(2);
        let a = pool.alloc().unwrap();
        let _b = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        pool.put(a);
        assert!(pool.alloc().is_some());
    }

    #[test]
    fn test_enqueue_invalid_flow_fails() {
        let mut pool = PktPool::new(4);
        let mut sched = DrrScheduler::new(1500, &[1, 1]);
        let h = fake_pkt(&mut pool, 7, 100);
        assert!(!sched.enqueue(&mut pool, h));
        assert_eq!(sched.total_queued(), 0);
        pool.put(h);
    }

    #[test]
    fn test_empty_dequeue_is_none() {
        let mut pool = PktPool::new(4);
        let mut sched = DrrScheduler::new(1500, &[1, 1, 1]);
        assert!(sched.dequeue(&mut pool).is_none());
    }

    #[test]
    fn test_fifo_within_flow() {
        let mut pool = PktPool::new(8);
        let mut sched = DrrScheduler::new(1500, &[1]);
        let a = fake_pkt(&mut pool, 0, 100);
        let b = fake_pkt(&mut pool, 0, 100);
        let c = fake_pkt(&mut pool, 0, 100);
        for h in [a, b, c] {
            assert!(sched.enqueue(&mut pool, h));
        }
        assert_eq!(sched.dequeue(&mut pool), Some(a));
        assert_eq!(sched.dequeue(&mut pool), Some(b));
        assert_eq!(sched.dequeue(&mut pool), Some(c));
        assert_eq!(sched.dequeue(&mut pool), None);
        assert_eq!(sched.total_queued(), 0);
    }

    #[test]
    fn test_deficit_reset_on_empty() {
        let mut pool = PktPool::new(8);
        let mut sched = DrrScheduler::new(1500, &[1]);
        // One small packet leaves credit behind; draining the flow must
        // zero it so the next burst starts fresh.
        let a = fake_pkt(&mut pool, 0, 100);
        sched.enqueue(&mut pool, a);
        assert_eq!(sched.dequeue(&mut pool), Some(a));
        pool.put(a);
        assert_eq!(sched.flows[0].deficit, 0);
    }

    #[test]
    fn test_large_packet_accumulates_credit() {
        let mut pool = PktPool::new(8);
        // Quantum 1000, weight 1: a 2500-byte packet needs three visits.
        let mut sched = DrrScheduler::new(1000, &[1, 1]);
        let big = fake_pkt(&mut pool, 0, 2500);
        sched.enqueue(&mut pool, big);
        assert_eq!(sched.dequeue(&mut pool), None);
        assert_eq!(sched.dequeue(&mut pool), None);
        assert_eq!(sched.dequeue(&mut pool), Some(big));
    }

    #[test]
    fn test_drr_fairness_weighted() {
        // Three saturated flows, weights 1/2/3, quantum 1500, 500-byte
        // packets: long-run byte shares track the weights.
        const WEIGHTS: [u32; 3] = [1, 2, 3];
        const PKT_LEN: u32 = 500;
        const DEQUEUES: usize = 1008;

        let mut pool = PktPool::new(64);
        let mut sched = DrrScheduler::new(1500, &WEIGHTS);
        let mut bytes = [0u64; 3];
        let mut queued = [0u32; 3];

        fn top_up(
            sched: &mut DrrScheduler,
            pool: &mut PktPool,
            queued: &mut [u32; 3],
        ) {
            for flow in 0..3u32 {
                while queued[flow as usize] < 12 {
                    let h = fake_pkt(pool, flow, PKT_LEN);
                    assert!(sched.enqueue(pool, h));
                    queued[flow as usize] += 1;
                }
            }
        }

        top_up(&mut sched, &mut pool, &mut queued);
        for _ in 0..DEQUEUES {
            let h = sched.dequeue(&mut pool).expect("saturated input");
            let pkt = *pool.get(h);
            bytes[pkt.flow_id as usize] += pkt.len as u64;
            queued[pkt.flow_id as usize] -= 1;
            pool.put(h);
            top_up(&mut sched, &mut pool, &mut queued);
        }

        let total: u64 = bytes.iter().sum();
        assert_eq!(total, DEQUEUES as u64 * PKT_LEN as u64);
        let weight_sum: u32 = WEIGHTS.iter().sum();
        for (i, &w) in WEIGHTS.iter().enumerate() {
            let expected = total * w as u64 / weight_sum as u64;
            let got = bytes[i];
            let err = expected.abs_diff(got);
            assert!(
                err <= 1500,
                "flow {i}: expected {expected} +/- 1500, got {got}"
            );
        }
    }

    #[test]
    fn test_pacer_rate_bound() {
        // 1000 ticks/s at 100 bytes/s: 10 ticks per byte.
        let mut pacer = LinkPacer::new(1000, 800.0, 0, 500);
        pacer.start(0);
        assert!(pacer.can_dequeue(0, 0));
        pacer.account(10);
        // 10 bytes at 10 ticks/byte: the link is busy for 100 ticks.
        assert_eq!(pacer.next_link_idle(), 100);
        assert!(!pacer.can_dequeue(50, 1));
        assert!(pacer.can_dequeue(100, 1));
    }

    #[test]
    fn test_pacer_batch_limit() {
        let mut pacer = LinkPacer::new(1000, 1e12, 0, 4);
        pacer.start(0);
        for ndeq in 0..4 {
            assert!(pacer.can_dequeue(0, ndeq));
        }
        assert!(!pacer.can_dequeue(0, 4));
    }
}
