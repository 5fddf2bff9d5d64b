//! Guest ring transports.
//!
//! Two interchangeable families implement the same queue contract: the
//! split ring (`sring`, separate producer/consumer counters) and the
//! VirtIO-style packed ring (single descriptor table with wrap counters
//! and out-of-order completion). Dispatch is a two-variant enum so the
//! worker loop monomorphizes down to direct calls per transport.

pub mod packed;
pub mod sring;

use std::sync::Arc;

use crate::memory::MemoryTable;
use crate::stats::QueueStats;

use super::port::EgressPort;

pub const CACHELINE: usize = 64;

/// Per-call descriptor budgets, matching the engine's per-tick fairness.
pub const RX_BUDGET: usize = 128;
pub const TX_BUDGET: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Sring,
    Packed,
}

impl Transport {
    pub fn name(self) -> &'static str {
        match self {
            Transport::Sring => "sring",
            Transport::Packed => "packed",
        }
    }

    /// On-disk bytecode object handed to the hypervisor via GET_PROGRAMS.
    pub fn progfile(self) -> &'static str {
        match self {
            Transport::Sring => "sring_progs.o",
            Transport::Packed => "vring_packed_progs.o",
        }
    }

    pub fn rx_ctx_size(self, num_bufs: usize) -> usize {
        match self {
            Transport::Sring => sring::rx_ctx_size(num_bufs),
            Transport::Packed => packed::ctx_size(num_bufs),
        }
    }

    pub fn tx_ctx_size(self, num_bufs: usize) -> usize {
        match self {
            Transport::Sring => sring::tx_ctx_size(num_bufs),
            Transport::Packed => packed::ctx_size(num_bufs),
        }
    }

    /// Startup self-test: hot fields must sit on their own cache lines.
    pub fn check_alignment(self) {
        match self {
            Transport::Sring => sring::check_alignment(),
            Transport::Packed => packed::check_alignment(),
        }
    }

    /// Initialize a receive context in place.
    ///
    /// # Safety
    ///
    /// `ctx` must point to at least `rx_ctx_size(num_bufs)` writable bytes
    /// aligned to the cache line, not shared with a live queue.
    pub unsafe fn rx_ctx_init(self, ctx: *mut u8, num_bufs: u32) {
        match self {
            Transport::Sring => unsafe { sring::rx_ctx_init(ctx, num_bufs) },
            Transport::Packed => unsafe { packed::ctx_init(ctx, num_bufs) },
        }
    }

    /// Initialize a transmit context in place.
    ///
    /// # Safety
    ///
    /// Same contract as [`Transport::rx_ctx_init`], with `tx_ctx_size`.
    pub unsafe fn tx_ctx_init(self, ctx: *mut u8, num_bufs: u32) {
        match self {
            Transport::Sring => unsafe { sring::tx_ctx_init(ctx, num_bufs) },
            Transport::Packed => unsafe { packed::ctx_init(ctx, num_bufs) },
        }
    }
}

impl std::str::FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sring" => Ok(Transport::Sring),
            "packed" => Ok(Transport::Packed),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// A transmit descriptor handed to the engine by acquire.
///
/// `opaque_id` identifies the buffer to the transport on release; it is
/// never interpreted by the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct TxBuf {
    pub ptr: *mut u8,
    pub len: u32,
    pub opaque_id: u64,
    pub guest_mark: u32,
}

pub enum RxRing {
    Sring(sring::SringRx),
    Packed(packed::PackedRx),
}

impl RxRing {
    /// Wrap an initialized receive context.
    ///
    /// # Safety
    ///
    /// `ctx` must point to a context initialized with the matching
    /// transport's `rx_ctx_init` for `num_bufs` buffers, valid for the
    /// life of the ring.
    pub unsafe fn new(
        transport: Transport,
        ctx: *mut u8,
        num_bufs: u32,
        name: String,
        stats: Arc<QueueStats>,
    ) -> Self {
        match transport {
            Transport::Sring => {
                RxRing::Sring(unsafe { sring::SringRx::new(ctx, num_bufs, name, stats) })
            }
            Transport::Packed => {
                RxRing::Packed(unsafe { packed::PackedRx::new(ctx, num_bufs, name, stats) })
            }
        }
    }

    /// Pull frames from the egress port into guest receive buffers.
    /// Returns the number of buffers filled and whether to raise an IRQ.
    #[inline]
    pub fn push(
        &mut self,
        mem: &mut MemoryTable,
        port: &mut EgressPort,
        can_receive: Option<&mut bool>,
    ) -> (usize, bool) {
        match self {
            RxRing::Sring(q) => q.push(mem, port, can_receive),
            RxRing::Packed(q) => q.push(mem, port, can_receive),
        }
    }

    #[inline]
    pub fn set_kicks(&mut self, enable: bool) {
        match self {
            RxRing::Sring(q) => q.set_kicks(enable),
            RxRing::Packed(q) => q.set_kicks(enable),
        }
    }

    pub fn stats(&self) -> &Arc<QueueStats> {
        match self {
            RxRing::Sring(q) => q.stats(),
            RxRing::Packed(q) => q.stats(),
        }
    }

    pub fn dump(&self) {
        match self {
            RxRing::Sring(q) => q.dump(),
            RxRing::Packed(q) => q.dump(),
        }
    }
}

pub enum TxRing {
    Sring(sring::SringTx),
    Packed(packed::PackedTx),
}

impl TxRing {
    /// Wrap an initialized transmit context.
    ///
    /// # Safety
    ///
    /// Same contract as [`RxRing::new`], with `tx_ctx_init`.
    pub unsafe fn new(
        transport: Transport,
        ctx: *mut u8,
        num_bufs: u32,
        name: String,
        stats: Arc<QueueStats>,
    ) -> Self {
        match transport {
            Transport::Sring => {
                TxRing::Sring(unsafe { sring::SringTx::new(ctx, num_bufs, name, stats) })
            }
            Transport::Packed => {
                TxRing::Packed(unsafe { packed::PackedTx::new(ctx, num_bufs, name, stats) })
            }
        }
    }

    /// Drain available descriptors straight to the egress port (in-order
    /// direct path, no scheduler).
    #[inline]
    pub fn drain(
        &mut self,
        mem: &mut MemoryTable,
        port: &mut EgressPort,
        can_send: Option<&mut bool>,
    ) -> (usize, bool) {
        match self {
            TxRing::Sring(q) => q.drain(mem, port, can_send),
            TxRing::Packed(q) => q.drain(mem, port, can_send),
        }
    }

    /// Take the next available descriptor for the scheduler path.
    #[inline]
    pub fn pop_avail(
        &mut self,
        mem: &mut MemoryTable,
        can_send: Option<&mut bool>,
    ) -> Option<TxBuf> {
        match self {
            TxRing::Sring(q) => q.pop_avail(mem, can_send),
            TxRing::Packed(q) => q.pop_avail(mem, can_send),
        }
    }

    /// Return an acquired buffer to the guest. Out-of-order release is
    /// supported; completion order visible to the guest is up to the
    /// transport.
    #[inline]
    pub fn release(&mut self, opaque_id: u64) {
        match self {
            TxRing::Sring(q) => q.release(opaque_id),
            TxRing::Packed(q) => q.release(opaque_id),
        }
    }

    /// Evaluate the interrupt condition for completions released since
    /// the previous call. True means: signal the queue's irqfd.
    #[inline]
    pub fn notify(&mut self) -> bool {
        match self {
            TxRing::Sring(q) => q.notify(),
            TxRing::Packed(q) => q.notify(),
        }
    }

    #[inline]
    pub fn set_kicks(&mut self, enable: bool) {
        match self {
            TxRing::Sring(q) => q.set_kicks(enable),
            TxRing::Packed(q) => q.set_kicks(enable),
        }
    }

    /// Buffers acquired but not yet released.
    pub fn pending_inflight(&self) -> u32 {
        match self {
            TxRing::Sring(q) => q.pending_inflight(),
            TxRing::Packed(q) => q.pending_inflight(),
        }
    }

    pub fn num_slots(&self) -> u32 {
        match self {
            TxRing::Sring(q) => q.num_slots(),
            TxRing::Packed(q) => q.num_slots(),
        }
    }

    pub fn stats(&self) -> &Arc<QueueStats> {
        match self {
            TxRing::Sring(q) => q.stats(),
            TxRing::Packed(q) => q.stats(),
        }
    }

    pub fn dump(&self) {
        match self {
            TxRing::Sring(q) => q.dump(),
            TxRing::Packed(q) => q.dump(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_self_checks() {
        Transport::Sring.check_alignment();
        Transport::Packed.check_alignment();
    }

    #[test]
    fn test_ctx_sizes_scale_with_bufs() {
        for transport in [Transport::Sring, Transport::Packed] {
            let small = transport.tx_ctx_size(64);
            let large = transport.tx_ctx_size(256);
            assert!(large > small, "{transport:?}");
            assert_eq!(small % CACHELINE, 0);
        }
    }

    #[test]
    fn test_transport_parse() {
        assert_eq!("sring".parse::<Transport>().unwrap(), Transport::Sring);
        assert_eq!("packed".parse::<Transport>().unwrap(), Transport::Packed);
        assert!("vring".parse::<Transport>().is_err());
    }
}
