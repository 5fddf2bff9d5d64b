//! Split-ring transport.
//!
//! Producer and consumer state live on separate cache lines of a shared
//! context; descriptor slots are addressed by free-running counters under
//! a power-of-two mask. The guest publishes on `prod`, the engine
//! completes on `cons`. Transmit interrupt moderation uses the guest's
//! `intr_at` threshold; receive interrupts follow `intr_enabled`.

use std::io::{self, IoSlice, IoSliceMut};
use std::mem::{offset_of, size_of};
use std::ptr::{NonNull, addr_of, addr_of_mut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering, fence};

use tracing::{trace, warn};

use crate::dataplane::port::EgressPort;
use crate::memory::MemoryTable;
use crate::stats::QueueStats;

use super::{CACHELINE, RX_BUDGET, TX_BUDGET, TxBuf};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SringDesc {
    pub cookie: u64,
    pub paddr: u64,
    pub len: u32,
    pub mark: u32,
}

#[repr(C, align(64))]
pub struct SringRxCtx {
    /// Producer line: guest writes, engine reads.
    pub prod: AtomicU32,
    pub intr_enabled: AtomicU32,
    _pad1: [u32; 14],
    /// Consumer line: engine writes, guest reads.
    pub cons: AtomicU32,
    pub kick_enabled: AtomicU32,
    _pad2: [u32; 14],
    /// Geometry, read-only after init.
    pub qmask: u32,
    _pad3: [u32; 15],
    /// Private to the guest driver: next slot handed back to its stack.
    pub clear: u32,
    _pad4: [u32; 15],
}

#[repr(C, align(64))]
pub struct SringTxCtx {
    /// Producer line: guest writes, engine reads. `intr_at` is the
    /// completion index the guest wants a signal at.
    pub prod: AtomicU32,
    pub intr_at: AtomicU32,
    _pad1: [u32; 14],
    /// Consumer line: engine writes, guest reads.
    pub cons: AtomicU32,
    pub kick_enabled: AtomicU32,
    _pad2: [u32; 14],
    pub qmask: u32,
    _pad3: [u32; 15],
    pub clear: u32,
    _pad4: [u32; 15],
}

pub fn rx_ctx_size(num_bufs: usize) -> usize {
    size_of::<SringRxCtx>() + num_bufs * size_of::<SringDesc>()
}

pub fn tx_ctx_size(num_bufs: usize) -> usize {
    size_of::<SringTxCtx>() + num_bufs * size_of::<SringDesc>()
}

pub fn check_alignment() {
    assert_eq!(offset_of!(SringRxCtx, prod) % CACHELINE, 0);
    assert_eq!(offset_of!(SringRxCtx, cons) % CACHELINE, 0);
    assert_eq!(offset_of!(SringRxCtx, qmask) % CACHELINE, 0);
    assert_eq!(offset_of!(SringRxCtx, clear) % CACHELINE, 0);
    assert_eq!(size_of::<SringRxCtx>() % CACHELINE, 0);

    assert_eq!(offset_of!(SringTxCtx, prod) % CACHELINE, 0);
    assert_eq!(offset_of!(SringTxCtx, cons) % CACHELINE, 0);
    assert_eq!(offset_of!(SringTxCtx, qmask) % CACHELINE, 0);
    assert_eq!(offset_of!(SringTxCtx, clear) % CACHELINE, 0);
    assert_eq!(size_of::<SringTxCtx>() % CACHELINE, 0);
}

/// Initialize a receive context in place.
///
/// # Safety
///
/// `ctx` must point to at least `rx_ctx_size(num_bufs)` writable bytes,
/// cache-line aligned.
pub unsafe fn rx_ctx_init(ctx: *mut u8, num_bufs: u32) {
    assert!(num_bufs.is_power_of_two());
    unsafe {
        ctx.write_bytes(0, rx_ctx_size(num_bufs as usize));
        let ctx = ctx.cast::<SringRxCtx>();
        (*ctx).qmask = num_bufs - 1;
        (*ctx).kick_enabled = AtomicU32::new(1);
        (*ctx).intr_enabled = AtomicU32::new(1);
    }
}

/// Initialize a transmit context in place.
///
/// # Safety
///
/// `ctx` must point to at least `tx_ctx_size(num_bufs)` writable bytes,
/// cache-line aligned.
pub unsafe fn tx_ctx_init(ctx: *mut u8, num_bufs: u32) {
    assert!(num_bufs.is_power_of_two());
    unsafe {
        ctx.write_bytes(0, tx_ctx_size(num_bufs as usize));
        let ctx = ctx.cast::<SringTxCtx>();
        (*ctx).qmask = num_bufs - 1;
        (*ctx).kick_enabled = AtomicU32::new(1);
    }
}

pub struct SringRx {
    ctx: NonNull<SringRxCtx>,
    num_bufs: u32,
    name: String,
    stats: Arc<QueueStats>,
}

// The context lives in guest-shared memory owned by the session.
unsafe impl Send for SringRx {}

impl SringRx {
    /// # Safety
    ///
    /// `ctx` must point to a context initialized with `rx_ctx_init` for
    /// `num_bufs` buffers, valid for the life of the ring.
    pub unsafe fn new(ctx: *mut u8, num_bufs: u32, name: String, stats: Arc<QueueStats>) -> Self {
        Self {
            ctx: NonNull::new(ctx.cast()).expect("null ring context"),
            num_bufs,
            name,
            stats,
        }
    }

    #[inline]
    fn desc(&self, slot: u32) -> *mut SringDesc {
        debug_assert!(slot < self.num_bufs);
        unsafe {
            self.ctx
                .as_ptr()
                .cast::<u8>()
                .add(size_of::<SringRxCtx>())
                .cast::<SringDesc>()
                .add(slot as usize)
        }
    }

    pub fn stats(&self) -> &Arc<QueueStats> {
        &self.stats
    }

    pub fn set_kicks(&mut self, enable: bool) {
        let ctx = self.ctx;
        let sh = unsafe { ctx.as_ref() };
        sh.kick_enabled.store(enable as u32, Ordering::Relaxed);
    }

    pub fn dump(&self) {
        let ctx = self.ctx;
        let sh = unsafe { ctx.as_ref() };
        let clear = unsafe { addr_of!((*ctx.as_ptr()).clear).read_volatile() };
        trace!(
            queue = %self.name,
            clear,
            cons = sh.cons.load(Ordering::Relaxed),
            prod = sh.prod.load(Ordering::Relaxed),
            kick = sh.kick_enabled.load(Ordering::Relaxed),
            intr = sh.intr_enabled.load(Ordering::Relaxed),
            "sring rxq"
        );
    }

    /// Read frames from the egress port into guest receive buffers.
    ///
    /// In polling mode (`can_receive` present) an empty ring re-enables
    /// kicks with a sequentially-consistent double-check so no guest
    /// publish is lost; `can_receive` is cleared when the ring stays
    /// empty. Invalid descriptors are completed with a zero length.
    pub fn push(
        &mut self,
        mem: &mut MemoryTable,
        port: &mut EgressPort,
        mut can_receive: Option<&mut bool>,
    ) -> (usize, bool) {
        let ctx = self.ctx;
        let sh = unsafe { ctx.as_ref() };
        let qmask = sh.qmask;

        let mut prod = sh.prod.load(Ordering::Acquire);
        let mut cons = sh.cons.load(Ordering::Relaxed);
        let mut count = 0usize;

        if sh.kick_enabled.load(Ordering::Relaxed) != 0 {
            sh.kick_enabled.store(0, Ordering::Relaxed);
        }

        loop {
            if cons == prod {
                // Out of descriptors. Busy-wait mode just bails; polling
                // mode re-enables kicks and double checks.
                match can_receive {
                    None => break,
                    Some(ref mut cr) => {
                        sh.kick_enabled.store(1, Ordering::Relaxed);
                        fence(Ordering::SeqCst);
                        prod = sh.prod.load(Ordering::Relaxed);
                        if cons == prod {
                            **cr = false;
                            break;
                        }
                        sh.kick_enabled.store(0, Ordering::Relaxed);
                        fence(Ordering::Acquire);
                    }
                }
            }
            if count >= RX_BUDGET {
                break;
            }

            let d = self.desc(cons & qmask);
            let paddr = unsafe { addr_of!((*d).paddr).read_volatile() };
            let dlen = unsafe { addr_of!((*d).len).read_volatile() };

            let Some(host) = mem.translate(paddr, dlen as u64) else {
                unsafe { addr_of_mut!((*d).len).write_volatile(0) };
                warn!(
                    queue = %self.name,
                    gpa = format_args!("{paddr:#x}"),
                    len = dlen,
                    "invalid RX descriptor"
                );
                cons = cons.wrapping_add(1);
                continue;
            };

            let buf = unsafe { std::slice::from_raw_parts_mut(host, dlen as usize) };
            let mut iov = [IoSliceMut::new(buf)];
            match port.recv(&mut iov) {
                Ok(0) => break,
                Ok(pktsize) => {
                    unsafe { addr_of_mut!((*d).len).write_volatile(pktsize as u32) };
                    self.stats.add_bufs(1);
                    cons = cons.wrapping_add(1);
                    count += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(queue = %self.name, error = %e, "recv failed");
                    break;
                }
            }
        }

        let mut notify = false;
        if count > 0 {
            sh.cons.store(cons, Ordering::Release);
            // The store to cons must be visible before intr_enabled is
            // sampled; the guest double-checks in the opposite order.
            fence(Ordering::SeqCst);
            notify = sh.intr_enabled.load(Ordering::Relaxed) != 0;
            self.stats.add_pkts(count as u64);
            self.stats.inc_batches();
        }
        (count, notify)
    }
}

pub struct SringTx {
    ctx: NonNull<SringTxCtx>,
    num_bufs: u32,
    /// Next slot to hand to the scheduler (`cons` <= `next_acq` <= `prod`).
    next_acq: u32,
    /// Completion flags for the window `[cons, next_acq)`.
    completed: Vec<bool>,
    /// Host shadow of the published `cons`.
    cons_shadow: u32,
    /// `cons` value covered by the last notify decision.
    last_notified: u32,
    pending_inflight: u32,
    name: String,
    stats: Arc<QueueStats>,
}

unsafe impl Send for SringTx {}

impl SringTx {
    /// # Safety
    ///
    /// `ctx` must point to a context initialized with `tx_ctx_init` for
    /// `num_bufs` buffers, valid for the life of the ring.
    pub unsafe fn new(ctx: *mut u8, num_bufs: u32, name: String, stats: Arc<QueueStats>) -> Self {
        Self {
            ctx: NonNull::new(ctx.cast()).expect("null ring context"),
            num_bufs,
            next_acq: 0,
            completed: vec![false; num_bufs as usize],
            cons_shadow: 0,
            last_notified: 0,
            pending_inflight: 0,
            name,
            stats,
        }
    }

    #[inline]
    fn desc(&self, slot: u32) -> *mut SringDesc {
        debug_assert!(slot < self.num_bufs);
        unsafe {
            self.ctx
                .as_ptr()
                .cast::<u8>()
                .add(size_of::<SringTxCtx>())
                .cast::<SringDesc>()
                .add(slot as usize)
        }
    }

    pub fn stats(&self) -> &Arc<QueueStats> {
        &self.stats
    }

    pub fn num_slots(&self) -> u32 {
        self.num_bufs
    }

    pub fn pending_inflight(&self) -> u32 {
        self.pending_inflight
    }

    pub fn set_kicks(&mut self, enable: bool) {
        let ctx = self.ctx;
        let sh = unsafe { ctx.as_ref() };
        sh.kick_enabled.store(enable as u32, Ordering::Relaxed);
    }

    pub fn dump(&self) {
        let ctx = self.ctx;
        let sh = unsafe { ctx.as_ref() };
        let clear = unsafe { addr_of!((*ctx.as_ptr()).clear).read_volatile() };
        trace!(
            queue = %self.name,
            clear,
            cons = sh.cons.load(Ordering::Relaxed),
            prod = sh.prod.load(Ordering::Relaxed),
            kick = sh.kick_enabled.load(Ordering::Relaxed),
            intr_at = sh.intr_at.load(Ordering::Relaxed),
            "sring txq"
        );
    }

    /// Drain available descriptors straight to the egress port.
    pub fn drain(
        &mut self,
        mem: &mut MemoryTable,
        port: &mut EgressPort,
        mut can_send: Option<&mut bool>,
    ) -> (usize, bool) {
        let ctx = self.ctx;
        let sh = unsafe { ctx.as_ref() };
        let qmask = sh.qmask;

        if can_send.is_some() {
            // Disable further kicks and start processing.
            sh.kick_enabled.store(0, Ordering::Relaxed);
        }

        let mut prod = sh.prod.load(Ordering::Acquire);
        let mut cons = sh.cons.load(Ordering::Relaxed);
        let old_cons = cons;
        let mut count = 0usize;

        loop {
            if cons == prod {
                // Check if more work arrived while we were not looking.
                prod = sh.prod.load(Ordering::Relaxed);
                if cons == prod {
                    match can_send {
                        None => break,
                        Some(ref mut _cs) => {
                            sh.kick_enabled.store(1, Ordering::Relaxed);
                            fence(Ordering::SeqCst);
                            prod = sh.prod.load(Ordering::Relaxed);
                            if cons == prod {
                                break;
                            }
                            sh.kick_enabled.store(0, Ordering::Relaxed);
                        }
                    }
                }
                fence(Ordering::Acquire);
            }
            if count >= TX_BUDGET {
                break;
            }

            let d = self.desc(cons & qmask);
            let paddr = unsafe { addr_of!((*d).paddr).read_volatile() };
            let dlen = unsafe { addr_of!((*d).len).read_volatile() };

            let Some(host) = mem.translate(paddr, dlen as u64) else {
                warn!(
                    queue = %self.name,
                    gpa = format_args!("{paddr:#x}"),
                    len = dlen,
                    "invalid TX descriptor"
                );
                cons = cons.wrapping_add(1);
                continue;
            };

            let frame = unsafe { std::slice::from_raw_parts(host as *const u8, dlen as usize) };
            let iov = [IoSlice::new(frame)];
            match port.send(&iov) {
                Ok(0) => break,
                Ok(_) => {
                    self.stats.add_bufs(1);
                    cons = cons.wrapping_add(1);
                    count += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if let Some(ref mut cs) = can_send {
                        **cs = false;
                    }
                    break;
                }
                Err(e) => {
                    warn!(queue = %self.name, error = %e, "send failed");
                    break;
                }
            }
        }

        let mut notify = false;
        if count > 0 {
            sh.cons.store(cons, Ordering::Release);
            // Publish cons before sampling intr_at; pairs with the guest
            // updating intr_at and re-reading cons.
            fence(Ordering::SeqCst);
            let intr_at = sh.intr_at.load(Ordering::Relaxed);
            notify =
                cons.wrapping_sub(intr_at).wrapping_sub(1) < cons.wrapping_sub(old_cons);
            self.stats.add_pkts(count as u64);
            self.stats.inc_batches();
            self.cons_shadow = cons;
            self.last_notified = cons;
            self.next_acq = cons;
        }
        (count, notify)
    }

    /// Take the next available descriptor for the scheduler path.
    ///
    /// Invalid descriptors are completed on the spot and skipped.
    pub fn pop_avail(
        &mut self,
        mem: &mut MemoryTable,
        mut can_send: Option<&mut bool>,
    ) -> Option<TxBuf> {
        let ctx = self.ctx;
        let sh = unsafe { ctx.as_ref() };
        let qmask = sh.qmask;

        loop {
            let prod = sh.prod.load(Ordering::Acquire);
            if self.next_acq == prod {
                match can_send {
                    None => return None,
                    Some(ref mut _cs) => {
                        sh.kick_enabled.store(1, Ordering::Relaxed);
                        fence(Ordering::SeqCst);
                        let prod = sh.prod.load(Ordering::Relaxed);
                        if self.next_acq == prod {
                            return None;
                        }
                        sh.kick_enabled.store(0, Ordering::Relaxed);
                        fence(Ordering::Acquire);
                    }
                }
            }

            let idx = self.next_acq;
            let d = self.desc(idx & qmask);
            let paddr = unsafe { addr_of!((*d).paddr).read_volatile() };
            let dlen = unsafe { addr_of!((*d).len).read_volatile() };
            let mark = unsafe { addr_of!((*d).mark).read_volatile() };

            self.next_acq = idx.wrapping_add(1);
            self.pending_inflight += 1;
            self.stats.add_bufs(1);

            match mem.translate(paddr, dlen as u64) {
                Some(host) => {
                    return Some(TxBuf {
                        ptr: host,
                        len: dlen,
                        opaque_id: idx as u64,
                        guest_mark: mark,
                    });
                }
                None => {
                    warn!(
                        queue = %self.name,
                        gpa = format_args!("{paddr:#x}"),
                        len = dlen,
                        "invalid TX descriptor"
                    );
                    self.stats.inc_drops();
                    self.release(idx as u64);
                }
            }
        }
    }

    /// Complete an acquired descriptor. The split ring surfaces
    /// completions to the guest in ring order: `cons` advances over the
    /// contiguous completed prefix.
    pub fn release(&mut self, opaque_id: u64) {
        if self.pending_inflight == 0 {
            return;
        }
        let ctx = self.ctx;
        let sh = unsafe { ctx.as_ref() };
        let qmask = sh.qmask;

        let idx = opaque_id as u32;
        self.completed[(idx & qmask) as usize] = true;
        self.pending_inflight -= 1;

        let mut cons = self.cons_shadow;
        while cons != self.next_acq && self.completed[(cons & qmask) as usize] {
            self.completed[(cons & qmask) as usize] = false;
            cons = cons.wrapping_add(1);
        }
        if cons != self.cons_shadow {
            self.cons_shadow = cons;
            sh.cons.store(cons, Ordering::Release);
        }
    }

    /// Interrupt decision over the completions published since the last
    /// call, under the guest's `intr_at` threshold.
    pub fn notify(&mut self) -> bool {
        let cons = self.cons_shadow;
        if cons == self.last_notified {
            return false;
        }
        let ctx = self.ctx;
        let sh = unsafe { ctx.as_ref() };

        // cons was stored with release; order it before the intr_at load.
        fence(Ordering::SeqCst);
        let intr_at = sh.intr_at.load(Ordering::Relaxed);
        let released = cons.wrapping_sub(self.last_notified);
        let notify = cons.wrapping_sub(intr_at).wrapping_sub(1) < released;

        self.stats.add_pkts(released as u64);
        self.stats.inc_batches();
        self.last_notified = cons;
        notify
    }
}
