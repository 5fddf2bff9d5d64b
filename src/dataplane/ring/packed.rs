//! Packed-ring transport.
//!
//! A single descriptor table carries both directions of the handshake:
//! per-slot AVAIL/USED flag bits toggle against wrap counters, and the
//! driver/device event words implement interrupt and kick suppression.
//! Transmit completion is out of order: a host-side map from buffer id to
//! ring slot lets release swap descriptor payloads so that used entries
//! still surface in host order.

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

/// Descriptor flag bits.
pub const DESC_F_AVAIL: u16 = 1 << 7;
pub const DESC_F_USED: u16 = 1 << 15;

/// Event suppression modes carried in the event word flags.
pub const EVENT_FLAG_ENABLE: u16 = 0x0;
pub const EVENT_FLAG_DISABLE: u16 = 0x1;
/// Fire when the descriptor index in off_wrap is crossed.
pub const EVENT_FLAG_DESC: u16 = 0x2;

/// Wrap-counter bit inside the event off_wrap field.
pub const EVENT_F_WRAP_CTR: u16 = 1 << 15;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PackedDesc {
    pub addr: u64,
    pub len: u32,
    pub id: u16,
    pub flags: u16,
    pub mark: u32,
    _pad: u32,
}

/// Shared context: the two event words and geometry, each on its own
/// cache line, followed by the descriptor table. Host-side cursors and
/// the id-to-slot map are host-private state, not shared with the guest.
#[repr(C, align(64))]
pub struct PackedCtx {
    /// Guest writes, engine reads: interrupt suppression. Flags and
    /// off_wrap are packed in one 32-bit word so a single load observes
    /// them consistently.
    pub driver_event: AtomicU32,
    _pad1: [u32; 15],
    /// Engine writes, guest reads: kick suppression.
    pub device_event: AtomicU32,
    _pad2: [u32; 15],
    /// Read-only after init.
    pub num_slots: u32,
    _pad3: [u32; 15],
}

#[inline]
pub(crate) fn event_word(off_wrap: u16, flags: u16) -> u32 {
    off_wrap as u32 | (flags as u32) << 16
}

#[inline]
pub(crate) fn event_split(word: u32) -> (u16, u16) {
    (word as u16, (word >> 16) as u16)
}

/// True when the driver must be notified: the event index lies inside
/// the window of indices consumed since `old`.
#[inline]
pub fn need_event(event_idx: u16, new_idx: u16, old: u16) -> bool {
    new_idx.wrapping_sub(event_idx).wrapping_sub(1) < new_idx.wrapping_sub(old)
}

fn desc_area_size(num_bufs: usize) -> usize {
    (num_bufs * size_of::<PackedDesc>()).div_ceil(CACHELINE) * CACHELINE
}

pub fn ctx_size(num_bufs: usize) -> usize {
    size_of::<PackedCtx>() + desc_area_size(num_bufs)
}

pub fn check_alignment() {
    assert_eq!(offset_of!(PackedCtx, driver_event) % CACHELINE, 0);
    assert_eq!(offset_of!(PackedCtx, device_event) % CACHELINE, 0);
    assert_eq!(offset_of!(PackedCtx, num_slots) % CACHELINE, 0);
    assert_eq!(size_of::<PackedCtx>() % CACHELINE, 0);
    assert_eq!(size_of::<AtomicU32>(), 4);
    assert_eq!(size_of::<PackedDesc>(), 24);
}

/// Initialize a packed context in place (both directions use the same
/// layout).
///
/// # Safety
///
/// `ctx` must point to at least `ctx_size(num_bufs)` writable bytes,
/// cache-line aligned.
pub unsafe fn ctx_init(ctx: *mut u8, num_bufs: u32) {
    assert!(num_bufs.is_power_of_two());
    unsafe {
        ctx.write_bytes(0, ctx_size(num_bufs as usize));
        let ctx = ctx.cast::<PackedCtx>();
        (*ctx).num_slots = num_bufs;
        // Driver starts with descriptor-event mode, wrap counter set.
        (*ctx).driver_event = AtomicU32::new(event_word(EVENT_F_WRAP_CTR, EVENT_FLAG_DESC));
        // Device starts with kicks enabled at slot 0, wrap counter set.
        (*ctx).device_event = AtomicU32::new(event_word(EVENT_F_WRAP_CTR, EVENT_FLAG_DESC));
    }
}

/// Host-side cursors shared by both queue directions.
struct Cursors {
    next_avail: u16,
    avail_wrap: bool,
    next_used: u16,
    used_wrap: bool,
    /// Flag pattern marking a descriptor used at the current used wrap.
    avail_used_flags: u16,
    /// Shadow of the last device_event flags written.
    device_event_flags: u16,
}

impl Cursors {
    fn new() -> Self {
        Self {
            next_avail: 0,
            avail_wrap: true,
            next_used: 0,
            used_wrap: true,
            avail_used_flags: DESC_F_AVAIL | DESC_F_USED,
            device_event_flags: EVENT_FLAG_DESC,
        }
    }

    #[inline]
    fn advance_avail(&mut self, num_slots: u32) {
        self.next_avail += 1;
        if self.next_avail as u32 >= num_slots {
            self.next_avail = 0;
            self.avail_wrap = !self.avail_wrap;
        }
    }

    #[inline]
    fn advance_used(&mut self, num_slots: u32) {
        self.next_used += 1;
        if self.next_used as u32 >= num_slots {
            self.next_used = 0;
            self.used_wrap = !self.used_wrap;
            self.avail_used_flags ^= DESC_F_AVAIL | DESC_F_USED;
        }
    }
}

macro_rules! packed_queue_common {
    ($ty:ident) => {
        impl $ty {
            #[inline]
            fn shared(&self) -> &PackedCtx {
                unsafe { self.ctx.as_ref() }
            }

            #[inline]
            fn desc(&self, slot: u16) -> *mut PackedDesc {
                debug_assert!((slot as u32) < self.num_slots);
                unsafe {
                    self.ctx
                        .as_ptr()
                        .cast::<u8>()
                        .add(size_of::<PackedCtx>())
                        .cast::<PackedDesc>()
                        .add(slot as usize)
                }
            }

            /// AVAIL != USED and AVAIL matching the wrap counter marks the
            /// next slot as driver-owned work.
            #[inline]
            fn more_avail(&self) -> bool {
                let flags =
                    unsafe { addr_of!((*self.desc(self.cur.next_avail)).flags).read_volatile() };
                let avail = flags & DESC_F_AVAIL != 0;
                let used = flags & DESC_F_USED != 0;
                avail != used && avail == self.cur.avail_wrap
            }

            pub fn set_kicks(&mut self, enable: bool) {
                let ctx = self.ctx;
                let sh = unsafe { ctx.as_ref() };
                if !enable {
                    sh.device_event
                        .store(event_word(0, EVENT_FLAG_DISABLE), Ordering::Relaxed);
                    self.cur.device_event_flags = EVENT_FLAG_DISABLE;
                } else {
                    // One atomic store so flags and off_wrap can never be
                    // observed torn.
                    let off_wrap = self.cur.next_avail
                        | if self.cur.avail_wrap { EVENT_F_WRAP_CTR } else { 0 };
                    sh.device_event
                        .store(event_word(off_wrap, EVENT_FLAG_DESC), Ordering::Relaxed);
                    self.cur.device_event_flags = EVENT_FLAG_DESC;
                }
            }

            /// Interrupt decision per the driver event word, rebased so the
            /// usual need_event window test applies.
            fn intr_needed(&self, num_consumed: u16) -> bool {
                let (off_wrap, flags) = event_split(self.shared().driver_event.load(Ordering::Relaxed));
                if flags != EVENT_FLAG_DESC {
                    return flags == EVENT_FLAG_ENABLE;
                }
                let old = self.cur.next_used.wrapping_sub(num_consumed);
                let mut event_idx = off_wrap & !EVENT_F_WRAP_CTR;
                let wrap = off_wrap & EVENT_F_WRAP_CTR != 0;
                if wrap != self.cur.used_wrap {
                    event_idx = event_idx.wrapping_sub(self.num_slots as u16);
                }
                need_event(event_idx, self.cur.next_used, old)
            }

            pub fn stats(&self) -> &Arc<QueueStats> {
                &self.stats
            }

            pub fn dump(&self) {
                let (dev_off, dev_flags) =
                    event_split(self.shared().device_event.load(Ordering::Relaxed));
                let (drv_off, drv_flags) =
                    event_split(self.shared().driver_event.load(Ordering::Relaxed));
                trace!(
                    queue = %self.name,
                    avail = self.cur.next_avail,
                    used = self.cur.next_used,
                    avail_wrap = self.cur.avail_wrap,
                    used_wrap = self.cur.used_wrap,
                    drv_flags,
                    drv_off,
                    dev_flags,
                    dev_off,
                    "packed queue"
                );
            }
        }
    };
}

pub struct PackedRx {
    ctx: NonNull<PackedCtx>,
    num_slots: u32,
    cur: Cursors,
    name: String,
    stats: Arc<QueueStats>,
}

unsafe impl Send for PackedRx {}

packed_queue_common!(PackedRx);

impl PackedRx {
    /// # Safety
    ///
    /// `ctx` must point to a context initialized with `ctx_init` for
    /// `num_bufs` slots, valid for the life of the ring.
    pub unsafe fn new(ctx: *mut u8, num_bufs: u32, name: String, stats: Arc<QueueStats>) -> Self {
        Self {
            ctx: NonNull::new(ctx.cast()).expect("null ring context"),
            num_slots: num_bufs,
            cur: Cursors::new(),
            name,
            stats,
        }
    }

    /// Read frames from the egress port into guest receive buffers.
    /// Slots are used in order; an invalid descriptor is completed with
    /// length zero.
    pub fn push(
        &mut self,
        mem: &mut MemoryTable,
        port: &mut EgressPort,
        mut can_receive: Option<&mut bool>,
    ) -> (usize, bool) {
        if self.cur.device_event_flags != EVENT_FLAG_DISABLE {
            self.set_kicks(false);
        }

        let mut count = 0usize;
        'outer: loop {
            if !self.more_avail() {
                match can_receive {
                    None => break,
                    Some(ref mut _cr) => {
                        // Kicks re-enabled: the next guest publish wakes
                        // the poll loop, so the direction stays armed.
                        self.set_kicks(true);
                        fence(Ordering::SeqCst);
                        if !self.more_avail() {
                            break;
                        }
                        self.set_kicks(false);
                    }
                }
            }
            if count >= RX_BUDGET {
                break;
            }

            fence(Ordering::Acquire);
            let avail_idx = self.cur.next_avail;
            let used_idx = self.cur.next_used;
            let ad = self.desc(avail_idx);
            let addr = unsafe { addr_of!((*ad).addr).read_volatile() };
            let dlen = unsafe { addr_of!((*ad).len).read_volatile() };
            let id = unsafe { addr_of!((*ad).id).read_volatile() };

            let ud = self.desc(used_idx);
            if avail_idx != used_idx {
                // Only needed when slots were consumed out of order; the
                // receive side never does, but keep the slot payload
                // coherent anyway.
                unsafe {
                    addr_of_mut!((*ud).addr).write_volatile(addr);
                    addr_of_mut!((*ud).id).write_volatile(id);
                }
            }

            match mem.translate(addr, dlen as u64) {
                None => {
                    unsafe { addr_of_mut!((*ud).len).write_volatile(0) };
                    warn!(
                        queue = %self.name,
                        gpa = format_args!("{addr:#x}"),
                        len = dlen,
                        "invalid RX descriptor"
                    );
                }
                Some(host) => {
                    let buf = unsafe { std::slice::from_raw_parts_mut(host, dlen as usize) };
                    let mut iov = [IoSliceMut::new(buf)];
                    match port.recv(&mut iov) {
                        Ok(0) => break 'outer,
                        Ok(pktsize) => {
                            unsafe { addr_of_mut!((*ud).len).write_volatile(pktsize as u32) };
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break 'outer,
                        Err(e) => {
                            warn!(queue = %self.name, error = %e, "recv failed");
                            break 'outer;
                        }
                    }
                }
            }

            // Expose the used descriptor, then advance both cursors.
            fence(Ordering::Release);
            unsafe { addr_of_mut!((*ud).flags).write_volatile(self.cur.avail_used_flags) };
            self.cur.advance_avail(self.num_slots);
            self.cur.advance_used(self.num_slots);
            self.stats.add_bufs(1);
            count += 1;
        }

        let mut notify = false;
        if count > 0 {
            // Descriptor stores must precede the driver_event load.
            fence(Ordering::SeqCst);
            notify = self.intr_needed(count as u16);
            self.stats.add_pkts(count as u64);
            self.stats.inc_batches();
        }
        (count, notify)
    }
}

pub struct PackedTx {
    ctx: NonNull<PackedCtx>,
    num_slots: u32,
    cur: Cursors,
    /// buffer id -> ring slot of its (possibly swapped) descriptor.
    hv_map: Vec<u16>,
    pending_inuse: u32,
    pending_used: u32,
    name: String,
    stats: Arc<QueueStats>,
}

unsafe impl Send for PackedTx {}

packed_queue_common!(PackedTx);

impl PackedTx {
    /// # Safety
    ///
    /// `ctx` must point to a context initialized with `ctx_init` for
    /// `num_bufs` slots, valid for the life of the ring.
    pub unsafe fn new(ctx: *mut u8, num_bufs: u32, name: String, stats: Arc<QueueStats>) -> Self {
        Self {
            ctx: NonNull::new(ctx.cast()).expect("null ring context"),
            num_slots: num_bufs,
            cur: Cursors::new(),
            hv_map: vec![0; num_bufs as usize],
            pending_inuse: 0,
            pending_used: 0,
            name,
            stats,
        }
    }

    pub fn pending_inflight(&self) -> u32 {
        self.pending_inuse
    }

    pub fn num_slots(&self) -> u32 {
        self.num_slots
    }

    /// Buffer ids are bounded by the ring size per the ring contract;
    /// masking keeps a broken guest from reaching outside the map (it
    /// only corrupts its own completions).
    #[inline]
    fn id_index(&self, id: u16) -> usize {
        (id as u32 & (self.num_slots - 1)) as usize
    }

    #[cfg(test)]
    pub(crate) fn hv_slot_of(&self, id: u16) -> u16 {
        self.hv_map[self.id_index(id)]
    }

    #[cfg(test)]
    pub(crate) fn next_used_idx(&self) -> u16 {
        self.cur.next_used
    }

    /// Drain available descriptors straight to the egress port, marking
    /// them used in order.
    pub fn drain(
        &mut self,
        mem: &mut MemoryTable,
        port: &mut EgressPort,
        mut can_send: Option<&mut bool>,
    ) -> (usize, bool) {
        if can_send.is_some() {
            self.set_kicks(false);
        }

        let mut count = 0usize;
        'outer: loop {
            if !self.more_avail() {
                match can_send {
                    None => break,
                    Some(ref mut _cs) => {
                        self.set_kicks(true);
                        fence(Ordering::SeqCst);
                        if !self.more_avail() {
                            break;
                        }
                        self.set_kicks(false);
                    }
                }
            }
            if count >= TX_BUDGET {
                break;
            }

            fence(Ordering::Acquire);
            let avail_idx = self.cur.next_avail;
            let used_idx = self.cur.next_used;
            let ad = self.desc(avail_idx);
            let addr = unsafe { addr_of!((*ad).addr).read_volatile() };
            let dlen = unsafe { addr_of!((*ad).len).read_volatile() };

            match mem.translate(addr, dlen as u64) {
                None => {
                    warn!(
                        queue = %self.name,
                        gpa = format_args!("{addr:#x}"),
                        len = dlen,
                        "invalid TX descriptor"
                    );
                }
                Some(host) => {
                    let frame =
                        unsafe { std::slice::from_raw_parts(host as *const u8, dlen as usize) };
                    let iov = [IoSlice::new(frame)];
                    match port.send(&iov) {
                        Ok(0) => break 'outer,
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            if let Some(ref mut cs) = can_send {
                                **cs = false;
                            }
                            break 'outer;
                        }
                        Err(e) => {
                            warn!(queue = %self.name, error = %e, "send failed");
                            break 'outer;
                        }
                    }
                }
            }

            // In-order processing: the used slot equals the avail slot, so
            // the descriptor payload needs no rewrite, only the flags.
            let ud = self.desc(used_idx);
            if avail_idx != used_idx {
                let id = unsafe { addr_of!((*ad).id).read_volatile() };
                unsafe {
                    addr_of_mut!((*ud).addr).write_volatile(addr);
                    addr_of_mut!((*ud).len).write_volatile(dlen);
                    addr_of_mut!((*ud).id).write_volatile(id);
                }
                fence(Ordering::Release);
            }
            unsafe { addr_of_mut!((*ud).flags).write_volatile(self.cur.avail_used_flags) };
            self.cur.advance_avail(self.num_slots);
            self.cur.advance_used(self.num_slots);
            self.stats.add_bufs(1);
            count += 1;
        }

        let mut notify = false;
        if count > 0 {
            fence(Ordering::SeqCst);
            notify = self.intr_needed(count as u16);
            self.stats.add_pkts(count as u64);
            self.stats.inc_batches();
        }
        (count, notify)
    }

    /// Take the next available descriptor for the scheduler path. The
    /// buffer id is the opaque handle; its slot is recorded so release
    /// can find the descriptor after later swaps.
    pub fn pop_avail(
        &mut self,
        mem: &mut MemoryTable,
        mut can_send: Option<&mut bool>,
    ) -> Option<TxBuf> {
        loop {
            if !self.more_avail() {
                match can_send {
                    None => return None,
                    Some(ref mut _cs) => {
                        self.set_kicks(true);
                        fence(Ordering::SeqCst);
                        if !self.more_avail() {
                            return None;
                        }
                        self.set_kicks(false);
                    }
                }
            }

            fence(Ordering::Acquire);
            let slot = self.cur.next_avail;
            let d = self.desc(slot);
            let addr = unsafe { addr_of!((*d).addr).read_volatile() };
            let dlen = unsafe { addr_of!((*d).len).read_volatile() };
            let id = unsafe { addr_of!((*d).id).read_volatile() };
            let mark = unsafe { addr_of!((*d).mark).read_volatile() };

            // Slots can be swapped under out-of-order release, so buffer
            // ids, not slot indices, are the release handle.
            let id_idx = self.id_index(id);
            self.hv_map[id_idx] = slot;
            self.cur.advance_avail(self.num_slots);
            self.pending_inuse += 1;
            self.stats.add_bufs(1);

            match mem.translate(addr, dlen as u64) {
                Some(host) => {
                    return Some(TxBuf {
                        ptr: host,
                        len: dlen,
                        opaque_id: id as u64,
                        guest_mark: mark,
                    });
                }
                None => {
                    warn!(
                        queue = %self.name,
                        gpa = format_args!("{addr:#x}"),
                        len = dlen,
                        "invalid TX descriptor"
                    );
                    self.stats.inc_drops();
                    self.release(id as u64);
                }
            }
        }
    }

    /// Mark an acquired buffer used, swapping descriptor payloads when
    /// the buffer's slot is not the next used slot. Notification is
    /// deferred to `notify`.
    pub fn release(&mut self, opaque_id: u64) {
        // Releasing with nothing in flight is a caller bug; ignore.
        if self.pending_inuse == 0 {
            return;
        }

        let id = opaque_id as u16;
        let used_idx = self.cur.next_used;
        let slot = self.hv_map[self.id_index(id)];

        if slot != used_idx {
            // Move the released buffer's descriptor into the next used
            // slot and remap the displaced buffer.
            let ud = self.desc(used_idx);
            let sd = self.desc(slot);
            let displaced = unsafe { addr_of!((*ud).id).read_volatile() };
            let displaced_idx = self.id_index(displaced);
            self.hv_map[displaced_idx] = slot;

            unsafe {
                let (a_addr, a_len, a_id) = (
                    addr_of!((*ud).addr).read_volatile(),
                    addr_of!((*ud).len).read_volatile(),
                    addr_of!((*ud).id).read_volatile(),
                );
                addr_of_mut!((*ud).addr).write_volatile(addr_of!((*sd).addr).read_volatile());
                addr_of_mut!((*ud).len).write_volatile(addr_of!((*sd).len).read_volatile());
                addr_of_mut!((*ud).id).write_volatile(addr_of!((*sd).id).read_volatile());
                addr_of_mut!((*sd).addr).write_volatile(a_addr);
                addr_of_mut!((*sd).len).write_volatile(a_len);
                addr_of_mut!((*sd).id).write_volatile(a_id);

                // Acquired-but-unreleased descriptors are neither
                // available nor used under either wrap, so leaving the
                // flags in place preserves that state.
                let uf = addr_of!((*ud).flags).read_volatile();
                let sf = addr_of!((*sd).flags).read_volatile();
                debug_assert!(
                    uf == sf || (uf ^ sf) == (DESC_F_AVAIL | DESC_F_USED),
                    "swap across incompatible flag states"
                );
            }
            fence(Ordering::Release);
        }

        let ud = self.desc(used_idx);
        unsafe { addr_of_mut!((*ud).flags).write_volatile(self.cur.avail_used_flags) };
        self.pending_inuse -= 1;
        self.cur.advance_used(self.num_slots);
        self.pending_used += 1;
    }

    /// Interrupt decision over releases since the previous call.
    pub fn notify(&mut self) -> bool {
        if self.pending_used == 0 {
            return false;
        }
        // Flush the flag stores before sampling the driver event word.
        fence(Ordering::SeqCst);
        let count = self.pending_used;
        let irq = self.intr_needed(count as u16);
        self.stats.add_pkts(count as u64);
        self.stats.inc_batches();
        self.pending_used = 0;
        irq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::port::{EgressPort, SinkPort, SourcePort};
    use crate::test_util::guest::PackedGuest;
    use crate::test_util::shmem::{AlignedCtx, GuestRam};

    const NUM_BUFS: u32 = 8;

    fn tx_setup() -> (AlignedCtx, GuestRam, PackedTx, PackedGuest) {
        let ctx = AlignedCtx::alloc(ctx_size(NUM_BUFS as usize));
        let ram = GuestRam::new(0x10000, 64 * 1024);
        unsafe { ctx_init(ctx.ptr(), NUM_BUFS) };
        let tx = unsafe {
            PackedTx::new(
                ctx.ptr(),
                NUM_BUFS,
                "TX0".into(),
                Arc::new(QueueStats::default()),
            )
        };
        let guest = unsafe { PackedGuest::new(ctx.ptr(), NUM_BUFS) };
        (ctx, ram, tx, guest)
    }

    fn rx_setup() -> (AlignedCtx, GuestRam, PackedRx, PackedGuest) {
        let ctx = AlignedCtx::alloc(ctx_size(NUM_BUFS as usize));
        let ram = GuestRam::new(0x10000, 64 * 1024);
        unsafe { ctx_init(ctx.ptr(), NUM_BUFS) };
        let rx = unsafe {
            PackedRx::new(
                ctx.ptr(),
                NUM_BUFS,
                "RX0".into(),
                Arc::new(QueueStats::default()),
            )
        };
        let guest = unsafe { PackedGuest::new(ctx.ptr(), NUM_BUFS) };
        (ctx, ram, rx, guest)
    }

    #[test]
    fn test_need_event() {
        assert!(need_event(10, 11, 10));
        assert!(!need_event(10, 10, 9));
        // Wraparound.
        assert!(need_event(65535, 0, 65535));
    }

    #[test]
    fn test_in_order_acquire_release() {
        let (_ctx, mut ram, mut tx, mut guest) = tx_setup();
        let mut mem = ram.table();

        ram.fill(0, &[1; 100]);
        guest.publish(3, ram.gpa_at(0), 100, 2);

        let buf = tx.pop_avail(&mut mem, None).unwrap();
        assert_eq!(buf.opaque_id, 3);
        assert_eq!(buf.len, 100);
        assert_eq!(buf.guest_mark, 2);
        assert!(tx.pop_avail(&mut mem, None).is_none());

        tx.release(buf.opaque_id);
        assert!(tx.notify());
        assert_eq!(guest.poll_used(), Some(3));
        assert_eq!(guest.poll_used(), None);
    }

    #[test]
    fn test_out_of_order_release_swaps_slots() {
        let (_ctx, mut ram, mut tx, mut guest) = tx_setup();
        let mut mem = ram.table();

        // Guest publishes buffer ids 7, 2, 9 % 8 -> use ids 7, 2, 5.
        for (slot, id) in [(0usize, 7u16), (1, 2), (2, 5)] {
            ram.fill(slot * 1024, &[id as u8; 64]);
            guest.publish(id, ram.gpa_at(slot * 1024), 64, 0);
        }

        let a = tx.pop_avail(&mut mem, None).unwrap();
        let b = tx.pop_avail(&mut mem, None).unwrap();
        let c = tx.pop_avail(&mut mem, None).unwrap();
        assert_eq!((a.opaque_id, b.opaque_id, c.opaque_id), (7, 2, 5));
        assert_eq!(tx.pending_inflight(), 3);

        // Release 2 first: its descriptor swaps into slot 0, displacing
        // buffer 7 into slot 1.
        tx.release(2);
        assert_eq!(tx.hv_slot_of(7), 1);
        assert_eq!(guest.desc_id_at(1), 7);
        assert_eq!(guest.desc_id_at(0), 2);
        assert_eq!(tx.next_used_idx(), 1);
        assert_eq!(guest.poll_used(), Some(2));

        tx.release(7);
        assert_eq!(guest.poll_used(), Some(7));
        tx.release(5);
        assert_eq!(guest.poll_used(), Some(5));
        assert_eq!(tx.next_used_idx(), 3);
        assert_eq!(tx.pending_inflight(), 0);
        assert!(tx.notify());
    }

    #[test]
    fn test_wraparound_acquire_release() {
        let (_ctx, mut ram, mut tx, mut guest) = tx_setup();
        let mut mem = ram.table();

        // Two full ring generations, one buffer at a time.
        for round in 0..(NUM_BUFS as u64 * 2) {
            let id = (round % NUM_BUFS as u64) as u16;
            ram.fill(0, &[round as u8; 32]);
            guest.publish(id, ram.gpa_at(0), 32, 0);
            let buf = tx.pop_avail(&mut mem, None).unwrap();
            assert_eq!(buf.opaque_id, id as u64);
            tx.release(buf.opaque_id);
            assert_eq!(guest.poll_used(), Some(id));
        }
        assert_eq!(tx.next_used_idx(), 0);
    }

    #[test]
    fn test_tx_drain_to_sink() {
        let (_ctx, mut ram, mut tx, mut guest) = tx_setup();
        let mut mem = ram.table();
        let mut port = EgressPort::Sink(SinkPort::default());

        for i in 0..3u16 {
            ram.fill(i as usize * 256, &[i as u8; 200]);
            guest.publish(i, ram.gpa_at(i as usize * 256), 200, 0);
        }

        let (count, _irq) = tx.drain(&mut mem, &mut port, None);
        assert_eq!(count, 3);
        let EgressPort::Sink(sink) = &port else {
            unreachable!()
        };
        assert_eq!(sink.sent_bytes, 600);
        for i in 0..3u16 {
            assert_eq!(guest.poll_used(), Some(i));
        }
    }

    #[test]
    fn test_rx_push_from_source() {
        let (_ctx, mut ram, mut rx, mut guest) = rx_setup();
        let mut mem = ram.table();
        let mut port = EgressPort::Source(SourcePort::new(0));

        guest.publish(0, ram.gpa_at(0), 2048, 0);
        guest.publish(1, ram.gpa_at(2048), 2048, 0);

        let (count, irq) = rx.push(&mut mem, &mut port, None);
        assert_eq!(count, 2);
        // Driver event is in DESC mode at slot 0 with the wrap bit: the
        // first used descriptor crosses it.
        assert!(irq);
        assert_eq!(guest.poll_used_with_len(), Some((0, 60)));
        assert_eq!(guest.poll_used_with_len(), Some((1, 60)));
        assert_eq!(&ram.slice(0, 14)[12..14], &[0x08, 0x00]);
    }

    #[test]
    fn test_rx_invalid_descriptor_zero_len() {
        let (_ctx, mut ram, mut rx, mut guest) = rx_setup();
        let mut mem = ram.table();
        let mut port = EgressPort::Source(SourcePort::new(0));

        guest.publish(0, 0xbad0_0000, 2048, 0);
        guest.publish(1, ram.gpa_at(0), 2048, 0);

        let (count, _) = rx.push(&mut mem, &mut port, None);
        assert_eq!(count, 2);
        assert_eq!(guest.poll_used_with_len(), Some((0, 0)));
        assert_eq!(guest.poll_used_with_len(), Some((1, 60)));
    }

    #[test]
    fn test_kick_suppression_packed() {
        let (_ctx, mut ram, mut tx, mut guest) = tx_setup();
        let mut mem = ram.table();

        // Busy-wait mode: kicks disabled for the whole run.
        tx.set_kicks(false);
        assert!(!guest.kick_needed());

        ram.fill(0, &[4; 64]);
        guest.publish(0, ram.gpa_at(0), 64, 0);
        assert!(!guest.kick_needed());

        // The worker still sees the publication without a kick.
        let buf = tx.pop_avail(&mut mem, None).unwrap();
        assert_eq!(buf.opaque_id, 0);

        // Re-enabling arms the descriptor event at the next avail slot.
        tx.set_kicks(true);
        guest.publish(1, ram.gpa_at(0), 64, 0);
        assert!(guest.kick_needed());
    }

    #[test]
    fn test_notify_idx_mode_window() {
        let (_ctx, mut ram, mut tx, mut guest) = tx_setup();
        let mut mem = ram.table();

        // Driver asks for an interrupt only when used index 2 is
        // crossed (descriptor event mode).
        guest.set_driver_event_idx(2);

        for id in 0..2u16 {
            ram.fill(0, &[id as u8; 32]);
            guest.publish(id, ram.gpa_at(0), 32, 0);
        }
        let a = tx.pop_avail(&mut mem, None).unwrap();
        let b = tx.pop_avail(&mut mem, None).unwrap();

        // Releases advance used to 2: event index 2 not crossed yet.
        tx.release(a.opaque_id);
        tx.release(b.opaque_id);
        assert!(!tx.notify());

        guest.publish(2, ram.gpa_at(0), 32, 0);
        let c = tx.pop_avail(&mut mem, None).unwrap();
        tx.release(c.opaque_id);
        // Used index moved past 2 now.
        assert!(tx.notify());
    }
}
