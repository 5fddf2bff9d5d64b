//! Guest-side ring drivers.
//!
//! These model the driver half of each transport so tests can exercise
//! the engine against a realistic peer: publication follows the same
//! barrier discipline a guest kernel would use, including the kick
//! double-check protocol.

use std::mem::size_of;
use std::ptr::{NonNull, addr_of, addr_of_mut};
use std::sync::atomic::{Ordering, fence};

use crate::dataplane::ring::packed::{
    DESC_F_AVAIL, DESC_F_USED, EVENT_F_WRAP_CTR, EVENT_FLAG_DESC, EVENT_FLAG_DISABLE,
    EVENT_FLAG_ENABLE, PackedCtx, PackedDesc, event_split, event_word,
};
use crate::dataplane::ring::sring::{SringDesc, SringRxCtx, SringTxCtx};

/// Driver side of a split transmit ring.
pub struct SringGuestTx {
    ctx: NonNull<SringTxCtx>,
    prod: u32,
}

impl SringGuestTx {
    /// # Safety
    ///
    /// `ctx` must point to an initialized split TX context.
    pub unsafe fn new(ctx: *mut u8) -> Self {
        Self {
            ctx: NonNull::new(ctx.cast()).expect("null ctx"),
            prod: 0,
        }
    }

    fn desc(&self, slot: u32) -> *mut SringDesc {
        unsafe {
            self.ctx
                .as_ptr()
                .cast::<u8>()
                .add(size_of::<SringTxCtx>())
                .cast::<SringDesc>()
                .add(slot as usize)
        }
    }

    /// Publish one frame; returns whether the engine asked for a kick.
    pub fn publish(&mut self, paddr: u64, len: u32, mark: u32) -> bool {
        let ctx = self.ctx;
        let sh = unsafe { ctx.as_ref() };
        let d = self.desc(self.prod & sh.qmask);
        unsafe {
            addr_of_mut!((*d).cookie).write_volatile(self.prod as u64);
            addr_of_mut!((*d).paddr).write_volatile(paddr);
            addr_of_mut!((*d).len).write_volatile(len);
            addr_of_mut!((*d).mark).write_volatile(mark);
        }
        self.prod = self.prod.wrapping_add(1);
        sh.prod.store(self.prod, Ordering::Release);
        fence(Ordering::SeqCst);
        sh.kick_enabled.load(Ordering::Relaxed) != 0
    }

    pub fn cons(&self) -> u32 {
        let ctx = self.ctx;
        let sh = unsafe { ctx.as_ref() };
        sh.cons.load(Ordering::Acquire)
    }

    pub fn kick_enabled(&self) -> bool {
        let ctx = self.ctx;
        let sh = unsafe { ctx.as_ref() };
        sh.kick_enabled.load(Ordering::Relaxed) != 0
    }

    pub fn set_intr_at(&mut self, at: u32) {
        let ctx = self.ctx;
        let sh = unsafe { ctx.as_ref() };
        sh.intr_at.store(at, Ordering::Relaxed);
    }
}

/// Driver side of a split receive ring.
pub struct SringGuestRx {
    ctx: NonNull<SringRxCtx>,
    prod: u32,
}

impl SringGuestRx {
    /// # Safety
    ///
    /// `ctx` must point to an initialized split RX context.
    pub unsafe fn new(ctx: *mut u8) -> Self {
        Self {
            ctx: NonNull::new(ctx.cast()).expect("null ctx"),
            prod: 0,
        }
    }

    fn desc(&self, slot: u32) -> *mut SringDesc {
        unsafe {
            self.ctx
                .as_ptr()
                .cast::<u8>()
                .add(size_of::<SringRxCtx>())
                .cast::<SringDesc>()
                .add(slot as usize)
        }
    }

    /// Post one empty receive buffer; returns whether a kick is wanted.
    pub fn publish(&mut self, paddr: u64, len: u32) -> bool {
        let ctx = self.ctx;
        let sh = unsafe { ctx.as_ref() };
        let d = self.desc(self.prod & sh.qmask);
        unsafe {
            addr_of_mut!((*d).cookie).write_volatile(self.prod as u64);
            addr_of_mut!((*d).paddr).write_volatile(paddr);
            addr_of_mut!((*d).len).write_volatile(len);
            addr_of_mut!((*d).mark).write_volatile(0);
        }
        self.prod = self.prod.wrapping_add(1);
        sh.prod.store(self.prod, Ordering::Release);
        fence(Ordering::SeqCst);
        sh.kick_enabled.load(Ordering::Relaxed) != 0
    }

    pub fn cons(&self) -> u32 {
        let ctx = self.ctx;
        let sh = unsafe { ctx.as_ref() };
        sh.cons.load(Ordering::Acquire)
    }

    /// Received length written back into the given slot.
    pub fn completion_len(&self, slot: u32) -> u32 {
        unsafe { addr_of!((*self.desc(slot)).len).read_volatile() }
    }

    pub fn set_intr_enabled(&mut self, enabled: bool) {
        let ctx = self.ctx;
        let sh = unsafe { ctx.as_ref() };
        sh.intr_enabled.store(enabled as u32, Ordering::Relaxed);
    }
}

/// Driver side of a packed ring (either direction).
pub struct PackedGuest {
    ctx: NonNull<PackedCtx>,
    num_slots: u32,
    next_avail: u16,
    avail_wrap: bool,
    next_used: u16,
    used_wrap: bool,
    /// Publications not yet considered by `kick_needed`.
    unseen_pubs: Vec<(u16, bool)>,
}

impl PackedGuest {
    /// # Safety
    ///
    /// `ctx` must point to an initialized packed context of `num_slots`.
    pub unsafe fn new(ctx: *mut u8, num_slots: u32) -> Self {
        Self {
            ctx: NonNull::new(ctx.cast()).expect("null ctx"),
            num_slots,
            next_avail: 0,
            avail_wrap: true,
            next_used: 0,
            used_wrap: true,
            unseen_pubs: Vec::new(),
        }
    }

    fn desc(&self, slot: u16) -> *mut PackedDesc {
        unsafe {
            self.ctx
                .as_ptr()
                .cast::<u8>()
                .add(size_of::<PackedCtx>())
                .cast::<PackedDesc>()
                .add(slot as usize)
        }
    }

    /// Make a buffer available to the device.
    pub fn publish(&mut self, id: u16, addr: u64, len: u32, mark: u32) {
        let d = self.desc(self.next_avail);
        unsafe {
            addr_of_mut!((*d).addr).write_volatile(addr);
            addr_of_mut!((*d).len).write_volatile(len);
            addr_of_mut!((*d).id).write_volatile(id);
            addr_of_mut!((*d).mark).write_volatile(mark);
        }
        // Descriptor body before the flag store that makes it visible.
        fence(Ordering::Release);
        let flags = if self.avail_wrap {
            DESC_F_AVAIL
        } else {
            DESC_F_USED
        };
        unsafe { addr_of_mut!((*d).flags).write_volatile(flags) };

        self.unseen_pubs.push((self.next_avail, self.avail_wrap));
        self.next_avail += 1;
        if self.next_avail as u32 >= self.num_slots {
            self.next_avail = 0;
            self.avail_wrap = !self.avail_wrap;
        }
    }

    /// Whether any publication since the previous call requires a kick
    /// under the device's current suppression state.
    pub fn kick_needed(&mut self) -> bool {
        fence(Ordering::SeqCst);
        let ctx = self.ctx;
        let sh = unsafe { ctx.as_ref() };
        let (off_wrap, flags) = event_split(sh.device_event.load(Ordering::Relaxed));
        let pubs = std::mem::take(&mut self.unseen_pubs);
        match flags {
            EVENT_FLAG_DISABLE => false,
            EVENT_FLAG_ENABLE => !pubs.is_empty(),
            EVENT_FLAG_DESC => {
                let event_slot = off_wrap & !EVENT_F_WRAP_CTR;
                let event_wrap = off_wrap & EVENT_F_WRAP_CTR != 0;
                pubs.iter()
                    .any(|&(slot, wrap)| slot == event_slot && wrap == event_wrap)
            }
            _ => false,
        }
    }

    /// Buffer id currently stored in a ring slot.
    pub fn desc_id_at(&self, slot: u16) -> u16 {
        unsafe { addr_of!((*self.desc(slot)).id).read_volatile() }
    }

    /// Pop the next used buffer id, if any.
    pub fn poll_used(&mut self) -> Option<u16> {
        self.poll_used_with_len().map(|(id, _)| id)
    }

    /// Pop the next used buffer as (id, written length).
    pub fn poll_used_with_len(&mut self) -> Option<(u16, u32)> {
        let d = self.desc(self.next_used);
        let flags = unsafe { addr_of!((*d).flags).read_volatile() };
        let avail = flags & DESC_F_AVAIL != 0;
        let used = flags & DESC_F_USED != 0;
        // Used under the current wrap: both bits match the counter.
        if used != self.used_wrap || avail != self.used_wrap {
            return None;
        }
        fence(Ordering::Acquire);
        let id = unsafe { addr_of!((*d).id).read_volatile() };
        let len = unsafe { addr_of!((*d).len).read_volatile() };

        self.next_used += 1;
        if self.next_used as u32 >= self.num_slots {
            self.next_used = 0;
            self.used_wrap = !self.used_wrap;
        }
        Some((id, len))
    }

    /// Request a descriptor-mode interrupt when the device's used index
    /// crosses `idx` (within the current used generation).
    pub fn set_driver_event_idx(&mut self, idx: u16) {
        let ctx = self.ctx;
        let sh = unsafe { ctx.as_ref() };
        let off_wrap = idx | if self.used_wrap { EVENT_F_WRAP_CTR } else { 0 };
        sh.driver_event
            .store(event_word(off_wrap, EVENT_FLAG_DESC), Ordering::Relaxed);
    }

    /// Switch the driver event word to plain enable/disable mode.
    pub fn set_intr_mode(&mut self, enabled: bool) {
        let ctx = self.ctx;
        let sh = unsafe { ctx.as_ref() };
        let flags = if enabled {
            EVENT_FLAG_ENABLE
        } else {
            EVENT_FLAG_DISABLE
        };
        sh.driver_event
            .store(event_word(0, flags), Ordering::Relaxed);
    }
}
