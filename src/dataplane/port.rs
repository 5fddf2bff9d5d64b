//! Egress port abstraction.
//!
//! Every backend speaks the same iovec contract: `recv` fills the given
//! buffers with one frame and returns its length (0 when nothing is
//! pending), `send` consumes one frame. `WouldBlock` errors pause the
//! affected direction at the call sites until the next tick.

use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::unix::io::{AsFd, AsRawFd, RawFd};

use nix::libc;
use nix::sys::uio::{readv, writev};
use tracing::{debug, warn};
use vmm_sys_util::eventfd::EventFd;

use crate::proto::VNET_HDR_LEN;

/// TUN device flags from linux/if_tun.h.
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_VNET_HDR: libc::c_short = 0x4000;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUNSETVNETHDRSZ: libc::c_ulong = 0x4004_54d8;

/// ifreq for TUNSETIFF.
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// TAP-backed port: scatter-gather read/write on the device fd.
pub struct TapPort {
    name: String,
    file: File,
    vnet_hdr_len: usize,
}

impl TapPort {
    /// Open `/dev/net/tun` and attach to (or create) the named TAP
    /// device. With `vnet_hdr` set the kernel prepends/expects a 12-byte
    /// virtio-net header on every frame.
    pub fn open(name: &str, vnet_hdr: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;

        let mut ifr = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: IFF_TAP | IFF_NO_PI,
            _pad: [0; 22],
        };
        if vnet_hdr {
            ifr.ifr_flags |= IFF_VNET_HDR;
        }

        let name_bytes = name.as_bytes();
        if name_bytes.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "TAP device name too long",
            ));
        }
        for (i, &b) in name_bytes.iter().enumerate() {
            ifr.ifr_name[i] = b as libc::c_char;
        }

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut vnet_hdr_len = 0;
        if vnet_hdr {
            let len: libc::c_int = VNET_HDR_LEN as libc::c_int;
            let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETVNETHDRSZ as _, &len) };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            vnet_hdr_len = VNET_HDR_LEN;
        }

        // Nonblocking so a full TX queue surfaces as WouldBlock.
        let flags = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETFL) };
        if flags < 0
            || unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
        {
            return Err(io::Error::last_os_error());
        }

        debug!(device = name, vnet_hdr_len, "opened TAP port");
        Ok(Self {
            name: name.to_string(),
            file,
            vnet_hdr_len,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn recv(&mut self, iov: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        readv(self.file.as_fd(), iov).map_err(io::Error::from)
    }

    fn send(&mut self, iov: &[IoSlice<'_>]) -> io::Result<usize> {
        writev(self.file.as_fd(), iov).map_err(io::Error::from)
    }
}

/// Discards everything, reports full delivery, never receives.
#[derive(Default)]
pub struct SinkPort {
    pub sent_pkts: u64,
    pub sent_bytes: u64,
}

impl SinkPort {
    fn send(&mut self, iov: &[IoSlice<'_>]) -> io::Result<usize> {
        let bytes: usize = iov.iter().map(|s| s.len()).sum();
        self.sent_pkts += 1;
        self.sent_bytes += bytes as u64;
        Ok(bytes)
    }
}

/// Hard-coded UDP frame the synthetic source hands out on every recv.
const SOURCE_PKT: [u8; 60] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08, 0x00, 0x45,
    0x10, 0x00, 0x2e, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x26, 0xad, 0x0a, 0x00, 0x00, 0x01,
    0x0a, 0x01, 0x00, 0x01, 0x04, 0xd2, 0x04, 0xd2, 0x00, 0x1a, 0x15, 0x80, 0x6e, 0x65, 0x74,
    0x6d, 0x61, 0x70, 0x20, 0x70, 0x6b, 0x74, 0x2d, 0x67, 0x65, 0x6e, 0x20, 0x44, 0x49, 0x52,
];

/// Infinite generator of one canned UDP frame; sends are discarded.
pub struct SourcePort {
    vnet_hdr_len: usize,
    sink: SinkPort,
}

impl SourcePort {
    pub fn new(vnet_hdr_len: usize) -> Self {
        Self {
            vnet_hdr_len,
            sink: SinkPort::default(),
        }
    }

    fn recv(&mut self, iov: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        let mut iov = iov.iter_mut();
        let mut copied = 0;

        if self.vnet_hdr_len > 0 {
            let Some(first) = iov.next() else {
                return Ok(0);
            };
            if first.len() < self.vnet_hdr_len {
                return Ok(0);
            }
            first[..self.vnet_hdr_len].fill(0);
        }

        for slot in iov {
            if copied == SOURCE_PKT.len() {
                break;
            }
            let n = slot.len().min(SOURCE_PKT.len() - copied);
            slot[..n].copy_from_slice(&SOURCE_PKT[copied..copied + n]);
            copied += n;
        }
        Ok(copied)
    }
}

/// Event-only pair: never has data, discards sends, but owns an eventfd
/// that can be polled on.
pub struct NullPort {
    event: EventFd,
}

impl NullPort {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            event: EventFd::new(libc::EFD_NONBLOCK).map_err(io::Error::from)?,
        })
    }
}

/// Flag on all slots of a frame except the last one.
pub const SLOT_F_MOREFRAG: u16 = 1 << 0;

/// Payload capacity of one ring slot.
pub const SLOT_SIZE: usize = 2048;

struct Slot {
    len: u32,
    flags: u16,
    buf: Box<[u8; SLOT_SIZE]>,
}

/// One direction of the netmap-style port: a circular buffer of
/// fixed-size slots. Frames larger than one slot continue into the next
/// slot with `SLOT_F_MOREFRAG` set.
pub struct SlotRing {
    slots: Vec<Slot>,
    /// Next slot the consumer will take.
    head: usize,
    /// First slot not yet filled by the producer.
    tail: usize,
}

impl SlotRing {
    pub fn new(num_slots: usize) -> Self {
        assert!(num_slots >= 2);
        let slots = (0..num_slots)
            .map(|_| Slot {
                len: 0,
                flags: 0,
                buf: Box::new([0u8; SLOT_SIZE]),
            })
            .collect();
        Self {
            slots,
            head: 0,
            tail: 0,
        }
    }

    fn next_idx(&self, idx: usize) -> usize {
        let next = idx + 1;
        if next == self.slots.len() { 0 } else { next }
    }

    fn free_space(&self) -> usize {
        // One slot is kept open to distinguish full from empty.
        (self.head + self.slots.len() - self.tail - 1) % self.slots.len()
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Copy one frame out of the iovec into the ring, splitting across
    /// slots with MOREFRAG. Returns 0 when the ring has no room.
    pub fn push_frame(&mut self, iov: &[IoSlice<'_>]) -> usize {
        let total: usize = iov.iter().map(|s| s.len()).sum();
        let slots_needed = total.div_ceil(SLOT_SIZE).max(1);
        if slots_needed > self.free_space() {
            return 0;
        }

        let mut idx = self.tail;
        let mut slot_ofs = 0;
        for frag in iov {
            let mut src = &frag[..];
            while !src.is_empty() {
                if slot_ofs == SLOT_SIZE {
                    let slot = &mut self.slots[idx];
                    slot.len = SLOT_SIZE as u32;
                    slot.flags = SLOT_F_MOREFRAG;
                    idx = self.next_idx(idx);
                    slot_ofs = 0;
                }
                let n = src.len().min(SLOT_SIZE - slot_ofs);
                self.slots[idx].buf[slot_ofs..slot_ofs + n].copy_from_slice(&src[..n]);
                slot_ofs += n;
                src = &src[n..];
            }
        }
        let last = &mut self.slots[idx];
        last.len = slot_ofs as u32;
        last.flags = 0;
        self.tail = self.next_idx(idx);
        total
    }

    /// Copy the next frame from the ring into the iovec, following the
    /// MOREFRAG chain. Returns 0 when the ring is empty; truncates (with
    /// a warning) when the iovec is too small.
    pub fn pop_frame(&mut self, iov: &mut [IoSliceMut<'_>]) -> usize {
        if self.is_empty() {
            return 0;
        }

        let mut idx = self.head;
        let mut copied = 0;
        let mut truncated = 0usize;
        let mut iov_iter = iov.iter_mut();
        let mut dst: Option<&mut IoSliceMut<'_>> = iov_iter.next();
        let mut dst_ofs = 0;

        loop {
            let (slot_len, slot_flags) = {
                let slot = &self.slots[idx];
                (slot.len as usize, slot.flags)
            };
            let mut frag_ofs = 0;
            while frag_ofs < slot_len {
                let dst_full = matches!(dst, Some(ref d) if dst_ofs == d.len());
                if dst_full {
                    dst = iov_iter.next();
                    dst_ofs = 0;
                    continue;
                }
                match dst {
                    Some(ref mut d) => {
                        let n = (d.len() - dst_ofs).min(slot_len - frag_ofs);
                        d[dst_ofs..dst_ofs + n]
                            .copy_from_slice(&self.slots[idx].buf[frag_ofs..frag_ofs + n]);
                        dst_ofs += n;
                        frag_ofs += n;
                        copied += n;
                    }
                    None => {
                        truncated += slot_len - frag_ofs;
                        break;
                    }
                }
            }

            idx = self.next_idx(idx);
            if slot_flags & SLOT_F_MOREFRAG == 0 || idx == self.tail {
                break;
            }
        }

        if truncated > 0 {
            warn!(truncated, "recv iovec too small for ring frame");
        }
        self.head = idx;
        copied
    }
}

/// Shared-memory ring port: one slot ring per direction.
pub struct RingPort {
    /// Engine-bound frames (the peer's transmissions).
    pub rx: SlotRing,
    /// Frames the engine transmitted.
    pub tx: SlotRing,
}

impl RingPort {
    pub fn new(num_slots: usize) -> Self {
        Self {
            rx: SlotRing::new(num_slots),
            tx: SlotRing::new(num_slots),
        }
    }
}

pub enum EgressPort {
    Tap(TapPort),
    Sink(SinkPort),
    Source(SourcePort),
    Null(NullPort),
    Ring(RingPort),
}

impl EgressPort {
    /// Receive one frame into the iovec. Ok(0) means nothing pending.
    pub fn recv(&mut self, iov: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        match self {
            EgressPort::Tap(tap) => tap.recv(iov),
            EgressPort::Sink(_) | EgressPort::Null(_) => Ok(0),
            EgressPort::Source(src) => src.recv(iov),
            EgressPort::Ring(ring) => Ok(ring.rx.pop_frame(iov)),
        }
    }

    /// Send one frame. Ok(0) means the port is out of room right now.
    pub fn send(&mut self, iov: &[IoSlice<'_>]) -> io::Result<usize> {
        match self {
            EgressPort::Tap(tap) => tap.send(iov),
            EgressPort::Sink(sink) => sink.send(iov),
            EgressPort::Source(src) => src.sink.send(iov),
            EgressPort::Null(_) => Ok(iov.iter().map(|s| s.len()).sum()),
            EgressPort::Ring(ring) => Ok(ring.tx.push_frame(iov)),
        }
    }

    /// File descriptor to include in the poll set, if the backend has one.
    pub fn pollable_fd(&self) -> Option<RawFd> {
        match self {
            EgressPort::Tap(tap) => Some(tap.file.as_raw_fd()),
            EgressPort::Null(null) => Some(null.event.as_raw_fd()),
            _ => None,
        }
    }

    /// Bytes of virtio-net header prepended to every frame.
    pub fn vnet_hdr_len(&self) -> usize {
        match self {
            EgressPort::Tap(tap) => tap.vnet_hdr_len,
            EgressPort::Source(src) => src.vnet_hdr_len,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ios(buf: &[u8]) -> [IoSlice<'_>; 1] {
        [IoSlice::new(buf)]
    }

    #[test]
    fn test_sink_counts() {
        let mut port = EgressPort::Sink(SinkPort::default());
        let frame = [0u8; 1500];
        assert_eq!(port.send(&ios(&frame)).unwrap(), 1500);
        assert_eq!(port.send(&ios(&frame[..60])).unwrap(), 60);
        let EgressPort::Sink(sink) = &port else {
            unreachable!()
        };
        assert_eq!(sink.sent_pkts, 2);
        assert_eq!(sink.sent_bytes, 1560);
        let mut buf = [0u8; 64];
        let mut iov = [IoSliceMut::new(&mut buf)];
        assert_eq!(port.recv(&mut iov).unwrap(), 0);
    }

    #[test]
    fn test_source_frame() {
        let mut port = EgressPort::Source(SourcePort::new(0));
        let mut buf = [0u8; 2048];
        let mut iov = [IoSliceMut::new(&mut buf)];
        let n = port.recv(&mut iov).unwrap();
        assert_eq!(n, SOURCE_PKT.len());
        assert_eq!(&buf[..n], &SOURCE_PKT[..]);
        // Ethertype IPv4, UDP.
        assert_eq!(&buf[12..14], &[0x08, 0x00]);
        assert_eq!(buf[23], 0x11);
    }

    #[test]
    fn test_source_with_vnet_hdr() {
        let mut port = EgressPort::Source(SourcePort::new(VNET_HDR_LEN));
        let mut hdr = [0xffu8; VNET_HDR_LEN];
        let mut buf = [0u8; 2048];
        let mut iov = [IoSliceMut::new(&mut hdr), IoSliceMut::new(&mut buf)];
        let n = port.recv(&mut iov).unwrap();
        assert_eq!(n, SOURCE_PKT.len());
        assert_eq!(hdr, [0u8; VNET_HDR_LEN]);
        assert_eq!(&buf[..n], &SOURCE_PKT[..]);
    }

    #[test]
    fn test_slot_ring_roundtrip_small() {
        let mut ring = SlotRing::new(8);
        let frame: Vec<u8> = (0..100u8).collect();
        assert_eq!(ring.push_frame(&ios(&frame)), 100);

        let mut buf = [0u8; 2048];
        assert_eq!(ring.pop_frame(&mut [IoSliceMut::new(&mut buf)]), 100);
        assert_eq!(&buf[..100], &frame[..]);
        assert_eq!(ring.pop_frame(&mut [IoSliceMut::new(&mut buf)]), 0);
    }

    #[test]
    fn test_slot_ring_morefrag() {
        let mut ring = SlotRing::new(8);
        // Three slots worth of data: two MOREFRAG slots plus a tail.
        let frame: Vec<u8> = (0..(SLOT_SIZE * 2 + 100)).map(|i| i as u8).collect();
        assert_eq!(ring.push_frame(&ios(&frame)), frame.len());
        assert_eq!(ring.slots[0].flags, SLOT_F_MOREFRAG);
        assert_eq!(ring.slots[1].flags, SLOT_F_MOREFRAG);
        assert_eq!(ring.slots[2].flags, 0);
        assert_eq!(ring.slots[2].len, 100);

        let mut buf = vec![0u8; SLOT_SIZE * 3];
        let mut iov = [IoSliceMut::new(&mut buf)];
        assert_eq!(ring.pop_frame(&mut iov), frame.len());
        assert_eq!(&buf[..frame.len()], &frame[..]);
    }

    #[test]
    fn test_slot_ring_full() {
        let mut ring = SlotRing::new(4);
        let frame = [0xabu8; SLOT_SIZE];
        // Capacity is num_slots - 1.
        assert_eq!(ring.push_frame(&ios(&frame)), SLOT_SIZE);
        assert_eq!(ring.push_frame(&ios(&frame)), SLOT_SIZE);
        assert_eq!(ring.push_frame(&ios(&frame)), SLOT_SIZE);
        assert_eq!(ring.push_frame(&ios(&frame)), 0);

        let mut buf = [0u8; SLOT_SIZE];
        let mut iov = [IoSliceMut::new(&mut buf)];
        assert_eq!(ring.pop_frame(&mut iov), SLOT_SIZE);
        assert_eq!(ring.push_frame(&ios(&frame)), SLOT_SIZE);
    }

    #[test]
    fn test_slot_ring_interleaved_frames() {
        let mut ring = SlotRing::new(16);
        let a = [1u8; 300];
        let b = [2u8; SLOT_SIZE + 10];
        let c = [3u8; 50];
        ring.push_frame(&ios(&a));
        ring.push_frame(&ios(&b));
        ring.push_frame(&ios(&c));

        let mut buf = vec![0u8; SLOT_SIZE * 2];
        let mut iov = [IoSliceMut::new(&mut buf)];
        assert_eq!(ring.pop_frame(&mut iov), 300);
        assert_eq!(buf[0], 1);
        let mut iov = [IoSliceMut::new(&mut buf)];
        assert_eq!(ring.pop_frame(&mut iov), SLOT_SIZE + 10);
        assert_eq!(buf[0], 2);
        let mut iov = [IoSliceMut::new(&mut buf)];
        assert_eq!(ring.pop_frame(&mut iov), 50);
        assert_eq!(buf[0], 3);
    }

    #[test]
    fn test_ring_port_directions() {
        let mut port = EgressPort::Ring(RingPort::new(8));
        let frame = [9u8; 128];
        assert_eq!(port.send(&ios(&frame)).unwrap(), 128);

        // Nothing to receive until the peer injects a frame.
        let mut buf = [0u8; 256];
        let mut iov = [IoSliceMut::new(&mut buf)];
        assert_eq!(port.recv(&mut iov).unwrap(), 0);

        let EgressPort::Ring(ring) = &mut port else {
            unreachable!()
        };
        let inject = [7u8; 64];
        ring.rx.push_frame(&ios(&inject));
        let mut iov = [IoSliceMut::new(&mut buf)];
        assert_eq!(port.recv(&mut iov).unwrap(), 64);
        assert_eq!(&buf[..64], &inject[..]);
    }
}
