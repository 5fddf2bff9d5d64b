//! Shared harness for integration tests: sring guest construction for
//! engine tests and a control-socket client for daemon tests.

#![allow(dead_code)]

use std::io::{IoSlice, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use nix::sys::socket::{ControlMessage, MsgFlags, UnixAddr, sendmsg};
use vmm_sys_util::eventfd::EventFd;

use pvnet::dataplane::engine::{GuestDataplane, RxQueue, TxQueue};
use pvnet::dataplane::ring::{RxRing, Transport, TxRing, sring};
use pvnet::proto::{HDR_SIZE, MsgHeader, ReqType, VERSION};
use pvnet::stats::QueueStats;
use pvnet::test_util::guest::{SringGuestRx, SringGuestTx};
use pvnet::test_util::shmem::{AlignedCtx, GuestRam};

/// The guest half of an engine-test session: RAM, ring contexts, the
/// driver-side views and the irqfd read ends.
pub struct TestGuest {
    pub ram: GuestRam,
    pub rx_ctx: AlignedCtx,
    pub tx_ctx: AlignedCtx,
    pub rx_driver: SringGuestRx,
    pub tx_driver: SringGuestTx,
    pub rx_kick: EventFd,
    pub tx_kick: EventFd,
    pub rx_irq: EventFd,
    pub tx_irq: EventFd,
}

impl TestGuest {
    /// Number of IRQs delivered on an eventfd since the last call.
    pub fn drain_irqs(fd: &EventFd) -> u64 {
        fd.read().unwrap_or(0)
    }
}

/// Build one split-ring guest with heap-allocated contexts and memfd RAM.
pub fn sring_guest(num_bufs: u32, gpa_base: u64) -> (TestGuest, GuestDataplane) {
    let ram = GuestRam::new(gpa_base, 256 * 1024);
    let rx_ctx = AlignedCtx::alloc(sring::rx_ctx_size(num_bufs as usize));
    let tx_ctx = AlignedCtx::alloc(sring::tx_ctx_size(num_bufs as usize));
    unsafe {
        sring::rx_ctx_init(rx_ctx.ptr(), num_bufs);
        sring::tx_ctx_init(tx_ctx.ptr(), num_bufs);
    }

    let rx_ring = unsafe {
        RxRing::new(
            Transport::Sring,
            rx_ctx.ptr(),
            num_bufs,
            "RX0".into(),
            Arc::new(QueueStats::default()),
        )
    };
    let tx_ring = unsafe {
        TxRing::new(
            Transport::Sring,
            tx_ctx.ptr(),
            num_bufs,
            "TX0".into(),
            Arc::new(QueueStats::default()),
        )
    };

    let nb = nix::libc::EFD_NONBLOCK;
    let rx_kick = EventFd::new(nb).expect("eventfd");
    let tx_kick = EventFd::new(nb).expect("eventfd");
    let rx_irq = EventFd::new(nb).expect("eventfd");
    let tx_irq = EventFd::new(nb).expect("eventfd");

    let dp = GuestDataplane {
        mem: ram.table(),
        rxq: RxQueue {
            ring: rx_ring,
            kickfd: rx_kick.try_clone().expect("clone kick"),
            irqfd: rx_irq.try_clone().expect("clone irq"),
        },
        txq: TxQueue {
            ring: tx_ring,
            kickfd: tx_kick.try_clone().expect("clone kick"),
            irqfd: tx_irq.try_clone().expect("clone irq"),
        },
    };

    let rx_driver = unsafe { SringGuestRx::new(rx_ctx.ptr()) };
    let tx_driver = unsafe { SringGuestTx::new(tx_ctx.ptr()) };

    (
        TestGuest {
            ram,
            rx_ctx,
            tx_ctx,
            rx_driver,
            tx_driver,
            rx_kick,
            tx_kick,
            rx_irq,
            tx_irq,
        },
        dp,
    )
}

/// Hypervisor-side control client speaking the daemon protocol.
pub struct ControlClient {
    pub stream: UnixStream,
}

impl ControlClient {
    pub fn connect(path: &std::path::Path) -> std::io::Result<Self> {
        Ok(Self {
            stream: UnixStream::connect(path)?,
        })
    }

    /// Send a request with optional payload and SCM_RIGHTS fds, then read
    /// the response header and payload.
    pub fn request(
        &mut self,
        req: ReqType,
        payload: &[u8],
        fds: &[RawFd],
    ) -> std::io::Result<(MsgHeader, Vec<u8>)> {
        let hdr = MsgHeader::request(req, payload.len() as u32);
        let mut buf = vec![0u8; HDR_SIZE + payload.len()];
        let mut hdr_bytes = [0u8; HDR_SIZE];
        hdr.encode(&mut hdr_bytes);
        buf[..HDR_SIZE].copy_from_slice(&hdr_bytes);
        buf[HDR_SIZE..].copy_from_slice(payload);

        let iov = [IoSlice::new(&buf)];
        let cmsgs: Vec<ControlMessage> = if fds.is_empty() {
            Vec::new()
        } else {
            vec![ControlMessage::ScmRights(fds)]
        };
        sendmsg::<UnixAddr>(
            self.stream.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::empty(),
            None,
        )
        .map_err(std::io::Error::from)?;

        let mut hdr_buf = [0u8; HDR_SIZE];
        self.stream.read_exact(&mut hdr_buf)?;
        let resp = MsgHeader::decode(&hdr_buf).map_err(std::io::Error::other)?;
        assert_eq!(resp.version(), VERSION);
        let mut resp_payload = vec![0u8; resp.size as usize];
        if !resp_payload.is_empty() {
            self.stream.read_exact(&mut resp_payload)?;
        }
        Ok((resp, resp_payload))
    }
}
