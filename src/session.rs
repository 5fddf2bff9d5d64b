//! Guest sessions and the hypervisor control plane.
//!
//! The control thread owns every session: it accepts connections on the
//! UNIX listener, decodes control messages, and mutates per-guest state
//! only while that guest is not part of a running worker. Activating or
//! reconfiguring a running batch goes through the stop handshake: halt
//! the worker, take its state back, apply the change, restart.

use std::fs::File;
use std::io::{IoSlice, IoSliceMut, Read};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::io::BorrowedFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::cmsg_space;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr, recvmsg, sendmsg};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use vmm_sys_util::eventfd::EventFd;

use crate::dataplane::engine::{
    EngineConfig, GuestDataplane, RxQueue, TxQueue, WorkerHandle, WorkerState, drain_guest,
    spawn_worker,
};
use crate::dataplane::port::EgressPort;
use crate::dataplane::ring::{RxRing, Transport, TxRing};
use crate::memory::{MAX_REGIONS, MemoryError, MemoryTable};
use crate::proto::{
    self, CtxSizes, DIRECTION_RX, DIRECTION_TX, HDR_SIZE, MemoryMap, MsgHeader, Notifier,
    ProtoError, QueueCtx, QueueParams, ReqType, num_bufs_valid,
};
use crate::stats::{QueueStats, StatsReporter};

/// Process-wide shutdown flag, set from the signal handler.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Signal-safe shutdown request.
pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Release);
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("system error: {0}")]
    Sys(#[from] nix::errno::Errno),
    #[error(transparent)]
    Proto(#[from] ProtoError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("connection closed by the hypervisor")]
    Eof,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub transport: Transport,
    pub features_avail: u64,
    /// Directory holding the transport program objects.
    pub progdir: PathBuf,
    /// Number of ready guests that triggers the worker spawn.
    pub activation_threshold: usize,
    pub engine: EngineConfig,
    pub collect_stats: bool,
}

/// Dataplane resources under construction, owned by the session while
/// the guest is not part of a running batch.
#[derive(Default)]
struct PendingDataplane {
    mem: MemoryTable,
    rx_ring: Option<RxRing>,
    tx_ring: Option<TxRing>,
    rx_kick: Option<EventFd>,
    rx_irq: Option<EventFd>,
    tx_kick: Option<EventFd>,
    tx_irq: Option<EventFd>,
}

impl PendingDataplane {
    fn ready(&self, params: Option<&QueueParams>) -> bool {
        let Some(p) = params else {
            return false;
        };
        self.rx_ring.is_some()
            && self.tx_ring.is_some()
            && self.rx_kick.is_some()
            && self.rx_irq.is_some()
            && self.tx_kick.is_some()
            && self.tx_irq.is_some()
            && self.mem.num_regions() > 0
            && num_bufs_valid(p.num_rx_bufs as u64)
            && num_bufs_valid(p.num_tx_bufs as u64)
    }

    fn into_dataplane(self) -> GuestDataplane {
        GuestDataplane {
            mem: self.mem,
            rxq: RxQueue {
                ring: self.rx_ring.expect("rx ring"),
                kickfd: self.rx_kick.expect("rx kick"),
                irqfd: self.rx_irq.expect("rx irq"),
            },
            txq: TxQueue {
                ring: self.tx_ring.expect("tx ring"),
                kickfd: self.tx_kick.expect("tx kick"),
                irqfd: self.tx_irq.expect("tx irq"),
            },
        }
    }

    fn from_dataplane(dp: GuestDataplane) -> Self {
        Self {
            mem: dp.mem,
            rx_ring: Some(dp.rxq.ring),
            rx_kick: Some(dp.rxq.kickfd),
            rx_irq: Some(dp.rxq.irqfd),
            tx_ring: Some(dp.txq.ring),
            tx_kick: Some(dp.txq.kickfd),
            tx_irq: Some(dp.txq.irqfd),
        }
    }
}

pub struct GuestSession {
    stream: UnixStream,
    features_sel: u64,
    params: Option<QueueParams>,
    status: u32,
    /// Part of a running worker batch (dataplane moved out).
    running: bool,
    /// Staged for activation (dataplane moved into the batch).
    staged: bool,
    /// Receive-size cap implied by the negotiated LRO bits; enforced by
    /// the guest driver, recorded here for dumps.
    #[allow(dead_code)]
    max_rx_pkt_size: usize,
    upgrade_fd: Option<OwnedFd>,
    dp: Option<PendingDataplane>,
    rx_stats: Arc<QueueStats>,
    tx_stats: Arc<QueueStats>,
}

impl GuestSession {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            features_sel: 0,
            params: None,
            status: 0,
            running: false,
            staged: false,
            max_rx_pkt_size: 1518,
            upgrade_fd: None,
            dp: Some(PendingDataplane::default()),
            rx_stats: Arc::new(QueueStats::default()),
            tx_stats: Arc::new(QueueStats::default()),
        }
    }

    fn ready(&self) -> bool {
        self.dp
            .as_ref()
            .is_some_and(|dp| dp.ready(self.params.as_ref()))
    }
}

/// The worker batch: staged guests before the spawn, the live worker
/// handle afterwards. A single batch is supported.
struct Batch {
    worker: Option<WorkerHandle>,
    /// Session ids, in `WorkerState::guests` order.
    members: Vec<usize>,
    staged: Vec<(usize, GuestDataplane)>,
    /// The egress port, held here while no worker runs.
    port: Option<EgressPort>,
}

pub struct Daemon {
    cfg: SessionConfig,
    listener: UnixListener,
    socket_path: PathBuf,
    sessions: Vec<Option<GuestSession>>,
    batch: Batch,
    ticks_per_second: u64,
    reporters: Vec<StatsReporter>,
    last_report: Instant,
    shutdown: Arc<AtomicBool>,
}

impl Daemon {
    pub fn new(
        socket_path: PathBuf,
        port: EgressPort,
        cfg: SessionConfig,
        ticks_per_second: u64,
    ) -> std::io::Result<Self> {
        cfg.transport.check_alignment();

        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;
        info!(path = %socket_path.display(), transport = cfg.transport.name(), "listening");

        Ok(Self {
            cfg,
            listener,
            socket_path,
            sessions: Vec::new(),
            batch: Batch {
                worker: None,
                members: Vec::new(),
                staged: Vec::new(),
                port: Some(port),
            },
            ticks_per_second,
            reporters: Vec::new(),
            last_report: Instant::now(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Handle for programmatic shutdown (tests, embedding).
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    fn stop_requested(&self) -> bool {
        SHUTDOWN.load(Ordering::Acquire) || self.shutdown.load(Ordering::Acquire)
    }

    /// Control loop: accept guests, dispatch their messages, report
    /// stats. Returns after a shutdown request, with everything torn
    /// down.
    pub fn run(&mut self) {
        while !self.stop_requested() {
            let mut fds = Vec::with_capacity(self.sessions.len() + 1);
            fds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(self.listener.as_raw_fd()) },
                PollFlags::POLLIN,
            ));
            let mut slots = Vec::new();
            for (i, sess) in self.sessions.iter().enumerate() {
                if let Some(sess) = sess {
                    fds.push(PollFd::new(
                        unsafe { BorrowedFd::borrow_raw(sess.stream.as_raw_fd()) },
                        PollFlags::POLLIN,
                    ));
                    slots.push(i);
                }
            }

            match poll(&mut fds, PollTimeout::try_from(500u64).unwrap()) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    error!(error = %e, "control poll failed");
                    break;
                }
            }

            let accept_ready = fds[0]
                .revents()
                .is_some_and(|r| r.intersects(PollFlags::POLLIN));
            let readable: Vec<usize> = slots
                .iter()
                .zip(fds[1..].iter())
                .filter(|(_, fd)| {
                    fd.revents()
                        .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
                })
                .map(|(&slot, _)| slot)
                .collect();
            drop(fds);

            if accept_ready {
                self.accept_pending();
            }
            for slot in readable {
                match self.process_message(slot) {
                    Ok(()) => {}
                    Err(SessionError::Eof) => {
                        info!(guest = slot, "connection closed by the hypervisor");
                        self.close_session(slot);
                    }
                    Err(e) => {
                        warn!(guest = slot, error = %e, "session error");
                        self.close_session(slot);
                    }
                }
            }

            if self.cfg.collect_stats && self.last_report.elapsed() >= Duration::from_secs(1) {
                for reporter in &mut self.reporters {
                    reporter.report();
                }
                self.last_report = Instant::now();
            }
        }

        self.teardown();
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let slot = self
                        .sessions
                        .iter()
                        .position(Option::is_none)
                        .unwrap_or_else(|| {
                            self.sessions.push(None);
                            self.sessions.len() - 1
                        });
                    info!(guest = slot, "guest connected");
                    self.sessions[slot] = Some(GuestSession::new(stream));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Read and handle one message on a session socket.
    fn process_message(&mut self, slot: usize) -> Result<(), SessionError> {
        let (hdr, payload, mut fds) = {
            let sess = self.sessions[slot].as_mut().expect("live session");
            read_message(&mut sess.stream)?
        };

        if hdr.version() != proto::VERSION {
            warn!(guest = slot, version = hdr.version(), "protocol version mismatch");
            return Err(ProtoError::BadVersion(hdr.version()).into());
        }

        let mut resp = MsgHeader {
            reqtype: hdr.reqtype,
            flags: proto::VERSION,
            size: 0,
        };
        let mut resp_payload = Vec::new();
        let mut resp_fds: Vec<OwnedFd> = Vec::new();

        let outcome = ReqType::from_u32(hdr.reqtype)
            .map_err(SessionError::from)
            .and_then(|req| {
                if payload.len() != req.payload_size() {
                    return Err(ProtoError::PayloadSizeMismatch {
                        expected: req.payload_size(),
                        got: payload.len(),
                    }
                    .into());
                }
                debug!(guest = slot, ?req, "control request");
                self.handle_request(
                    slot,
                    req,
                    &payload,
                    &mut fds,
                    &mut resp_payload,
                    &mut resp_fds,
                )
            });

        match outcome {
            Ok(()) => {}
            Err(e) => {
                warn!(guest = slot, error = %e, "request failed");
                resp.flags |= proto::F_ERROR;
                resp_payload.clear();
                resp_fds.clear();
            }
        }

        resp.size = resp_payload.len() as u32;
        let sess = self.sessions[slot].as_mut().expect("live session");
        let raw_fds: Vec<RawFd> = resp_fds.iter().map(|fd| fd.as_raw_fd()).collect();
        send_response(&sess.stream, resp, &resp_payload, &raw_fds)?;
        Ok(())
    }

    fn handle_request(
        &mut self,
        slot: usize,
        req: ReqType,
        payload: &[u8],
        fds: &mut Vec<OwnedFd>,
        resp_payload: &mut Vec<u8>,
        resp_fds: &mut Vec<OwnedFd>,
    ) -> Result<(), SessionError> {
        // Requests that reshape the dataplane are refused while the guest
        // is being served by the worker.
        let active = {
            let sess = self.sessions[slot].as_ref().expect("live session");
            sess.running || sess.staged
        };
        if active
            && matches!(
                req,
                ReqType::SetFeatures
                    | ReqType::SetParameters
                    | ReqType::SetQueueCtx
                    | ReqType::SetQueueKick
            )
        {
            return Err(std::io::Error::other("backend is running").into());
        }

        match req {
            ReqType::GetFeatures => {
                resp_payload.extend_from_slice(&self.cfg.features_avail.to_le_bytes());
            }

            ReqType::SetFeatures => {
                let requested = u64::from_le_bytes(payload.try_into().unwrap());
                let sess = self.sessions[slot].as_mut().expect("live session");
                sess.features_sel = self.cfg.features_avail & requested;
                sess.max_rx_pkt_size = if sess.features_sel & proto::features::LRO_ANY != 0 {
                    65536
                } else {
                    1518
                };
                info!(
                    guest = slot,
                    features = format_args!("{:#x}", sess.features_sel),
                    "negotiated features"
                );
            }

            ReqType::SetParameters => {
                let params = QueueParams::decode(payload)?;
                if params.num_rx_queues != 1 || params.num_tx_queues != 1 {
                    // Single queue pair per guest.
                    return Err(std::io::Error::other("unsupported queue count").into());
                }
                if !num_bufs_valid(params.num_rx_bufs as u64)
                    || !num_bufs_valid(params.num_tx_bufs as u64)
                {
                    return Err(std::io::Error::other("invalid buffer count").into());
                }
                let sizes = CtxSizes {
                    rx_ctx_size: self.cfg.transport.rx_ctx_size(params.num_rx_bufs as usize)
                        as u64,
                    tx_ctx_size: self.cfg.transport.tx_ctx_size(params.num_tx_bufs as usize)
                        as u64,
                };
                let sess = self.sessions[slot].as_mut().expect("live session");
                sess.params = Some(params);
                info!(
                    guest = slot,
                    rx_bufs = params.num_rx_bufs,
                    tx_bufs = params.num_tx_bufs,
                    "queue parameters set"
                );
                let mut buf = [0u8; CtxSizes::SIZE];
                sizes.encode(&mut buf);
                resp_payload.extend_from_slice(&buf);
            }

            ReqType::GetPrograms => {
                let path = self.cfg.progdir.join(self.cfg.transport.progfile());
                let file = File::open(&path).map_err(|e| {
                    warn!(path = %path.display(), error = %e, "program object open failed");
                    SessionError::Io(e)
                })?;
                resp_fds.push(OwnedFd::from(file));
            }

            ReqType::SetMemTable => {
                let map = MemoryMap::decode(payload)?;
                let table = MemoryTable::from_map(&map, fds)?;
                let sess = self.sessions[slot].as_mut().expect("live session");
                let dp = sess.dp.as_mut().expect("idle session has dataplane");
                // Ring contexts point into the previous mapping; they must
                // be re-established against the new table.
                dp.rx_ring = None;
                dp.tx_ring = None;
                dp.mem = table;
                info!(guest = slot, regions = map.num_regions, "memory table installed");
            }

            ReqType::SetQueueCtx => {
                let ctx = QueueCtx::decode(payload)?;
                self.set_queue_ctx(slot, ctx)?;
            }

            ReqType::SetQueueKick | ReqType::SetQueueIrq => {
                let notifier = Notifier::decode(payload)?;
                if notifier.direction != DIRECTION_RX && notifier.direction != DIRECTION_TX {
                    return Err(std::io::Error::other("invalid queue direction").into());
                }
                if fds.len() > 1 {
                    return Err(std::io::Error::other("too many notifier fds").into());
                }
                let eventfd = match fds.pop() {
                    Some(fd) => Some(unsafe { EventFd::from_raw_fd(fd.into_raw_fd()) }),
                    None => None,
                };
                let sess = self.sessions[slot].as_mut().expect("live session");
                let dp = sess.dp.as_mut().expect("idle session has dataplane");
                let slot_ref = match (req, notifier.direction) {
                    (ReqType::SetQueueKick, DIRECTION_RX) => &mut dp.rx_kick,
                    (ReqType::SetQueueKick, DIRECTION_TX) => &mut dp.tx_kick,
                    (ReqType::SetQueueIrq, DIRECTION_RX) => &mut dp.rx_irq,
                    (ReqType::SetQueueIrq, DIRECTION_TX) => &mut dp.tx_irq,
                    _ => unreachable!(),
                };
                *slot_ref = eventfd;
                debug!(
                    guest = slot,
                    queue = notifier.queue_idx,
                    direction = notifier.direction,
                    kind = ?req,
                    "notifier installed"
                );
            }

            ReqType::SetUpgrade => {
                if fds.len() != 1 {
                    return Err(std::io::Error::other("missing upgrade fd").into());
                }
                let sess = self.sessions[slot].as_mut().expect("live session");
                sess.upgrade_fd = fds.pop();
                debug!(guest = slot, "upgrade notifier installed");
            }

            ReqType::RxEnable | ReqType::TxEnable => {
                let bit = if req == ReqType::RxEnable {
                    proto::status::RX_ENABLED
                } else {
                    proto::status::TX_ENABLED
                };
                {
                    let sess = self.sessions[slot].as_mut().expect("live session");
                    if !sess.running && !sess.staged && !sess.ready() {
                        return Err(std::io::Error::other("backend is not ready").into());
                    }
                    sess.status |= bit;
                }
                self.try_activate(slot)?;
            }

            ReqType::RxDisable | ReqType::TxDisable => {
                let bit = if req == ReqType::RxDisable {
                    proto::status::RX_ENABLED
                } else {
                    proto::status::TX_ENABLED
                };
                let fully_disabled = {
                    let sess = self.sessions[slot].as_mut().expect("live session");
                    sess.status &= !bit;
                    sess.status & (proto::status::RX_ENABLED | proto::status::TX_ENABLED) == 0
                };
                if fully_disabled {
                    self.deactivate(slot);
                }
            }
        }
        Ok(())
    }

    fn set_queue_ctx(&mut self, slot: usize, ctx: QueueCtx) -> Result<(), SessionError> {
        if ctx.direction != DIRECTION_RX && ctx.direction != DIRECTION_TX {
            return Err(std::io::Error::other("invalid queue direction").into());
        }
        if ctx.queue_idx >= 2 {
            return Err(std::io::Error::other("invalid queue index").into());
        }
        let transport = self.cfg.transport;
        let sess = self.sessions[slot].as_mut().expect("live session");
        let Some(params) = sess.params else {
            return Err(std::io::Error::other("queue parameters not negotiated").into());
        };
        let dp = sess.dp.as_mut().expect("idle session has dataplane");

        let is_rx = ctx.direction == DIRECTION_RX;
        let (num_bufs, ctx_size) = if is_rx {
            (
                params.num_rx_bufs,
                transport.rx_ctx_size(params.num_rx_bufs as usize),
            )
        } else {
            (
                params.num_tx_bufs,
                transport.tx_ctx_size(params.num_tx_bufs as usize),
            )
        };

        if ctx.gpa == 0 {
            // Detach.
            if is_rx {
                dp.rx_ring = None;
            } else {
                dp.tx_ring = None;
            }
            debug!(guest = slot, direction = ctx.direction, "queue context detached");
            return Ok(());
        }

        let Some(ptr) = dp.mem.translate(ctx.gpa, ctx_size as u64) else {
            return Err(std::io::Error::other("queue context gpa not mapped").into());
        };

        if is_rx {
            unsafe { transport.rx_ctx_init(ptr, num_bufs) };
            dp.rx_ring = Some(unsafe {
                RxRing::new(
                    transport,
                    ptr,
                    num_bufs,
                    format!("g{slot}.RX0"),
                    Arc::clone(&sess.rx_stats),
                )
            });
        } else {
            unsafe { transport.tx_ctx_init(ptr, num_bufs) };
            dp.tx_ring = Some(unsafe {
                TxRing::new(
                    transport,
                    ptr,
                    num_bufs,
                    format!("g{slot}.TX0"),
                    Arc::clone(&sess.tx_stats),
                )
            });
        }
        info!(
            guest = slot,
            direction = ctx.direction,
            gpa = format_args!("{:#x}", ctx.gpa),
            "queue context installed"
        );
        Ok(())
    }

    /// Stage a ready guest and spawn (or extend) the worker batch.
    fn try_activate(&mut self, slot: usize) -> Result<(), SessionError> {
        {
            let sess = self.sessions[slot].as_mut().expect("live session");
            if sess.running || sess.staged {
                return Ok(());
            }
            let dp = sess.dp.take().expect("idle session has dataplane");
            sess.staged = true;
            self.batch.staged.push((slot, dp.into_dataplane()));
        }
        info!(guest = slot, staged = self.batch.staged.len(), "guest staged for activation");

        if self.batch.worker.is_some() {
            // Extend the running batch through the stop handshake.
            self.stop_worker();
            self.start_worker()?;
        } else if self.batch.staged.len() >= self.cfg.activation_threshold {
            self.start_worker()?;
        }
        Ok(())
    }

    /// Remove a guest from the batch and hand its dataplane back.
    fn deactivate(&mut self, slot: usize) {
        let was_running = self.batch.worker.is_some();
        if was_running {
            self.stop_worker();
        }

        if let Some(pos) = self.batch.staged.iter().position(|(id, _)| *id == slot) {
            let (_, mut dp) = self.batch.staged.remove(pos);
            if let Some(port) = self.batch.port.as_mut() {
                drain_guest(&mut dp, port);
            }
            if let Some(sess) = self.sessions[slot].as_mut() {
                sess.dp = Some(PendingDataplane::from_dataplane(dp));
                sess.running = false;
                sess.staged = false;
            }
            info!(guest = slot, "guest deactivated");
        }

        if was_running && !self.batch.staged.is_empty() {
            if let Err(e) = self.start_worker() {
                error!(error = %e, "worker restart failed");
            }
        }
    }

    fn start_worker(&mut self) -> Result<(), SessionError> {
        let port = self
            .batch
            .port
            .take()
            .expect("port available while worker idle");
        let mut members = Vec::new();
        let mut guests = Vec::new();
        for (id, dp) in self.batch.staged.drain(..) {
            members.push(id);
            guests.push(dp);
        }
        let state = WorkerState { guests, port };
        let handle = spawn_worker(state, self.cfg.engine.clone(), self.ticks_per_second)
            .map_err(std::io::Error::other)?;
        self.batch.worker = Some(handle);
        self.batch.members = members;

        self.reporters.clear();
        for &id in &self.batch.members {
            if let Some(sess) = self.sessions[id].as_mut() {
                sess.running = true;
                sess.staged = false;
                if self.cfg.collect_stats {
                    self.reporters.push(StatsReporter::new(
                        format!("g{id}.RX0"),
                        Arc::clone(&sess.rx_stats),
                    ));
                    self.reporters.push(StatsReporter::new(
                        format!("g{id}.TX0"),
                        Arc::clone(&sess.tx_stats),
                    ));
                }
            }
        }
        info!(guests = self.batch.members.len(), "worker activated");
        Ok(())
    }

    /// Stop the worker and move its guests back to the staging area.
    fn stop_worker(&mut self) {
        let Some(handle) = self.batch.worker.take() else {
            return;
        };
        match handle.stop() {
            Ok(state) => {
                self.batch.port = Some(state.port);
                for (id, dp) in self.batch.members.drain(..).zip(state.guests) {
                    if let Some(sess) = self.sessions[id].as_mut() {
                        sess.running = false;
                        sess.staged = true;
                    }
                    self.batch.staged.push((id, dp));
                }
            }
            Err(e) => {
                error!(error = %e, "worker stop failed; batch state lost");
                self.batch.members.clear();
            }
        }
        self.reporters.clear();
    }

    fn close_session(&mut self, slot: usize) {
        let Some(sess) = self.sessions[slot].as_ref() else {
            return;
        };
        if sess.running || sess.staged {
            self.deactivate(slot);
        }
        // Session drop closes the stream, the upgrade fd and any queue
        // eventfds still held.
        self.sessions[slot] = None;
        info!(guest = slot, "session closed");
    }

    fn teardown(&mut self) {
        info!("shutting down");
        self.stop_worker();
        for slot in 0..self.sessions.len() {
            if self.sessions[slot].is_some() {
                self.close_session(slot);
            }
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Read one control message: header with ancillary fds, then the
/// payload the header announces.
fn read_message(stream: &mut UnixStream) -> Result<(MsgHeader, Vec<u8>, Vec<OwnedFd>), SessionError> {
    let mut hdr_buf = [0u8; HDR_SIZE];
    let mut cmsg_buf = cmsg_space!([RawFd; MAX_REGIONS]);
    let mut fds = Vec::new();

    let bytes = loop {
        let mut iov = [IoSliceMut::new(&mut hdr_buf)];
        match recvmsg::<UnixAddr>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        ) {
            Ok(msg) => {
                for cmsg in msg.cmsgs()? {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        for raw in received {
                            fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                        }
                    }
                }
                break msg.bytes;
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    };

    if bytes == 0 {
        return Err(SessionError::Eof);
    }
    if bytes < HDR_SIZE {
        return Err(ProtoError::Truncated {
            need: HDR_SIZE,
            got: bytes,
        }
        .into());
    }

    let hdr = MsgHeader::decode(&hdr_buf)?;
    if hdr.size as usize > MemoryMap::SIZE {
        return Err(ProtoError::PayloadSizeMismatch {
            expected: MemoryMap::SIZE,
            got: hdr.size as usize,
        }
        .into());
    }

    let mut payload = vec![0u8; hdr.size as usize];
    if !payload.is_empty() {
        stream.read_exact(&mut payload)?;
    }
    Ok((hdr, payload, fds))
}

fn send_response(
    stream: &UnixStream,
    hdr: MsgHeader,
    payload: &[u8],
    fds: &[RawFd],
) -> Result<(), SessionError> {
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
        stream.as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::empty(),
        None,
    )?;
    Ok(())
}
