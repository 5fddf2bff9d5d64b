//! Dataplane worker.
//!
//! One worker thread serves a batch of guests. In scheduler mode each
//! tick moves packets egress-port → RX rings (ingress), TX rings →
//! scheduler (acquire), scheduler → egress port under the link pacer
//! (dequeue), and finally releases completed buffers and raises IRQs.
//! Without the scheduler the worker runs the direct spin or poll loop.
//!
//! The control thread owns all guest state while the worker is stopped;
//! stopping stores HALT with release ordering, pokes the stop eventfd and
//! joins, and the worker hands its state back through the join handle.

use std::io::IoSlice;
use std::os::unix::io::{AsRawFd, BorrowedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::bounded;
use nix::libc;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, info, trace, warn};
use vmm_sys_util::eventfd::EventFd;

use crate::dataplane::classifier::{self, MarkMode, NUM_CLASSES};
use crate::dataplane::port::EgressPort;
use crate::dataplane::ring::{RX_BUDGET, RxRing, TX_BUDGET, TxRing};
use crate::dataplane::sched::{DrrScheduler, LinkPacer, PktPool};
use crate::memory::MemoryTable;
use crate::stats::QueueStats;
use crate::tsc;

pub const STOP_NONE: u32 = 0;
pub const STOP_HALT: u32 = 1;

pub struct RxQueue {
    pub ring: RxRing,
    pub kickfd: EventFd,
    pub irqfd: EventFd,
}

pub struct TxQueue {
    pub ring: TxRing,
    pub kickfd: EventFd,
    pub irqfd: EventFd,
}

/// Per-guest dataplane state, owned by the worker while it runs.
pub struct GuestDataplane {
    pub mem: MemoryTable,
    pub rxq: RxQueue,
    pub txq: TxQueue,
}

#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// Emulated link bandwidth, bits per second.
    pub bw: f64,
    /// Scheduling interval in nanoseconds.
    pub interval_ns: u64,
    /// Maximum packets dequeued per tick.
    pub batch_limit: u32,
    /// Bytes of credit per flow weight unit per round.
    pub quantum: u32,
    /// Per-flow weights; the length fixes the flow count.
    pub weights: Vec<u32>,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            bw: 1e9,
            interval_ns: 5_000,
            batch_limit: 500,
            quantum: 1500,
            weights: vec![1; NUM_CLASSES as usize],
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub busy_wait: bool,
    pub mark_mode: MarkMode,
    /// Optional coarse sleep per iteration, for fast-consumer setups.
    pub sleep_usecs: u64,
    pub sched: Option<SchedConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            busy_wait: true,
            mark_mode: MarkMode::None,
            sleep_usecs: 0,
            sched: Some(SchedConfig::default()),
        }
    }
}

/// Everything the worker thread owns while running.
pub struct WorkerState {
    pub guests: Vec<GuestDataplane>,
    pub port: EgressPort,
}

fn signal_irq(irqfd: &EventFd, stats: &QueueStats, queue: &str) {
    match irqfd.write(1) {
        Ok(()) => stats.inc_irqs(),
        Err(e) => warn!(queue, error = %e, "irqfd signal failed"),
    }
}

/// Outcome of one scheduler tick, for pacing and for tests.
#[derive(Debug, Clone, Copy)]
pub struct TickStats {
    pub now: u64,
    pub ingress: usize,
    pub acquired: usize,
    pub dequeued: u32,
    pub dropped: u32,
}

/// Scheduler-mode engine: deterministic tick over a batch of guests.
pub struct SchedEngine {
    guests: Vec<GuestDataplane>,
    port: EgressPort,
    pool: PktPool,
    sched: DrrScheduler,
    pacer: LinkPacer,
    mark_mode: MarkMode,
    vnet_hdr_len: usize,
}

impl SchedEngine {
    pub fn new(
        guests: Vec<GuestDataplane>,
        port: EgressPort,
        cfg: &SchedConfig,
        mark_mode: MarkMode,
        ticks_per_second: u64,
    ) -> Self {
        // One handle per TX descriptor that can be in flight: returning a
        // handle is the release-eligibility signal, so the pool can never
        // run dry before the rings do.
        let capacity: u32 = guests.iter().map(|g| g.txq.ring.num_slots()).sum();
        let vnet_hdr_len = port.vnet_hdr_len();
        Self {
            guests,
            port,
            pool: PktPool::new(capacity.max(1) as usize),
            sched: DrrScheduler::new(cfg.quantum, &cfg.weights),
            pacer: LinkPacer::new(ticks_per_second, cfg.bw, cfg.interval_ns, cfg.batch_limit),
            mark_mode,
            vnet_hdr_len,
        }
    }

    /// Set the link-idle origin. Returns the tick origin.
    pub fn start(&mut self) -> u64 {
        let now = tsc::rdtsc();
        self.pacer.start(now);
        now
    }

    pub fn pacer(&self) -> &LinkPacer {
        &self.pacer
    }

    pub fn guests(&mut self) -> &mut [GuestDataplane] {
        &mut self.guests
    }

    pub fn port(&mut self) -> &mut EgressPort {
        &mut self.port
    }

    pub fn into_parts(self) -> (Vec<GuestDataplane>, EgressPort) {
        (self.guests, self.port)
    }

    /// One engine iteration: ingress, acquire, paced dequeue, notify.
    pub fn tick(&mut self) -> TickStats {
        let now = tsc::rdtsc();
        let mut stats = TickStats {
            now,
            ingress: 0,
            acquired: 0,
            dequeued: 0,
            dropped: 0,
        };

        // Ingress: egress port into the first receive ring of each guest.
        for g in self.guests.iter_mut() {
            let (count, irq) = g.rxq.ring.push(&mut g.mem, &mut self.port, None);
            stats.ingress += count;
            if irq {
                signal_irq(&g.rxq.irqfd, g.rxq.ring.stats(), "rx");
            }
        }

        // Acquire available TX descriptors into the scheduler.
        for (gi, g) in self.guests.iter_mut().enumerate() {
            for _ in 0..TX_BUDGET {
                let Some(buf) = g.txq.ring.pop_avail(&mut g.mem, None) else {
                    break;
                };
                let flow_id = match self.mark_mode {
                    MarkMode::None => 0,
                    MarkMode::Guest => buf.guest_mark,
                    MarkMode::Hv => {
                        let skip = self.vnet_hdr_len.min(buf.len as usize);
                        let frame = unsafe {
                            std::slice::from_raw_parts(
                                buf.ptr.add(skip) as *const u8,
                                buf.len as usize - skip,
                            )
                        };
                        classifier::mark(frame)
                    }
                };

                let Some(h) = self.pool.alloc() else {
                    // Sized to the sum of ring capacities; reaching this
                    // means a ring reported more slots than it has.
                    g.txq.ring.release(buf.opaque_id);
                    g.txq.ring.stats().inc_drops();
                    stats.dropped += 1;
                    continue;
                };
                let pkt = self.pool.get_mut(h);
                pkt.ptr = buf.ptr;
                pkt.len = buf.len;
                pkt.guest = gi as u16;
                pkt.queue = 0;
                pkt.opaque_id = buf.opaque_id;
                pkt.flow_id = flow_id;

                if self.sched.enqueue(&mut self.pool, h) {
                    stats.acquired += 1;
                } else {
                    // Invalid class: give the buffer straight back.
                    self.pool.put(h);
                    g.txq.ring.release(buf.opaque_id);
                    g.txq.ring.stats().inc_drops();
                    stats.dropped += 1;
                }
            }
        }

        // Dequeue under the byte-time and batch budgets.
        while self.pacer.can_dequeue(now, stats.dequeued) {
            let Some(h) = self.sched.dequeue(&mut self.pool) else {
                break;
            };
            let pkt = *self.pool.get(h);
            let frame =
                unsafe { std::slice::from_raw_parts(pkt.ptr as *const u8, pkt.len as usize) };
            if let Err(e) = self.port.send(&[IoSlice::new(frame)]) {
                // The packet consumed its link slot either way; it is
                // dropped, not retried.
                trace!(error = %e, "egress send failed");
                self.guests[pkt.guest as usize].txq.ring.stats().inc_drops();
            }
            self.pacer.account(pkt.len);
            stats.dequeued += 1;

            let g = &mut self.guests[pkt.guest as usize];
            g.txq.ring.release(pkt.opaque_id);
            self.pool.put(h);
        }

        // Completion IRQs are evaluated once per tick, after the batch.
        if stats.dequeued > 0 {
            for g in self.guests.iter_mut() {
                if g.txq.ring.notify() {
                    signal_irq(&g.txq.irqfd, g.txq.ring.stats(), "tx");
                }
            }
        }

        stats
    }

    pub fn idle_sleep(&mut self, now: u64, ndeq: u32) {
        self.pacer.idle_sleep(now, ndeq);
    }
}

/// Drain a guest's pending TX work straight to the port (teardown path).
pub fn drain_guest(g: &mut GuestDataplane, port: &mut EgressPort) {
    let limit = g.txq.ring.num_slots() as usize;
    let mut drained = 0;
    loop {
        let (count, _) = g.txq.ring.drain(&mut g.mem, port, None);
        drained += count;
        if count == 0 || drained >= limit {
            break;
        }
    }
    if drained > 0 {
        debug!(drained, "drained pending TX buffers");
    }
}

pub struct WorkerHandle {
    thread: JoinHandle<WorkerState>,
    stopflag: Arc<AtomicU32>,
    stop_event: EventFd,
}

impl WorkerHandle {
    /// Halt the worker and take its state back.
    pub fn stop(self) -> Result<WorkerState, String> {
        self.stopflag.store(STOP_HALT, Ordering::Release);
        if let Err(e) = self.stop_event.write(1) {
            warn!(error = %e, "stop eventfd signal failed");
        }
        self.thread.join().map_err(|_| "worker panicked".to_string())
    }

    pub fn is_running(&self) -> bool {
        !self.thread.is_finished()
    }
}

/// Spawn the batch worker and wait until it is live.
pub fn spawn_worker(
    state: WorkerState,
    cfg: EngineConfig,
    ticks_per_second: u64,
) -> Result<WorkerHandle, String> {
    let stopflag = Arc::new(AtomicU32::new(STOP_NONE));
    let flag = Arc::clone(&stopflag);
    let stop_event = EventFd::new(libc::EFD_NONBLOCK)
        .map_err(|e| format!("failed to create stop event: {e}"))?;
    let stop_clone = stop_event
        .try_clone()
        .map_err(|e| format!("failed to clone stop event: {e}"))?;

    let (ready_tx, ready_rx) = bounded::<()>(1);
    let thread = thread::Builder::new()
        .name("pvnet-worker".to_string())
        .spawn(move || {
            let _ = ready_tx.send(());
            run_worker(state, cfg, ticks_per_second, &flag, stop_clone)
        })
        .map_err(|e| format!("failed to spawn worker thread: {e}"))?;

    ready_rx
        .recv_timeout(Duration::from_secs(5))
        .map_err(|_| "timeout waiting for worker start".to_string())?;

    Ok(WorkerHandle {
        thread,
        stopflag,
        stop_event,
    })
}

fn run_worker(
    state: WorkerState,
    cfg: EngineConfig,
    ticks_per_second: u64,
    stopflag: &AtomicU32,
    stop_event: EventFd,
) -> WorkerState {
    info!(
        guests = state.guests.len(),
        busy_wait = cfg.busy_wait,
        scheduler = cfg.sched.is_some(),
        "worker started"
    );

    let state = if let Some(ref scfg) = cfg.sched {
        run_sched(state, &cfg, scfg, ticks_per_second, stopflag)
    } else if cfg.busy_wait {
        run_spin(state, &cfg, stopflag)
    } else {
        run_poll(state, &cfg, stopflag, &stop_event)
    };

    info!("worker stopped");
    state
}

/// Busy-wait scheduler loop: kicks disabled for the whole run.
fn run_sched(
    mut state: WorkerState,
    cfg: &EngineConfig,
    scfg: &SchedConfig,
    ticks_per_second: u64,
    stopflag: &AtomicU32,
) -> WorkerState {
    for g in &mut state.guests {
        g.rxq.ring.set_kicks(false);
        g.txq.ring.set_kicks(false);
    }

    let mut engine = SchedEngine::new(state.guests, state.port, scfg, cfg.mark_mode, ticks_per_second);
    engine.start();

    while stopflag.load(Ordering::Acquire) == STOP_NONE {
        let t = engine.tick();
        if t.dequeued > 0 && tracing::enabled!(tracing::Level::TRACE) {
            for g in engine.guests() {
                g.rxq.ring.dump();
                g.txq.ring.dump();
            }
        }
        engine.idle_sleep(t.now, t.dequeued);
        if cfg.sleep_usecs > 0 {
            thread::sleep(Duration::from_micros(cfg.sleep_usecs));
        }
    }

    let (guests, port) = engine.into_parts();
    WorkerState { guests, port }
}

/// Busy-wait direct loop: no scheduler, rings drain straight to the port.
fn run_spin(mut state: WorkerState, cfg: &EngineConfig, stopflag: &AtomicU32) -> WorkerState {
    for g in &mut state.guests {
        g.rxq.ring.set_kicks(false);
        g.txq.ring.set_kicks(false);
    }

    while stopflag.load(Ordering::Acquire) == STOP_NONE {
        for g in &mut state.guests {
            let (_count, irq) = g.rxq.ring.push(&mut g.mem, &mut state.port, None);
            if irq {
                signal_irq(&g.rxq.irqfd, g.rxq.ring.stats(), "rx");
            }

            let (_count, irq) = g.txq.ring.drain(&mut g.mem, &mut state.port, None);
            if irq {
                signal_irq(&g.txq.irqfd, g.txq.ring.stats(), "tx");
            }
        }
        if cfg.sleep_usecs > 0 {
            thread::sleep(Duration::from_micros(cfg.sleep_usecs));
        }
    }
    state
}

/// Blocking loop: sleep in poll() on kickfds, the port fd and the stop
/// eventfd; budget exhaustion turns the next poll into a non-blocking
/// check so processing continues.
fn run_poll(
    mut state: WorkerState,
    cfg: &EngineConfig,
    stopflag: &AtomicU32,
    stop_event: &EventFd,
) -> WorkerState {
    for g in &mut state.guests {
        g.rxq.ring.set_kicks(true);
        g.txq.ring.set_kicks(true);
    }

    let mut can_send = true;
    let mut can_receive = true;
    let mut poll_zero = false;

    while stopflag.load(Ordering::Acquire) == STOP_NONE {
        let port_fd = state.port.pollable_fd();
        let mut fds = Vec::with_capacity(state.guests.len() * 2 + 2);
        for g in &state.guests {
            fds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(g.rxq.kickfd.as_raw_fd()) },
                PollFlags::POLLIN,
            ));
            fds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(g.txq.kickfd.as_raw_fd()) },
                PollFlags::POLLIN,
            ));
        }
        if let Some(fd) = port_fd {
            let mut events = PollFlags::empty();
            if can_receive {
                events |= PollFlags::POLLIN;
            }
            if !can_send {
                events |= PollFlags::POLLOUT;
            }
            fds.push(PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, events));
        }
        let stop_slot = fds.len();
        fds.push(PollFd::new(
            unsafe { BorrowedFd::borrow_raw(stop_event.as_raw_fd()) },
            PollFlags::POLLIN,
        ));

        let timeout = if poll_zero {
            PollTimeout::ZERO
        } else {
            PollTimeout::NONE
        };
        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!(error = %e, "poll failed");
                break;
            }
        }
        poll_zero = false;

        // Drain any kick eventfds that fired.
        let mut fired = vec![false; state.guests.len() * 2];
        for (i, fd) in fds[..state.guests.len() * 2].iter().enumerate() {
            if fd
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLIN))
            {
                fired[i] = true;
            }
        }
        let stopped = fds[stop_slot]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN));
        drop(fds);

        for (i, g) in state.guests.iter_mut().enumerate() {
            if fired[i * 2] {
                g.rxq.ring.stats().inc_kicks();
                let _ = g.rxq.kickfd.read();
            }
            if fired[i * 2 + 1] {
                g.txq.ring.stats().inc_kicks();
                let _ = g.txq.kickfd.read();
            }
        }

        // Ingress into every guest's receive ring.
        can_receive = true;
        for g in &mut state.guests {
            let (count, irq) = g.rxq.ring.push(&mut g.mem, &mut state.port, Some(&mut can_receive));
            if irq {
                signal_irq(&g.rxq.irqfd, g.rxq.ring.stats(), "rx");
            }
            if count >= RX_BUDGET {
                // Out of budget: do not block in the next poll.
                poll_zero = true;
            }
        }

        // Drain every guest's transmit ring.
        can_send = true;
        for g in &mut state.guests {
            let (count, irq) = g.txq.ring.drain(&mut g.mem, &mut state.port, Some(&mut can_send));
            if irq {
                signal_irq(&g.txq.irqfd, g.txq.ring.stats(), "tx");
            }
            if count >= TX_BUDGET {
                poll_zero = true;
            }
        }

        if stopped {
            let _ = stop_event.read();
            debug!("stop event received");
            break;
        }

        if cfg.sleep_usecs > 0 {
            thread::sleep(Duration::from_micros(cfg.sleep_usecs));
        }
    }
    state
}
