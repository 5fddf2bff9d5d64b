//! Daemon configuration and command line.

use std::io;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::dataplane::classifier::MarkMode;
use crate::dataplane::engine::{EngineConfig, SchedConfig};
use crate::dataplane::port::{EgressPort, NullPort, RingPort, SinkPort, SourcePort, TapPort};
use crate::dataplane::ring::Transport;
use crate::proto::VNET_HDR_LEN;
use crate::session::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportArg {
    Sring,
    Packed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PortArg {
    Tap,
    Sink,
    Source,
    Null,
    Ring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MarkArg {
    None,
    Guest,
    Hv,
}

#[derive(Debug, Parser)]
#[command(
    name = "pvnet",
    about = "User-space paravirtual network backend with DRR egress scheduling"
)]
pub struct Args {
    /// UNIX socket path for hypervisor control connections.
    #[arg(long, default_value = "/tmp/pvnet.sock")]
    pub socket: PathBuf,

    /// Guest ring transport.
    #[arg(long, value_enum, default_value_t = TransportArg::Sring)]
    pub transport: TransportArg,

    /// Egress port backend.
    #[arg(long, value_enum, default_value_t = PortArg::Sink)]
    pub port: PortArg,

    /// TAP device name (port = tap).
    #[arg(long, default_value = "pvnet0")]
    pub ifname: String,

    /// Prepend a virtio-net header on the TAP port.
    #[arg(long)]
    pub vnet_hdr: bool,

    /// Slot count per direction for the shared-memory ring port.
    #[arg(long, default_value_t = 512)]
    pub ring_slots: usize,

    /// Busy-wait instead of blocking in poll (implied by the scheduler).
    #[arg(long)]
    pub busy_wait: bool,

    /// Disable the DRR scheduler and drain rings directly.
    #[arg(long)]
    pub no_sched: bool,

    /// Emulated link bandwidth in bits per second (k/M/G suffixes).
    #[arg(long, default_value = "1G")]
    pub bandwidth: String,

    /// Scheduling interval in nanoseconds.
    #[arg(long, default_value_t = 5_000)]
    pub sched_interval_ns: u64,

    /// Maximum packets dequeued per scheduler tick.
    #[arg(long, default_value_t = 500)]
    pub sched_batch: u32,

    /// Bytes of DRR credit per weight unit per round.
    #[arg(long, default_value_t = 1500)]
    pub quantum: u32,

    /// Comma-separated per-flow weights; the count fixes the flow count.
    #[arg(long, default_value = "1,1,1,1,1,1")]
    pub weights: String,

    /// Mark source selecting the scheduler flow.
    #[arg(long, value_enum, default_value_t = MarkArg::Hv)]
    pub mark: MarkArg,

    /// Guests required in the batch before the worker starts.
    #[arg(long, default_value_t = 1)]
    pub activation_threshold: usize,

    /// Coarse sleep per worker iteration, in microseconds.
    #[arg(long, default_value_t = 0)]
    pub sleep_usecs: u64,

    /// Periodically log per-queue rates.
    #[arg(long)]
    pub stats: bool,

    /// Write the daemon PID here; removed on clean shutdown.
    #[arg(long)]
    pub pidfile: Option<PathBuf>,

    /// Directory holding the transport program objects.
    #[arg(long, default_value = "progs")]
    pub progdir: PathBuf,
}

/// Parse a bandwidth with an optional k/M/G suffix.
pub fn parse_bw(s: &str) -> Result<f64, String> {
    let s = s.trim();
    let (digits, mult) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1e3),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1e6),
        Some('g') | Some('G') => (&s[..s.len() - 1], 1e9),
        _ => (s, 1.0),
    };
    let value: f64 = digits
        .parse()
        .map_err(|_| format!("invalid bandwidth '{s}'"))?;
    if value <= 0.0 {
        return Err(format!("bandwidth must be positive, got '{s}'"));
    }
    Ok(value * mult)
}

/// Parse the comma-separated flow weight list.
pub fn parse_weights(s: &str) -> Result<Vec<u32>, String> {
    let weights: Result<Vec<u32>, _> = s.split(',').map(|w| w.trim().parse::<u32>()).collect();
    let weights = weights.map_err(|_| format!("invalid weights '{s}'"))?;
    if weights.is_empty() || weights.iter().any(|&w| w == 0) {
        return Err(format!("weights must be non-empty and non-zero: '{s}'"));
    }
    Ok(weights)
}

impl Args {
    pub fn transport(&self) -> Transport {
        match self.transport {
            TransportArg::Sring => Transport::Sring,
            TransportArg::Packed => Transport::Packed,
        }
    }

    pub fn mark_mode(&self) -> MarkMode {
        match self.mark {
            MarkArg::None => MarkMode::None,
            MarkArg::Guest => MarkMode::Guest,
            MarkArg::Hv => MarkMode::Hv,
        }
    }

    pub fn session_config(&self) -> Result<SessionConfig, String> {
        let sched = if self.no_sched {
            None
        } else {
            Some(SchedConfig {
                bw: parse_bw(&self.bandwidth)?,
                interval_ns: self.sched_interval_ns,
                batch_limit: self.sched_batch,
                quantum: self.quantum,
                weights: parse_weights(&self.weights)?,
            })
        };

        if self.activation_threshold == 0 {
            return Err("activation threshold must be > 0".to_string());
        }

        Ok(SessionConfig {
            transport: self.transport(),
            features_avail: 0,
            progdir: self.progdir.clone(),
            activation_threshold: self.activation_threshold,
            engine: EngineConfig {
                busy_wait: self.busy_wait || !self.no_sched,
                mark_mode: self.mark_mode(),
                sleep_usecs: self.sleep_usecs,
                sched,
            },
            collect_stats: self.stats,
        })
    }

    pub fn build_port(&self) -> io::Result<EgressPort> {
        Ok(match self.port {
            PortArg::Tap => EgressPort::Tap(TapPort::open(&self.ifname, self.vnet_hdr)?),
            PortArg::Sink => EgressPort::Sink(SinkPort::default()),
            PortArg::Source => EgressPort::Source(SourcePort::new(if self.vnet_hdr {
                VNET_HDR_LEN
            } else {
                0
            })),
            PortArg::Null => EgressPort::Null(NullPort::new()?),
            PortArg::Ring => EgressPort::Ring(RingPort::new(self.ring_slots)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bw() {
        assert_eq!(parse_bw("1000").unwrap(), 1000.0);
        assert_eq!(parse_bw("10k").unwrap(), 10_000.0);
        assert_eq!(parse_bw("2M").unwrap(), 2e6);
        assert_eq!(parse_bw("1G").unwrap(), 1e9);
        assert!(parse_bw("fast").is_err());
        assert!(parse_bw("-1G").is_err());
    }

    #[test]
    fn test_parse_weights() {
        assert_eq!(parse_weights("1,2,3").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_weights("5").unwrap(), vec![5]);
        assert!(parse_weights("1,0").is_err());
        assert!(parse_weights("a,b").is_err());
    }

    #[test]
    fn test_default_args() {
        let args = Args::parse_from(["pvnet"]);
        assert_eq!(args.transport(), Transport::Sring);
        let cfg = args.session_config().unwrap();
        assert_eq!(cfg.activation_threshold, 1);
        let sched = cfg.engine.sched.expect("scheduler on by default");
        assert_eq!(sched.batch_limit, 500);
        assert_eq!(sched.weights.len(), 6);
        assert!(cfg.engine.busy_wait);
    }

    #[test]
    fn test_no_sched_poll_mode() {
        let args = Args::parse_from(["pvnet", "--no-sched", "--transport", "packed"]);
        assert_eq!(args.transport(), Transport::Packed);
        let cfg = args.session_config().unwrap();
        assert!(cfg.engine.sched.is_none());
        assert!(!cfg.engine.busy_wait);
    }
}
