use anyhow::Context;
use clap::Parser;
use nix::sys::signal::{SigHandler, Signal, signal};
use tracing::info;

use pvnet::config::Args;
use pvnet::session::{Daemon, request_shutdown};
use pvnet::tsc;

extern "C" fn on_signal(_: i32) {
    request_shutdown();
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let cfg = args
        .session_config()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;
    let port = args.build_port().context("egress port setup failed")?;

    if let Some(ref pidfile) = args.pidfile {
        std::fs::write(pidfile, format!("{}\n", std::process::id()))
            .with_context(|| format!("failed to write pidfile {}", pidfile.display()))?;
    }

    unsafe {
        let _ = signal(Signal::SIGINT, SigHandler::Handler(on_signal));
        let _ = signal(Signal::SIGTERM, SigHandler::Handler(on_signal));
    }

    let ticks_per_second = tsc::calibrate_tsc();
    info!(ticks_per_second, "tsc calibrated");

    let mut daemon = Daemon::new(args.socket.clone(), port, cfg, ticks_per_second)
        .context("failed to start control listener")?;
    daemon.run();

    if let Some(ref pidfile) = args.pidfile {
        let _ = std::fs::remove_file(pidfile);
    }
    info!("exited cleanly");
    Ok(())
}
