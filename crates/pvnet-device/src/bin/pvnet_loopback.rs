//! # pvnet Loopback Driver
//!
//! Runs a full device against the in-memory loopback remote: negotiates
//! channels, pushes synthetic flow traffic through the transmit rings, and
//! counts what comes back through the receive path when echo is on.
//!
//! ## Usage
//!
//! ```bash
//! # Four queues, 100k echoed packets
//! pvnet-loopback --queues 4 --packets 100000 --echo
//!
//! # Device settings from a TOML file, stats as JSON
//! pvnet-loopback --config device.toml --json
//!
//! # Change MTU halfway through the run
//! pvnet-loopback --queues 2 --echo --mtu-change 9000
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use quanta::Instant;
use tracing_subscriber::EnvFilter;

use pvnet_device::DeviceRuntime;
use pvnet_device::traffic::TrafficGenerator;
use pvnet_ring::config::DeviceConfig;
use pvnet_ring::loopback::{LoopbackConfig, LoopbackTransport};
use pvnet_ring::rss::Toeplitz;
use pvnet_ring::{EnqueueError, PacketDescriptor};

#[derive(Parser, Debug)]
#[command(name = "pvnet-loopback", about = "Paravirtual NIC loopback driver")]
struct Cli {
    /// Device config file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Requested queue count; overrides the config file.
    #[arg(long)]
    queues: Option<u16>,

    /// Packets to send.
    #[arg(long, default_value_t = 10_000)]
    packets: usize,

    /// Frame size in bytes.
    #[arg(long, default_value_t = 512)]
    size: usize,

    /// Distinct flows in the generated traffic.
    #[arg(long, default_value_t = 64)]
    flows: usize,

    /// Reconfigure to this MTU after half the packets are sent.
    #[arg(long)]
    mtu_change: Option<u32>,

    /// Remote writes every frame back into the receive path.
    #[arg(long, default_value_t = false)]
    echo: bool,

    /// Traffic generator seed.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Print final stats as JSON on stdout.
    #[arg(long, default_value_t = false)]
    json: bool,
}

const DELIVERY_WAIT: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .compact()
        .init();

    let cli = Cli::parse();

    // ── Config ──────────────────────────────────────────────────
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            DeviceConfig::from_toml_str(&text)
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => DeviceConfig::default(),
    };
    if let Some(queues) = cli.queues {
        config = config.with_queue_count(queues);
    }

    tracing::info!(
        queues = config.queue_count,
        mtu = config.mtu,
        packets = cli.packets,
        size = cli.size,
        echo = cli.echo,
        "pvnet-loopback starting"
    );

    // ── Device ──────────────────────────────────────────────────
    let transport = Arc::new(LoopbackTransport::new(LoopbackConfig {
        echo: cli.echo,
        record_frames: false,
        ..Default::default()
    }));
    let (sink, received) = crossbeam_channel::unbounded::<PacketDescriptor>();
    let toeplitz = Toeplitz::new(config.rss_key);
    let runtime = DeviceRuntime::start(transport, config, Arc::new(sink))
        .context("device failed to start")?;

    // ── Traffic ─────────────────────────────────────────────────
    let mut traffic = TrafficGenerator::new(cli.seed, cli.flows, cli.size, toeplitz);
    let started = Instant::now();
    let mut accepted = 0usize;
    let mut rejected = 0usize;
    let mut stranded = 0usize;
    let halfway = cli.packets / 2;

    for i in 0..cli.packets {
        if i == halfway {
            if let Some(mtu) = cli.mtu_change {
                let leftover = runtime.set_mtu(mtu).context("MTU change failed")?;
                stranded += leftover.len();
                tracing::info!(mtu, queues = runtime.active_queues().get(), "MTU changed");
            }
        }
        if send(&runtime, traffic.next_packet()) {
            accepted += 1;
        } else {
            rejected += 1;
        }
    }

    // ── Delivery ────────────────────────────────────────────────
    let expected = if cli.echo {
        accepted - stranded
    } else {
        0
    };
    let mut delivered = 0usize;
    let deadline = Instant::now() + DELIVERY_WAIT;
    while delivered < expected && Instant::now() < deadline {
        match received.recv_timeout(Duration::from_millis(50)) {
            Ok(_) => delivered += 1,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    let elapsed = started.elapsed();

    let stats = runtime.stats();
    let unsent = runtime.shutdown().len() + runtime.take_unsent().len();

    tracing::info!(
        accepted,
        rejected,
        stranded,
        delivered,
        unsent,
        elapsed_ms = elapsed.as_millis() as u64,
        pps = (accepted as f64 / elapsed.as_secs_f64().max(1e-9)) as u64,
        "run complete"
    );
    if cli.echo && delivered < expected {
        tracing::warn!(missing = expected - delivered, "not every echoed packet arrived");
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        for queue in &stats.queues {
            tracing::info!(
                queue = queue.queue,
                state = queue.state,
                sent = queue.tx.packets_sent,
                received = queue.rx.packets_delivered,
                decode_drops = queue.rx.decode_drops,
                "queue stats"
            );
        }
    }
    Ok(())
}

/// Queue one packet, backing off while the backlog is full. Returns `false`
/// if the device refused it for good.
fn send(runtime: &DeviceRuntime, mut packet: PacketDescriptor) -> bool {
    loop {
        match runtime.try_send_hashed(packet) {
            Ok(()) => return true,
            Err(EnqueueError::Busy(p)) => {
                packet = p;
                thread::sleep(Duration::from_micros(50));
            }
            Err(e) => {
                tracing::warn!(error = %e, "packet rejected");
                return false;
            }
        }
    }
}
