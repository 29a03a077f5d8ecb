use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use log::{info, warn};

use readoutd::config::Config;
use readoutd::emulator;
use readoutd::queues;
use readoutd::readout::{LinkQueues, ReadoutLink};

#[derive(Parser, Debug)]
#[command(name = "readoutd")]
#[command(about = "Per-link readout daemon")]
struct Args {
    /// Path to config file
    #[arg(long, value_name = "PATH", default_value = "/etc/readoutd/readoutd.toml", env = "READOUTD_CONFIG")]
    config: PathBuf,
    /// Feed the link from the built-in source emulator
    #[arg(long)]
    standalone: bool,
    /// Run the software trigger-primitive stage
    #[arg(long)]
    enable_tpg: bool,
    /// Start a raw recording of this many seconds once the link is running
    #[arg(long, value_name = "SECONDS")]
    record: Option<u64>,
    /// Stop after this many seconds instead of waiting for ctrl-c
    #[arg(long, value_name = "SECONDS")]
    run_for: Option<u64>,
    /// Seconds between counter snapshots in the log
    #[arg(long, default_value_t = 10)]
    info_interval: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = Config::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.validate().context("validating configuration")?;
    let link_number = config.link.link_number;
    info!("starting readout daemon for link {link_number}");

    // Queue endpoints: in a full DAQ application these connect to the card
    // reader and the trigger/fragment collectors.
    let (raw_tx, raw_rx) = queues::pair(65_536);
    let (_request_tx, request_rx) = queues::pair(1024);
    let (fragment_tx, fragment_rx) = queues::pair(1024);
    let (timesync_tx, timesync_rx) = queues::pair(1024);
    let (tp_tx, tp_rx) = queues::pair(65_536);

    let mut link = ReadoutLink::tpc(args.enable_tpg, args.enable_tpg.then_some(tp_tx));
    link.init(LinkQueues {
        raw_input: raw_rx,
        data_requests: vec![request_rx],
        fragment_responses: vec![fragment_tx],
        timesync: timesync_tx,
    })
    .context("wiring link queues")?;
    link.conf(config.clone()).context("configuring link")?;
    link.start().context("starting link")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::Release);
        })
        .context("installing signal handler")?;
    }

    // Downstream consumers: count and drop.
    let fragments_received = Arc::new(AtomicU64::new(0));
    {
        let fragments_received = Arc::clone(&fragments_received);
        std::thread::Builder::new()
            .name("fragsink".into())
            .spawn(move || {
                while fragment_rx.recv().is_ok() {
                    fragments_received.fetch_add(1, Ordering::Relaxed);
                }
            })
            .context("spawning fragment sink")?;
    }
    let primitives_received = Arc::new(AtomicU64::new(0));
    {
        let primitives_received = Arc::clone(&primitives_received);
        std::thread::Builder::new()
            .name("tpsink".into())
            .spawn(move || {
                while tp_rx.recv().is_ok() {
                    primitives_received.fetch_add(1, Ordering::Relaxed);
                }
            })
            .context("spawning trigger-primitive sink")?;
    }
    std::thread::Builder::new()
        .name("syncsink".into())
        .spawn(move || while timesync_rx.recv().is_ok() {})
        .context("spawning timesync sink")?;

    let emulator_handle = if args.standalone {
        let (stats, handle) = emulator::start_tpc_emulator(
            raw_tx,
            Arc::clone(link.run_marker()),
            config.emulator.clone(),
            link_number,
        );
        Some((stats, handle))
    } else {
        drop(raw_tx);
        None
    };

    if let Some(seconds) = args.record {
        link.record(Duration::from_secs(seconds))
            .context("starting recording")?;
    }

    info!("running; press ctrl-c to stop");
    let started = Instant::now();
    let mut last_info = Instant::now();
    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        if let Some(seconds) = args.run_for {
            if started.elapsed() >= Duration::from_secs(seconds) {
                break;
            }
        }
        if last_info.elapsed() >= Duration::from_secs(args.info_interval) {
            last_info = Instant::now();
            let info = link.get_info();
            info!(
                "link {link_number} info: {}",
                serde_json::to_string(&info).unwrap_or_default()
            );
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("shutting down");
    link.stop().context("stopping link")?;
    if let Some((stats, handle)) = emulator_handle {
        if handle.join().is_err() {
            warn!("emulator thread panicked");
        }
        info!(
            "emulator produced {} packets ({} dropouts, {} queue timeouts)",
            stats.packets.load(Ordering::Relaxed),
            stats.dropouts.load(Ordering::Relaxed),
            stats.queue_timeouts.load(Ordering::Relaxed)
        );
    }
    info!(
        "received {} fragments, {} trigger primitives",
        fragments_received.load(Ordering::Relaxed),
        primitives_received.load(Ordering::Relaxed)
    );
    Ok(())
}
