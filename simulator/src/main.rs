//! NFC discovery simulator
//!
//! Runs the discovery loop against a simulated RF field and prints every
//! device it activates.
//!
//! # Usage
//! ```bash
//! # Built-in demo field, until Ctrl-C
//! cargo run -p nfc-discovery-simulator
//!
//! # Field from a scenario file, stop after 6 cycles
//! cargo run -p nfc-discovery-simulator -- --scenario simulator/scenarios/p2p.json --cycles 6
//!
//! # Every event as a JSON line
//! cargo run -p nfc-discovery-simulator -- --json
//!
//! # Read block 3 of NFC-V tags instead of block 1
//! cargo run -p nfc-discovery-simulator -- --read-block 3
//! ```

mod led;
mod scenario;

use std::path::PathBuf;

use clap::Parser;
use nfc_discovery::device::hex;
use nfc_discovery::platform::TechIndicator;
use nfc_discovery::sim::SimulatedField;
use nfc_discovery::{DeviceSummary, DiscoveryConfig, DiscoveryEvent, InterfaceKind, Orchestrator};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::led::ConsoleLed;
use crate::scenario::Scenario;

#[derive(Parser, Debug)]
#[command(name = "nfc-discovery-simulator")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Scenario file (JSON) describing the tags in the field
    #[arg(short, long)]
    scenario: Option<PathBuf>,

    /// Stop after this many discovery cycles
    #[arg(short, long)]
    cycles: Option<u64>,

    /// Print every discovery event as a JSON line
    #[arg(long)]
    json: bool,

    /// Block read from NFC-V tags after activation
    #[arg(long, default_value_t = 1)]
    read_block: u8,

    /// Skip the NFC-V block read
    #[arg(long)]
    no_read_block: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr, device output to stdout
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nfc_discovery=info,nfc_discovery_simulator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let scenario = match &args.scenario {
        Some(path) => {
            info!("Loading scenario from {}", path.display());
            Scenario::load(path)?
        }
        None => Scenario::demo()?,
    };
    let mut config = scenario.discovery_config()?;
    config.nfcv_read_block = nfcv_read_block(&config, &args);

    info!(
        tags = scenario.tags.len(),
        techs = %config.techs,
        device_limit = config.device_limit,
        "NFC discovery simulator starting"
    );

    let mut orchestrator = Orchestrator::new(SimulatedField::new(scenario.tags), config);
    let printer = tokio::spawn(print_events(orchestrator.subscribe(), args.json));
    let shutdown = shutdown_signal(orchestrator.subscribe(), args.cycles);

    orchestrator.run(shutdown).await;

    let cycles = orchestrator.session().cycles();
    // Closes the event channel so the printer drains and exits.
    drop(orchestrator);
    printer.await??;

    info!(cycles, "Simulator stopped");
    Ok(())
}

/// Resolves on Ctrl-C or once `cycles` discovery cycles completed.
async fn shutdown_signal(events: broadcast::Receiver<DiscoveryEvent>, cycles: Option<u64>) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Ctrl-C handler failed");
            }
            info!("Shutdown signal received, stopping discovery...");
        }
        _ = cycles_completed(events, cycles) => {
            info!("Requested cycles completed");
        }
    }
}

async fn cycles_completed(mut events: broadcast::Receiver<DiscoveryEvent>, limit: Option<u64>) {
    let Some(limit) = limit else {
        return std::future::pending().await;
    };

    loop {
        match events.recv().await {
            Ok(DiscoveryEvent::Deactivated { cycle }) if cycle >= limit => return,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return,
        }
    }
}

async fn print_events(mut events: broadcast::Receiver<DiscoveryEvent>, json: bool) -> anyhow::Result<()> {
    let mut indicator = TechIndicator::new(
        ConsoleLed::new("A"),
        ConsoleLed::new("B"),
        ConsoleLed::new("F"),
        ConsoleLed::new("V"),
    );

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event output lagging");
                continue;
            }
            Err(RecvError::Closed) => return Ok(()),
        };

        if json {
            println!("{}", serde_json::to_string(&event)?);
        }

        match &event {
            DiscoveryEvent::Activated(summary) => {
                indicator.show(Some(summary.technology))?;
                if !json {
                    println!("{}", found_line(summary));
                }
            }
            DiscoveryEvent::Deactivated { .. } => indicator.show(None)?,
            _ => {
                if let Some(line) = block_line(&event).filter(|_| !json) {
                    println!("{line}");
                }
            }
        }
    }
}

/// A block chosen by the scenario wins over the command line.
fn nfcv_read_block(config: &DiscoveryConfig, args: &Args) -> Option<u8> {
    if args.no_read_block {
        None
    } else {
        config.nfcv_read_block.or(Some(args.read_block))
    }
}

fn block_line(event: &DiscoveryEvent) -> Option<String> {
    match event {
        DiscoveryEvent::BlockRead { data, .. } => Some(format!(" Read Block: OK Data: {}", hex(data))),
        DiscoveryEvent::BlockReadFailed { .. } => Some(" Read Block: FAIL".to_string()),
        _ => None,
    }
}

/// "<description> found. UID: <id>", with NFCID for peers.
fn found_line(summary: &DeviceSummary) -> String {
    let label = if summary.interface == InterfaceKind::NfcDep || summary.description.contains("P2P") {
        "NFCID"
    } else {
        "UID"
    };
    format!("{} found. {}: {}", summary.description, label, summary.id)
}
