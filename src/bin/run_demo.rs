//! Minimal non-interactive driver: load a topology and a configuration,
//! run the network to completion, and print the aggregate stats surface.
//!
//! This stands in for the out-of-scope CLI/command surface (RUN/PAUSE/
//! RESET/STATUS) — it only ever does `RUN(UNLIMITED)` to `duration_seconds`
//! and exits, matching `main.rs`'s own "load, run, report" shape.

use anyhow::{Context, Result};
use env_logger::Builder;
use log::{info, LevelFilter};
use std::path::PathBuf;
use tsch_sim_core::{Configuration, Network, Topology};

struct Args {
    topology_path: PathBuf,
    config_path: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let topology_path = args
        .next()
        .map(PathBuf::from)
        .context("usage: run_demo <topology.json> [config.toml]")?;
    let config_path = args.next().map(PathBuf::from);
    Ok(Args {
        topology_path,
        config_path,
    })
}

fn main() -> Result<()> {
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("tsch_sim_core"), LevelFilter::Debug)
        .init();

    let args = parse_args()?;

    let config = match &args.config_path {
        Some(path) => Configuration::load(path)?,
        None => Configuration::default(),
    };
    let topology = Topology::load(&args.topology_path)?.validate()?;

    info!(
        "loaded {} node(s), {} connection(s); running for {}s at seed {}",
        topology.nodes.len(),
        topology.connections.len(),
        config.duration_seconds,
        config.seed
    );

    let mut network = Network::new(config.clone(), &topology)?;
    let slot_seconds = config.mac_slot_duration_us as f64 / 1_000_000.0;
    let total_slots = (config.duration_seconds / slot_seconds).ceil() as u64;
    for _ in 0..total_slots {
        network.step();
    }

    let stats = network.aggregate_stats();
    info!("run complete at asn={}", total_slots);
    println!("{}", serde_json::to_string_pretty(&stats).expect("AggregateStats always serializes"));

    Ok(())
}
