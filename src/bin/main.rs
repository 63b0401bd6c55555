//! Schedule node runner.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;

use junction::bus::ChannelBus;
use junction::config::Config;
use junction::node::ScheduleNode;
use junction::telemetry;

#[derive(Parser, Debug)]
#[command(name = "junction-node", about = "Traffic schedule coordinator node")]
struct Args {
    /// Path to the node configuration file.
    #[arg(long, default_value = "junction.toml")]
    config: PathBuf,

    /// Override the persistent participant registry location.
    #[arg(long)]
    registry: Option<PathBuf>,
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return std::process::ExitCode::FAILURE;
        }
    };
    if let Some(registry) = args.registry {
        config.registry_path = registry;
    }
    telemetry::init(&config.logging);

    let bus = Arc::new(ChannelBus::new());
    let node = match ScheduleNode::new(&config, bus) {
        Ok(node) => node,
        Err(err) => {
            // Registry load failure means the node must not serve.
            tracing::error!("failed to start schedule node: {err}");
            return std::process::ExitCode::FAILURE;
        }
    };
    tracing::info!(node_version = node.node_version(), "schedule node running");

    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown));

    while !shutdown.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
    }

    tracing::info!("shutdown signal received");
    node.shutdown();
    std::process::ExitCode::SUCCESS
}
