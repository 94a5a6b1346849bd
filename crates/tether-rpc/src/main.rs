//! Tether RPC - collector and agent ends of the Tether transport.
//!
//! `serve` runs the collector that agents push metrics to; `agent` runs a
//! sample agent that connects, exposes remote commands and pushes batches.

mod agent;
mod server;
mod services;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{ChannelConfig, ServiceRegistry};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "tether-rpc")]
#[command(about = "Collector and agent for the Tether RPC transport")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Channel configuration file (JSON, every field optional)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept agent connections and host the `metrics` service
    Serve(ServeArgs),
    /// Connect to a collector and push metric batches
    Agent(AgentArgs),
}

#[derive(ClapArgs, Debug)]
struct ServeArgs {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Maximum concurrent agent connections
    #[arg(long, default_value = "64")]
    max_connections: usize,
}

#[derive(ClapArgs, Debug)]
struct AgentArgs {
    /// Collector address (host:port)
    #[arg(long)]
    addr: String,

    /// Agent name reported in batches and thread dumps
    #[arg(long, default_value = "agent")]
    name: String,

    /// Milliseconds between pushes
    #[arg(long, default_value = "1000")]
    interval_ms: u64,

    /// Batches to push before exiting (0 = until disconnected)
    #[arg(long, default_value = "0")]
    batches: u64,

    /// Configuration value served by `agent.fetchConfig` (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_setting)]
    settings: Vec<(String, String)>,
}

fn parse_setting(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))
}

fn init_logging(debug: bool, json: bool) {
    let log_level = if debug { Level::DEBUG } else { Level::INFO };
    let builder = FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false);

    // RUST_LOG wins over --debug when set.
    match (EnvFilter::try_from_default_env(), json) {
        (Ok(filter), true) => builder.with_env_filter(filter).json().init(),
        (Ok(filter), false) => builder.with_env_filter(filter).compact().init(),
        (Err(_), true) => builder.with_max_level(log_level).json().init(),
        (Err(_), false) => builder.with_max_level(log_level).compact().init(),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ChannelConfig> {
    let Some(path) = path else {
        return Ok(ChannelConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config = ChannelConfig::from_json(&json)?;
    info!("Loaded channel config from {}", path.display());
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug, args.log_json);

    let channel = load_config(args.config.as_ref())?;

    match args.command {
        Command::Serve(serve) => run_collector(serve, channel).await,
        Command::Agent(agent) => run_agent(agent, channel).await,
    }
}

async fn run_collector(args: ServeArgs, channel: ChannelConfig) -> Result<()> {
    info!("Starting Tether collector");

    let metrics = Arc::new(services::MetricsService::new());
    let registry = Arc::new(ServiceRegistry::new());
    registry.register(metrics.clone())?;
    for (service, method) in registry.endpoints() {
        info!("Serving {}.{}", service, method);
    }

    let options = server::CollectorOptions {
        max_connections: args.max_connections,
        channel,
        ..server::CollectorOptions::default()
    };
    let mut handle =
        server::CollectorServer::start(&args.host, args.port, registry, options).await?;

    // Print port for launchers and tests to read (intentional stdout)
    println!("RPC_PORT={}", handle.addr().port());

    info!("Collector running on {}", handle.addr());

    tokio::signal::ctrl_c().await?;
    info!(
        batches = metrics.total_batches(),
        points = metrics.total_points(),
        "Shutdown signal received, exiting"
    );
    handle.shutdown();

    Ok(())
}

async fn run_agent(args: AgentArgs, channel: ChannelConfig) -> Result<()> {
    info!("Starting Tether agent {}", args.name);

    let report = agent::run(agent::AgentOptions {
        addr: args.addr,
        name: args.name,
        interval: Duration::from_millis(args.interval_ms.max(1)),
        batches: args.batches,
        channel,
        settings: args.settings.into_iter().collect::<HashMap<_, _>>(),
    })
    .await?;

    println!("BATCHES_PUSHED={}", report.batches_pushed);
    Ok(())
}
