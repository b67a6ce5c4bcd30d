//! Feros Proxy
//!
//! An agent that keeps one outbound WebSocket connection to a relay and
//! carries the relay's requests to services on this machine:
//! - HTTP calls (`octo_api`) executed against a local base URL
//! - WebSocket sessions multiplexed over the same connection
//!
//! `feros-proxy forward` runs the companion forward proxy that exposes
//! `127.0.0.1:<port>` services under `/forward/<port>/...`.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod client;
mod config;
mod credentials;
mod error;
mod forward;
mod protocol;

use client::TunnelClient;
use config::Config;
use credentials::ConfigCredentials;

#[derive(Parser, Debug)]
#[command(name = "feros-proxy")]
#[command(author, version, about = "Relay HTTP and WebSocket traffic to local services")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Access token for the relay
    #[arg(short, long, env = "FEROS_TOKEN")]
    token: Option<String>,

    /// Relay address (ws:// or wss://)
    #[arg(short, long, env = "FEROS_ADDRESS")]
    address: Option<String>,

    /// Do not log individual requests
    #[arg(short, long, global = true)]
    silence: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Fail instead of prompting for missing credentials
    #[arg(long)]
    no_prompt: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the local forward proxy
    Forward(ForwardArgs),
}

#[derive(Parser, Debug)]
struct ForwardArgs {
    /// Address to listen on
    #[arg(short, long, default_value = forward::DEFAULT_LISTEN)]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.silence);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
        }
        signal_token.cancel();
    });

    match cli.command {
        Some(Commands::Forward(args)) => forward::serve(args.listen, shutdown).await,
        None => run_agent(cli, shutdown).await,
    }
}

async fn run_agent(cli: Cli, shutdown: CancellationToken) -> Result<()> {
    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };

    let credentials =
        ConfigCredentials::new(cli.address, cli.token, config_path, !cli.no_prompt);
    TunnelClient::new(credentials, shutdown)?.run().await
}

fn init_logging(verbose: bool, silence: bool) {
    let level = if verbose { "debug" } else { "info" };
    let traffic = if silence { "off" } else { level };
    let filter = EnvFilter::new(format!(
        "info,{}={},{}={}",
        env!("CARGO_CRATE_NAME"),
        level,
        client::TRAFFIC,
        traffic
    ));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
