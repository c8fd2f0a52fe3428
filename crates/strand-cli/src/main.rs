//! strand CLI
//!
//! Peer-to-peer overlay node: identity generation, configuration and a
//! long-running node that logs overlay events.

mod config;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use strand_core::node::{Node, NodeEvent};
use strand_crypto::Identity;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use config::{Config, parse_peer_endpoint};

/// strand - peer-to-peer overlay transport
#[derive(Parser)]
#[command(name = "strand")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new identity secret key
    GenerateIdentity {
        /// Output file for the secret key (defaults to the configured identity file)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run a node until interrupted
    Node {
        /// UDP bind address
        #[arg(short, long)]
        bind: Option<String>,

        /// Super peer as ADDRESS@HOST:PORT (repeatable)
        #[arg(long = "super-peer", value_name = "ADDR@HOST:PORT")]
        super_peers: Vec<String>,
    },

    /// Inspect the configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

fn init_logging(verbosity: u8, configured: &str) {
    let default_level = match verbosity {
        0 => configured,
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_default(&config_path)?;

    init_logging(cli.verbose, &config.logging.level);

    match cli.command {
        Commands::GenerateIdentity { output } => {
            let output = output.unwrap_or_else(|| config.node.identity_file.clone());
            generate_identity(&output)?;
        }
        Commands::Node { bind, super_peers } => {
            if let Some(bind) = bind {
                config.node.bind_addr = bind;
            }
            for peer in &super_peers {
                parse_peer_endpoint(peer)?;
            }
            config.discovery.super_peers.extend(super_peers);
            config.validate()?;
            run_node(&config).await?;
        }
        Commands::Config { show } => {
            config.validate()?;
            if show {
                println!("# {}", config_path.display());
                print!("{}", toml::to_string_pretty(&config)?);
            } else {
                println!("Configuration at {} is valid", config_path.display());
            }
        }
    }

    Ok(())
}

/// Write a fresh secret key as hex
fn generate_identity(output: &Path) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("Refusing to overwrite existing identity {}", output.display());
    }
    let identity = Identity::generate();
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, identity.secret_hex().as_bytes())
        .with_context(|| format!("writing identity to {}", output.display()))?;

    println!("Address: {}", identity.address());
    println!("Secret key saved to: {}", output.display());
    Ok(())
}

fn load_identity(path: &Path) -> anyhow::Result<Identity> {
    if !path.exists() {
        tracing::warn!(
            "No identity at {}, using a temporary one (run `strand generate-identity`)",
            path.display()
        );
        return Ok(Identity::generate());
    }
    let secret = std::fs::read_to_string(path)
        .with_context(|| format!("reading identity {}", path.display()))?;
    Identity::from_secret_hex(&secret)
        .with_context(|| format!("parsing identity {}", path.display()))
}

/// Run a node and log its events until Ctrl+C
async fn run_node(config: &Config) -> anyhow::Result<()> {
    let identity = load_identity(&config.node.identity_file)?;
    let node_config = config.to_node_config()?;
    let node = Node::bind(node_config, identity)
        .await
        .context("binding node transport")?;
    let mut events = node.subscribe();

    println!("strand node");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Address: {}", node.address());
    println!("Listen: {}", node.local_addr()?);

    node.start().await.context("starting node")?;
    println!("Press Ctrl+C to stop");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => tracing::warn!("Missed {} node events", missed),
                Err(RecvError::Closed) => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    println!("\nShutting down...");
    node.shutdown().await?;
    Ok(())
}

fn log_event(event: &NodeEvent) {
    match event {
        NodeEvent::MessageReceived { sender, payload } => {
            tracing::info!("Message from {}: {} bytes", sender.short(), payload.len());
        }
        NodeEvent::PeerPathAdded { peer } => tracing::info!("Peer {} reachable", peer.short()),
        NodeEvent::PeerPathRemoved { peer } => tracing::info!("Peer {} unreachable", peer.short()),
        NodeEvent::ConnectionEstablished { peer } => {
            tracing::info!("Connected to {}", peer.short());
        }
        NodeEvent::ConnectionClosing {
            peer,
            initiated_by_remote,
        } => tracing::info!(
            "Connection to {} closing (remote: {})",
            peer.short(),
            initiated_by_remote
        ),
        NodeEvent::ConnectionFailed { peer, error } => {
            tracing::warn!("Connection to {} failed: {}", peer.short(), error);
        }
        NodeEvent::NodeOnline => tracing::info!("Node online"),
        NodeEvent::NodeOffline => tracing::info!("Node offline"),
    }
}
