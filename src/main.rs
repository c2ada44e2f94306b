//! Evo P2P node CLI
//!
//! Runs a peer-to-peer node and inspects network addresses.

use clap::{Parser, Subcommand};
use evo_p2p::network::address::{self, NetAddress};
use evo_p2p::network::{Node, NodeConfig, PeerEvent, DEFAULT_PORT};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Interval between status lines while the node runs
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "evo-node")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Peer-to-peer overlay network node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a P2P node
    Start {
        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Initial peers to connect to (comma-separated host:port)
        #[arg(long)]
        peers: Option<String>,

        /// Use the light preset (fewer connections, 1 per IP)
        #[arg(long)]
        light: bool,

        /// Host under which other peers reach this node
        #[arg(long, default_value = "localhost")]
        public_host: String,
    },

    /// Classify and normalize an IP address
    Address {
        /// IPv4 or IPv6 address
        ip: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            port,
            peers,
            light,
            public_host,
        } => {
            let bootstrap_peers: Vec<String> = peers
                .map(|p| p.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default();

            let config = NodeConfig {
                port,
                bootstrap_peers,
                light,
                public_host,
            };
            run_node(config)
        }
        Commands::Address { ip } => cmd_address(&ip),
    }
}

fn run_node(config: NodeConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        println!("🌐 Starting P2P node on port {}...", config.port);

        let mut node = Node::new(config)?;
        let mut events = node.peer_manager().subscribe();
        node.start().await?;

        let mut status_tick = tokio::time::interval(STATUS_INTERVAL);
        status_tick.tick().await;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    println!("\n📴 Shutting down node...");
                    node.shutdown().await;
                    break;
                }
                _ = status_tick.tick() => {
                    let status = node.status().await;
                    println!(
                        "📊 peers: {} | connecting: {} | known addresses: {} | sent: {} kB | received: {} kB",
                        status.peer_count,
                        status.connecting_count,
                        status.known_addresses,
                        status.bytes_sent / 1000,
                        status.bytes_received / 1000
                    );
                }
                event = events.recv() => match event {
                    Ok(PeerEvent::Joined(peer)) => println!(
                        "✅ Peer joined: {} (height {}, work {})",
                        peer.peer_address(),
                        peer.start_height(),
                        peer.total_work()
                    ),
                    Ok(PeerEvent::Left(peer)) => println!("👋 Peer left: {}", peer.peer_address()),
                    Ok(PeerEvent::Changed) => {}
                    Err(RecvError::Lagged(skipped)) => log::warn!("Skipped {} peer events", skipped),
                    Err(RecvError::Closed) => break,
                },
            }
        }

        Ok(())
    })
}

fn cmd_address(ip: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let kind = if address::is_ipv4(ip) {
        "IPv4"
    } else if address::is_ipv6(ip) {
        "IPv6"
    } else {
        return Err(format!("❌ Not an IP address: {}", ip).into());
    };

    let net = NetAddress::parse(ip)?;
    println!("📍 {}", ip);
    println!("   Type:       {}", kind);
    println!("   Normalized: {}", address::normalize(ip)?);
    println!("   Private:    {}", net.is_private());
    Ok(())
}
