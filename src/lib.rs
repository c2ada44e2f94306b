//! Evo P2P: the peer connection layer of an overlay network
//!
//! This crate provides:
//! - IP address classification (IPv4/IPv6, private ranges, normalization)
//! - Per-connection handshake agents with liveness checks and address gossip
//! - A peer manager enforcing peer-count, per-IP and duplicate admission
//! - Hop-by-hop relay of signaling messages with loop detection
//! - A TCP transport and an in-memory transport for tests
//!
//! # Example
//!
//! ```rust,no_run
//! use evo_p2p::network::{Node, NodeConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut node = Node::new(NodeConfig {
//!     port: 8443,
//!     bootstrap_peers: vec!["seed.example.org:8443".to_string()],
//!     ..Default::default()
//! })?;
//! node.start().await?;
//!
//! let status = node.status().await;
//! println!("{} peers connected", status.peer_count);
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod network;

// Re-export commonly used types
pub use chain::{ChainInfo, StaticChain};
pub use network::{
    AddrManager, AddressBook, NetAddress, NetworkConfig, Node, NodeConfig, PeerAddress, PeerEvent,
    PeerManager,
};
