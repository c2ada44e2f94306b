//! P2P Node implementation
//!
//! Wires the TCP server, the address book and the peer manager together.

use crate::chain::{ChainInfo, StaticChain};
use crate::network::addrman::{AddrManager, AddressBook};
use crate::network::config::{NetworkConfig, DEFAULT_PORT};
use crate::network::connector::Connectors;
use crate::network::message::{PeerAddress, ServiceFlags};
use crate::network::peer::PeerManager;
use crate::network::server::{Server, TcpConnector};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid bootstrap address: {0}")]
    InvalidBootstrap(String),
    #[error("Node already started")]
    AlreadyStarted,
}

/// P2P Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Port to listen on
    pub port: u16,
    /// Initial peers to connect to, as `host:port`
    pub bootstrap_peers: Vec<String>,
    /// Use the light network preset
    pub light: bool,
    /// Host under which other peers reach us
    pub public_host: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bootstrap_peers: Vec::new(),
            light: false,
            public_host: "localhost".to_string(),
        }
    }
}

impl NodeConfig {
    /// Network configuration derived from the node settings
    pub fn network_config(&self) -> NetworkConfig {
        let services = if self.light {
            ServiceFlags::LIGHT
        } else {
            ServiceFlags::FULL
        };
        let own = PeerAddress::direct(self.public_host.clone(), self.port, services);
        if self.light {
            NetworkConfig::light(own)
        } else {
            NetworkConfig::new(own)
        }
    }
}

/// Parse a `host:port` bootstrap entry; IPv6 hosts go in brackets.
pub fn parse_peer_address(entry: &str) -> Result<PeerAddress, NodeError> {
    let invalid = || NodeError::InvalidBootstrap(entry.to_string());

    let (host, port) = entry.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if host.is_empty() || port == 0 {
        return Err(invalid());
    }

    Ok(PeerAddress::direct(host, port, ServiceFlags::FULL))
}

/// Snapshot of a running node
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub port: u16,
    pub signal_id: String,
    pub peer_count: usize,
    pub connecting_count: usize,
    pub known_addresses: usize,
    pub height: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// The main P2P node
pub struct Node {
    pub config: NodeConfig,
    pub chain: Arc<StaticChain>,
    pub addresses: Arc<AddrManager>,
    peer_manager: Arc<PeerManager>,
    shutdown: CancellationToken,
    port: u16,
    started: bool,
}

impl Node {
    /// Create a new node
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        Self::with_chain(config, Arc::new(StaticChain::default()))
    }

    pub fn with_chain(config: NodeConfig, chain: Arc<StaticChain>) -> Result<Self, NodeError> {
        let network = config.network_config();
        let addresses = Arc::new(AddrManager::with_local(network.peer_address.clone()));

        for entry in &config.bootstrap_peers {
            let address = parse_peer_address(entry)?;
            addresses.add(address);
        }

        let connectors = Connectors::new().with_direct(Arc::new(TcpConnector::default()));
        let chain_info: Arc<dyn ChainInfo> = chain.clone();
        let book: Arc<dyn AddressBook> = addresses.clone();
        let peer_manager = PeerManager::new(network, chain_info, book, connectors);

        Ok(Self {
            port: config.port,
            config,
            chain,
            addresses,
            peer_manager,
            shutdown: CancellationToken::new(),
            started: false,
        })
    }

    pub fn peer_manager(&self) -> Arc<PeerManager> {
        self.peer_manager.clone()
    }

    /// Bind the listener, start the manager and begin connecting.
    pub async fn start(&mut self) -> Result<(), NodeError> {
        if self.started {
            return Err(NodeError::AlreadyStarted);
        }

        let server = Server::bind(self.config.port)
            .await
            .map_err(|source| NodeError::Bind {
                port: self.config.port,
                source,
            })?;
        self.port = server.port();
        self.started = true;

        tokio::spawn(server.serve(
            self.peer_manager.connection_sink(),
            self.shutdown.clone(),
        ));
        tokio::spawn(self.peer_manager.clone().run());

        self.peer_manager.connect().await;

        log::info!(
            "Node started on port {} with {} known addresses",
            self.port,
            self.addresses.size()
        );
        Ok(())
    }

    /// Listening port; differs from the configured one when that was 0
    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            port: self.port,
            signal_id: self.peer_manager.config().signal_id.clone(),
            peer_count: self.peer_manager.peer_count().await,
            connecting_count: self.peer_manager.connecting_count().await,
            known_addresses: self.addresses.size(),
            height: self.chain.height(),
            bytes_sent: self.peer_manager.bytes_sent().await,
            bytes_received: self.peer_manager.bytes_received().await,
        }
    }

    pub async fn shutdown(&self) {
        log::info!("Shutting down node");
        self.peer_manager.disconnect("node shutdown").await;
        self.peer_manager.shutdown();
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_creation() {
        let config = NodeConfig {
            port: 0,
            bootstrap_peers: vec!["10.0.0.1:8443".to_string(), "[::1]:9000".to_string()],
            ..Default::default()
        };
        let node = Node::new(config).unwrap();
        assert_eq!(node.addresses.size(), 2);
    }

    #[test]
    fn test_bad_bootstrap_peer() {
        let config = NodeConfig {
            bootstrap_peers: vec!["no-port".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            Node::new(config),
            Err(NodeError::InvalidBootstrap(_))
        ));
        assert!(parse_peer_address("host:99999").is_err());
        assert!(parse_peer_address(":8443").is_err());
    }

    #[test]
    fn test_light_preset() {
        let config = NodeConfig {
            light: true,
            ..Default::default()
        };
        let network = config.network_config();
        assert_eq!(network.peer_count_max, 15);
        assert_eq!(network.peer_address.services, ServiceFlags::LIGHT);
    }

    #[tokio::test]
    async fn test_start_and_status() {
        let mut node = Node::new(NodeConfig {
            port: 0,
            ..Default::default()
        })
        .unwrap();
        node.start().await.unwrap();
        assert_ne!(node.port(), 0);
        assert!(matches!(node.start().await, Err(NodeError::AlreadyStarted)));

        let status = node.status().await;
        assert_eq!(status.peer_count, 0);
        assert_eq!(status.known_addresses, 0);
        node.shutdown().await;
    }
}
