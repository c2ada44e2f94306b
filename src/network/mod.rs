//! P2P Networking module
//!
//! Provides the peer connection layer of the overlay network.
//!
//! # Features
//! - IP address classification and normalization
//! - TCP-based peer connections with framed JSON messages
//! - Version handshake, ping liveness and address gossip per connection
//! - Admission control (peer caps, per-IP caps, duplicates)
//! - Multi-hop signal relay for peers behind NAT
//! - Temporary bans

pub mod address;
pub mod addrman;
pub mod agent;
pub mod channel;
pub mod config;
pub mod connector;
pub mod message;
pub mod node;
pub mod peer;
pub mod server;
pub mod signal_store;
pub mod timers;

pub use address::{AddressError, NetAddress};
pub use addrman::{AddrManager, AddrState, AddressBook};
pub use agent::NetworkAgent;
pub use channel::{Connection, ConnectionId, Direction, PeerChannel, TransportEnd};
pub use config::{NetworkConfig, DEFAULT_PORT};
pub use connector::{ConnectionSink, Connector, Connectors};
pub use message::{
    Endpoint, Message, PeerAddress, Protocol, ProtocolMask, ServiceFlags, SignalFlags,
    SignalMessage, VersionMessage, MAGIC, MAX_MESSAGE_SIZE, MIN_PROTOCOL_VERSION,
    PROTOCOL_VERSION,
};
pub use node::{Node, NodeConfig, NodeError, NodeStatus};
pub use peer::{NetworkEvent, Peer, PeerError, PeerEvent, PeerManager};
pub use server::{connect_to_peer, MessageCodec, Server, TcpConnector};
pub use signal_store::SignalStore;
