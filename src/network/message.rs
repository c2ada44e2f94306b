//! Network message types for P2P communication
//!
//! Defines the peer address model and every message the handshake, address
//! gossip, liveness and signal relay protocols exchange.

use crate::network::address::NetAddress;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 2;

/// Oldest protocol version we still talk to
pub const MIN_PROTOCOL_VERSION: u32 = 2;

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = [0x45, 0x56, 0x4F, 0x4E]; // "EVON"

/// Maximum size of a single framed message
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Maximum addresses accepted in one Addr message
pub const MAX_ADDR_PER_MESSAGE: usize = 1000;

/// Frame header: magic (4) + length (4)
pub const FRAME_HEADER_SIZE: usize = 8;

/// Identifier used to route signaling messages to relayed peers
pub type SignalId = String;

/// Whether a remote protocol version can be spoken to
pub fn is_compatible(version: u32) -> bool {
    version >= MIN_PROTOCOL_VERSION
}

bitflags! {
    /// Services a node offers to the network
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ServiceFlags: u32 {
        const NANO = 1;
        const LIGHT = 1 << 1;
        const FULL = 1 << 2;
    }
}

bitflags! {
    /// Set of transport protocols, used to filter address queries
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ProtocolMask: u8 {
        const DIRECT = 1;
        const RELAYED = 1 << 1;
        const UNREACHABLE = 1 << 2;
    }
}

bitflags! {
    /// Flags carried by signaling responses
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct SignalFlags: u8 {
        const UNROUTABLE = 1;
        const TTL_EXCEEDED = 1 << 1;
    }
}

// =============================================================================
// Peer addresses
// =============================================================================

/// Transport kind used to reach a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Direct socket connection
    Direct,
    /// Data channel negotiated through relayed signaling
    Relayed,
    /// Peer that accepts no incoming connections
    Unreachable,
}

impl Protocol {
    pub fn mask(&self) -> ProtocolMask {
        match self {
            Protocol::Direct => ProtocolMask::DIRECT,
            Protocol::Relayed => ProtocolMask::RELAYED,
            Protocol::Unreachable => ProtocolMask::UNREACHABLE,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Direct => "direct",
            Protocol::Relayed => "relayed",
            Protocol::Unreachable => "unreachable",
        };
        write!(f, "{}", name)
    }
}

/// How a peer is located; this is the address's identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    Direct { host: String, port: u16 },
    Relayed { signal_id: SignalId },
    Unreachable { peer_id: String },
}

/// A reachable (or at least identifiable) peer.
///
/// Equality and hashing only consider the endpoint; the remaining fields are
/// metadata refreshed as new information arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAddress {
    pub endpoint: Endpoint,
    pub services: ServiceFlags,
    /// Last seen, milliseconds since the Unix epoch
    pub timestamp: i64,
    pub net_address: Option<NetAddress>,
    /// Relay hops between us and a relayed peer
    pub distance: u8,
}

impl PeerAddress {
    pub fn direct(host: impl Into<String>, port: u16, services: ServiceFlags) -> Self {
        Self::new(
            Endpoint::Direct {
                host: host.into(),
                port,
            },
            services,
        )
    }

    pub fn relayed(signal_id: impl Into<SignalId>, services: ServiceFlags, distance: u8) -> Self {
        let mut addr = Self::new(
            Endpoint::Relayed {
                signal_id: signal_id.into(),
            },
            services,
        );
        addr.distance = distance;
        addr
    }

    pub fn unreachable(peer_id: impl Into<String>, services: ServiceFlags) -> Self {
        Self::new(
            Endpoint::Unreachable {
                peer_id: peer_id.into(),
            },
            services,
        )
    }

    fn new(endpoint: Endpoint, services: ServiceFlags) -> Self {
        Self {
            endpoint,
            services,
            timestamp: chrono::Utc::now().timestamp_millis(),
            net_address: None,
            distance: 0,
        }
    }

    pub fn with_net_address(mut self, net_address: NetAddress) -> Self {
        self.net_address = Some(net_address);
        self
    }

    pub fn protocol(&self) -> Protocol {
        match self.endpoint {
            Endpoint::Direct { .. } => Protocol::Direct,
            Endpoint::Relayed { .. } => Protocol::Relayed,
            Endpoint::Unreachable { .. } => Protocol::Unreachable,
        }
    }

    pub fn signal_id(&self) -> Option<&str> {
        match &self.endpoint {
            Endpoint::Relayed { signal_id } => Some(signal_id),
            _ => None,
        }
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
    }
}

impl Eq for PeerAddress {}

impl Hash for PeerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.endpoint.hash(state);
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Endpoint::Direct { host, port } => write!(f, "direct://{}:{}", host, port),
            Endpoint::Relayed { signal_id } => write!(f, "relayed://{}", signal_id),
            Endpoint::Unreachable { peer_id } => write!(f, "unreachable://{}", peer_id),
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Version announcement, the first message on every connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionMessage {
    /// Protocol version
    pub version: u32,
    /// Sender's own address, including announced services
    pub peer_address: PeerAddress,
    /// Genesis block hash of the sender's chain
    pub genesis_hash: String,
    /// Sender's chain height
    pub start_height: u32,
    /// Sender's cumulative chain work
    pub total_work: u64,
}

impl VersionMessage {
    pub fn new(
        peer_address: PeerAddress,
        genesis_hash: String,
        start_height: u32,
        total_work: u64,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            peer_address,
            genesis_hash,
            start_height,
            total_work,
        }
    }
}

/// Signaling message relayed hop by hop between NAT-restricted peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub sender_id: SignalId,
    pub recipient_id: SignalId,
    pub nonce: u32,
    pub ttl: u8,
    pub flags: SignalFlags,
    pub payload: Option<String>,
}

impl SignalMessage {
    pub fn new(sender_id: SignalId, recipient_id: SignalId, nonce: u32, ttl: u8) -> Self {
        Self {
            sender_id,
            recipient_id,
            nonce,
            ttl,
            flags: SignalFlags::empty(),
            payload: None,
        }
    }

    /// Flagged response travelling back to the sender of `self`
    pub fn reply(&self, ttl: u8, flags: SignalFlags) -> Self {
        Self {
            sender_id: self.recipient_id.clone(),
            recipient_id: self.sender_id.clone(),
            nonce: self.nonce,
            ttl,
            flags,
            payload: None,
        }
    }

    pub fn is_unroutable(&self) -> bool {
        self.flags.contains(SignalFlags::UNROUTABLE)
    }

    pub fn is_ttl_exceeded(&self) -> bool {
        self.flags.contains(SignalFlags::TTL_EXCEEDED)
    }

    /// Plain signals carry no response flags
    pub fn is_plain(&self) -> bool {
        self.flags.is_empty()
    }
}

/// Network message types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Version announcement
    Version(VersionMessage),

    /// Known peer addresses
    Addr(Vec<PeerAddress>),

    /// Request addresses matching the masks
    GetAddr {
        protocol_mask: ProtocolMask,
        service_mask: ServiceFlags,
    },

    /// Keep-alive ping
    Ping(u32),

    /// Keep-alive pong response
    Pong(u32),

    /// Relayed signaling
    Signal(SignalMessage),
}

impl Message {
    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Size of the framed message on the wire
    pub fn wire_size(&self) -> u64 {
        self.to_bytes()
            .map(|data| (FRAME_HEADER_SIZE + data.len()) as u64)
            .unwrap_or(0)
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Version(_) => "Version",
            Message::Addr(_) => "Addr",
            Message::GetAddr { .. } => "GetAddr",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::Signal(_) => "Signal",
        }
    }
}
