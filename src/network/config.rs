//! Network configuration for the peer connection layer.

use crate::network::message::{PeerAddress, Protocol, ProtocolMask, ServiceFlags, SignalId};
use rand::RngCore;
use std::time::Duration;

/// Default port for direct socket connections
pub const DEFAULT_PORT: u16 = 8443;

/// Tunables of the peer manager and its agents.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Our own address, announced in the version handshake.
    pub peer_address: PeerAddress,
    /// Identifier under which relayed signals reach us.
    pub signal_id: SignalId,
    /// Protocols we ask peers for in GetAddr.
    pub protocol_mask: ProtocolMask,
    /// Services we ask peers for in GetAddr.
    pub service_mask: ServiceFlags,

    /// Number of peers we try to keep connected.
    pub peer_count_desired: usize,
    /// Hard limit of established peers.
    pub peer_count_max: usize,
    /// Connections allowed per IP over direct sockets.
    pub peer_count_per_ip_direct_max: usize,
    /// Connections allowed per IP over relayed data channels.
    pub peer_count_per_ip_relayed_max: usize,
    /// Outbound connection attempts allowed in flight.
    pub connecting_count_max: usize,
    /// Agents a new address is relayed to.
    pub peer_count_relay: usize,
    /// Address batches larger than this are not relayed.
    pub relay_batch_max: usize,
    /// Delay before re-checking the peer count after a new connection.
    pub address_update_delay: Duration,
    /// Period of the background peer count check.
    pub peer_count_check_interval: Duration,

    /// Hop budget of a fresh signaling message.
    pub signal_ttl_initial: u8,
    /// Capacity of the forwarded-signal store.
    pub signal_store_capacity: usize,
    /// How long a forwarded signal is remembered.
    pub signal_max_age: Duration,

    /// Time allowed for the peer's version message.
    pub handshake_timeout: Duration,
    /// Time allowed for a pong.
    pub ping_timeout: Duration,
    /// Period between pings.
    pub connectivity_check_interval: Duration,
    /// Period between re-announcements of our own address.
    pub announce_addr_interval: Duration,
    /// Minimum time before the same address is relayed to a peer again.
    pub relay_throttle: Duration,
    /// Attempts at sending our version before giving up.
    pub version_attempts_max: u32,
    /// Delay between version send attempts.
    pub version_retry_delay: Duration,
    /// Addr messages with more entries get the sender banned.
    pub max_addr_per_message: usize,
    /// Relayed addresses this many hops away are not passed on.
    pub max_relay_distance: u8,
}

impl NetworkConfig {
    /// Full-node defaults announcing the given address
    pub fn new(peer_address: PeerAddress) -> Self {
        let signal_id = peer_address
            .signal_id()
            .map(str::to_string)
            .unwrap_or_else(random_signal_id);

        Self {
            peer_address,
            signal_id,
            protocol_mask: ProtocolMask::DIRECT | ProtocolMask::RELAYED,
            service_mask: ServiceFlags::all(),
            peer_count_desired: 6,
            peer_count_max: 50_000,
            peer_count_per_ip_direct_max: 25,
            peer_count_per_ip_relayed_max: 2,
            connecting_count_max: 2,
            peer_count_relay: 4,
            relay_batch_max: 10,
            address_update_delay: Duration::from_secs(1),
            peer_count_check_interval: Duration::from_secs(30),
            signal_ttl_initial: 3,
            signal_store_capacity: 1000,
            signal_max_age: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(3),
            ping_timeout: Duration::from_secs(10),
            connectivity_check_interval: Duration::from_secs(60),
            announce_addr_interval: Duration::from_secs(10 * 60),
            relay_throttle: Duration::from_secs(5 * 60),
            version_attempts_max: 10,
            version_retry_delay: Duration::from_millis(500),
            max_addr_per_message: 1000,
            max_relay_distance: 4,
        }
    }

    /// Preset for constrained deployments holding few connections.
    pub fn light(peer_address: PeerAddress) -> Self {
        Self {
            peer_count_max: 15,
            peer_count_per_ip_direct_max: 1,
            ..Self::new(peer_address)
        }
    }

    /// Per-IP connection cap for a transport
    pub fn per_ip_max(&self, protocol: Protocol) -> usize {
        match protocol {
            Protocol::Direct => self.peer_count_per_ip_direct_max,
            Protocol::Relayed | Protocol::Unreachable => self.peer_count_per_ip_relayed_max,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::new(PeerAddress::direct("localhost", DEFAULT_PORT, ServiceFlags::FULL))
    }
}

fn random_signal_id() -> SignalId {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
