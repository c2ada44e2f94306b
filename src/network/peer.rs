//! Peer management for P2P networking
//!
//! The [`PeerManager`] owns every live connection. It decides which
//! connections may stay (capacity, per-IP and duplicate checks), keeps the
//! desired number of outbound connections open, gossips new addresses and
//! routes signaling messages between peers that cannot reach each other
//! directly.

use crate::chain::ChainInfo;
use crate::network::addrman::AddressBook;
use crate::network::address::NetAddress;
use crate::network::agent::{AgentCommand, NetworkAgent};
use crate::network::channel::{Connection, ConnectionId, PeerChannel};
use crate::network::config::NetworkConfig;
use crate::network::connector::{ConnectionSink, Connectors};
use crate::network::message::{Message, PeerAddress, Protocol, SignalFlags, SignalMessage};
use crate::network::signal_store::SignalStore;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Buffered peer events per subscriber
const PEER_EVENT_CAPACITY: usize = 256;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Network disconnected")]
    Disconnected,
    #[error("Max peers reached")]
    MaxPeersReached,
    #[error("No connector for {0} addresses")]
    UnsupportedProtocol(Protocol),
    #[error("No signal route to {0}")]
    NoRoute(String),
}

/// A remote node that completed the version handshake
#[derive(Debug, Clone)]
pub struct Peer {
    channel: PeerChannel,
    peer_address: PeerAddress,
    version: u32,
    start_height: u32,
    total_work: u64,
}

impl Peer {
    pub(crate) fn new(
        channel: PeerChannel,
        peer_address: PeerAddress,
        version: u32,
        start_height: u32,
        total_work: u64,
    ) -> Self {
        Self {
            channel,
            peer_address,
            version,
            start_height,
            total_work,
        }
    }

    pub fn channel(&self) -> &PeerChannel {
        &self.channel
    }

    pub fn peer_address(&self) -> &PeerAddress {
        &self.peer_address
    }

    pub fn net_address(&self) -> Option<&NetAddress> {
        self.peer_address.net_address.as_ref()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn start_height(&self) -> u32 {
        self.start_height
    }

    pub fn total_work(&self) -> u64 {
        self.total_work
    }

    pub(crate) fn set_net_address(&mut self, net_address: Option<NetAddress>) {
        self.peer_address.net_address = net_address;
    }
}

/// Notifications for outer layers
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Joined(Peer),
    Left(Peer),
    /// The peer count changed
    Changed,
}

/// Everything the manager's event loop reacts to
pub enum NetworkEvent {
    /// A transport produced a connection
    Connection(Connection),
    /// An outbound attempt failed before a connection existed
    ConnectError { address: PeerAddress, reason: String },
    Handshake { peer: Peer },
    Addresses {
        channel: PeerChannel,
        addresses: Vec<PeerAddress>,
    },
    Signal {
        channel: PeerChannel,
        msg: SignalMessage,
    },
    Ban { channel: PeerChannel, reason: String },
    Close {
        channel: PeerChannel,
        closed_by_remote: bool,
    },
    CheckPeerCount,
}

struct AgentEntry {
    channel: PeerChannel,
    commands: mpsc::UnboundedSender<AgentCommand>,
    /// Address this connection is counted under
    net_address: Option<NetAddress>,
    counted: bool,
    /// Set once the handshake passed admission
    peer: Option<Peer>,
}

#[derive(Default)]
struct ManagerState {
    agents: HashMap<ConnectionId, AgentEntry>,
    connection_counts: HashMap<NetAddress, usize>,
    connecting_count: usize,
    auto_connect: bool,
    saved_auto_connect: bool,
    offline: bool,
    /// Traffic of closed connections
    bytes_sent: u64,
    bytes_received: u64,
}

impl ManagerState {
    fn peer_count(&self) -> usize {
        self.agents.values().filter(|a| a.peer.is_some()).count()
    }

    fn count_for(&self, net_address: &NetAddress) -> usize {
        self.connection_counts.get(net_address).copied().unwrap_or(0)
    }

    fn release(&mut self, net_address: &NetAddress) {
        if let Some(count) = self.connection_counts.get_mut(net_address) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.connection_counts.remove(net_address);
            }
        }
    }
}

/// Manages all peer connections
pub struct PeerManager {
    config: Arc<NetworkConfig>,
    chain: Arc<dyn ChainInfo>,
    addresses: Arc<dyn AddressBook>,
    connectors: Connectors,
    state: Mutex<ManagerState>,
    forwards: Mutex<SignalStore>,
    events_tx: mpsc::UnboundedSender<NetworkEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<NetworkEvent>>>,
    peer_events: broadcast::Sender<PeerEvent>,
    shutdown: CancellationToken,
}

impl PeerManager {
    pub fn new(
        config: NetworkConfig,
        chain: Arc<dyn ChainInfo>,
        addresses: Arc<dyn AddressBook>,
        connectors: Connectors,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (peer_events, _) = broadcast::channel(PEER_EVENT_CAPACITY);
        let forwards = SignalStore::with_limits(config.signal_store_capacity, config.signal_max_age);

        Arc::new(Self {
            config: Arc::new(config),
            chain,
            addresses,
            connectors,
            state: Mutex::new(ManagerState::default()),
            forwards: Mutex::new(forwards),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            peer_events,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Sink for transports to hand connections to this manager
    pub fn connection_sink(&self) -> ConnectionSink {
        ConnectionSink::new(self.events_tx.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.peer_events.subscribe()
    }

    // =========================================================================
    // Public controls
    // =========================================================================

    /// Enable auto-connect and start filling up peer slots.
    pub async fn connect(&self) {
        {
            let mut state = self.state.lock().await;
            state.auto_connect = true;
            state.saved_auto_connect = true;
        }
        self.check_peer_count().await;
    }

    /// Disable auto-connect and close every connection.
    pub async fn disconnect(&self, reason: &str) {
        let mut state = self.state.lock().await;
        state.auto_connect = false;
        state.saved_auto_connect = false;
        for agent in state.agents.values() {
            agent.channel.close(reason);
        }
    }

    /// React to the host going offline or coming back.
    pub async fn set_online(&self, online: bool) {
        let auto_connect = {
            let mut state = self.state.lock().await;
            state.offline = !online;
            if online {
                state.auto_connect = state.saved_auto_connect;
            } else {
                state.saved_auto_connect = state.auto_connect;
                state.auto_connect = false;
                for agent in state.agents.values() {
                    agent.channel.close("network disconnect");
                }
            }
            state.auto_connect
        };

        if online && auto_connect {
            self.check_peer_count().await;
        }
    }

    /// Dial a specific address right away.
    pub async fn dial(&self, address: PeerAddress) -> Result<(), PeerError> {
        let mut state = self.state.lock().await;
        if state.offline || self.shutdown.is_cancelled() {
            return Err(PeerError::Disconnected);
        }
        if state.peer_count() >= self.config.peer_count_max {
            return Err(PeerError::MaxPeersReached);
        }
        self.connect_to(&mut state, address)
    }

    /// Stop the event loop and close every connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peer_count()
    }

    pub async fn peer_count_direct(&self) -> usize {
        self.peer_count_by(Protocol::Direct).await
    }

    pub async fn peer_count_relayed(&self) -> usize {
        self.peer_count_by(Protocol::Relayed).await
    }

    pub async fn peer_count_unreachable(&self) -> usize {
        self.peer_count_by(Protocol::Unreachable).await
    }

    async fn peer_count_by(&self, protocol: Protocol) -> usize {
        self.state
            .lock()
            .await
            .agents
            .values()
            .filter_map(|a| a.peer.as_ref())
            .filter(|p| p.peer_address().protocol() == protocol)
            .count()
    }

    pub async fn connecting_count(&self) -> usize {
        self.state.lock().await.connecting_count
    }

    /// Live connections from `net_address`
    pub async fn connection_count(&self, net_address: &NetAddress) -> usize {
        self.state.lock().await.count_for(net_address)
    }

    pub async fn bytes_sent(&self) -> u64 {
        let state = self.state.lock().await;
        state.bytes_sent
            + state
                .agents
                .values()
                .map(|a| a.channel.bytes_sent())
                .sum::<u64>()
    }

    pub async fn bytes_received(&self) -> u64 {
        let state = self.state.lock().await;
        state.bytes_received
            + state
                .agents
                .values()
                .map(|a| a.channel.bytes_received())
                .sum::<u64>()
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.state
            .lock()
            .await
            .agents
            .values()
            .filter_map(|a| a.peer.clone())
            .collect()
    }

    // =========================================================================
    // Event loop
    // =========================================================================

    /// Run the manager until [`PeerManager::shutdown`] is called.
    pub async fn run(self: Arc<Self>) {
        let Some(mut events) = self.events_rx.lock().await.take() else {
            log::warn!("Peer manager is already running");
            return;
        };

        let period = self.config.peer_count_check_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(event) = events.recv() => self.handle_event(event).await,
                _ = ticker.tick() => self.check_peer_count().await,
            }
        }

        let state = self.state.lock().await;
        for agent in state.agents.values() {
            agent.channel.close("peer manager shutdown");
        }
        log::info!("Peer manager stopped");
    }

    pub async fn handle_event(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::Connection(connection) => self.on_connection(connection).await,
            NetworkEvent::ConnectError { address, reason } => {
                self.on_connect_error(address, reason).await
            }
            NetworkEvent::Handshake { peer } => self.on_handshake(peer).await,
            NetworkEvent::Addresses { channel, addresses } => {
                self.on_addresses(channel, addresses).await
            }
            NetworkEvent::Signal { channel, msg } => self.on_signal(channel, msg).await,
            NetworkEvent::Ban { channel, reason } => self.ban_channel(&channel, &reason).await,
            NetworkEvent::Close {
                channel,
                closed_by_remote,
            } => self.on_close(channel, closed_by_remote).await,
            NetworkEvent::CheckPeerCount => self.check_peer_count().await,
        }
    }

    // =========================================================================
    // Capacity
    // =========================================================================

    async fn check_peer_count(&self) {
        let mut state = self.state.lock().await;
        if !state.auto_connect
            || state.agents.len() + state.connecting_count >= self.config.peer_count_desired
            || state.connecting_count >= self.config.connecting_count_max
        {
            return;
        }

        let Some(address) = self.addresses.pick_unconnected_address() else {
            log::debug!("No unconnected addresses available");
            return;
        };

        if let Err(e) = self.connect_to(&mut state, address) {
            log::debug!("Could not start connection: {}", e);
        }
    }

    fn connect_to(&self, state: &mut ManagerState, address: PeerAddress) -> Result<(), PeerError> {
        let sink = self.connection_sink();
        self.addresses.mark_connecting(&address);

        let result = match address.protocol() {
            Protocol::Direct => match &self.connectors.direct {
                Some(connector) => connector
                    .connect(&address, None, &sink)
                    .then_some(())
                    .ok_or_else(|| PeerError::ConnectionFailed(address.to_string())),
                None => Err(PeerError::UnsupportedProtocol(Protocol::Direct)),
            },
            Protocol::Relayed => {
                let signal_id = address.signal_id().unwrap_or_default().to_string();
                match (
                    &self.connectors.relayed,
                    self.addresses.lookup_by_signal_id(&signal_id),
                ) {
                    (None, _) => Err(PeerError::UnsupportedProtocol(Protocol::Relayed)),
                    (Some(_), None) => Err(PeerError::NoRoute(signal_id)),
                    (Some(connector), Some(route)) => connector
                        .connect(&address, Some(&route), &sink)
                        .then_some(())
                        .ok_or_else(|| PeerError::ConnectionFailed(address.to_string())),
                }
            }
            Protocol::Unreachable => Err(PeerError::UnsupportedProtocol(Protocol::Unreachable)),
        };

        match result {
            Ok(()) => {
                state.connecting_count += 1;
                log::debug!("Connecting to {}", address);
            }
            Err(_) => {
                self.addresses.mark_unreachable(&address);
                sink.send(NetworkEvent::CheckPeerCount);
            }
        }
        result
    }

    fn schedule_peer_count_check(&self, delay: Duration) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(NetworkEvent::CheckPeerCount);
        });
    }

    /// Outbound attempt for `address` is no longer in flight
    fn finish_connecting(&self, state: &mut ManagerState, address: &PeerAddress) {
        if self.addresses.is_connecting(address) {
            state.connecting_count = state.connecting_count.saturating_sub(1);
        }
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    async fn on_connection(&self, connection: Connection) {
        let Connection { channel, inbound } = connection;
        let mut state = self.state.lock().await;

        if let Some(address) = channel.peer_address().cloned() {
            self.finish_connecting(&mut state, &address);
        }

        let net_address = channel.net_address().filter(|n| !n.is_pseudo()).cloned();

        if let Some(net) = &net_address {
            if state.count_for(net) >= self.config.per_ip_max(channel.protocol()) {
                self.reject(&channel, "connection limit per IP reached");
                return;
            }
        }

        if let Some(address) = channel.peer_address() {
            if self.addresses.is_connected(address) {
                self.reject(&channel, "duplicate connection");
                return;
            }
        }

        if state.peer_count() >= self.config.peer_count_max {
            self.reject(&channel, "max peer count reached");
            return;
        }

        let counted = match &net_address {
            Some(net) => {
                *state.connection_counts.entry(net.clone()).or_insert(0) += 1;
                true
            }
            None => false,
        };

        log::info!("Connection established ({}) {}", channel.direction(), channel);

        let agent = NetworkAgent::new(
            self.config.clone(),
            self.chain.clone(),
            self.addresses.clone(),
            channel.clone(),
            self.events_tx.clone(),
        );
        let commands = agent.spawn(inbound);

        state.agents.insert(
            channel.id(),
            AgentEntry {
                channel,
                commands,
                net_address,
                counted,
                peer: None,
            },
        );
        drop(state);

        self.schedule_peer_count_check(self.config.address_update_delay);
    }

    /// Close a connection that never got an agent
    fn reject(&self, channel: &PeerChannel, reason: &str) {
        log::info!("Rejecting connection {}: {}", channel, reason);
        channel.close(reason);
        if let Some(address) = channel.peer_address() {
            if self.addresses.is_connecting(address) {
                self.addresses.mark_unreachable(address);
            }
        }
    }

    /// Net address a peer is accounted under. The transport's view wins
    /// unless it is private and the announced one is not.
    fn resolve_net_address(channel: &PeerChannel, peer: &Peer) -> Option<NetAddress> {
        let observed = channel.net_address().cloned();
        let announced = peer.net_address().cloned();

        match (observed, announced) {
            (Some(seen), _) if !seen.is_private() => Some(seen),
            (_, Some(told)) if !told.is_private() => Some(told),
            (seen, told) => seen.or(told),
        }
    }

    async fn on_handshake(&self, mut peer: Peer) {
        let channel = peer.channel().clone();
        let mut state = self.state.lock().await;

        let Some(entry) = state.agents.get(&channel.id()) else {
            return;
        };
        let already_counted = entry.counted;

        let net_address = Self::resolve_net_address(&channel, &peer);
        let countable = net_address.clone().filter(|n| !n.is_pseudo());

        // Re-check now that the address may have become known
        if !already_counted {
            if let Some(net) = &countable {
                if state.count_for(net) >= self.config.per_ip_max(channel.protocol()) {
                    channel.close("connection limit per IP reached");
                    return;
                }
            }
        }

        let duplicate = self.addresses.is_connected(peer.peer_address())
            || state.agents.values().any(|a| {
                a.channel.id() != channel.id()
                    && a.peer
                        .as_ref()
                        .is_some_and(|p| p.peer_address() == peer.peer_address())
            });
        if duplicate {
            channel.close("duplicate connection");
            return;
        }

        if self.addresses.is_banned(peer.peer_address()) {
            channel.close("peer is banned");
            return;
        }

        if state.peer_count() >= self.config.peer_count_max {
            channel.close("max peer count reached");
            return;
        }

        if !already_counted {
            if let Some(net) = &countable {
                *state.connection_counts.entry(net.clone()).or_insert(0) += 1;
            }
        }

        peer.set_net_address(net_address);
        self.addresses.mark_connected(&channel, peer.peer_address());

        if let Some(entry) = state.agents.get_mut(&channel.id()) {
            if !already_counted && countable.is_some() {
                entry.net_address = countable;
                entry.counted = true;
            }
            entry.peer = Some(peer.clone());
        }

        self.relay_to_agents(&state, channel.id(), vec![peer.peer_address().clone()]);
        drop(state);

        log::info!(
            "Connected to {} ({}), version={}, height={}, total_work={}",
            peer.peer_address(),
            channel,
            peer.version(),
            peer.start_height(),
            peer.total_work()
        );

        let _ = self.peer_events.send(PeerEvent::Joined(peer));
        let _ = self.peer_events.send(PeerEvent::Changed);
    }

    async fn on_close(&self, channel: PeerChannel, closed_by_remote: bool) {
        let mut state = self.state.lock().await;
        let Some(entry) = state.agents.remove(&channel.id()) else {
            return;
        };

        if entry.counted {
            if let Some(net) = &entry.net_address {
                state.release(net);
            }
        }

        state.bytes_sent += channel.bytes_sent();
        state.bytes_received += channel.bytes_received();
        drop(state);

        let reason = channel.close_reason().unwrap_or("unknown");

        match entry.peer {
            Some(peer) => {
                self.addresses.mark_disconnected(&channel, closed_by_remote);
                log::info!(
                    "Disconnected from {} ({}) after {} kB sent / {} kB received: {}",
                    peer.peer_address(),
                    channel,
                    channel.bytes_sent() / 1000,
                    channel.bytes_received() / 1000,
                    reason
                );
                let _ = self.peer_events.send(PeerEvent::Left(peer));
                let _ = self.peer_events.send(PeerEvent::Changed);
            }
            None => {
                // Never became a peer
                if let Some(address) = channel.peer_address() {
                    if !self.addresses.is_connected(address) {
                        self.addresses.mark_unreachable(address);
                    }
                }
                log::debug!("Connection {} closed before handshake: {}", channel, reason);
            }
        }

        self.check_peer_count().await;
    }

    async fn on_connect_error(&self, address: PeerAddress, reason: String) {
        {
            let mut state = self.state.lock().await;
            self.finish_connecting(&mut state, &address);
        }
        log::debug!("Connection to {} failed: {}", address, reason);
        self.addresses.mark_unreachable(&address);
        self.check_peer_count().await;
    }

    async fn ban_channel(&self, channel: &PeerChannel, reason: &str) {
        let address = {
            let state = self.state.lock().await;
            state
                .agents
                .get(&channel.id())
                .and_then(|a| a.peer.as_ref())
                .map(|p| p.peer_address().clone())
                .or_else(|| channel.peer_address().cloned())
        };

        log::warn!("Banning {}: {}", channel, reason);
        if let Some(address) = address {
            self.addresses.ban(&address);
        }
        channel.close(reason);
    }

    // =========================================================================
    // Address gossip
    // =========================================================================

    async fn on_addresses(&self, channel: PeerChannel, addresses: Vec<PeerAddress>) {
        let added = self.addresses.ingest(&channel, &addresses);

        if !added.is_empty() && addresses.len() <= self.config.relay_batch_max {
            let state = self.state.lock().await;
            self.relay_to_agents(&state, channel.id(), added);
        }

        self.check_peer_count().await;
    }

    /// Pass addresses on to a few random established agents other than
    /// the one they came from.
    fn relay_to_agents(&self, state: &ManagerState, source: ConnectionId, addresses: Vec<PeerAddress>) {
        if addresses.len() > self.config.relay_batch_max {
            return;
        }

        let mut targets: Vec<&AgentEntry> = state
            .agents
            .values()
            .filter(|a| a.channel.id() != source && a.peer.is_some())
            .collect();
        targets.shuffle(&mut rand::thread_rng());

        for agent in targets.into_iter().take(self.config.peer_count_relay) {
            let _ = agent
                .commands
                .send(AgentCommand::RelayAddresses(addresses.clone()));
        }
    }

    // =========================================================================
    // Signal routing
    // =========================================================================

    async fn on_signal(&self, channel: PeerChannel, msg: SignalMessage) {
        // A relay hop never raises the TTL
        if msg.ttl > self.config.signal_ttl_initial {
            self.ban_channel(&channel, "invalid signal ttl").await;
            return;
        }

        if msg.sender_id == self.config.signal_id {
            log::debug!("Ignoring signal from myself via {}", channel);
            return;
        }

        let mut forwards = self.forwards.lock().await;
        let flagged = msg.is_unroutable() || msg.is_ttl_exceeded();

        // Our earlier forward did not reach its recipient
        if flagged && forwards.was_recently_forwarded(&msg.recipient_id, &msg.sender_id, msg.nonce) {
            self.addresses.mark_unroutable(&channel, &msg.sender_id);
        }

        if msg.recipient_id == self.config.signal_id {
            if let Some(connector) = &self.connectors.relayed {
                if flagged && connector.is_valid_signal(&msg) {
                    self.addresses.mark_unroutable(&channel, &msg.sender_id);
                }
                connector.on_signal(&channel, msg);
            }
            return;
        }

        if msg.ttl == 0 {
            log::warn!(
                "Discarding signal from {} to {}: TTL reached",
                msg.sender_id,
                msg.recipient_id
            );
            if msg.is_plain() {
                let reply = msg.reply(self.config.signal_ttl_initial, SignalFlags::TTL_EXCEEDED);
                channel.send(Message::Signal(reply));
            }
            return;
        }

        let Some(target) = self.addresses.lookup_by_signal_id(&msg.recipient_id) else {
            log::warn!(
                "Failed to forward signal from {} to {}: no route",
                msg.sender_id,
                msg.recipient_id
            );
            if msg.is_plain() {
                let reply = msg.reply(self.config.signal_ttl_initial, SignalFlags::UNROUTABLE);
                channel.send(Message::Signal(reply));
            }
            return;
        };

        if target.id() == channel.id() {
            log::warn!(
                "Discarding signal from {} to {}: route leads back to {}",
                msg.sender_id,
                msg.recipient_id,
                channel
            );
            return;
        }

        let mut forwarded = msg.clone();
        forwarded.ttl -= 1;
        if target.send(Message::Signal(forwarded)) {
            log::trace!(
                "Forwarded signal from {} to {} via {}",
                msg.sender_id,
                msg.recipient_id,
                target
            );
            if msg.is_plain() {
                forwards.add(&msg.sender_id, &msg.recipient_id, msg.nonce);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::StaticChain;
    use crate::network::addrman::{AddrManager, AddrState};
    use crate::network::channel::{Direction, TransportEnd};
    use crate::network::connector::Connector;
    use crate::network::message::{ServiceFlags, PROTOCOL_VERSION};

    #[derive(Default)]
    struct RecordingConnector {
        dialed: parking_lot::Mutex<Vec<PeerAddress>>,
        signals: parking_lot::Mutex<Vec<SignalMessage>>,
        valid: bool,
    }

    impl Connector for RecordingConnector {
        fn connect(
            &self,
            address: &PeerAddress,
            _signal_channel: Option<&PeerChannel>,
            _sink: &ConnectionSink,
        ) -> bool {
            self.dialed.lock().push(address.clone());
            true
        }

        fn is_valid_signal(&self, _msg: &SignalMessage) -> bool {
            self.valid
        }

        fn on_signal(&self, _channel: &PeerChannel, msg: SignalMessage) {
            self.signals.lock().push(msg);
        }
    }

    const MY_ID: &str = "0000aaaa";

    fn config() -> NetworkConfig {
        let mut config = NetworkConfig::new(PeerAddress::direct("1.1.1.1", 8443, ServiceFlags::FULL));
        config.signal_id = MY_ID.to_string();
        config
    }

    fn manager_with(
        config: NetworkConfig,
        book: Arc<AddrManager>,
        connectors: Connectors,
    ) -> Arc<PeerManager> {
        PeerManager::new(config, Arc::new(StaticChain::default()), book, connectors)
    }

    fn channel() -> (PeerChannel, TransportEnd) {
        let (conn, end) = Connection::new(Direction::Inbound, Protocol::Direct, None, None);
        (conn.channel, end)
    }

    fn signal(sender: &str, recipient: &str, ttl: u8) -> SignalMessage {
        SignalMessage::new(sender.to_string(), recipient.to_string(), 42, ttl)
    }

    fn sent_signal(end: &mut TransportEnd) -> Option<SignalMessage> {
        match end.outbound.try_recv() {
            Ok(Message::Signal(msg)) => Some(msg),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_ttl_exhausted_echoes_once() {
        let manager = manager_with(config(), Arc::new(AddrManager::new()), Connectors::new());
        let (ch, mut end) = channel();

        manager
            .handle_event(NetworkEvent::Signal {
                channel: ch.clone(),
                msg: signal("bbbb", "cccc", 0),
            })
            .await;
        let reply = sent_signal(&mut end).unwrap();
        assert!(reply.is_ttl_exceeded());
        assert_eq!(reply.recipient_id, "bbbb");
        assert_eq!(reply.ttl, 3);

        // Flagged messages are never echoed
        manager
            .handle_event(NetworkEvent::Signal {
                channel: ch,
                msg: reply.reply(0, SignalFlags::TTL_EXCEEDED),
            })
            .await;
        assert!(sent_signal(&mut end).is_none());
    }

    #[tokio::test]
    async fn test_excessive_ttl_bans_channel() {
        let manager = manager_with(config(), Arc::new(AddrManager::new()), Connectors::new());
        let (ch, _end) = channel();

        manager
            .handle_event(NetworkEvent::Signal {
                channel: ch.clone(),
                msg: signal("bbbb", "cccc", 4),
            })
            .await;
        assert!(ch.is_closed());
        assert_eq!(ch.close_reason(), Some("invalid signal ttl"));
    }

    #[tokio::test]
    async fn test_own_signal_is_ignored() {
        let manager = manager_with(config(), Arc::new(AddrManager::new()), Connectors::new());
        let (ch, mut end) = channel();

        manager
            .handle_event(NetworkEvent::Signal {
                channel: ch,
                msg: signal(MY_ID, "cccc", 0),
            })
            .await;
        assert!(sent_signal(&mut end).is_none());
    }

    #[tokio::test]
    async fn test_unknown_recipient_echoes_unroutable() {
        let manager = manager_with(config(), Arc::new(AddrManager::new()), Connectors::new());
        let (ch, mut end) = channel();

        manager
            .handle_event(NetworkEvent::Signal {
                channel: ch,
                msg: signal("bbbb", "cccc", 2),
            })
            .await;
        let reply = sent_signal(&mut end).unwrap();
        assert!(reply.is_unroutable());
        assert_eq!(reply.sender_id, "cccc");
    }

    #[tokio::test]
    async fn test_route_back_to_sender_is_dropped() {
        let book = Arc::new(AddrManager::new());
        let manager = manager_with(config(), book.clone(), Connectors::new());
        let (ch, mut end) = channel();
        book.ingest(&ch, &[PeerAddress::relayed("cccc", ServiceFlags::NANO, 0)]);

        manager
            .handle_event(NetworkEvent::Signal {
                channel: ch,
                msg: signal("bbbb", "cccc", 2),
            })
            .await;
        assert!(sent_signal(&mut end).is_none());
    }

    #[tokio::test]
    async fn test_forward_and_unroutable_reply() {
        let book = Arc::new(AddrManager::new());
        let manager = manager_with(config(), book.clone(), Connectors::new());
        let (from, _from_end) = channel();
        let (to, mut to_end) = channel();
        book.ingest(&to, &[PeerAddress::relayed("cccc", ServiceFlags::NANO, 0)]);

        manager
            .handle_event(NetworkEvent::Signal {
                channel: from,
                msg: signal("bbbb", "cccc", 3),
            })
            .await;
        let forwarded = sent_signal(&mut to_end).unwrap();
        assert_eq!(forwarded.ttl, 2);
        assert!(manager.forwards.lock().await.contains("bbbb", "cccc", 42));

        // The next hop could not deliver it; drop that route
        manager
            .handle_event(NetworkEvent::Signal {
                channel: to,
                msg: forwarded.reply(3, SignalFlags::UNROUTABLE),
            })
            .await;
        assert!(book.lookup_by_signal_id("cccc").is_none());
    }

    #[tokio::test]
    async fn test_signal_for_us_goes_to_connector() {
        let connector = Arc::new(RecordingConnector {
            valid: true,
            ..Default::default()
        });
        let book = Arc::new(AddrManager::new());
        let manager = manager_with(
            config(),
            book.clone(),
            Connectors::new().with_relayed(connector.clone()),
        );
        let (ch, _end) = channel();
        book.ingest(&ch, &[PeerAddress::relayed("bbbb", ServiceFlags::NANO, 0)]);

        manager
            .handle_event(NetworkEvent::Signal {
                channel: ch.clone(),
                msg: signal("bbbb", MY_ID, 2),
            })
            .await;
        assert_eq!(connector.signals.lock().len(), 1);
        assert!(book.lookup_by_signal_id("bbbb").is_some());

        let mut flagged = signal("bbbb", MY_ID, 2);
        flagged.flags = SignalFlags::UNROUTABLE;
        manager
            .handle_event(NetworkEvent::Signal {
                channel: ch,
                msg: flagged,
            })
            .await;
        assert_eq!(connector.signals.lock().len(), 2);
        assert!(book.lookup_by_signal_id("bbbb").is_none());
    }

    #[tokio::test]
    async fn test_per_ip_limit_for_relayed_connections() {
        let manager = manager_with(config(), Arc::new(AddrManager::new()), Connectors::new());
        let net = NetAddress::parse("5.6.7.8").unwrap();

        let mut ends = Vec::new();
        let mut channels = Vec::new();
        for _ in 0..3 {
            let (conn, end) = Connection::new(
                Direction::Inbound,
                Protocol::Relayed,
                Some(net.clone()),
                None,
            );
            channels.push(conn.channel.clone());
            ends.push(end);
            manager
                .handle_event(NetworkEvent::Connection(conn))
                .await;
        }

        assert!(!channels[0].is_closed());
        assert!(!channels[1].is_closed());
        assert_eq!(
            channels[2].close_reason(),
            Some("connection limit per IP reached")
        );
        assert_eq!(manager.connection_count(&net).await, 2);

        // Closing one frees a slot
        channels[0].close("test");
        manager
            .handle_event(NetworkEvent::Close {
                channel: channels[0].clone(),
                closed_by_remote: false,
            })
            .await;
        assert_eq!(manager.connection_count(&net).await, 1);
    }

    #[tokio::test]
    async fn test_pseudo_addresses_are_not_counted() {
        let manager = manager_with(config(), Arc::new(AddrManager::new()), Connectors::new());

        let mut ends = Vec::new();
        for _ in 0..3 {
            let (conn, end) = Connection::new(
                Direction::Inbound,
                Protocol::Relayed,
                Some(NetAddress::Unknown),
                None,
            );
            let ch = conn.channel.clone();
            ends.push(end);
            manager
                .handle_event(NetworkEvent::Connection(conn))
                .await;
            assert!(!ch.is_closed());
        }
        assert_eq!(manager.connection_count(&NetAddress::Unknown).await, 0);
    }

    #[tokio::test]
    async fn test_auto_connect_dials_candidates() {
        let connector = Arc::new(RecordingConnector::default());
        let book = Arc::new(AddrManager::new());
        book.add(PeerAddress::direct("2.2.2.2", 8443, ServiceFlags::FULL));
        book.add(PeerAddress::direct("3.3.3.3", 8443, ServiceFlags::FULL));
        book.add(PeerAddress::direct("4.4.4.4", 8443, ServiceFlags::FULL));
        let manager = manager_with(
            config(),
            book,
            Connectors::new().with_direct(connector.clone()),
        );

        // Disabled until connect() is called
        manager.handle_event(NetworkEvent::CheckPeerCount).await;
        assert!(connector.dialed.lock().is_empty());

        manager.connect().await;
        manager.handle_event(NetworkEvent::CheckPeerCount).await;
        manager.handle_event(NetworkEvent::CheckPeerCount).await;

        // Never more than two attempts in flight
        assert_eq!(connector.dialed.lock().len(), 2);
        assert_eq!(manager.connecting_count().await, 2);
    }

    #[tokio::test]
    async fn test_connect_error_frees_slot() {
        let connector = Arc::new(RecordingConnector::default());
        let book = Arc::new(AddrManager::new());
        let target = PeerAddress::direct("2.2.2.2", 8443, ServiceFlags::FULL);
        book.add(target.clone());
        let manager = manager_with(
            config(),
            book.clone(),
            Connectors::new().with_direct(connector.clone()),
        );

        manager.dial(target.clone()).await.unwrap();
        assert_eq!(manager.connecting_count().await, 1);
        assert!(book.is_connecting(&target));

        manager
            .handle_event(NetworkEvent::ConnectError {
                address: target.clone(),
                reason: "refused".into(),
            })
            .await;
        assert_eq!(manager.connecting_count().await, 0);
        assert!(!book.is_connecting(&target));
    }

    #[tokio::test]
    async fn test_unsupported_protocol() {
        let book = Arc::new(AddrManager::new());
        let manager = manager_with(config(), book, Connectors::new());

        let result = manager
            .dial(PeerAddress::direct("2.2.2.2", 8443, ServiceFlags::FULL))
            .await;
        assert!(matches!(
            result,
            Err(PeerError::UnsupportedProtocol(Protocol::Direct))
        ));

        let result = manager
            .dial(PeerAddress::relayed("cccc", ServiceFlags::NANO, 1))
            .await;
        assert!(matches!(
            result,
            Err(PeerError::UnsupportedProtocol(Protocol::Relayed))
        ));
        assert_eq!(manager.connecting_count().await, 0);
    }

    #[tokio::test]
    async fn test_offline_restores_auto_connect() {
        let manager = manager_with(config(), Arc::new(AddrManager::new()), Connectors::new());
        let (conn, _end) = Connection::new(Direction::Inbound, Protocol::Direct, None, None);
        let ch = conn.channel.clone();
        manager
            .handle_event(NetworkEvent::Connection(conn))
            .await;

        manager.connect().await;
        manager.set_online(false).await;
        assert_eq!(ch.close_reason(), Some("network disconnect"));
        assert!(!manager.state.lock().await.auto_connect);

        let target = PeerAddress::direct("2.2.2.2", 8443, ServiceFlags::FULL);
        assert!(matches!(
            manager.dial(target.clone()).await,
            Err(PeerError::Disconnected)
        ));

        manager.set_online(true).await;
        assert!(manager.state.lock().await.auto_connect);
        assert!(matches!(
            manager.dial(target).await,
            Err(PeerError::UnsupportedProtocol(Protocol::Direct))
        ));

        manager.disconnect("user request").await;
        manager.set_online(false).await;
        manager.set_online(true).await;
        assert!(!manager.state.lock().await.auto_connect);
    }

    fn ip(host: &str) -> Option<NetAddress> {
        NetAddress::parse(host).ok()
    }

    fn direct(host: &str) -> PeerAddress {
        PeerAddress::direct(host, 8443, ServiceFlags::FULL)
    }

    /// Hand an inbound connection to the manager, which starts its agent
    async fn admit(
        manager: &PeerManager,
        protocol: Protocol,
        net_address: Option<NetAddress>,
    ) -> (PeerChannel, TransportEnd) {
        let (conn, end) = Connection::new(Direction::Inbound, protocol, net_address, None);
        let channel = conn.channel.clone();
        manager.handle_event(NetworkEvent::Connection(conn)).await;
        (channel, end)
    }

    /// Register a connection whose agent commands end up in the returned receiver
    async fn attach(
        manager: &PeerManager,
        host: &str,
    ) -> (PeerChannel, TransportEnd, mpsc::UnboundedReceiver<AgentCommand>) {
        let (conn, end) = Connection::new(Direction::Inbound, Protocol::Direct, ip(host), None);
        let (commands, rx) = mpsc::unbounded_channel();
        manager.state.lock().await.agents.insert(
            conn.channel.id(),
            AgentEntry {
                channel: conn.channel.clone(),
                commands,
                net_address: None,
                counted: false,
                peer: None,
            },
        );
        (conn.channel, end, rx)
    }

    async fn handshake(manager: &PeerManager, channel: &PeerChannel, address: &PeerAddress) {
        let peer = Peer::new(channel.clone(), address.clone(), PROTOCOL_VERSION, 1, 1);
        manager.handle_event(NetworkEvent::Handshake { peer }).await;
    }

    fn relayed_to(rx: &mut mpsc::UnboundedReceiver<AgentCommand>, address: &PeerAddress) -> bool {
        let mut seen = false;
        while let Ok(AgentCommand::RelayAddresses(addresses)) = rx.try_recv() {
            seen |= addresses.contains(address);
        }
        seen
    }

    #[tokio::test]
    async fn test_outbound_duplicate_rejected_on_connection() {
        let book = Arc::new(AddrManager::new());
        let manager = manager_with(config(), book.clone(), Connectors::new());
        let target = direct("2.2.2.2");

        let (first, _first_end) = admit(&manager, Protocol::Direct, ip("2.2.2.2")).await;
        handshake(&manager, &first, &target).await;
        assert_eq!(manager.peer_count().await, 1);

        let (conn, _end) = Connection::new(
            Direction::Outbound,
            Protocol::Direct,
            ip("2.2.2.2"),
            Some(target.clone()),
        );
        let second = conn.channel.clone();
        manager.handle_event(NetworkEvent::Connection(conn)).await;

        assert_eq!(second.close_reason(), Some("duplicate connection"));
        assert!(!first.is_closed());
        assert!(book.is_connected(&target));
        assert_eq!(manager.peer_count().await, 1);
        assert_eq!(manager.connection_count(&ip("2.2.2.2").unwrap()).await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_rejected_on_handshake() {
        let manager = manager_with(config(), Arc::new(AddrManager::new()), Connectors::new());
        let target = direct("2.2.2.2");

        let (first, _first_end) = admit(&manager, Protocol::Direct, ip("2.2.2.2")).await;
        let (second, _second_end) = admit(&manager, Protocol::Direct, ip("3.3.3.3")).await;
        handshake(&manager, &first, &target).await;
        handshake(&manager, &second, &target).await;

        assert_eq!(second.close_reason(), Some("duplicate connection"));
        assert!(!first.is_closed());
        assert_eq!(manager.peer_count().await, 1);

        manager
            .handle_event(NetworkEvent::Close {
                channel: second,
                closed_by_remote: false,
            })
            .await;
        assert_eq!(manager.connection_count(&ip("3.3.3.3").unwrap()).await, 0);
        assert_eq!(manager.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_per_ip_limit_rechecked_on_handshake() {
        let manager = manager_with(config(), Arc::new(AddrManager::new()), Connectors::new());
        let announced = NetAddress::parse("5.5.5.5").unwrap();

        // The transport cannot tell where relayed peers come from
        let mut links = Vec::new();
        for i in 0..3 {
            let (channel, end) = admit(&manager, Protocol::Relayed, None).await;
            let mut address = PeerAddress::relayed(format!("peer{}", i), ServiceFlags::NANO, 0);
            address.net_address = Some(announced.clone());
            handshake(&manager, &channel, &address).await;
            links.push((channel, end));
        }

        assert!(!links[0].0.is_closed());
        assert!(!links[1].0.is_closed());
        assert_eq!(
            links[2].0.close_reason(),
            Some("connection limit per IP reached")
        );
        assert_eq!(manager.connection_count(&announced).await, 2);
        assert_eq!(manager.peer_count_relayed().await, 2);
    }

    #[tokio::test]
    async fn test_banned_peer_rejected_on_handshake() {
        let book = Arc::new(AddrManager::new());
        let manager = manager_with(config(), book.clone(), Connectors::new());
        let target = direct("2.2.2.2");
        book.ban(&target);

        let (channel, _end) = admit(&manager, Protocol::Direct, ip("2.2.2.2")).await;
        handshake(&manager, &channel, &target).await;

        assert_eq!(channel.close_reason(), Some("peer is banned"));
        assert_eq!(manager.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_before_handshake_marks_unreachable() {
        let book = Arc::new(AddrManager::new());
        let manager = manager_with(config(), book.clone(), Connectors::new());

        // Outbound: the dialed address failed to become a peer
        let target = direct("2.2.2.2");
        book.add(target.clone());
        book.mark_connecting(&target);
        let (conn, _end) = Connection::new(
            Direction::Outbound,
            Protocol::Direct,
            ip("2.2.2.2"),
            Some(target.clone()),
        );
        let outbound = conn.channel.clone();
        manager.handle_event(NetworkEvent::Connection(conn)).await;
        outbound.close("version timeout");
        manager
            .handle_event(NetworkEvent::Close {
                channel: outbound,
                closed_by_remote: false,
            })
            .await;
        assert_eq!(book.state_of(&target), Some(AddrState::Failed));

        // Inbound: the address announced in the version message is used
        let announced = direct("3.3.3.3");
        book.add(announced.clone());
        let (inbound, _in_end) = admit(&manager, Protocol::Direct, ip("3.3.3.3")).await;
        assert!(inbound.set_peer_address(announced.clone()));
        inbound.close("connection limit per IP reached");
        manager
            .handle_event(NetworkEvent::Close {
                channel: inbound,
                closed_by_remote: false,
            })
            .await;
        assert_eq!(book.state_of(&announced), Some(AddrState::Failed));
        assert_eq!(manager.connection_count(&ip("3.3.3.3").unwrap()).await, 0);
    }

    #[tokio::test]
    async fn test_new_peer_relayed_to_limited_agents() {
        let mut config = config();
        config.peer_count_relay = 2;
        let manager = manager_with(config, Arc::new(AddrManager::new()), Connectors::new());

        let mut agents = Vec::new();
        for i in 1..=4 {
            let host = format!("2.2.2.{}", i);
            let (channel, end, rx) = attach(&manager, &host).await;
            handshake(&manager, &channel, &direct(&host)).await;
            agents.push((channel, end, rx));
        }
        for (_, _, rx) in agents.iter_mut() {
            while rx.try_recv().is_ok() {}
        }

        let newcomer = direct("3.3.3.3");
        let (channel, _end, mut own_rx) = attach(&manager, "3.3.3.3").await;
        handshake(&manager, &channel, &newcomer).await;

        let relayed = agents
            .iter_mut()
            .map(|(_, _, rx)| relayed_to(rx, &newcomer))
            .filter(|seen| *seen)
            .count();
        assert_eq!(relayed, 2);
        assert!(!relayed_to(&mut own_rx, &newcomer));
    }

    #[tokio::test]
    async fn test_large_addr_batches_are_not_relayed() {
        let mut config = config();
        config.peer_count_relay = 2;
        let manager = manager_with(config, Arc::new(AddrManager::new()), Connectors::new());

        let mut agents = Vec::new();
        for i in 1..=3 {
            let host = format!("2.2.2.{}", i);
            let (channel, end, rx) = attach(&manager, &host).await;
            handshake(&manager, &channel, &direct(&host)).await;
            agents.push((channel, end, rx));
        }
        for (_, _, rx) in agents.iter_mut() {
            while rx.try_recv().is_ok() {}
        }
        let source = agents[0].0.clone();

        let batch: Vec<PeerAddress> = (1..=11).map(|i| direct(&format!("7.7.7.{}", i))).collect();
        manager
            .handle_event(NetworkEvent::Addresses {
                channel: source.clone(),
                addresses: batch.clone(),
            })
            .await;
        for (_, _, rx) in agents.iter_mut() {
            assert!(!relayed_to(rx, &batch[0]));
        }

        let single = direct("8.8.8.8");
        manager
            .handle_event(NetworkEvent::Addresses {
                channel: source,
                addresses: vec![single.clone()],
            })
            .await;
        assert!(!relayed_to(&mut agents[0].2, &single));
        assert!(relayed_to(&mut agents[1].2, &single));
        assert!(relayed_to(&mut agents[2].2, &single));
    }
}
