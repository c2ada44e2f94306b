//! Per-connection network agent
//!
//! Drives the version handshake, liveness pings and address gossip on one
//! channel. Each agent runs in its own task and only talks to the peer
//! manager through [`NetworkEvent`]s.

use crate::chain::ChainInfo;
use crate::network::addrman::AddressBook;
use crate::network::channel::PeerChannel;
use crate::network::config::NetworkConfig;
use crate::network::message::{
    is_compatible, Message, PeerAddress, Protocol, ProtocolMask, ServiceFlags, VersionMessage,
    PROTOCOL_VERSION,
};
use crate::network::peer::{NetworkEvent, Peer};
use crate::network::timers::Timers;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Handshake progress of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentState {
    /// Our version has not been sent yet
    AwaitingHandshake,
    /// Our version is out, waiting for theirs
    HandshakeInFlight,
    Established,
    Closed,
}

/// Requests from the peer manager
#[derive(Debug, Clone)]
pub enum AgentCommand {
    RelayAddresses(Vec<PeerAddress>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AgentTimer {
    VersionRetry,
    VersionTimeout,
    Connectivity,
    AnnounceAddress,
    PingTimeout(u32),
}

impl AgentTimer {
    fn key(&self) -> String {
        match self {
            AgentTimer::VersionRetry => "version-retry".to_string(),
            AgentTimer::VersionTimeout => "version".to_string(),
            AgentTimer::Connectivity => "connectivity".to_string(),
            AgentTimer::AnnounceAddress => "announce-addr".to_string(),
            AgentTimer::PingTimeout(nonce) => format!("ping_{}", nonce),
        }
    }
}

pub struct NetworkAgent {
    config: Arc<NetworkConfig>,
    chain: Arc<dyn ChainInfo>,
    addresses: Arc<dyn AddressBook>,
    channel: PeerChannel,
    events: mpsc::UnboundedSender<NetworkEvent>,
    peer: Option<Peer>,
    /// Addresses this peer knows about, and when we learned that
    known_addresses: HashMap<PeerAddress, Instant>,
    timers: Timers<AgentTimer>,
    timer_rx: Option<mpsc::UnboundedReceiver<AgentTimer>>,
    state: AgentState,
    version_received: bool,
    version_sent: bool,
    version_attempts: u32,
    discarded: u64,
}

impl NetworkAgent {
    pub fn new(
        config: Arc<NetworkConfig>,
        chain: Arc<dyn ChainInfo>,
        addresses: Arc<dyn AddressBook>,
        channel: PeerChannel,
        events: mpsc::UnboundedSender<NetworkEvent>,
    ) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        Self {
            config,
            chain,
            addresses,
            channel,
            events,
            peer: None,
            known_addresses: HashMap::new(),
            timers: Timers::new(timer_tx),
            timer_rx: Some(timer_rx),
            state: AgentState::AwaitingHandshake,
            version_received: false,
            version_sent: false,
            version_attempts: 0,
            discarded: 0,
        }
    }

    /// Start the agent task. The returned sender reaches [`AgentCommand`]s
    /// to it until the channel closes.
    pub fn spawn(self, inbound: mpsc::Receiver<Message>) -> mpsc::UnboundedSender<AgentCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(inbound, rx));
        tx
    }

    /// Process messages, timers and commands until the channel closes.
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Message>,
        mut commands: mpsc::UnboundedReceiver<AgentCommand>,
    ) {
        let Some(mut timer_rx) = self.timer_rx.take() else {
            return;
        };
        let channel = self.channel.clone();

        self.handshake();

        let closed_by_remote = loop {
            tokio::select! {
                biased;
                _ = channel.closed() => break false,
                Some(timer) = timer_rx.recv() => self.on_timer(timer),
                Some(command) = commands.recv() => self.on_command(command),
                msg = inbound.recv() => match msg {
                    Some(msg) => self.handle_message(msg),
                    None => break true,
                },
            }
        };

        self.close(closed_by_remote);
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    fn handshake(&mut self) {
        if self.version_sent || self.state == AgentState::Closed {
            return;
        }

        let version = VersionMessage::new(
            self.config.peer_address.clone(),
            self.chain.genesis_hash(),
            self.chain.height(),
            self.chain.total_work(),
        );

        if !self.channel.send(Message::Version(version)) {
            self.version_attempts += 1;
            if self.version_attempts >= self.config.version_attempts_max {
                self.channel.close("sending of version message failed");
                return;
            }
            let timer = AgentTimer::VersionRetry;
            self.timers
                .set_timeout(timer.key(), self.config.version_retry_delay, timer);
            return;
        }

        self.version_sent = true;
        self.state = AgentState::HandshakeInFlight;

        if self.version_received {
            self.finish_handshake();
        } else {
            let timer = AgentTimer::VersionTimeout;
            self.timers
                .set_timeout(timer.key(), self.config.handshake_timeout, timer);
        }
    }

    fn on_version(&mut self, version: VersionMessage) {
        if self.version_received {
            log::warn!("Discarding duplicate version message from {}", self.channel);
            self.discarded += 1;
            return;
        }

        self.timers.clear_timeout(&AgentTimer::VersionTimeout.key());

        if !is_compatible(version.version) {
            self.channel.close(&format!(
                "incompatible version (ours={}, theirs={})",
                PROTOCOL_VERSION, version.version
            ));
            return;
        }

        if version.genesis_hash != self.chain.genesis_hash() {
            self.channel.close(&format!(
                "different genesis block ({})",
                version.genesis_hash
            ));
            return;
        }

        if let Some(expected) = self.channel.peer_address() {
            if expected != &version.peer_address {
                self.channel.close("unexpected peerAddress in version message");
                return;
            }
        }

        let mut peer_address = version.peer_address;
        if peer_address.net_address.is_none() {
            peer_address.net_address = self
                .addresses
                .get(&peer_address)
                .and_then(|stored| stored.net_address);
        }

        // The peer knows its own address
        self.known_addresses
            .insert(peer_address.clone(), Instant::now());
        self.channel.set_peer_address(peer_address.clone());

        self.peer = Some(Peer::new(
            self.channel.clone(),
            peer_address,
            version.version,
            version.start_height,
            version.total_work,
        ));
        self.version_received = true;

        if self.version_sent {
            self.finish_handshake();
        }
    }

    fn finish_handshake(&mut self) {
        let Some(peer) = self.peer.clone() else {
            return;
        };
        self.state = AgentState::Established;

        let timer = AgentTimer::Connectivity;
        self.timers.set_interval(
            timer.key(),
            self.config.connectivity_check_interval,
            timer,
        );
        let timer = AgentTimer::AnnounceAddress;
        self.timers
            .set_interval(timer.key(), self.config.announce_addr_interval, timer);

        self.emit(NetworkEvent::Handshake { peer });

        self.channel.send(Message::GetAddr {
            protocol_mask: self.config.protocol_mask,
            service_mask: self.config.service_mask,
        });
    }

    // =========================================================================
    // Messages
    // =========================================================================

    fn handle_message(&mut self, msg: Message) {
        if self.channel.is_closed() {
            return;
        }

        if !self.version_received {
            match msg {
                Message::Version(version) => self.on_version(version),
                other => {
                    log::warn!(
                        "Discarding {} message from {} before handshake",
                        other.type_name(),
                        self.channel
                    );
                    self.discarded += 1;
                }
            }
            return;
        }

        match msg {
            Message::Version(version) => self.on_version(version),
            Message::Addr(addresses) => self.on_addr(addresses),
            Message::GetAddr {
                protocol_mask,
                service_mask,
            } => self.on_get_addr(protocol_mask, service_mask),
            Message::Ping(nonce) => {
                self.channel.send(Message::Pong(nonce));
            }
            Message::Pong(nonce) => {
                self.timers
                    .clear_timeout(&AgentTimer::PingTimeout(nonce).key());
            }
            Message::Signal(msg) => self.emit(NetworkEvent::Signal {
                channel: self.channel.clone(),
                msg,
            }),
        }
    }

    fn on_addr(&mut self, addresses: Vec<PeerAddress>) {
        if addresses.len() > self.config.max_addr_per_message {
            let reason = "addr message too large";
            self.emit(NetworkEvent::Ban {
                channel: self.channel.clone(),
                reason: reason.to_string(),
            });
            self.channel.close(reason);
            return;
        }

        let now = Instant::now();
        for address in &addresses {
            self.known_addresses.insert(address.clone(), now);
        }

        self.emit(NetworkEvent::Addresses {
            channel: self.channel.clone(),
            addresses,
        });
    }

    fn on_get_addr(&mut self, protocol_mask: ProtocolMask, service_mask: ServiceFlags) {
        let now = Instant::now();
        let addresses: Vec<PeerAddress> = self
            .addresses
            .query(protocol_mask, service_mask)
            .into_iter()
            .filter(|address| self.can_relay(address, now))
            .take(self.config.max_addr_per_message)
            .collect();

        for address in &addresses {
            self.known_addresses.insert(address.clone(), now);
        }
        self.channel.send(Message::Addr(addresses));
    }

    // =========================================================================
    // Relay and liveness
    // =========================================================================

    fn on_command(&mut self, command: AgentCommand) {
        match command {
            AgentCommand::RelayAddresses(addresses) => self.relay_addresses(addresses),
        }
    }

    fn relay_addresses(&mut self, addresses: Vec<PeerAddress>) {
        if self.state != AgentState::Established {
            return;
        }

        let now = Instant::now();
        let addresses: Vec<PeerAddress> = addresses
            .into_iter()
            .filter(|address| self.can_relay(address, now))
            .collect();
        if addresses.is_empty() {
            return;
        }

        for address in &addresses {
            self.known_addresses.insert(address.clone(), now);
        }
        self.channel.send(Message::Addr(addresses));
    }

    fn can_relay(&self, address: &PeerAddress, now: Instant) -> bool {
        let forwardable = match address.protocol() {
            Protocol::Direct => true,
            Protocol::Relayed => address.distance < self.config.max_relay_distance,
            Protocol::Unreachable => false,
        };

        forwardable
            && address != &self.config.peer_address
            && self
                .known_addresses
                .get(address)
                .map_or(true, |seen| now.duration_since(*seen) >= self.config.relay_throttle)
    }

    fn announce_address(&mut self) {
        let mut own = self.config.peer_address.clone();
        own.timestamp = chrono::Utc::now().timestamp_millis();
        self.channel.send(Message::Addr(vec![own]));
    }

    fn check_connectivity(&mut self) {
        let nonce: u32 = rand::random();
        if !self.channel.send(Message::Ping(nonce)) {
            self.channel.close("sending ping message failed");
            return;
        }
        let timer = AgentTimer::PingTimeout(nonce);
        self.timers
            .set_timeout(timer.key(), self.config.ping_timeout, timer);
    }

    fn on_timer(&mut self, timer: AgentTimer) {
        let key = timer.key();
        match timer {
            AgentTimer::VersionRetry => {
                if self.timers.take_fired(&key) {
                    self.handshake();
                }
            }
            AgentTimer::VersionTimeout => {
                if self.timers.take_fired(&key) {
                    self.channel.close("version timeout");
                }
            }
            AgentTimer::PingTimeout(_) => {
                if self.timers.take_fired(&key) {
                    self.channel.close("ping timeout");
                }
            }
            AgentTimer::Connectivity => {
                if self.timers.is_set(&key) {
                    self.check_connectivity();
                }
            }
            AgentTimer::AnnounceAddress => {
                if self.timers.is_set(&key) {
                    self.announce_address();
                }
            }
        }
    }

    fn close(&mut self, closed_by_remote: bool) {
        if self.state == AgentState::Closed {
            return;
        }
        self.state = AgentState::Closed;
        self.timers.clear_all();

        if closed_by_remote {
            self.channel.close("closed by remote");
        }
        if self.discarded > 0 {
            log::debug!(
                "Agent for {} discarded {} out-of-order messages",
                self.channel,
                self.discarded
            );
        }

        self.emit(NetworkEvent::Close {
            channel: self.channel.clone(),
            closed_by_remote,
        });
    }

    fn emit(&self, event: NetworkEvent) {
        let _ = self.events.send(event);
    }
}
