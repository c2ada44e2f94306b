//! Connections and peer channels
//!
//! A [`Connection`] is what a transport hands to the peer manager: a
//! [`PeerChannel`] for sending plus the receiver of inbound messages. The
//! transport keeps the matching [`TransportEnd`] and pumps bytes between the
//! socket and those queues.

use crate::network::address::NetAddress;
use crate::network::message::{Message, PeerAddress, Protocol};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Messages buffered per direction before sends start failing
pub const CHANNEL_CAPACITY: usize = 256;

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// Cumulative traffic of one connection
#[derive(Debug, Default)]
pub struct TrafficCounters {
    sent: AtomicU64,
    received: AtomicU64,
}

impl TrafficCounters {
    pub fn record_sent(&self, bytes: u64) {
        self.sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: u64) {
        self.received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Peer channel
// =============================================================================

struct ChannelInner {
    id: ConnectionId,
    direction: Direction,
    protocol: Protocol,
    net_address: Option<NetAddress>,
    /// Dialed address, or the one announced in the peer's version
    peer_address: OnceLock<PeerAddress>,
    tx: mpsc::Sender<Message>,
    counters: Arc<TrafficCounters>,
    closed: CancellationToken,
    close_reason: OnceLock<String>,
}

/// Cloneable handle for sending to a connected peer
#[derive(Clone)]
pub struct PeerChannel {
    inner: Arc<ChannelInner>,
}

impl PeerChannel {
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn is_outbound(&self) -> bool {
        self.inner.direction == Direction::Outbound
    }

    pub fn protocol(&self) -> Protocol {
        self.inner.protocol
    }

    /// Address of the remote end as seen by the transport
    pub fn net_address(&self) -> Option<&NetAddress> {
        self.inner.net_address.as_ref()
    }

    /// Address of the remote node, once known
    pub fn peer_address(&self) -> Option<&PeerAddress> {
        self.inner.peer_address.get()
    }

    /// Record the peer's address. Returns false if one was already known.
    pub(crate) fn set_peer_address(&self, address: PeerAddress) -> bool {
        self.inner.peer_address.set(address).is_ok()
    }

    /// Queue a message; false if the channel is closed or its buffer is full
    pub fn send(&self, msg: Message) -> bool {
        if self.is_closed() {
            return false;
        }
        self.inner.tx.try_send(msg).is_ok()
    }

    /// Close the connection. The first reason given sticks.
    pub fn close(&self, reason: &str) {
        if self.inner.close_reason.set(reason.to_string()).is_ok() {
            log::debug!("Closing connection #{}: {}", self.inner.id, reason);
        }
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the channel has been closed
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.inner.close_reason.get().map(String::as_str)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.inner.counters.bytes_sent()
    }

    pub fn bytes_received(&self) -> u64 {
        self.inner.counters.bytes_received()
    }
}

impl fmt::Debug for PeerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerChannel")
            .field("id", &self.inner.id)
            .field("direction", &self.inner.direction)
            .field("protocol", &self.inner.protocol)
            .field("net_address", &self.inner.net_address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl fmt::Display for PeerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.inner.peer_address.get(), &self.inner.net_address) {
            (Some(addr), _) => write!(f, "#{} {}", self.inner.id, addr),
            (None, Some(net)) => write!(f, "#{} {}", self.inner.id, net),
            (None, None) => write!(f, "#{} <pending>", self.inner.id),
        }
    }
}

// =============================================================================
// Connection
// =============================================================================

/// A live transport session handed over to the peer manager
pub struct Connection {
    pub channel: PeerChannel,
    pub inbound: mpsc::Receiver<Message>,
}

/// The transport's side of a [`Connection`]
pub struct TransportEnd {
    /// Messages the local node wants sent
    pub outbound: mpsc::Receiver<Message>,
    /// Where decoded remote messages are delivered
    pub inbound: mpsc::Sender<Message>,
    pub counters: Arc<TrafficCounters>,
    /// Cancelled when the local side closes the channel
    pub closed: CancellationToken,
}

impl Connection {
    /// Create a connection and the transport end that feeds it.
    pub fn new(
        direction: Direction,
        protocol: Protocol,
        net_address: Option<NetAddress>,
        peer_address: Option<PeerAddress>,
    ) -> (Connection, TransportEnd) {
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let counters = Arc::new(TrafficCounters::default());
        let closed = CancellationToken::new();
        let known_address = OnceLock::new();
        if let Some(address) = peer_address {
            let _ = known_address.set(address);
        }

        let channel = PeerChannel {
            inner: Arc::new(ChannelInner {
                id: next_connection_id(),
                direction,
                protocol,
                net_address,
                peer_address: known_address,
                tx: out_tx,
                counters: counters.clone(),
                closed: closed.clone(),
                close_reason: OnceLock::new(),
            }),
        };

        let connection = Connection {
            channel,
            inbound: in_rx,
        };
        let end = TransportEnd {
            outbound: out_rx,
            inbound: in_tx,
            counters,
            closed,
        };
        (connection, end)
    }

    /// Close before any agent took ownership
    pub fn close(&self, reason: &str) {
        self.channel.close(reason);
    }

    /// Two in-process connections wired to each other.
    ///
    /// Returns `(dialer, listener)`. The dialer side knows `target` as its
    /// peer address and sees the listener at `target_net`; the listener sees
    /// the dialer at `dialer_net`. Must be called inside a tokio runtime.
    pub fn memory_pair(
        protocol: Protocol,
        target: Option<PeerAddress>,
        dialer_net: Option<NetAddress>,
        target_net: Option<NetAddress>,
    ) -> (Connection, Connection) {
        let (dialer, dialer_end) = Connection::new(Direction::Outbound, protocol, target_net, target);
        let (listener, listener_end) =
            Connection::new(Direction::Inbound, protocol, dialer_net, None);

        let TransportEnd {
            outbound: dialer_out,
            inbound: dialer_in,
            counters: dialer_counters,
            closed: dialer_closed,
        } = dialer_end;
        let TransportEnd {
            outbound: listener_out,
            inbound: listener_in,
            counters: listener_counters,
            closed: listener_closed,
        } = listener_end;

        spawn_memory_pump(
            dialer_out,
            listener_in,
            dialer_counters.clone(),
            listener_counters.clone(),
            dialer_closed.clone(),
            listener_closed.clone(),
        );
        spawn_memory_pump(
            listener_out,
            dialer_in,
            listener_counters,
            dialer_counters,
            listener_closed,
            dialer_closed,
        );

        (dialer, listener)
    }
}

/// Moves messages from one side's outbound queue to the other's inbound
/// queue until either side closes. Dropping `to` signals the remote close.
fn spawn_memory_pump(
    mut from: mpsc::Receiver<Message>,
    to: mpsc::Sender<Message>,
    sender: Arc<TrafficCounters>,
    receiver: Arc<TrafficCounters>,
    local_closed: CancellationToken,
    remote_closed: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = local_closed.cancelled() => break,
                _ = remote_closed.cancelled() => break,
                msg = from.recv() => {
                    let Some(msg) = msg else { break };
                    let size = msg.wire_size();
                    sender.record_sent(size);
                    receiver.record_received(size);
                    if to.send(msg).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}
