//! Transport connectors
//!
//! A connector opens outbound connections for one transport kind and reports
//! the outcome asynchronously through a [`ConnectionSink`]. Listeners use the
//! same sink to hand accepted connections to the peer manager.

use crate::network::channel::{Connection, PeerChannel};
use crate::network::message::{PeerAddress, SignalMessage};
use crate::network::peer::NetworkEvent;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Opens connections of one transport kind.
pub trait Connector: Send + Sync {
    /// Start connecting to `address`. Relayed transports negotiate through
    /// `signal_channel`. Returns false if the attempt could not be started.
    fn connect(
        &self,
        address: &PeerAddress,
        signal_channel: Option<&PeerChannel>,
        sink: &ConnectionSink,
    ) -> bool;

    /// Whether `msg` belongs to a negotiation this connector started
    fn is_valid_signal(&self, _msg: &SignalMessage) -> bool {
        false
    }

    /// Signal addressed to us, arriving on `channel`
    fn on_signal(&self, _channel: &PeerChannel, _msg: SignalMessage) {}
}

/// Where connectors and listeners deliver their results
#[derive(Clone)]
pub struct ConnectionSink {
    tx: mpsc::UnboundedSender<NetworkEvent>,
}

impl ConnectionSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<NetworkEvent>) -> Self {
        Self { tx }
    }

    /// A connection is up, in either direction
    pub fn connection(&self, connection: Connection) {
        if let Err(e) = self.tx.send(NetworkEvent::Connection(connection)) {
            if let NetworkEvent::Connection(conn) = e.0 {
                conn.close("peer manager stopped");
            }
        }
    }

    /// An outbound attempt to `address` failed
    pub fn error(&self, address: PeerAddress, reason: impl Into<String>) {
        let _ = self.tx.send(NetworkEvent::ConnectError {
            address,
            reason: reason.into(),
        });
    }

    pub(crate) fn send(&self, event: NetworkEvent) {
        let _ = self.tx.send(event);
    }
}

/// Connectors available to the peer manager, one per dialable transport
#[derive(Clone, Default)]
pub struct Connectors {
    pub direct: Option<Arc<dyn Connector>>,
    pub relayed: Option<Arc<dyn Connector>>,
}

impl Connectors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_direct(mut self, connector: Arc<dyn Connector>) -> Self {
        self.direct = Some(connector);
        self
    }

    pub fn with_relayed(mut self, connector: Arc<dyn Connector>) -> Self {
        self.relayed = Some(connector);
        self
    }
}
