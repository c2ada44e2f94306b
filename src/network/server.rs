//! TCP server and connection handling
//!
//! Accepts incoming peer connections, dials outbound ones and pumps framed
//! messages between sockets and [`Connection`]s.

use crate::network::address::NetAddress;
use crate::network::channel::{Connection, Direction, PeerChannel, TransportEnd};
use crate::network::connector::{ConnectionSink, Connector};
use crate::network::message::{
    Endpoint, Message, PeerAddress, Protocol, FRAME_HEADER_SIZE, MAGIC, MAX_MESSAGE_SIZE,
};
use crate::network::peer::PeerError;
use bytes::{Buf, BufMut, BytesMut};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;

/// Default time allowed for an outbound TCP connect
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Message codec for length-prefixed framing
pub struct MessageCodec;

fn invalid_frame(reason: &str) -> PeerError {
    PeerError::IoError(std::io::Error::new(std::io::ErrorKind::InvalidData, reason))
}

impl Encoder<Message> for MessageCodec {
    type Error = PeerError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = item.to_bytes()?;

        if data.len() > MAX_MESSAGE_SIZE {
            return Err(invalid_frame("Message too large"));
        }

        // Magic (4) + Length (4) + Data
        dst.reserve(FRAME_HEADER_SIZE + data.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least header
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Check magic
        if src[..4] != MAGIC {
            return Err(invalid_frame("Invalid magic bytes"));
        }

        // Get length
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(invalid_frame("Message too large"));
        }

        // Check if we have full message
        if src.len() < FRAME_HEADER_SIZE + len {
            src.reserve(FRAME_HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        // Skip header
        src.advance(FRAME_HEADER_SIZE);

        // Extract message data
        let data = src.split_to(len);

        // Deserialize
        Ok(Some(Message::from_bytes(&data)?))
    }
}

/// TCP server for accepting peer connections
pub struct Server {
    listener: TcpListener,
    port: u16,
}

impl Server {
    /// Bind to a port and create the server
    pub async fn bind(port: u16) -> Result<Self, std::io::Error> {
        let addr = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        log::info!("Server listening on 0.0.0.0:{}", port);

        Ok(Self { listener, port })
    }

    /// Get the listening port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept incoming connections
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), std::io::Error> {
        self.listener.accept().await
    }

    /// Hand every accepted socket to `sink` until `shutdown` fires.
    pub async fn serve(self, sink: ConnectionSink, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("Inbound connection from {}", addr);
                        match spawn_tcp_connection(stream, Direction::Inbound, None) {
                            Ok(connection) => sink.connection(connection),
                            Err(e) => log::warn!("Failed to set up connection from {}: {}", addr, e),
                        }
                    }
                    Err(e) => log::warn!("Failed to accept connection: {}", e),
                },
            }
        }
        log::info!("Server on port {} stopped", self.port);
    }
}

/// Wrap a connected socket into a [`Connection`] and start pumping frames.
pub fn spawn_tcp_connection(
    stream: TcpStream,
    direction: Direction,
    peer_address: Option<PeerAddress>,
) -> Result<Connection, PeerError> {
    let remote = stream.peer_addr()?;
    let net_address = NetAddress::from_ip(remote.ip()).ok();
    let (connection, end) = Connection::new(direction, Protocol::Direct, net_address, peer_address);

    let TransportEnd {
        mut outbound,
        inbound,
        counters,
        closed,
    } = end;
    let (mut writer, mut reader) = Framed::new(stream, MessageCodec).split();
    let id = connection.channel.id();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                msg = outbound.recv() => {
                    let Some(msg) = msg else { break };
                    let size = msg.wire_size();
                    if let Err(e) = writer.send(msg).await {
                        log::warn!("Error writing to #{} ({}): {}", id, remote, e);
                        break;
                    }
                    counters.record_sent(size);
                }
                frame = reader.next() => match frame {
                    Some(Ok(msg)) => {
                        counters.record_received(msg.wire_size());
                        if inbound.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        log::warn!("Error reading from #{} ({}): {}", id, remote, e);
                        break;
                    }
                    None => {
                        log::debug!("Peer {} closed connection #{}", remote, id);
                        break;
                    }
                },
            }
        }

        let _ = writer.close().await;
        // Dropping `inbound` tells the agent the remote end is gone
    });

    Ok(connection)
}

/// Outbound direct connections over TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(CONNECT_TIMEOUT)
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        address: &PeerAddress,
        _signal_channel: Option<&PeerChannel>,
        sink: &ConnectionSink,
    ) -> bool {
        let Endpoint::Direct { host, port } = &address.endpoint else {
            return false;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return false;
        };

        let target = format!("{}:{}", host, port);
        let timeout = self.connect_timeout;
        let address = address.clone();
        let sink = sink.clone();

        runtime.spawn(async move {
            let result = connect_to_peer(&target, timeout)
                .await
                .and_then(|stream| spawn_tcp_connection(stream, Direction::Outbound, Some(address.clone())));
            match result {
                Ok(connection) => sink.connection(connection),
                Err(e) => sink.error(address, e.to_string()),
            }
        });
        true
    }
}

/// Connect to a peer
pub async fn connect_to_peer(addr: &str, timeout: Duration) -> Result<TcpStream, PeerError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(PeerError::ConnectionFailed(e.to_string())),
        Err(_) => Err(PeerError::ConnectionFailed(format!("{}: connect timeout", addr))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::ServiceFlags;
    use crate::network::peer::NetworkEvent;
    use tokio::sync::mpsc;

    #[test]
    fn test_message_codec() {
        let mut codec = MessageCodec;
        let msg = Message::Ping(12345);

        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        if let Message::Ping(nonce) = decoded {
            assert_eq!(nonce, 12345);
        } else {
            panic!("Wrong message type");
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut codec = MessageCodec;
        let mut full = BytesMut::new();
        codec.encode(Message::Pong(7), &mut full).unwrap();

        let mut buf = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[full.len() - 1..]);
        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(Message::Pong(7))));
    }

    #[test]
    fn test_bad_frames_are_rejected() {
        let mut codec = MessageCodec;

        let mut buf = BytesMut::from(&b"XXXX\x00\x00\x00\x01{"[..]);
        assert!(codec.decode(&mut buf).is_err());

        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32(MAX_MESSAGE_SIZE as u32 + 1);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_garbage_body_is_serialization_error() {
        let mut codec = MessageCodec;
        let body = b"{\"Nope\":1}";

        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(PeerError::SerializationError(_))
        ));
    }

    #[tokio::test]
    async fn test_tcp_connection_roundtrip() {
        let server = Server::bind(0).await.unwrap();
        let port = server.port();
        let (tx, mut events) = mpsc::unbounded_channel();
        let sink = ConnectionSink::new(tx);
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(sink.clone(), shutdown.clone()));

        let target = PeerAddress::direct("127.0.0.1", port, ServiceFlags::FULL);
        assert!(TcpConnector::default().connect(&target, None, &sink));

        let mut inbound = None;
        let mut outbound = None;
        while inbound.is_none() || outbound.is_none() {
            match events.recv().await {
                Some(NetworkEvent::Connection(conn)) if conn.channel.is_outbound() => {
                    outbound = Some(conn)
                }
                Some(NetworkEvent::Connection(conn)) => inbound = Some(conn),
                _ => panic!("unexpected event"),
            }
        }
        let outbound = outbound.unwrap();
        let mut inbound = inbound.unwrap();

        assert_eq!(outbound.channel.peer_address(), Some(&target));
        // Loopback is blacklisted, so it never becomes a per-IP key
        assert!(NetAddress::parse("127.0.0.1").is_err());
        assert!(inbound.channel.net_address().is_none());
        assert!(outbound.channel.net_address().is_none());

        assert!(outbound.channel.send(Message::Ping(5)));
        assert!(matches!(inbound.inbound.recv().await, Some(Message::Ping(5))));

        outbound.channel.close("done");
        assert!(inbound.inbound.recv().await.is_none());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        // Grab a free port, then close it again
        let port = Server::bind(0).await.unwrap().port();

        let (tx, mut events) = mpsc::unbounded_channel();
        let sink = ConnectionSink::new(tx);
        let target = PeerAddress::direct("127.0.0.1", port, ServiceFlags::FULL);
        assert!(TcpConnector::default().connect(&target, None, &sink));

        match events.recv().await {
            Some(NetworkEvent::ConnectError { address, .. }) => assert_eq!(address, target),
            _ => panic!("expected connect error"),
        }
    }

    #[test]
    fn test_connector_rejects_other_transports() {
        let (tx, _events) = mpsc::unbounded_channel();
        let sink = ConnectionSink::new(tx);
        let relayed = PeerAddress::relayed("cafe", ServiceFlags::NANO, 1);
        assert!(!TcpConnector::default().connect(&relayed, None, &sink));
    }
}
