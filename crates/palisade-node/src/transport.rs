//! The messaging service.
//!
//! One `mio` reactor per node owns the listening socket and every
//! connection. Peers are addressed by node id:
//!
//! - **Outbound**: `send` looks the peer up in the connection map and
//!   falls back to the address book, connecting lazily. The first queued
//!   message on every outbound connection is this node's IntroMessage.
//! - **Inbound**: an accepted connection is anonymous until its
//!   IntroMessage arrives, which installs the peer-id mapping.
//! - **Mesh**: each replica proactively connects to every replica with a
//!   lower port; the higher-port side accepts. The port ordering keeps the
//!   mesh free of symmetric duplicate connections.
//!
//! Protocol violations (malformed JSON, unknown tags, oversized frames)
//! close the offending connection without touching protocol state.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use palisade_types::NodeId;
use palisade_wire::{IntroMessage, Message};

use crate::NodeError;
use crate::connection::Connection;

const LISTENER: Token = Token(0);

/// The node-id-addressed framed transport.
pub struct Transport {
    id: NodeId,
    poll: Poll,
    events: Events,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: HashMap<Token, Connection>,
    peers: HashMap<NodeId, Token>,
    address_book: HashMap<NodeId, SocketAddr>,
    next_token: usize,
}

impl Transport {
    /// Binds the listener and sets up the reactor.
    pub fn bind(
        id: NodeId,
        addr: SocketAddr,
        address_book: HashMap<NodeId, SocketAddr>,
    ) -> Result<Self, NodeError> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        tracing::info!(node = %id, %local_addr, "transport bound");
        Ok(Self {
            id,
            poll,
            events: Events::with_capacity(256),
            listener,
            local_addr,
            connections: HashMap::new(),
            peers: HashMap::new(),
            address_book,
            next_token: 1,
        })
    }

    /// The bound listen address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Proactively connects to every peer in `peers` whose configured port
    /// is lower than this node's; the higher-port side accepts.
    pub fn connect_mesh(&mut self, peers: impl Iterator<Item = NodeId>) -> Result<(), NodeError> {
        let own_port = self.local_addr.port();
        for peer in peers {
            if peer == self.id {
                continue;
            }
            let Some(addr) = self.address_book.get(&peer).copied() else {
                continue;
            };
            if addr.port() < own_port {
                self.connect(peer, addr)?;
            }
        }
        Ok(())
    }

    /// Queues a message to a peer, connecting lazily if needed.
    ///
    /// An unknown peer (no open connection, no address book entry) drops
    /// the message with a log line; the quorum protocol absorbs the loss.
    pub fn send(&mut self, to: NodeId, message: &Message) {
        let token = match self.peers.get(&to) {
            Some(token) => *token,
            None => match self.address_book.get(&to).copied() {
                Some(addr) => match self.connect(to, addr) {
                    Ok(token) => token,
                    Err(e) => {
                        tracing::warn!(node = %self.id, peer = %to, error = %e, "connect failed; dropping message");
                        return;
                    }
                },
                None => {
                    tracing::warn!(node = %self.id, peer = %to, msg = message.name(), "no route to peer; dropping message");
                    return;
                }
            },
        };

        if let Some(conn) = self.connections.get_mut(&token) {
            conn.queue(message);
            // Edge-triggered registration: flush now, the writable event
            // only covers what the socket cannot take yet.
            if let Err(e) = conn.write() {
                tracing::warn!(node = %self.id, peer = %to, error = %e, "write failed");
                self.close(token);
            }
        }
    }

    /// Polls for events and returns the decoded inbound messages.
    ///
    /// IntroMessages are consumed here: they identify the connection and
    /// never reach the caller.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<Message>, NodeError> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        let mut inbound = Vec::new();
        let mut closing = Vec::new();

        // Collect per-event work first; the events buffer borrows `self`.
        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.is_readable(), event.is_writable()))
            .collect();

        for (token, readable, writable) in ready {
            if token == LISTENER {
                self.accept_pending();
                continue;
            }

            let Some(conn) = self.connections.get_mut(&token) else {
                continue;
            };

            if writable {
                if let Err(e) = conn.write() {
                    tracing::debug!(node = %self.id, error = %e, "write error; closing connection");
                    closing.push(token);
                    continue;
                }
            }

            if readable {
                match conn.read() {
                    Ok(true) => {}
                    Ok(false) => {
                        closing.push(token);
                        // Drain whatever arrived before the close below.
                    }
                    Err(e) => {
                        tracing::debug!(node = %self.id, error = %e, "read error; closing connection");
                        closing.push(token);
                        continue;
                    }
                }
                if let Err(violation) = self.drain_frames(token, &mut inbound) {
                    tracing::warn!(node = %self.id, error = %violation, "protocol violation; closing connection");
                    closing.push(token);
                }
            }
        }

        for token in closing {
            self.close(token);
        }
        Ok(inbound)
    }

    /// Accepts all pending connections; peers stay anonymous until their
    /// IntroMessage.
    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, remote)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        tracing::warn!(node = %self.id, error = %e, "failed to register accepted connection");
                        continue;
                    }
                    tracing::debug!(node = %self.id, %remote, "accepted connection");
                    self.connections
                        .insert(token, Connection::new(token, stream, None));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::warn!(node = %self.id, error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    /// Opens an outbound connection and queues the identity handshake.
    fn connect(&mut self, peer: NodeId, addr: SocketAddr) -> Result<Token, NodeError> {
        let mut stream = TcpStream::connect(addr)?;
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        let mut conn = Connection::new(token, stream, Some(peer));
        conn.queue(&Message::Intro(IntroMessage { id: self.id }));
        // The intro flushes on the connected-writable event if the socket
        // is not usable yet.
        let _ = conn.write();

        tracing::debug!(node = %self.id, %peer, %addr, "connecting");
        self.connections.insert(token, conn);
        self.peers.insert(peer, token);
        Ok(token)
    }

    /// Extracts every complete frame from a connection's read buffer.
    fn drain_frames(&mut self, token: Token, inbound: &mut Vec<Message>) -> Result<(), NodeError> {
        loop {
            let Some(conn) = self.connections.get_mut(&token) else {
                return Ok(());
            };
            match conn.try_decode()? {
                Some(Message::Intro(intro)) => {
                    conn.peer = Some(intro.id);
                    self.peers.insert(intro.id, token);
                    tracing::debug!(node = %self.id, peer = %intro.id, "peer identified");
                }
                Some(message) => inbound.push(message),
                None => return Ok(()),
            }
        }
    }

    /// Closes a connection and drops its peer mapping.
    fn close(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            if let Some(peer) = conn.peer {
                // Only clear the mapping if it still points at this
                // connection; the peer may have reconnected already.
                if self.peers.get(&peer) == Some(&token) {
                    self.peers.remove(&peer);
                }
            }
            tracing::debug!(node = %self.id, peer = ?conn.peer, "connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn bind_ephemeral(id: u8) -> Transport {
        Transport::bind(
            NodeId::new(id),
            "127.0.0.1:0".parse().unwrap(),
            HashMap::new(),
        )
        .unwrap()
    }

    /// Pumps both transports until `want` messages arrive at `b` or the
    /// deadline passes.
    fn pump(a: &mut Transport, b: &mut Transport, want: usize) -> Vec<Message> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut got = Vec::new();
        while got.len() < want && Instant::now() < deadline {
            let _ = a.poll(Some(Duration::from_millis(10))).unwrap();
            got.extend(b.poll(Some(Duration::from_millis(10))).unwrap());
        }
        got
    }

    #[test]
    fn lazy_connect_identifies_and_delivers() {
        let mut receiver = bind_ephemeral(0);
        let mut sender = Transport::bind(
            NodeId::new(1),
            "127.0.0.1:0".parse().unwrap(),
            HashMap::from([(NodeId::new(0), receiver.local_addr())]),
        )
        .unwrap();

        let message = Message::EnrollResponse(palisade_wire::EnrollResponse {
            username: "alice".into(),
            timestamp: palisade_types::Timestamp::new(1),
        });
        sender.send(NodeId::new(0), &message);

        let got = pump(&mut sender, &mut receiver, 1);
        assert_eq!(got, vec![message]);
        // The intro identified the sender on the receiving side.
        assert!(receiver.peers.contains_key(&NodeId::new(1)));
    }

    #[test]
    fn reply_over_the_inbound_connection() {
        let mut receiver = bind_ephemeral(0);
        let mut sender = Transport::bind(
            NodeId::new(1),
            "127.0.0.1:0".parse().unwrap(),
            HashMap::from([(NodeId::new(0), receiver.local_addr())]),
        )
        .unwrap();

        let ping = Message::EnrollResponse(palisade_wire::EnrollResponse {
            username: "ping".into(),
            timestamp: palisade_types::Timestamp::new(1),
        });
        sender.send(NodeId::new(0), &ping);
        assert_eq!(pump(&mut sender, &mut receiver, 1).len(), 1);

        // The receiver has no address book entry for the sender; the reply
        // must ride the identified inbound connection.
        let pong = Message::EnrollResponse(palisade_wire::EnrollResponse {
            username: "pong".into(),
            timestamp: palisade_types::Timestamp::new(2),
        });
        receiver.send(NodeId::new(1), &pong);
        let got = pump(&mut receiver, &mut sender, 1);
        assert_eq!(got, vec![pong]);
    }

    #[test]
    fn unroutable_peer_drops_without_error() {
        let mut transport = bind_ephemeral(0);
        let message = Message::EnrollResponse(palisade_wire::EnrollResponse {
            username: "alice".into(),
            timestamp: palisade_types::Timestamp::new(1),
        });
        // No panic, no error; the message is dropped with a log line.
        transport.send(NodeId::new(9), &message);
        assert!(transport.poll(Some(Duration::from_millis(10))).unwrap().is_empty());
    }

    #[test]
    fn garbage_frames_close_the_connection() {
        let mut receiver = bind_ephemeral(0);
        let addr = receiver.local_addr();

        let mut raw = std::net::TcpStream::connect(addr).unwrap();
        use std::io::Write as _;
        // A frame announcing 5 bytes of invalid JSON.
        raw.write_all(&[0, 0, 0, 5]).unwrap();
        raw.write_all(b"not-j").unwrap();
        raw.flush().unwrap();

        // The connection is accepted, the bad frame read, and the
        // connection closed on the violation; no message ever surfaces.
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            assert!(receiver.poll(Some(Duration::from_millis(10))).unwrap().is_empty());
        }
        assert!(receiver.connections.is_empty());
    }
}
