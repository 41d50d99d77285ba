//! The user client.
//!
//! Users sit outside the quorum core: a blocking request/response client
//! suffices. The client connects to the gateway, introduces itself, and
//! runs enroll or login. For login it performs the SPAKE2+ client role and
//! refuses the session unless the gateway's key confirmation verifies —
//! which it cannot if either side holds the wrong password.

use std::fmt;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use bytes::BytesMut;

use palisade_crypto::pake::ClientLogin;
use palisade_types::{NodeId, Timestamp, Username};
use palisade_wire::{
    EnrollRequest, EnrollResponse, Frame, IntroMessage, LoginRequest, Message,
};

use crate::NodeError;

/// A negotiated login session.
pub struct LoginSession {
    pub username: Username,
    session_key: [u8; 32],
}

impl LoginSession {
    pub fn session_key(&self) -> &[u8; 32] {
        &self.session_key
    }
}

impl fmt::Debug for LoginSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginSession")
            .field("username", &self.username)
            .field("session_key", &"<redacted>")
            .finish()
    }
}

/// Blocking client for the gateway.
pub struct UserClient {
    id: NodeId,
    stream: TcpStream,
    read_buf: BytesMut,
}

impl UserClient {
    /// Connects to the gateway and introduces this user.
    ///
    /// `timeout` bounds the connect and every subsequent wait for a
    /// response.
    pub fn connect(id: NodeId, gateway: SocketAddr, timeout: Duration) -> Result<Self, NodeError> {
        let stream = TcpStream::connect_timeout(&gateway, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;

        let mut client = Self {
            id,
            stream,
            read_buf: BytesMut::with_capacity(4096),
        };
        client.send(&Message::Intro(IntroMessage { id }))?;
        Ok(client)
    }

    /// Registers a username/password pair.
    pub fn enroll(
        &mut self,
        username: &Username,
        password: &str,
        timestamp: Timestamp,
    ) -> Result<EnrollResponse, NodeError> {
        self.send(&Message::EnrollRequest(EnrollRequest {
            username: username.clone(),
            password: password.to_string(),
            user_id: self.id,
            timestamp,
        }))?;

        loop {
            match self.recv()? {
                Message::EnrollResponse(resp)
                    if resp.username == *username && resp.timestamp == timestamp =>
                {
                    return Ok(resp);
                }
                other => {
                    tracing::debug!(msg = other.name(), "ignoring unrelated message");
                }
            }
        }
    }

    /// Proves knowledge of the password and negotiates a session key.
    ///
    /// Fails with [`NodeError::ConfirmationFailed`] when the gateway's key
    /// confirmation does not verify under the derived key — the observable
    /// outcome of a wrong password on either side.
    pub fn login(
        &mut self,
        username: &Username,
        password: &str,
        timestamp: Timestamp,
    ) -> Result<LoginSession, NodeError> {
        let (exchange, u) = ClientLogin::start(username.as_bytes(), password.as_bytes());
        self.send(&Message::LoginRequest(LoginRequest {
            username: username.clone(),
            u: u.to_vec(),
            user_id: self.id,
            timestamp,
        }))?;

        let response = loop {
            match self.recv()? {
                Message::LoginResponse(resp)
                    if resp.username == *username && resp.timestamp == timestamp =>
                {
                    break resp;
                }
                other => {
                    tracing::debug!(msg = other.name(), "ignoring unrelated message");
                }
            }
        };

        let keys = exchange.finish(&response.v)?;
        if !keys.verify_confirmation(&response.confirmation) {
            return Err(NodeError::ConfirmationFailed);
        }
        Ok(LoginSession {
            username: username.clone(),
            session_key: *keys.session_key(),
        })
    }

    fn send(&mut self, message: &Message) -> Result<(), NodeError> {
        let mut buf = BytesMut::new();
        Frame::new(message.to_json().into()).encode(&mut buf);
        self.stream.write_all(&buf)?;
        Ok(())
    }

    fn recv(&mut self) -> Result<Message, NodeError> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.read_buf)? {
                return Ok(Message::from_json(frame.payload())?);
            }
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(NodeError::Protocol(
                        "gateway closed the connection".to_string(),
                    ));
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Err(NodeError::Timeout("gateway response"));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
