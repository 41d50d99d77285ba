//! Connection state management.

use std::io::{self, Read, Write};

use bytes::BytesMut;
use mio::Token;
use mio::net::TcpStream;

use palisade_types::NodeId;
use palisade_wire::{Frame, Message, WireError};

/// Initial capacity for per-connection buffers.
const BUFFER_SIZE: usize = 8 * 1024;

/// State of one TCP connection.
pub struct Connection {
    /// Token this connection is registered under (kept for debugging).
    #[allow(dead_code)]
    pub token: Token,
    /// TCP stream.
    pub stream: TcpStream,
    /// Read buffer; frames are extracted from its front.
    pub read_buf: BytesMut,
    /// Write buffer; flushed opportunistically and on writable events.
    pub write_buf: BytesMut,
    /// The peer's node id, known after its IntroMessage (inbound) or from
    /// the address book (outbound).
    pub peer: Option<NodeId>,
}

impl Connection {
    pub fn new(token: Token, stream: TcpStream, peer: Option<NodeId>) -> Self {
        Self {
            token,
            stream,
            read_buf: BytesMut::with_capacity(BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(BUFFER_SIZE),
            peer,
        }
    }

    /// Reads until the socket would block.
    ///
    /// Returns `false` once the peer has closed the connection.
    pub fn read(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes buffered data until drained or the socket would block.
    ///
    /// Returns `true` once the buffer is empty. A not-yet-established
    /// outbound connection reports `NotConnected`; the data stays queued
    /// for the writable event that signals connection completion.
    pub fn write(&mut self) -> io::Result<bool> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    ));
                }
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                }
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::NotConnected =>
                {
                    return Ok(false);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Queues one message for sending.
    pub fn queue(&mut self, message: &Message) {
        let frame = Frame::new(message.to_json().into());
        frame.encode(&mut self.write_buf);
    }

    /// Attempts to decode one message from the read buffer.
    pub fn try_decode(&mut self) -> Result<Option<Message>, WireError> {
        match Frame::decode(&mut self.read_buf)? {
            Some(frame) => Ok(Some(Message::from_json(frame.payload())?)),
            None => Ok(None),
        }
    }
}
