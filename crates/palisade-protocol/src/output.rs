//! State machine output.
//!
//! Handling a message never performs I/O; it returns an [`Output`] the
//! runtime flushes. Sends enqueue onto the node's outbound buffer, so a
//! state machine invocation always runs to completion first.

use palisade_types::NodeId;
use palisade_wire::Message;

/// One outgoing message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Deliver to every replica except the emitting node.
    Broadcast(Message),
    /// Deliver to one peer (a replica, the gateway, or a user).
    Send(NodeId, Message),
}

/// Messages produced by one `handle` invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Output {
    pub outbound: Vec<Outbound>,
}

impl Output {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty()
    }

    /// Queues a broadcast to all other replicas.
    pub fn broadcast(&mut self, message: Message) {
        self.outbound.push(Outbound::Broadcast(message));
    }

    /// Queues a targeted send.
    pub fn send(&mut self, to: NodeId, message: Message) {
        self.outbound.push(Outbound::Send(to, message));
    }
}
