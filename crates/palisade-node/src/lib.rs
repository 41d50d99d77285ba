//! # palisade-node: Node runtime
//!
//! The imperative shell around `palisade-protocol`:
//!
//! - [`connection`] — one TCP connection: non-blocking reads and writes
//!   against growable buffers, frame extraction.
//! - [`transport`] — the messaging service: a `mio` reactor owning the
//!   listener and every connection, a peer-id → connection map fed by the
//!   [`IntroMessage`](palisade_wire::IntroMessage) identity handshake, lazy
//!   outbound connects from the cluster address book, and the port-ordered
//!   proactive replica mesh.
//! - [`runtime`] — the per-node event loop: poll, decode, dispatch into the
//!   protocol registry, flush the resulting output, tick the transaction
//!   sweep.
//! - [`user`] — the blocking user client: enroll and the SPAKE2+ client
//!   side of login, with key confirmation checking.
//!
//! Everything here is single-threaded per node: one reactor dequeues
//! readable sockets and synchronously invokes dispatch, so the protocol
//! invariants hold without locking.

pub mod connection;
pub mod runtime;
pub mod transport;
pub mod user;

use thiserror::Error;

pub use runtime::NodeRuntime;
pub use transport::Transport;
pub use user::UserClient;

use palisade_types::NodeId;

/// Errors from the node runtime.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] palisade_wire::WireError),

    #[error(transparent)]
    Config(#[from] palisade_config::ConfigError),

    #[error(transparent)]
    Crypto(#[from] palisade_crypto::CryptoError),

    #[error("no address for peer {0} and no open connection")]
    UnknownPeer(NodeId),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("gateway key confirmation failed; passwords do not match")]
    ConfirmationFailed,

    #[error("protocol violation: {0}")]
    Protocol(String),
}
