//! # palisade-protocol: Quorum state machines
//!
//! The core of Palisade: two pairs of coordinated state machines that drive
//! the protocol across three asynchronous role groups (user, gateway,
//! replicas).
//!
//! ## Replicated write (enroll)
//!
//! ```text
//! User ──EnrollRequest──► Gateway
//!                           │
//!                           ├──Put──► every replica
//!                           │           │
//!                           │           ├──PutAccept──► every other replica
//!                           │           │   (2f+1 distinct accepts)
//!                           │           ▼
//!                           │         encrypt + store
//!                           │◄──PutComplete── each replica
//!                           │   (f+1 distinct completes)
//! User ◄──EnrollResponse──┘
//! ```
//!
//! ## Threshold read (login)
//!
//! ```text
//! User ──LoginRequest(u)──► Gateway
//!                             │
//!                             ├──Get──► every replica
//!                             │           │
//!                             │           ├──DecryptionShare──► every other replica
//!                             │           │   (2f+1 distinct shares)
//!                             │           ▼
//!                             │         combine → verifier
//!                             │◄──GetResponse── each replica
//!                             │   (f+1 matching verifiers)
//!                             │   SPAKE2+ server finish
//! User ◄──LoginResponse(v)──┘
//! ```
//!
//! Every state machine is pure with respect to I/O: handling a message
//! returns an [`Output`](output::Output) of messages for the runtime to
//! flush. Storage and cryptography are reached through the narrow
//! capability bundles in [`context`] — never through a back-pointer to the
//! owning node.
//!
//! Messages enter through [`replica::Replica::handle`] and
//! [`gateway::Gateway::handle`], which verify signatures before anything
//! touches a state machine, create or look up the transaction for the
//! message's key, and route per kind. Each invocation runs to completion
//! before the next message is processed, so the quorum invariants need no
//! locking.

pub mod context;
pub mod gateway;
pub mod output;
pub mod params;
pub mod replica;


pub use context::{GatewayContext, ReplicaContext};
pub use gateway::Gateway;
pub use output::{Outbound, Output};
pub use params::ClusterParams;
pub use replica::Replica;

use std::time::Duration;

/// How long a terminal transaction stays resident before the sweep evicts
/// it. While resident it absorbs duplicate and replayed messages for its
/// key.
pub const TRANSACTION_TTL: Duration = Duration::from_secs(60);
