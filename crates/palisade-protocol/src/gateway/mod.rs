//! Gateway-side dispatch and transaction registry.
//!
//! The gateway bridges user requests to the replica quorum. Routing:
//!
//! | Incoming | Key | Action |
//! |---|---|---|
//! | EnrollRequest | `(username, ts, Enroll)` | create; duplicates absorbed |
//! | LoginRequest | `(username, ts, Login)` | create; duplicates absorbed |
//! | PutComplete | `(put.key, ts, Enroll)` | dispatch to the open enroll |
//! | GetResponse | `(get.key, ts, Login)` | dispatch to the open login |
//!
//! A replica response without an open transaction is a protocol violation
//! and is dropped with a log line. Terminal transactions linger for
//! [`TRANSACTION_TTL`] so duplicate responses and replayed requests stay
//! idempotent, then the sweep evicts them.

mod enroll;
mod login;

pub use enroll::EnrollMachine;
pub use login::LoginMachine;

use std::collections::HashMap;
use std::time::Instant;

use palisade_types::{TransactionKey, TxKind};
use palisade_wire::Message;

use crate::TRANSACTION_TTL;
use crate::context::GatewayContext;
use crate::output::Output;

/// A gateway-side transaction.
pub enum GatewayMachine {
    Enroll(EnrollMachine),
    Login(LoginMachine),
}

impl GatewayMachine {
    fn is_terminal(&self) -> bool {
        match self {
            GatewayMachine::Enroll(m) => m.is_terminal(),
            GatewayMachine::Login(m) => m.is_terminal(),
        }
    }
}

struct Entry {
    machine: GatewayMachine,
    terminal_since: Option<Instant>,
}

/// The gateway: capability bundle plus the per-transaction registry.
pub struct Gateway {
    ctx: GatewayContext,
    machines: HashMap<TransactionKey, Entry>,
}

impl Gateway {
    pub fn new(ctx: GatewayContext) -> Self {
        Self {
            ctx,
            machines: HashMap::new(),
        }
    }

    /// Number of resident transactions (terminal included until swept).
    pub fn transaction_count(&self) -> usize {
        self.machines.len()
    }

    /// The session key negotiated by a completed login, if any.
    ///
    /// The core drops the key with the transaction (session management
    /// after key agreement is out of scope); embedders and tests read it
    /// here before the sweep.
    pub fn session_key(&self, key: &TransactionKey) -> Option<[u8; 32]> {
        match self.machines.get(key) {
            Some(Entry {
                machine: GatewayMachine::Login(m),
                ..
            }) => m.session_key(),
            _ => None,
        }
    }

    /// Handles one incoming message, returning the messages to flush.
    pub fn handle(&mut self, message: &Message, now: Instant) -> Output {
        if !message.verify(&self.ctx.signatures) {
            tracing::warn!(
                gateway = %self.ctx.id,
                msg = message.name(),
                "dropping message with invalid signature"
            );
            return Output::empty();
        }

        match message {
            Message::EnrollRequest(req) => {
                let key =
                    TransactionKey::new(req.username.clone(), req.timestamp, TxKind::Enroll);
                if self.machines.contains_key(&key) {
                    tracing::debug!(gateway = %self.ctx.id, %key, "duplicate EnrollRequest absorbed");
                    return Output::empty();
                }
                let (machine, output) = EnrollMachine::start(req.clone(), &self.ctx);
                self.machines.insert(
                    key,
                    Entry {
                        machine: GatewayMachine::Enroll(machine),
                        terminal_since: None,
                    },
                );
                output
            }
            Message::LoginRequest(req) => {
                let key = TransactionKey::new(req.username.clone(), req.timestamp, TxKind::Login);
                if self.machines.contains_key(&key) {
                    tracing::debug!(gateway = %self.ctx.id, %key, "duplicate LoginRequest absorbed");
                    return Output::empty();
                }
                let (machine, output) = LoginMachine::start(req.clone(), &self.ctx);
                self.machines.insert(
                    key,
                    Entry {
                        machine: GatewayMachine::Login(machine),
                        terminal_since: None,
                    },
                );
                output
            }
            Message::PutComplete(m) => {
                let key = TransactionKey::new(
                    m.put_msg.key.clone(),
                    m.put_msg.timestamp,
                    TxKind::Enroll,
                );
                self.dispatch(&key, now, |machine, ctx| match machine {
                    GatewayMachine::Enroll(sm) => sm.on_put_complete(m, ctx),
                    GatewayMachine::Login(_) => unreachable!("Enroll keys map to enroll machines"),
                })
            }
            Message::GetResponse(m) => {
                let key =
                    TransactionKey::new(m.get_msg.key.clone(), m.get_msg.timestamp, TxKind::Login);
                self.dispatch(&key, now, |machine, ctx| match machine {
                    GatewayMachine::Login(sm) => sm.on_get_response(m, ctx),
                    GatewayMachine::Enroll(_) => unreachable!("Login keys map to login machines"),
                })
            }
            other => {
                tracing::warn!(
                    gateway = %self.ctx.id,
                    msg = other.name(),
                    "unexpected message kind for the gateway"
                );
                Output::empty()
            }
        }
    }

    /// Evicts transactions that have been terminal for [`TRANSACTION_TTL`].
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.machines.len();
        self.machines.retain(|_, entry| match entry.terminal_since {
            Some(at) => now.saturating_duration_since(at) < TRANSACTION_TTL,
            None => true,
        });
        let evicted = before - self.machines.len();
        if evicted > 0 {
            tracing::debug!(gateway = %self.ctx.id, evicted, "swept terminal transactions");
        }
        evicted
    }

    /// Routes a replica response to its open transaction.
    ///
    /// Unlike the replica side there is no create-if-absent: a response the
    /// gateway never asked for is a protocol violation.
    fn dispatch(
        &mut self,
        key: &TransactionKey,
        now: Instant,
        drive: impl FnOnce(&mut GatewayMachine, &GatewayContext) -> Output,
    ) -> Output {
        let Some(entry) = self.machines.get_mut(key) else {
            tracing::warn!(
                gateway = %self.ctx.id,
                %key,
                "replica response without an open transaction; dropping"
            );
            return Output::empty();
        };
        let output = drive(&mut entry.machine, &self.ctx);
        if entry.terminal_since.is_none() && entry.machine.is_terminal() {
            entry.terminal_since = Some(now);
        }
        output
    }
}
