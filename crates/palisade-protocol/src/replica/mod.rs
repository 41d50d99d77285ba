//! Replica-side dispatch and transaction registry.
//!
//! A replica owns one state machine per transaction key. Incoming messages
//! are signature-checked, then routed by type and key:
//!
//! | Incoming | Key | Action |
//! |---|---|---|
//! | Put | `(key, ts, Put)` | create-if-absent, drive |
//! | PutAccept | `(put.key, ts, Put)` | create-if-absent from the embedded Put, drive |
//! | Get | `(key, ts, Get)` | create-if-absent, drive |
//! | DecryptionShare | `(get.key, ts, Get)` | create-if-absent from the embedded Get, drive |
//!
//! Creating from an embedded message is what makes out-of-order delivery
//! safe: a PutAccept that outruns its Put still bootstraps the transaction.
//!
//! Terminal transactions stay resident for [`TRANSACTION_TTL`], absorbing
//! duplicates and replayed `(username, timestamp)` pairs, then the sweep
//! evicts them.

mod get;
mod put;

pub use get::GetMachine;
pub use put::PutMachine;

use std::collections::HashMap;
use std::time::Instant;

use palisade_types::{TransactionKey, TxKind};
use palisade_wire::Message;

use crate::TRANSACTION_TTL;
use crate::context::ReplicaContext;
use crate::output::Output;

/// A replica-side transaction.
pub enum ReplicaMachine {
    Put(PutMachine),
    Get(GetMachine),
}

impl ReplicaMachine {
    fn is_terminal(&self) -> bool {
        match self {
            ReplicaMachine::Put(m) => m.is_terminal(),
            ReplicaMachine::Get(m) => m.is_terminal(),
        }
    }
}

struct Entry {
    machine: ReplicaMachine,
    terminal_since: Option<Instant>,
}

/// One replica: capability bundle plus the per-transaction registry.
pub struct Replica {
    ctx: ReplicaContext,
    machines: HashMap<TransactionKey, Entry>,
}

impl Replica {
    pub fn new(ctx: ReplicaContext) -> Self {
        Self {
            ctx,
            machines: HashMap::new(),
        }
    }

    /// Number of resident transactions (terminal included until swept).
    pub fn transaction_count(&self) -> usize {
        self.machines.len()
    }

    /// Handles one incoming message, returning the messages to flush.
    ///
    /// Signature verification gates everything: a message that does not
    /// verify (its own signature or an embedded one) is dropped before any
    /// state is touched.
    pub fn handle(&mut self, message: &Message, now: Instant) -> Output {
        if !message.verify(&self.ctx.signatures) {
            tracing::warn!(
                replica = %self.ctx.id,
                msg = message.name(),
                "dropping message with invalid signature"
            );
            return Output::empty();
        }

        match message {
            Message::Put(m) => {
                let key = TransactionKey::new(m.key.clone(), m.timestamp, TxKind::Put);
                self.drive(key, now, || ReplicaMachine::Put(PutMachine::new(m.clone())), |machine, ctx| {
                    match machine {
                        ReplicaMachine::Put(sm) => sm.on_put(ctx),
                        ReplicaMachine::Get(_) => unreachable!("Put keys map to put machines"),
                    }
                })
            }
            Message::PutAccept(m) => {
                let key =
                    TransactionKey::new(m.put_msg.key.clone(), m.put_msg.timestamp, TxKind::Put);
                self.drive(
                    key,
                    now,
                    || ReplicaMachine::Put(PutMachine::new(m.put_msg.clone())),
                    |machine, ctx| match machine {
                        ReplicaMachine::Put(sm) => sm.on_accept(m, ctx),
                        ReplicaMachine::Get(_) => unreachable!("Put keys map to put machines"),
                    },
                )
            }
            Message::Get(m) => {
                let key = TransactionKey::new(m.key.clone(), m.timestamp, TxKind::Get);
                self.drive(key, now, || ReplicaMachine::Get(GetMachine::new(m.clone())), |machine, ctx| {
                    match machine {
                        ReplicaMachine::Get(sm) => sm.on_get(ctx),
                        ReplicaMachine::Put(_) => unreachable!("Get keys map to get machines"),
                    }
                })
            }
            Message::DecryptionShare(m) => {
                let key =
                    TransactionKey::new(m.get_msg.key.clone(), m.get_msg.timestamp, TxKind::Get);
                self.drive(
                    key,
                    now,
                    || ReplicaMachine::Get(GetMachine::new(m.get_msg.clone())),
                    |machine, ctx| match machine {
                        ReplicaMachine::Get(sm) => sm.on_share(m, ctx),
                        ReplicaMachine::Put(_) => unreachable!("Get keys map to get machines"),
                    },
                )
            }
            other => {
                tracing::warn!(
                    replica = %self.ctx.id,
                    msg = other.name(),
                    "unexpected message kind for a replica"
                );
                Output::empty()
            }
        }
    }

    /// Evicts transactions that have been terminal for [`TRANSACTION_TTL`].
    ///
    /// Returns the number of evicted transactions.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.machines.len();
        self.machines.retain(|_, entry| match entry.terminal_since {
            Some(at) => now.saturating_duration_since(at) < TRANSACTION_TTL,
            None => true,
        });
        let evicted = before - self.machines.len();
        if evicted > 0 {
            tracing::debug!(replica = %self.ctx.id, evicted, "swept terminal transactions");
        }
        evicted
    }

    fn drive(
        &mut self,
        key: TransactionKey,
        now: Instant,
        create: impl FnOnce() -> ReplicaMachine,
        drive: impl FnOnce(&mut ReplicaMachine, &ReplicaContext) -> Output,
    ) -> Output {
        let entry = self.machines.entry(key).or_insert_with(|| Entry {
            machine: create(),
            terminal_since: None,
        });
        let output = drive(&mut entry.machine, &self.ctx);
        if entry.terminal_since.is_none() && entry.machine.is_terminal() {
            entry.terminal_since = Some(now);
        }
        output
    }
}
