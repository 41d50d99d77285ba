//! Replicated write: the replica put state machine.
//!
//! Commits a verifier blob under a username at `2f+1` honest replicas. On
//! the first driving message — the Put itself or a PutAccept that outran
//! it — the replica broadcasts its own acceptance exactly once and counts
//! itself. Once `2f+1` distinct replicas (itself included) have accepted
//! the same Put, it threshold-encrypts the blob, stores the ciphertext, and
//! reports PutComplete to the gateway that originated the Put.
//!
//! Any cryptographic or store failure is fatal to the transaction: no reply
//! is sent, and the gateway's `f+1` threshold absorbs the loss alongside up
//! to `f` faulty replicas.

use std::collections::HashSet;

use palisade_types::NodeId;
use palisade_wire::{Message, PutAcceptMessage, PutCompleteMessage, PutMessage};

use crate::context::ReplicaContext;
use crate::output::Output;

/// State for one replicated write.
pub struct PutMachine {
    /// The canonical Put for this transaction; first-seen wins.
    put: PutMessage,
    /// Distinct replicas whose acceptance has been counted.
    acceptances: HashSet<NodeId>,
    sent_accept: bool,
    sent_response: bool,
    abandoned: bool,
}

impl PutMachine {
    pub(crate) fn new(put: PutMessage) -> Self {
        Self {
            put,
            acceptances: HashSet::new(),
            sent_accept: false,
            sent_response: false,
            abandoned: false,
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.sent_response || self.abandoned
    }

    /// Drives the machine with the Put itself (possibly a duplicate).
    pub(crate) fn on_put(&mut self, ctx: &ReplicaContext) -> Output {
        let mut out = Output::empty();
        self.ensure_accept_broadcast(ctx, &mut out);
        out
    }

    /// Drives the machine with a peer's acceptance.
    pub(crate) fn on_accept(&mut self, accept: &PutAcceptMessage, ctx: &ReplicaContext) -> Output {
        let mut out = Output::empty();
        self.ensure_accept_broadcast(ctx, &mut out);

        if accept.put_msg != self.put {
            // A second, different Put under the same key is a Byzantine
            // event; the first-seen Put stays canonical.
            tracing::warn!(
                replica = %ctx.id,
                key = %self.put.key,
                ts = %self.put.timestamp,
                from = %accept.sender_id,
                "ignoring PutAccept with a conflicting embedded Put"
            );
            return out;
        }

        if !self.acceptances.insert(accept.sender_id) {
            tracing::debug!(
                replica = %ctx.id,
                from = %accept.sender_id,
                "duplicate PutAccept ignored"
            );
            return out;
        }

        if !self.sent_response && self.acceptances.len() >= ctx.params.accept_quorum() {
            self.commit(ctx, &mut out);
        }
        out
    }

    /// Broadcasts this replica's acceptance exactly once and counts it.
    fn ensure_accept_broadcast(&mut self, ctx: &ReplicaContext, out: &mut Output) {
        if self.sent_accept {
            return;
        }
        self.sent_accept = true;
        self.acceptances.insert(ctx.id);
        out.broadcast(Message::PutAccept(PutAcceptMessage::new(
            self.put.clone(),
            &ctx.signatures,
        )));
    }

    /// Encrypts, stores, and reports completion to the originating gateway.
    fn commit(&mut self, ctx: &ReplicaContext, out: &mut Output) {
        let ciphertext = match ctx.threshold.encrypt(&self.put.secret) {
            Ok(ct) => ct,
            Err(e) => {
                tracing::error!(
                    replica = %ctx.id,
                    key = %self.put.key,
                    error = %e,
                    "threshold encryption failed; abandoning transaction"
                );
                self.abandoned = true;
                return;
            }
        };

        if let Err(e) = ctx.secrets.put(&self.put.key, ciphertext.encode()) {
            tracing::error!(
                replica = %ctx.id,
                key = %self.put.key,
                error = %e,
                "store write failed; abandoning transaction"
            );
            self.abandoned = true;
            return;
        }

        tracing::info!(
            replica = %ctx.id,
            key = %self.put.key,
            ts = %self.put.timestamp,
            accepts = self.acceptances.len(),
            "put quorum reached; ciphertext stored"
        );
        out.send(
            self.put.client_id,
            Message::PutComplete(PutCompleteMessage::new(self.put.clone(), &ctx.signatures)),
        );
        self.sent_response = true;
    }
}
