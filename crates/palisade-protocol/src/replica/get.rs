//! Threshold read: the replica get state machine.
//!
//! Reconstructs the verifier blob stored under a username. On the first
//! driving message — the Get itself or a peer's DecryptionShare — the
//! replica loads the ciphertext, computes its own share, and broadcasts it
//! exactly once. Each replica combines locally: once `2f+1` distinct
//! shares (its own included) have accumulated against the ciphertext it
//! loaded, it recovers the blob and replies GetResponse to the gateway.
//!
//! A replica that does not hold the key stays silent for the whole
//! transaction; `2f+1` replicas that do hold it suffice. A share from an
//! equivocating peer makes the combine fail its authentication tag, which
//! is fatal to the transaction — no reply, and the gateway's `f+1` matching
//! rule rides on the other replicas.

use palisade_crypto::{Ciphertext, DecryptionShare};
use palisade_types::NodeId;
use palisade_wire::{DecryptionShareMessage, GetMessage, GetResponseMessage, Message};

use crate::context::ReplicaContext;
use crate::output::Output;

/// State for one threshold read.
pub struct GetMachine {
    get: GetMessage,
    /// The ciphertext this replica's share was computed from; later shares
    /// are combined against exactly this value.
    encrypted: Option<Ciphertext>,
    /// Collected shares, aligned with `servers`.
    shares: Vec<DecryptionShare>,
    /// Distinct contributing replicas, this one first.
    servers: Vec<NodeId>,
    sent_share: bool,
    sent_response: bool,
    abandoned: bool,
}

impl GetMachine {
    pub(crate) fn new(get: GetMessage) -> Self {
        Self {
            get,
            encrypted: None,
            shares: Vec::new(),
            servers: Vec::new(),
            sent_share: false,
            sent_response: false,
            abandoned: false,
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.sent_response || self.abandoned
    }

    /// Drives the machine with the Get itself (possibly a duplicate).
    pub(crate) fn on_get(&mut self, ctx: &ReplicaContext) -> Output {
        let mut out = Output::empty();
        self.ensure_share_broadcast(ctx, &mut out);
        out
    }

    /// Drives the machine with a peer's decryption share.
    pub(crate) fn on_share(
        &mut self,
        share_msg: &DecryptionShareMessage,
        ctx: &ReplicaContext,
    ) -> Output {
        let mut out = Output::empty();
        self.ensure_share_broadcast(ctx, &mut out);
        if self.abandoned {
            return out;
        }

        if share_msg.get_msg != self.get {
            tracing::warn!(
                replica = %ctx.id,
                key = %self.get.key,
                from = %share_msg.sender_id,
                "ignoring DecryptionShare with a conflicting embedded Get"
            );
            return out;
        }

        if self.servers.contains(&share_msg.sender_id) {
            tracing::debug!(
                replica = %ctx.id,
                from = %share_msg.sender_id,
                "duplicate DecryptionShare ignored"
            );
            return out;
        }

        let Ok(point) = <[u8; 32]>::try_from(share_msg.decryption_share.as_slice()) else {
            tracing::warn!(
                replica = %ctx.id,
                from = %share_msg.sender_id,
                len = share_msg.decryption_share.len(),
                "ignoring DecryptionShare with a malformed share encoding"
            );
            return out;
        };

        self.shares.push(DecryptionShare { point });
        self.servers.push(share_msg.sender_id);

        if !self.sent_response && self.shares.len() >= ctx.params.accept_quorum() {
            self.combine_and_reply(ctx, &mut out);
        }
        out
    }

    /// Loads the ciphertext and broadcasts this replica's share exactly
    /// once. A store miss means this replica sits the transaction out.
    fn ensure_share_broadcast(&mut self, ctx: &ReplicaContext, out: &mut Output) {
        if self.sent_share || self.abandoned {
            return;
        }
        self.sent_share = true;

        let Some(stored) = ctx.secrets.get(&self.get.key) else {
            tracing::debug!(
                replica = %ctx.id,
                key = %self.get.key,
                "no stored ciphertext; not participating in this Get"
            );
            self.abandoned = true;
            return;
        };

        let ciphertext = match Ciphertext::decode(&stored) {
            Ok(ct) => ct,
            Err(e) => {
                tracing::error!(
                    replica = %ctx.id,
                    key = %self.get.key,
                    error = %e,
                    "stored ciphertext is corrupt; abandoning transaction"
                );
                self.abandoned = true;
                return;
            }
        };

        let share = match ctx.threshold.decrypt_share(&ciphertext) {
            Ok(share) => share,
            Err(e) => {
                tracing::error!(
                    replica = %ctx.id,
                    key = %self.get.key,
                    error = %e,
                    "failed to compute decryption share; abandoning transaction"
                );
                self.abandoned = true;
                return;
            }
        };

        out.broadcast(Message::DecryptionShare(DecryptionShareMessage::new(
            share.point.to_vec(),
            self.get.clone(),
            &ctx.signatures,
        )));
        self.shares.push(share);
        self.servers.push(ctx.id);
        self.encrypted = Some(ciphertext);
    }

    /// Combines the collected shares and replies to the gateway.
    fn combine_and_reply(&mut self, ctx: &ReplicaContext, out: &mut Output) {
        let Some(ciphertext) = &self.encrypted else {
            // Shares only accumulate after a successful broadcast, which is
            // the only place `encrypted` is set.
            return;
        };

        let secret = match ctx
            .threshold
            .combine(ciphertext, &self.shares, &self.servers)
        {
            Ok(secret) => secret,
            Err(e) => {
                tracing::error!(
                    replica = %ctx.id,
                    key = %self.get.key,
                    error = %e,
                    "share combination failed; abandoning transaction"
                );
                self.abandoned = true;
                return;
            }
        };

        tracing::info!(
            replica = %ctx.id,
            key = %self.get.key,
            ts = %self.get.timestamp,
            shares = self.shares.len(),
            "get quorum reached; verifier recovered"
        );
        out.send(
            self.get.client_id,
            Message::GetResponse(GetResponseMessage::new(
                self.get.clone(),
                secret,
                &ctx.signatures,
            )),
        );
        self.sent_response = true;
    }
}
