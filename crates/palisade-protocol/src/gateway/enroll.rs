//! Enroll: the gateway put state machine.
//!
//! Starting the transaction derives the SPAKE2+ verifier from the user's
//! password, serializes it, and broadcasts a signed Put to every replica.
//! The password is dropped with the request; only the verifier blob leaves
//! the gateway, and the replicas in turn store it only threshold-encrypted.
//!
//! The gateway replies after `f+1` distinct PutCompletes — not `2f+1`. At
//! least one of `f+1` responders is honest, and an honest replica reports
//! completion only after its own `2f+1` accept quorum stored the
//! ciphertext, so `f+1` responses are evidence the write is durable.

use std::collections::HashSet;

use palisade_crypto::derive_verifier;
use palisade_types::NodeId;
use palisade_wire::{EnrollRequest, EnrollResponse, Message, PutCompleteMessage, PutMessage};

use crate::context::GatewayContext;
use crate::output::Output;

/// State for one enrollment.
pub struct EnrollMachine {
    request: EnrollRequest,
    /// Distinct replicas that reported completion.
    responders: HashSet<NodeId>,
    sent: bool,
}

impl EnrollMachine {
    /// Derives the verifier and broadcasts the Put.
    pub(crate) fn start(request: EnrollRequest, ctx: &GatewayContext) -> (Self, Output) {
        let verifier = derive_verifier(request.username.as_bytes(), request.password.as_bytes());
        let put = PutMessage::new(
            request.username.clone(),
            verifier.to_bytes(),
            request.timestamp,
            &ctx.signatures,
        );

        tracing::info!(
            gateway = %ctx.id,
            username = %request.username,
            ts = %request.timestamp,
            "starting enrollment; broadcasting Put"
        );
        let mut out = Output::empty();
        out.broadcast(Message::Put(put));
        (
            Self {
                request,
                responders: HashSet::new(),
                sent: false,
            },
            out,
        )
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.sent
    }

    /// Counts a replica's completion report.
    pub(crate) fn on_put_complete(
        &mut self,
        complete: &PutCompleteMessage,
        ctx: &GatewayContext,
    ) -> Output {
        let mut out = Output::empty();

        if !self.responders.insert(complete.sender_id) {
            tracing::debug!(
                gateway = %ctx.id,
                from = %complete.sender_id,
                "duplicate PutComplete ignored"
            );
            return out;
        }

        if !self.sent && self.responders.len() >= ctx.params.reply_quorum() {
            tracing::info!(
                gateway = %ctx.id,
                username = %self.request.username,
                ts = %self.request.timestamp,
                completes = self.responders.len(),
                "enrollment committed; replying to user"
            );
            out.send(
                self.request.user_id,
                Message::EnrollResponse(EnrollResponse {
                    username: self.request.username.clone(),
                    timestamp: self.request.timestamp,
                }),
            );
            self.sent = true;
        }
        out
    }
}
