//! Login: the gateway get state machine.
//!
//! Starting the transaction broadcasts a signed Get. Each responding
//! replica returns the verifier blob its local quorum reconstructed; the
//! gateway accepts a blob only once `f+1` distinct replicas have returned
//! byte-identical copies. Up to `f` Byzantine replicas can return garbage
//! without ever reaching that bar, while among any `2f+1` responses the
//! honest majority always does — so if `2f+1` responses arrive with no
//! matching set, something is wrong beyond the fault budget and the
//! transaction is abandoned.
//!
//! With a verifier selected, the gateway runs the SPAKE2+ server role
//! against the client element from the LoginRequest and replies with its
//! own element and the transcript-MAC key confirmation. The verifier and
//! the session keys are ephemeral: they die with the transaction.

use std::collections::HashMap;

use bytes::Bytes;

use palisade_crypto::pake::ServerLogin;
use palisade_crypto::SessionKeys;
use palisade_types::{NodeId, Verifier};
use palisade_wire::{GetMessage, GetResponseMessage, LoginRequest, LoginResponse, Message};

use crate::context::GatewayContext;
use crate::output::Output;

/// State for one login.
pub struct LoginMachine {
    request: LoginRequest,
    /// Verifier blob returned by each distinct replica.
    responses: HashMap<NodeId, Bytes>,
    sent: bool,
    abandoned: bool,
    /// Keys from a completed exchange, kept until the sweep for embedders.
    session: Option<SessionKeys>,
}

impl LoginMachine {
    /// Broadcasts the Get.
    pub(crate) fn start(request: LoginRequest, ctx: &GatewayContext) -> (Self, Output) {
        let get = GetMessage::new(request.username.clone(), request.timestamp, &ctx.signatures);

        tracing::info!(
            gateway = %ctx.id,
            username = %request.username,
            ts = %request.timestamp,
            "starting login; broadcasting Get"
        );
        let mut out = Output::empty();
        out.broadcast(Message::Get(get));
        (
            Self {
                request,
                responses: HashMap::new(),
                sent: false,
                abandoned: false,
                session: None,
            },
            out,
        )
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.sent || self.abandoned
    }

    pub(crate) fn session_key(&self) -> Option<[u8; 32]> {
        self.session.as_ref().map(|keys| *keys.session_key())
    }

    /// Records a replica's verifier blob and completes once `f+1` match.
    pub(crate) fn on_get_response(
        &mut self,
        response: &GetResponseMessage,
        ctx: &GatewayContext,
    ) -> Output {
        let mut out = Output::empty();

        if self.sent || self.abandoned {
            return out;
        }

        if self.responses.contains_key(&response.sender_id) {
            tracing::debug!(
                gateway = %ctx.id,
                from = %response.sender_id,
                "duplicate GetResponse ignored"
            );
            return out;
        }
        self.responses
            .insert(response.sender_id, response.secret.clone());

        if let Some(verifier_blob) = self.matching_quorum(ctx.params.reply_quorum()) {
            self.complete(&verifier_blob, ctx, &mut out);
        } else if self.responses.len() >= ctx.params.accept_quorum() {
            // Any 2f+1 responses contain an f+1 honest matching set; its
            // absence means more than f faulty replicas.
            tracing::error!(
                gateway = %ctx.id,
                username = %self.request.username,
                responses = self.responses.len(),
                "no verifier blob matched across f+1 replicas; abandoning login"
            );
            self.abandoned = true;
        }
        out
    }

    /// Returns the blob returned by at least `quorum` distinct replicas.
    fn matching_quorum(&self, quorum: usize) -> Option<Bytes> {
        self.responses
            .values()
            .find(|blob| {
                self.responses
                    .values()
                    .filter(|other| other == blob)
                    .count()
                    >= quorum
            })
            .cloned()
    }

    /// Runs the SPAKE2+ server role and replies to the user.
    fn complete(&mut self, verifier_blob: &Bytes, ctx: &GatewayContext, out: &mut Output) {
        let verifier = match Verifier::parse(verifier_blob) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(
                    gateway = %ctx.id,
                    username = %self.request.username,
                    error = %e,
                    "quorum verifier blob failed to parse; abandoning login"
                );
                self.abandoned = true;
                return;
            }
        };

        let exchange = ServerLogin::start(self.request.username.as_bytes(), &verifier)
            .and_then(|(server, v)| server.finish(&self.request.u).map(|keys| (keys, v)));
        let (keys, v) = match exchange {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(
                    gateway = %ctx.id,
                    username = %self.request.username,
                    error = %e,
                    "SPAKE2+ server exchange failed; abandoning login"
                );
                self.abandoned = true;
                return;
            }
        };

        tracing::info!(
            gateway = %ctx.id,
            username = %self.request.username,
            ts = %self.request.timestamp,
            matches = self.responses.len(),
            "login verifier agreed; replying to user"
        );
        out.send(
            self.request.user_id,
            Message::LoginResponse(LoginResponse {
                username: self.request.username.clone(),
                v: v.to_vec(),
                confirmation: keys.confirmation_tag().to_vec(),
                timestamp: self.request.timestamp,
            }),
        );
        self.session = Some(keys);
        self.sent = true;
    }
}
