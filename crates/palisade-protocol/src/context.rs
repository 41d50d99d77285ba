//! Capability bundles.
//!
//! Each state machine is constructed against the narrow set of services it
//! needs — quorum arithmetic, the signature service, the threshold cipher,
//! the secrets store — rather than a reference to the whole node. The
//! runtime builds one context per node at startup and lends it to every
//! transaction.

use palisade_crypto::{SignatureService, ThresholdKey};
use palisade_store::SecretsDb;
use palisade_types::NodeId;

use crate::params::ClusterParams;

/// Everything a replica-side transaction may touch.
pub struct ReplicaContext {
    pub id: NodeId,
    pub params: ClusterParams,
    pub signatures: SignatureService,
    pub threshold: ThresholdKey,
    pub secrets: Box<dyn SecretsDb>,
}

impl ReplicaContext {
    pub fn new(
        id: NodeId,
        params: ClusterParams,
        signatures: SignatureService,
        threshold: ThresholdKey,
        secrets: Box<dyn SecretsDb>,
    ) -> Self {
        Self {
            id,
            params,
            signatures,
            threshold,
            secrets,
        }
    }
}

/// Everything a gateway-side transaction may touch.
///
/// The gateway holds no store and no threshold share: its only long-term
/// secret is its signing key, and its view of any verifier is ephemeral.
pub struct GatewayContext {
    pub id: NodeId,
    pub params: ClusterParams,
    pub signatures: SignatureService,
}

impl GatewayContext {
    pub fn new(params: ClusterParams, signatures: SignatureService) -> Self {
        Self {
            id: signatures.id(),
            params,
            signatures,
        }
    }
}
