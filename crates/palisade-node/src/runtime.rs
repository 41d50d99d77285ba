//! Per-node event loop.
//!
//! A [`NodeRuntime`] joins the three layers: the framed transport, the
//! protocol registry for its role, and the cluster configuration. The loop
//! is the contract from the protocol crate made concrete — poll, decode,
//! dispatch synchronously, flush the output, and tick the transaction
//! sweep between batches.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use palisade_config::{ClusterConfig, NodeSecrets};
use palisade_crypto::{KeyDirectory, SecretShare, SignatureService, ThresholdKey};
use palisade_protocol::{
    ClusterParams, Gateway, GatewayContext, Outbound, Output, Replica, ReplicaContext,
};
use palisade_store::SecretsDb;
use palisade_types::NodeId;

use crate::NodeError;
use crate::transport::Transport;

/// How often the terminal-transaction sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

enum RoleState {
    Replica(Replica),
    Gateway(Gateway),
}

/// A running replica or gateway.
pub struct NodeRuntime {
    id: NodeId,
    params: ClusterParams,
    transport: Transport,
    role: RoleState,
    last_sweep: Instant,
}

impl NodeRuntime {
    /// Builds a replica runtime from its configuration and secret material.
    pub fn replica(
        config: &ClusterConfig,
        secrets: &NodeSecrets,
        store: Box<dyn SecretsDb>,
    ) -> Result<Self, NodeError> {
        let id = NodeId::new(secrets.id);
        let params = params_of(config)?;
        let signatures = signature_service(config, secrets, id)?;

        let share_bytes = secrets.threshold_share()?.ok_or_else(|| {
            NodeError::Protocol(format!("replica {id} has no threshold share configured"))
        })?;
        let share = SecretShare::from_bytes(id, &share_bytes)?;
        let threshold = ThresholdKey::new(
            &config.threshold_public_key()?,
            share,
            params.accept_quorum(),
        )?;

        let mut transport = bind_transport(config, id)?;
        transport.connect_mesh(params.replica_ids())?;

        let ctx = ReplicaContext::new(id, params, signatures, threshold, store);
        Ok(Self {
            id,
            params,
            transport,
            role: RoleState::Replica(Replica::new(ctx)),
            last_sweep: Instant::now(),
        })
    }

    /// Builds the gateway runtime.
    pub fn gateway(config: &ClusterConfig, secrets: &NodeSecrets) -> Result<Self, NodeError> {
        let id = NodeId::new(secrets.id);
        let params = params_of(config)?;
        let signatures = signature_service(config, secrets, id)?;
        let transport = bind_transport(config, id)?;

        let ctx = GatewayContext::new(params, signatures);
        Ok(Self {
            id,
            params,
            transport,
            role: RoleState::Gateway(Gateway::new(ctx)),
            last_sweep: Instant::now(),
        })
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Runs the event loop until the process is killed.
    pub fn run(&mut self) -> Result<(), NodeError> {
        tracing::info!(node = %self.id, addr = %self.local_addr(), "node running");
        loop {
            self.tick(SWEEP_INTERVAL)?;
        }
    }

    /// One reactor turn: poll, dispatch, flush, sweep.
    ///
    /// Exposed so tests and embedders can drive several nodes from one
    /// thread.
    pub fn tick(&mut self, timeout: Duration) -> Result<(), NodeError> {
        let inbound = self.transport.poll(Some(timeout))?;
        let now = Instant::now();

        for message in inbound {
            let output = match &mut self.role {
                RoleState::Replica(replica) => replica.handle(&message, now),
                RoleState::Gateway(gateway) => gateway.handle(&message, now),
            };
            self.flush(output);
        }

        if now.saturating_duration_since(self.last_sweep) >= SWEEP_INTERVAL {
            match &mut self.role {
                RoleState::Replica(replica) => replica.sweep(now),
                RoleState::Gateway(gateway) => gateway.sweep(now),
            };
            self.last_sweep = now;
        }
        Ok(())
    }

    /// Flushes state machine output onto the transport.
    fn flush(&mut self, output: Output) {
        for item in output.outbound {
            match item {
                Outbound::Broadcast(message) => {
                    for peer in self.params.replica_ids() {
                        if peer != self.id {
                            self.transport.send(peer, &message);
                        }
                    }
                }
                Outbound::Send(to, message) => self.transport.send(to, &message),
            }
        }
    }
}

fn params_of(config: &ClusterConfig) -> Result<ClusterParams, NodeError> {
    ClusterParams::new(config.cluster.n, config.cluster.f)
        .map_err(|e| NodeError::Protocol(e.to_string()))
}

fn signature_service(
    config: &ClusterConfig,
    secrets: &NodeSecrets,
    id: NodeId,
) -> Result<SignatureService, NodeError> {
    let mut directory = KeyDirectory::new();
    for entry in &config.nodes {
        directory.insert(NodeId::new(entry.id), &config.verifying_key(entry)?)?;
    }
    Ok(SignatureService::new(id, &secrets.signing_seed()?, directory)?)
}

fn bind_transport(config: &ClusterConfig, id: NodeId) -> Result<Transport, NodeError> {
    let entry = config
        .node(id)
        .ok_or_else(|| NodeError::Protocol(format!("node {id} missing from the address book")))?;
    let listen = resolve(&entry.host, entry.port)?;

    let mut address_book = HashMap::new();
    for peer in &config.nodes {
        if peer.id != id.as_u8() {
            address_book.insert(NodeId::new(peer.id), resolve(&peer.host, peer.port)?);
        }
    }
    Transport::bind(id, listen, address_book)
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, NodeError> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| NodeError::Protocol(format!("{host}:{port} did not resolve")))
}
