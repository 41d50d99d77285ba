//! Quorum arithmetic.

use palisade_types::NodeId;
use thiserror::Error;

/// Sizing of the replica group: `n` replicas tolerating `f` Byzantine
/// faults, `n ≥ 3f + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterParams {
    n: usize,
    f: usize,
}

/// Rejected cluster sizings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamsError {
    #[error("{n} replicas cannot tolerate {f} Byzantine faults (need n ≥ 3f + 1)")]
    TooFewReplicas { n: usize, f: usize },
}

impl ClusterParams {
    pub fn new(n: usize, f: usize) -> Result<Self, ParamsError> {
        if n < 3 * f + 1 {
            return Err(ParamsError::TooFewReplicas { n, f });
        }
        Ok(Self { n, f })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn f(&self) -> usize {
        self.f
    }

    /// Safety quorum at replicas: `2f + 1` distinct accepts or shares.
    pub fn accept_quorum(&self) -> usize {
        2 * self.f + 1
    }

    /// Liveness evidence at the gateway: `f + 1` distinct responses, at
    /// least one of which is from an honest replica.
    pub fn reply_quorum(&self) -> usize {
        self.f + 1
    }

    /// The gateway's distinguished id, one past the replica range.
    pub fn gateway_id(&self) -> NodeId {
        NodeId::new(self.n as u8)
    }

    /// All replica ids, `0..n`.
    pub fn replica_ids(&self) -> impl Iterator<Item = NodeId> + use<> {
        (0..self.n as u8).map(NodeId::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(4, 1, 3, 2; "minimum f1")]
    #[test_case(7, 2, 5, 3; "minimum f2")]
    #[test_case(10, 3, 7, 4; "minimum f3")]
    #[test_case(5, 1, 3, 2; "slack replica")]
    fn quorum_sizes(n: usize, f: usize, accept: usize, reply: usize) {
        let params = ClusterParams::new(n, f).unwrap();
        assert_eq!(params.accept_quorum(), accept);
        assert_eq!(params.reply_quorum(), reply);
    }

    #[test]
    fn undersized_cluster_rejected() {
        assert_eq!(
            ClusterParams::new(3, 1),
            Err(ParamsError::TooFewReplicas { n: 3, f: 1 })
        );
    }

    #[test]
    fn gateway_id_is_past_the_replicas() {
        let params = ClusterParams::new(4, 1).unwrap();
        assert!(params.replica_ids().all(|id| id != params.gateway_id()));
        assert_eq!(params.gateway_id(), NodeId::new(4));
    }
}
