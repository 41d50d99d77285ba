//! # palisade-types: Core types for Palisade
//!
//! This crate contains shared types used across the Palisade system:
//! - Node identity ([`NodeId`])
//! - Store keys ([`Username`])
//! - Request identity ([`Timestamp`], [`TxKind`], [`TransactionKey`])
//! - The SPAKE2+ server-side secret ([`Verifier`])
//!
//! Every protocol run is identified by a [`TransactionKey`]; the state
//! machines in `palisade-protocol` are keyed by it on both replicas and
//! the gateway.

use std::fmt::{self, Display};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Node Identity
// ============================================================================

/// Unique identifier for a node in the deployment.
///
/// Replica ids are `0..n`. The gateway carries the distinguished id `n`,
/// and user ids are strictly greater than the gateway's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u8);

impl NodeId {
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Returns true if this id names one of the `n` replicas.
    pub fn is_replica(self, n: usize) -> bool {
        usize::from(self.0) < n
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for NodeId {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<NodeId> for u8 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

// ============================================================================
// Store Keys
// ============================================================================

/// An enrolled account name; the primary key into the secrets store.
///
/// Usernames are opaque to the protocol: they are never parsed, only
/// compared and used as store keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Username(String);

impl Username {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Username {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Username {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Request Identity
// ============================================================================

/// Opaque monotonic request identifier chosen by the originator.
///
/// Timestamps are not compared against a clock; together with the username
/// and the operation kind they form the [`TransactionKey`] that names one
/// protocol run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn new(ts: u64) -> Self {
        Self(ts)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// The kind of protocol run a transaction key names.
///
/// `Put`/`Get` identify replica-side quorum runs; `Enroll`/`Login` identify
/// the gateway-side runs that drive them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxKind {
    Put,
    Get,
    Enroll,
    Login,
}

impl TxKind {
    /// Returns a human-readable name for the kind.
    pub fn name(self) -> &'static str {
        match self {
            TxKind::Put => "Put",
            TxKind::Get => "Get",
            TxKind::Enroll => "Enroll",
            TxKind::Login => "Login",
        }
    }
}

impl Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The identity of one protocol run.
///
/// Exactly one state machine exists per key within a node; duplicate
/// first-messages for a key are absorbed by the existing machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionKey {
    pub username: Username,
    pub timestamp: Timestamp,
    pub kind: TxKind,
}

impl TransactionKey {
    pub fn new(username: Username, timestamp: Timestamp, kind: TxKind) -> Self {
        Self {
            username,
            timestamp,
            kind,
        }
    }
}

impl Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.username, self.timestamp, self.kind)
    }
}

// ============================================================================
// Verifier
// ============================================================================

/// Length of the `π₀` prefix in a serialized verifier.
pub const PI0_LEN: usize = 32;

/// The SPAKE2+ server-side augmented secret.
///
/// `pi0` is the canonical 32-byte encoding of the scalar `π₀`; `c` is the
/// opaque augmentation (the compressed point `π₁·G`). A replica quorum
/// reconstructs this pair during login; no single replica ever holds it.
///
/// Serialized as `π₀ ‖ c`. The split point is fixed at 32 bytes, so `c`
/// must be non-empty for a blob to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verifier {
    pub pi0: [u8; PI0_LEN],
    pub c: Bytes,
}

impl Verifier {
    pub fn new(pi0: [u8; PI0_LEN], c: Bytes) -> Self {
        Self { pi0, c }
    }

    /// Serializes to the stored blob layout `π₀ ‖ c`.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = Vec::with_capacity(PI0_LEN + self.c.len());
        out.extend_from_slice(&self.pi0);
        out.extend_from_slice(&self.c);
        Bytes::from(out)
    }

    /// Parses a stored blob back into `(π₀, c)`.
    ///
    /// Structural validation only: the blob must be long enough to carry a
    /// 32-byte scalar and a non-empty augmentation. Whether the scalar and
    /// point are canonical group encodings is checked by `palisade-crypto`
    /// when the verifier enters the PAKE.
    pub fn parse(blob: &[u8]) -> Result<Self, TypeError> {
        if blob.len() <= PI0_LEN {
            return Err(TypeError::VerifierTooShort { len: blob.len() });
        }
        let mut pi0 = [0u8; PI0_LEN];
        pi0.copy_from_slice(&blob[..PI0_LEN]);
        Ok(Self {
            pi0,
            c: Bytes::copy_from_slice(&blob[PI0_LEN..]),
        })
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from structural validation of shared types.
#[derive(Debug, Error)]
pub enum TypeError {
    #[error("verifier blob too short: {len} bytes, need at least 33")]
    VerifierTooShort { len: usize },
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test]
    fn node_id_roundtrip() {
        let id = NodeId::new(3);
        assert_eq!(id.as_u8(), 3);
        assert_eq!(u8::from(id), 3);
        assert_eq!(NodeId::from(3u8), id);
        assert_eq!(id.to_string(), "3");
    }

    #[test_case(0, 4, true; "first replica")]
    #[test_case(3, 4, true; "last replica")]
    #[test_case(4, 4, false; "gateway id")]
    #[test_case(9, 4, false; "user id")]
    fn replica_id_range(id: u8, n: usize, expected: bool) {
        assert_eq!(NodeId::new(id).is_replica(n), expected);
    }

    #[test]
    fn transaction_key_distinguishes_kind() {
        let put = TransactionKey::new("alice".into(), Timestamp::new(7), TxKind::Put);
        let get = TransactionKey::new("alice".into(), Timestamp::new(7), TxKind::Get);
        assert_ne!(put, get);
    }

    #[test]
    fn verifier_layout() {
        let v = Verifier::new([0xAA; 32], Bytes::from_static(b"augmentation"));
        let blob = v.to_bytes();
        assert_eq!(&blob[..32], &[0xAA; 32]);
        assert_eq!(&blob[32..], b"augmentation");
    }

    #[test]
    fn verifier_parse_rejects_short_blobs() {
        assert!(Verifier::parse(&[]).is_err());
        assert!(Verifier::parse(&[0u8; 32]).is_err());
        assert!(Verifier::parse(&[0u8; 33]).is_ok());
    }

    #[test]
    fn tx_kind_serde_tags() {
        let json = serde_json::to_string(&TxKind::Enroll).unwrap();
        assert_eq!(json, "\"Enroll\"");
    }

    proptest! {
        #[test]
        fn verifier_roundtrip(pi0 in proptest::array::uniform32(any::<u8>()),
                              c in proptest::collection::vec(any::<u8>(), 1..128)) {
            let v = Verifier::new(pi0, Bytes::from(c));
            let parsed = Verifier::parse(&v.to_bytes()).unwrap();
            prop_assert_eq!(parsed, v);
        }

        #[test]
        fn timestamp_display_matches_value(ts in any::<u64>()) {
            prop_assert_eq!(Timestamp::new(ts).to_string(), ts.to_string());
        }
    }
}
