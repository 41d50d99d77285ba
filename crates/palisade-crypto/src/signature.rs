//! Ed25519 message signing.
//!
//! Each node holds one signing key and a directory mapping every node id in
//! the deployment to its verifying key. The directory is distributed through
//! the cluster configuration; secret seeds live in per-node key files.
//!
//! Verification uses `verify_strict`, which rejects the malleable and
//! mixed-order encodings plain `verify` accepts.

use std::collections::HashMap;
use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use palisade_types::NodeId;

use crate::CryptoError;

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Length of an Ed25519 seed or verifying key in bytes.
pub const KEY_LEN: usize = 32;

// ============================================================================
// Key Directory
// ============================================================================

/// NodeId-indexed verifying keys for every node in the deployment.
#[derive(Debug, Clone, Default)]
pub struct KeyDirectory {
    keys: HashMap<NodeId, VerifyingKey>,
}

impl KeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a verifying key from its 32-byte encoding.
    pub fn insert(&mut self, id: NodeId, key_bytes: &[u8; KEY_LEN]) -> Result<(), CryptoError> {
        let key = VerifyingKey::from_bytes(key_bytes)
            .map_err(|e| CryptoError::InvalidKeyMaterial(format!("node {id}: {e}")))?;
        self.keys.insert(id, key);
        Ok(())
    }

    pub fn get(&self, id: NodeId) -> Option<&VerifyingKey> {
        self.keys.get(&id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// ============================================================================
// Signature Service
// ============================================================================

/// Per-node signing service: `sign(bytes) → sig`, `verify(id, bytes, sig)`.
pub struct SignatureService {
    id: NodeId,
    signing: SigningKey,
    directory: KeyDirectory,
}

// Manual Debug implementation to avoid exposing key material
impl fmt::Debug for SignatureService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureService")
            .field("id", &self.id)
            .field("signing", &"<redacted>")
            .field("directory", &self.directory.len())
            .finish()
    }
}

impl SignatureService {
    /// Constructs the service from a 32-byte seed and the cluster directory.
    ///
    /// The seed must be cryptographically random; an all-zero seed is a
    /// degenerate key and is rejected.
    pub fn new(id: NodeId, seed: &[u8; KEY_LEN], directory: KeyDirectory) -> Result<Self, CryptoError> {
        if seed == &[0u8; KEY_LEN] {
            return Err(CryptoError::InvalidKeyMaterial(
                "signing seed is all zeros".to_string(),
            ));
        }
        Ok(Self {
            id,
            signing: SigningKey::from_bytes(seed),
            directory,
        })
    }

    /// Generates a fresh keypair, returning `(seed, verifying key)`.
    ///
    /// Used by the dealer at cluster setup; nodes themselves never generate.
    pub fn generate_keypair() -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
        let signing = SigningKey::generate(&mut OsRng);
        (
            signing.to_bytes(),
            signing.verifying_key().to_bytes(),
        )
    }

    /// The id this service signs as.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The verifying key matching this node's signing key.
    pub fn verifying_key_bytes(&self) -> [u8; KEY_LEN] {
        self.signing.verifying_key().to_bytes()
    }

    /// Signs a message, returning the 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }

    /// Verifies a signature attributed to `signer`.
    ///
    /// Returns false for unknown signers, malformed signatures, and
    /// verification failures alike; callers treat all three as a protocol
    /// violation by the peer that delivered the message.
    pub fn verify(&self, signer: NodeId, message: &[u8], sig: &[u8]) -> bool {
        let Some(key) = self.directory.get(signer) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; SIGNATURE_LEN]>::try_from(sig) else {
            return false;
        };
        let signature = Signature::from_bytes(&sig_bytes);
        key.verify_strict(message, &signature).is_ok()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn service_pair() -> (SignatureService, SignatureService) {
        let (seed_a, pub_a) = SignatureService::generate_keypair();
        let (seed_b, pub_b) = SignatureService::generate_keypair();
        let mut directory = KeyDirectory::new();
        directory.insert(NodeId::new(0), &pub_a).unwrap();
        directory.insert(NodeId::new(1), &pub_b).unwrap();
        let a = SignatureService::new(NodeId::new(0), &seed_a, directory.clone()).unwrap();
        let b = SignatureService::new(NodeId::new(1), &seed_b, directory).unwrap();
        (a, b)
    }

    #[test]
    fn sign_verify_roundtrip() {
        let (a, b) = service_pair();
        let sig = a.sign(b"quorum message");
        assert!(b.verify(NodeId::new(0), b"quorum message", &sig));
    }

    #[test]
    fn tampered_message_rejected() {
        let (a, b) = service_pair();
        let sig = a.sign(b"quorum message");
        assert!(!b.verify(NodeId::new(0), b"forged message", &sig));
    }

    #[test]
    fn wrong_attribution_rejected() {
        let (a, b) = service_pair();
        let sig = a.sign(b"quorum message");
        assert!(!b.verify(NodeId::new(1), b"quorum message", &sig));
    }

    #[test]
    fn unknown_signer_rejected() {
        let (a, b) = service_pair();
        let sig = a.sign(b"quorum message");
        assert!(!b.verify(NodeId::new(9), b"quorum message", &sig));
    }

    #[test]
    fn malformed_signature_rejected() {
        let (_, b) = service_pair();
        assert!(!b.verify(NodeId::new(0), b"quorum message", &[0u8; 10]));
    }

    #[test]
    fn zero_seed_rejected() {
        let err = SignatureService::new(NodeId::new(0), &[0u8; 32], KeyDirectory::new());
        assert!(err.is_err());
    }
}
