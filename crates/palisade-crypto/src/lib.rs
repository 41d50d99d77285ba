//! # palisade-crypto: Cryptographic services for Palisade
//!
//! Three services, each consumed through a narrow surface by the protocol
//! state machines:
//!
//! - [`signature`] — per-node Ed25519 signing plus a NodeId-indexed
//!   directory of verifying keys. Every replica- and gateway-originated
//!   message is signed; verification gates all state effects.
//! - [`threshold`] — threshold ElGamal KEM over Ristretto255 with an
//!   AES-256-GCM DEM. Verifier blobs are stored encrypted under the group
//!   public key; `2f+1` decryption shares are required to open one.
//! - [`pake`] — SPAKE2+ over Ristretto255. The client proves knowledge of
//!   the password; the gateway runs the server role against the verifier
//!   reconstructed by the replica quorum.
//!
//! All group elements cross module boundaries as canonical 32-byte
//! compressed encodings; decompression failures surface as
//! [`CryptoError::InvalidPoint`] before any secret-dependent work happens.

pub mod pake;
pub mod signature;
pub mod threshold;

use thiserror::Error;

pub use pake::{ClientLogin, ServerLogin, SessionKeys, derive_verifier};
pub use signature::{KeyDirectory, SignatureService};
pub use threshold::{Ciphertext, DecryptionShare, SecretShare, ThresholdKey, dealer_keygen};

/// Errors from the cryptographic services.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encoding is not a canonical Ristretto point")]
    InvalidPoint,

    #[error("encoding is not a canonical scalar")]
    InvalidScalar,

    #[error("not enough decryption shares: got {got}, need {need}")]
    NotEnoughShares { got: usize, need: usize },

    #[error("duplicate share from sender {sender}")]
    DuplicateShareSender { sender: palisade_types::NodeId },

    #[error("share count {shares} does not match sender count {senders}")]
    ShareSenderMismatch { shares: usize, senders: usize },

    #[error("authenticated decryption failed")]
    AeadFailure,

    #[error("malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    #[error("key exchange produced the identity element")]
    IdentityElement,

    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),
}
