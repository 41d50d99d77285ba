//! Threshold ElGamal encryption over Ristretto255.
//!
//! Verifier blobs are stored under the group public key `P = s·G`, where the
//! group secret `s` is Shamir-shared across the replicas by a trusted dealer
//! at cluster setup. Decrypting a blob takes `t = 2f+1` cooperating replicas;
//! any smaller subset learns nothing about the plaintext.
//!
//! Hybrid construction:
//! - KEM: ephemeral `r`, `epk = r·G`, shared point `S = r·P`; an AES-256 key
//!   is derived from `S` with HKDF-SHA-256.
//! - DEM: AES-256-GCM over the blob with a random 96-bit nonce.
//! - Share: replica `i` contributes `Dᵢ = sᵢ·epk`; Lagrange interpolation of
//!   `{Dᵢ}` at zero recovers `S` without reconstructing `s` itself.
//!
//! A share computed against a different ciphertext (or fabricated outright)
//! interpolates to the wrong `S`, the derived key fails the GCM tag, and
//! [`ThresholdKey::combine`] reports [`CryptoError::AeadFailure`].

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use bytes::Bytes;
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use palisade_types::NodeId;

use crate::CryptoError;

/// HKDF salt binding derived keys to this scheme.
const KEM_SALT: &[u8] = b"palisade.threshold.kem.v1";

/// HKDF info label for the DEM key.
const KEM_INFO: &[u8] = b"palisade.threshold.dem-key.v1";

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

// ============================================================================
// Dealer Key Generation
// ============================================================================

/// A replica's share of the group decryption key.
///
/// The scalar is wiped on drop; it leaves this struct only as `sᵢ·epk`
/// inside a [`DecryptionShare`].
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretShare {
    #[zeroize(skip)]
    pub holder: NodeId,
    scalar: Scalar,
}

impl SecretShare {
    /// Reconstructs a share from its stored 32-byte encoding.
    pub fn from_bytes(holder: NodeId, bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let scalar = Option::<Scalar>::from(Scalar::from_canonical_bytes(*bytes))
            .ok_or(CryptoError::InvalidScalar)?;
        Ok(Self { holder, scalar })
    }

    /// The canonical encoding written to the holder's key file.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.scalar.to_bytes()
    }
}

/// Dealer-side key generation.
///
/// Samples a polynomial of degree `threshold - 1` over the scalar field,
/// takes `s = p(0)` as the group secret, and hands replica `i` the share
/// `p(i+1)` (x-coordinates are offset by one so no share evaluates at zero).
/// Returns the compressed group public key and the per-replica shares.
pub fn dealer_keygen(n: usize, threshold: usize) -> Result<([u8; 32], Vec<SecretShare>), CryptoError> {
    if threshold == 0 || threshold > n {
        return Err(CryptoError::InvalidKeyMaterial(format!(
            "threshold {threshold} out of range for {n} replicas"
        )));
    }

    let coeffs: Vec<Scalar> = (0..threshold).map(|_| Scalar::random(&mut OsRng)).collect();
    let public = RISTRETTO_BASEPOINT_POINT * coeffs[0];

    let shares = (0..n)
        .map(|i| {
            let x = Scalar::from(i as u64 + 1);
            // Horner evaluation of p(x)
            let mut acc = Scalar::ZERO;
            for coeff in coeffs.iter().rev() {
                acc = acc * x + coeff;
            }
            SecretShare {
                holder: NodeId::new(i as u8),
                scalar: acc,
            }
        })
        .collect();

    Ok((public.compress().to_bytes(), shares))
}

// ============================================================================
// Ciphertext & Shares
// ============================================================================

/// A stored threshold ciphertext: KEM ephemeral, DEM nonce, sealed body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    /// Compressed ephemeral public point `r·G`.
    pub epk: [u8; 32],
    /// AES-GCM nonce.
    pub nonce: [u8; NONCE_LEN],
    /// AES-GCM sealed blob (tag appended).
    pub body: Vec<u8>,
}

impl Ciphertext {
    /// Encodes for the secrets store.
    pub fn encode(&self) -> Bytes {
        let encoded = postcard::to_allocvec(self)
            .expect("ciphertext fields are plain bytes and always serialize");
        Bytes::from(encoded)
    }

    /// Decodes a stored blob.
    pub fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        postcard::from_bytes(bytes).map_err(|e| CryptoError::MalformedCiphertext(e.to_string()))
    }
}

/// One replica's partial decryption `sᵢ·epk` of a specific ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionShare {
    pub point: [u8; 32],
}

// ============================================================================
// Threshold Key (per-replica view)
// ============================================================================

/// A replica's view of the threshold scheme: the group public key, its own
/// secret share, and the combination threshold.
pub struct ThresholdKey {
    public: RistrettoPoint,
    share: SecretShare,
    threshold: usize,
}

impl std::fmt::Debug for ThresholdKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThresholdKey")
            .field("holder", &self.share.holder)
            .field("threshold", &self.threshold)
            .field("share", &"<redacted>")
            .finish()
    }
}

impl ThresholdKey {
    pub fn new(
        public_bytes: &[u8; 32],
        share: SecretShare,
        threshold: usize,
    ) -> Result<Self, CryptoError> {
        let public = CompressedRistretto(*public_bytes)
            .decompress()
            .ok_or(CryptoError::InvalidPoint)?;
        Ok(Self {
            public,
            share,
            threshold,
        })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Encrypts a blob under the group public key.
    pub fn encrypt(&self, blob: &[u8]) -> Result<Ciphertext, CryptoError> {
        let r = Scalar::random(&mut OsRng);
        let epk = RISTRETTO_BASEPOINT_POINT * r;
        let shared = self.public * r;

        let key = derive_dem_key(&shared);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let body = cipher
            .encrypt(Nonce::from_slice(&nonce), blob)
            .map_err(|_| CryptoError::AeadFailure)?;

        Ok(Ciphertext {
            epk: epk.compress().to_bytes(),
            nonce,
            body,
        })
    }

    /// Computes this replica's decryption share for a ciphertext.
    pub fn decrypt_share(&self, ct: &Ciphertext) -> Result<DecryptionShare, CryptoError> {
        let epk = CompressedRistretto(ct.epk)
            .decompress()
            .ok_or(CryptoError::InvalidPoint)?;
        let point = epk * self.share.scalar;
        Ok(DecryptionShare {
            point: point.compress().to_bytes(),
        })
    }

    /// Combines `threshold` shares against a ciphertext to recover the blob.
    ///
    /// `senders[i]` must name the replica that produced `shares[i]`; the
    /// Lagrange coefficients depend on which replicas contributed. Shares
    /// beyond the threshold are ignored.
    pub fn combine(
        &self,
        ct: &Ciphertext,
        shares: &[DecryptionShare],
        senders: &[NodeId],
    ) -> Result<Bytes, CryptoError> {
        if shares.len() != senders.len() {
            return Err(CryptoError::ShareSenderMismatch {
                shares: shares.len(),
                senders: senders.len(),
            });
        }
        if shares.len() < self.threshold {
            return Err(CryptoError::NotEnoughShares {
                got: shares.len(),
                need: self.threshold,
            });
        }

        let shares = &shares[..self.threshold];
        let senders = &senders[..self.threshold];
        for (i, sender) in senders.iter().enumerate() {
            if senders[..i].contains(sender) {
                return Err(CryptoError::DuplicateShareSender { sender: *sender });
            }
        }

        // Lagrange interpolation of the share points at x = 0.
        let xs: Vec<Scalar> = senders
            .iter()
            .map(|id| Scalar::from(u64::from(id.as_u8()) + 1))
            .collect();
        let mut shared = RistrettoPoint::identity();
        for (j, share) in shares.iter().enumerate() {
            let point = CompressedRistretto(share.point)
                .decompress()
                .ok_or(CryptoError::InvalidPoint)?;
            let mut num = Scalar::ONE;
            let mut den = Scalar::ONE;
            for (m, x) in xs.iter().enumerate() {
                if m != j {
                    num *= x;
                    den *= x - xs[j];
                }
            }
            shared += point * (num * den.invert());
        }

        let key = derive_dem_key(&shared);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let blob = cipher
            .decrypt(Nonce::from_slice(&ct.nonce), ct.body.as_slice())
            .map_err(|_| CryptoError::AeadFailure)?;

        Ok(Bytes::from(blob))
    }
}

/// Derives the 32-byte DEM key from the shared KEM point.
fn derive_dem_key(shared: &RistrettoPoint) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(KEM_SALT), shared.compress().as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(KEM_INFO, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn keyring(n: usize, threshold: usize) -> Vec<ThresholdKey> {
        let (public, shares) = dealer_keygen(n, threshold).unwrap();
        shares
            .into_iter()
            .map(|share| ThresholdKey::new(&public, share, threshold).unwrap())
            .collect()
    }

    #[test_case(4, 3; "n4 f1")]
    #[test_case(7, 5; "n7 f2")]
    fn any_threshold_subset_decrypts(n: usize, threshold: usize) {
        let keys = keyring(n, threshold);
        let ct = keys[0].encrypt(b"the verifier blob").unwrap();

        // Every contiguous window of `threshold` replicas recovers the blob.
        for start in 0..=(n - threshold) {
            let subset: Vec<usize> = (start..start + threshold).collect();
            let shares: Vec<DecryptionShare> = subset
                .iter()
                .map(|&i| keys[i].decrypt_share(&ct).unwrap())
                .collect();
            let senders: Vec<NodeId> = subset.iter().map(|&i| NodeId::new(i as u8)).collect();
            let blob = keys[subset[0]].combine(&ct, &shares, &senders).unwrap();
            assert_eq!(blob.as_ref(), b"the verifier blob");
        }
    }

    #[test]
    fn non_contiguous_subset_decrypts() {
        let keys = keyring(4, 3);
        let ct = keys[0].encrypt(b"secret").unwrap();
        let subset = [0usize, 2, 3];
        let shares: Vec<DecryptionShare> = subset
            .iter()
            .map(|&i| keys[i].decrypt_share(&ct).unwrap())
            .collect();
        let senders: Vec<NodeId> = subset.iter().map(|&i| NodeId::new(i as u8)).collect();
        assert_eq!(
            keys[0].combine(&ct, &shares, &senders).unwrap().as_ref(),
            b"secret"
        );
    }

    #[test]
    fn too_few_shares_rejected() {
        let keys = keyring(4, 3);
        let ct = keys[0].encrypt(b"secret").unwrap();
        let shares = vec![
            keys[0].decrypt_share(&ct).unwrap(),
            keys[1].decrypt_share(&ct).unwrap(),
        ];
        let senders = vec![NodeId::new(0), NodeId::new(1)];
        assert!(matches!(
            keys[0].combine(&ct, &shares, &senders),
            Err(CryptoError::NotEnoughShares { got: 2, need: 3 })
        ));
    }

    #[test]
    fn duplicate_sender_rejected() {
        let keys = keyring(4, 3);
        let ct = keys[0].encrypt(b"secret").unwrap();
        let share = keys[0].decrypt_share(&ct).unwrap();
        let shares = vec![share.clone(), share.clone(), share];
        let senders = vec![NodeId::new(0), NodeId::new(0), NodeId::new(0)];
        assert!(matches!(
            keys[0].combine(&ct, &shares, &senders),
            Err(CryptoError::DuplicateShareSender { .. })
        ));
    }

    #[test]
    fn corrupted_share_fails_combine() {
        let keys = keyring(4, 3);
        let ct = keys[0].encrypt(b"secret").unwrap();
        let mut shares: Vec<DecryptionShare> = (0..3)
            .map(|i: usize| keys[i].decrypt_share(&ct).unwrap())
            .collect();
        // A share for a different ciphertext interpolates to the wrong point.
        let other = keys[1].encrypt(b"other").unwrap();
        shares[1] = keys[1].decrypt_share(&other).unwrap();
        let senders = vec![NodeId::new(0), NodeId::new(1), NodeId::new(2)];
        assert!(matches!(
            keys[0].combine(&ct, &shares, &senders),
            Err(CryptoError::AeadFailure)
        ));
    }

    #[test]
    fn ciphertext_store_roundtrip() {
        let keys = keyring(4, 3);
        let ct = keys[0].encrypt(b"secret").unwrap();
        let decoded = Ciphertext::decode(&ct.encode()).unwrap();
        assert_eq!(decoded, ct);
    }

    #[test]
    fn share_encoding_roundtrip() {
        let (_, shares) = dealer_keygen(4, 3).unwrap();
        let bytes = shares[2].to_bytes();
        let restored = SecretShare::from_bytes(NodeId::new(2), &bytes).unwrap();
        assert_eq!(restored.to_bytes(), bytes);
    }

    #[test]
    fn keygen_rejects_bad_threshold() {
        assert!(dealer_keygen(4, 0).is_err());
        assert!(dealer_keygen(4, 5).is_err());
    }
}
