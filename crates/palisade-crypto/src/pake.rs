//! SPAKE2+ over Ristretto255.
//!
//! The augmented PAKE at the heart of login. Registration derives two
//! scalars `(π₀, π₁)` from the password; the client keeps both, while the
//! server side stores only the verifier `(π₀, c = π₁·G)`. Compromise of a
//! stored verifier therefore does not yield the password, and in this
//! deployment even the verifier only exists in plaintext inside a gateway
//! transaction after a `2f+1` replica quorum has jointly decrypted it.
//!
//! Exchange (client A, server B, blinding points `M`, `N` fixed by
//! hash-to-group):
//!
//! ```text
//! A: x ← random,  u = x·G + π₀·M   ──u──►  B
//! B: y ← random,  v = y·G + π₀·N   ◄──v──  (with key confirmation tag)
//! A: Z = x·(v − π₀·N),  V = π₁·(v − π₀·N)
//! B: Z = y·(u − π₀·M),  V = y·c
//! ```
//!
//! Both sides hash the transcript `(username, u, v, Z, V, π₀)` into a
//! session key and a confirmation key. The server proves possession by
//! sending `HMAC(confirm_key, H(transcript))`; the client rejects the
//! session if the tag does not verify. A wrong password changes `π₀` on
//! one side only, the transcripts diverge, and the tag fails.

use std::fmt;
use std::sync::LazyLock;

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

use bytes::Bytes;
use palisade_types::Verifier;

use crate::CryptoError;

/// Length of a compressed group element on the wire.
pub const ELEMENT_LEN: usize = 32;

/// Length of a key confirmation tag.
pub const CONFIRMATION_LEN: usize = 32;

const REGISTRATION_SALT: &[u8] = b"palisade.spake2plus.registration.v1";
const KEY_SCHEDULE_SALT: &[u8] = b"palisade.spake2plus.keys.v1";
const INFO_PI0: &[u8] = b"palisade.spake2plus.pi0.v1";
const INFO_PI1: &[u8] = b"palisade.spake2plus.pi1.v1";
const INFO_SESSION_KEY: &[u8] = b"palisade.spake2plus.session-key.v1";
const INFO_CONFIRM_KEY: &[u8] = b"palisade.spake2plus.confirm-key.v1";

/// Blinding point `M`, fixed by hash-to-group so its discrete log is unknown.
static BLIND_M: LazyLock<RistrettoPoint> =
    LazyLock::new(|| RistrettoPoint::hash_from_bytes::<Sha512>(b"palisade.spake2plus.M.v1"));

/// Blinding point `N`.
static BLIND_N: LazyLock<RistrettoPoint> =
    LazyLock::new(|| RistrettoPoint::hash_from_bytes::<Sha512>(b"palisade.spake2plus.N.v1"));

// ============================================================================
// Registration
// ============================================================================

/// Derives the password scalars `(π₀, π₁)`.
///
/// The username is folded into the expansion labels so equal passwords under
/// different accounts produce unrelated scalars.
fn derive_scalars(username: &[u8], password: &[u8]) -> (Scalar, Scalar) {
    let hk = Hkdf::<Sha512>::new(Some(REGISTRATION_SALT), password);
    let expand = |label: &[u8]| {
        let mut info = Vec::with_capacity(label.len() + username.len());
        info.extend_from_slice(label);
        info.extend_from_slice(username);
        let mut okm = [0u8; 64];
        hk.expand(&info, &mut okm)
            .expect("64 bytes is a valid HKDF-SHA512 output length");
        let scalar = Scalar::from_bytes_mod_order_wide(&okm);
        okm.zeroize();
        scalar
    };
    (expand(INFO_PI0), expand(INFO_PI1))
}

/// Derives the server-side verifier `(π₀, c = π₁·G)` for enrollment.
pub fn derive_verifier(username: &[u8], password: &[u8]) -> Verifier {
    let (pi0, mut pi1) = derive_scalars(username, password);
    let c = RISTRETTO_BASEPOINT_POINT * pi1;
    pi1.zeroize();
    Verifier::new(pi0.to_bytes(), Bytes::copy_from_slice(&c.compress().to_bytes()))
}

// ============================================================================
// Client Role
// ============================================================================

/// Client (role A) login state between `start` and `finish`.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ClientLogin {
    pi0: Scalar,
    pi1: Scalar,
    x: Scalar,
    #[zeroize(skip)]
    u: [u8; ELEMENT_LEN],
    #[zeroize(skip)]
    username: Vec<u8>,
}

impl fmt::Debug for ClientLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientLogin").finish_non_exhaustive()
    }
}

impl ClientLogin {
    /// Starts the exchange, returning the public element `u` to send.
    pub fn start(username: &[u8], password: &[u8]) -> (Self, [u8; ELEMENT_LEN]) {
        let (pi0, pi1) = derive_scalars(username, password);
        let x = Scalar::random(&mut OsRng);
        let u = RISTRETTO_BASEPOINT_POINT * x + *BLIND_M * pi0;
        let u_bytes = u.compress().to_bytes();
        (
            Self {
                pi0,
                pi1,
                x,
                u: u_bytes,
                username: username.to_vec(),
            },
            u_bytes,
        )
    }

    /// Completes the exchange against the server element `v`.
    ///
    /// The caller must still check the server's confirmation tag with
    /// [`SessionKeys::verify_confirmation`] before trusting the key.
    pub fn finish(self, v_bytes: &[u8]) -> Result<SessionKeys, CryptoError> {
        let v = decompress(v_bytes)?;
        let unblinded = v - *BLIND_N * self.pi0;
        let z = unblinded * self.x;
        let vv = unblinded * self.pi1;
        if z == RistrettoPoint::identity() || vv == RistrettoPoint::identity() {
            return Err(CryptoError::IdentityElement);
        }

        let mut v_wire = [0u8; ELEMENT_LEN];
        v_wire.copy_from_slice(v_bytes);
        Ok(key_schedule(
            &self.username,
            &self.u,
            &v_wire,
            &z,
            &vv,
            &self.pi0,
        ))
    }
}

// ============================================================================
// Server Role
// ============================================================================

/// Server (role B) login state between `start` and `finish`.
///
/// On the gateway this is ephemeral: it is built from the quorum-decrypted
/// verifier and dies with the login transaction.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ServerLogin {
    pi0: Scalar,
    #[zeroize(skip)]
    c: RistrettoPoint,
    y: Scalar,
    #[zeroize(skip)]
    v: [u8; ELEMENT_LEN],
    #[zeroize(skip)]
    username: Vec<u8>,
}

impl fmt::Debug for ServerLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerLogin").finish_non_exhaustive()
    }
}

impl ServerLogin {
    /// Starts the server role from a stored verifier, returning the public
    /// element `v` to send.
    ///
    /// Rejects verifiers whose scalar or augmentation point is not a
    /// canonical encoding — a Byzantine quorum member cannot smuggle a
    /// malformed group element this far.
    pub fn start(username: &[u8], verifier: &Verifier) -> Result<(Self, [u8; ELEMENT_LEN]), CryptoError> {
        let pi0 = Option::<Scalar>::from(Scalar::from_canonical_bytes(verifier.pi0))
            .ok_or(CryptoError::InvalidScalar)?;
        let c = decompress(&verifier.c)?;

        let y = Scalar::random(&mut OsRng);
        let v = RISTRETTO_BASEPOINT_POINT * y + *BLIND_N * pi0;
        let v_bytes = v.compress().to_bytes();
        Ok((
            Self {
                pi0,
                c,
                y,
                v: v_bytes,
                username: username.to_vec(),
            },
            v_bytes,
        ))
    }

    /// Completes the exchange against the client element `u`.
    pub fn finish(self, u_bytes: &[u8]) -> Result<SessionKeys, CryptoError> {
        let u = decompress(u_bytes)?;
        let unblinded = u - *BLIND_M * self.pi0;
        let z = unblinded * self.y;
        let vv = self.c * self.y;
        if z == RistrettoPoint::identity() || vv == RistrettoPoint::identity() {
            return Err(CryptoError::IdentityElement);
        }

        let mut u_wire = [0u8; ELEMENT_LEN];
        u_wire.copy_from_slice(u_bytes);
        Ok(key_schedule(
            &self.username,
            &u_wire,
            &self.v,
            &z,
            &vv,
            &self.pi0,
        ))
    }
}

// ============================================================================
// Key Schedule
// ============================================================================

/// The keys both sides derive from a completed exchange.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    session: [u8; 32],
    confirm: [u8; 32],
    transcript_hash: [u8; 32],
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

impl SessionKeys {
    /// The negotiated session key.
    pub fn session_key(&self) -> &[u8; 32] {
        &self.session
    }

    /// The server's key confirmation tag: `HMAC(confirm_key, H(transcript))`.
    pub fn confirmation_tag(&self) -> [u8; CONFIRMATION_LEN] {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.confirm)
            .expect("HMAC accepts any key length");
        mac.update(&self.transcript_hash);
        mac.finalize().into_bytes().into()
    }

    /// Constant-time check of a received confirmation tag.
    pub fn verify_confirmation(&self, tag: &[u8]) -> bool {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.confirm)
            .expect("HMAC accepts any key length");
        mac.update(&self.transcript_hash);
        mac.verify_slice(tag).is_ok()
    }
}

/// Hashes the transcript and expands the session and confirmation keys.
///
/// Every component is length-prefixed so no two distinct transcripts
/// serialize to the same byte string.
fn key_schedule(
    username: &[u8],
    u: &[u8; ELEMENT_LEN],
    v: &[u8; ELEMENT_LEN],
    z: &RistrettoPoint,
    vv: &RistrettoPoint,
    pi0: &Scalar,
) -> SessionKeys {
    let mut transcript = Vec::with_capacity(256);
    for part in [
        username,
        u.as_slice(),
        v.as_slice(),
        z.compress().as_bytes(),
        vv.compress().as_bytes(),
        pi0.as_bytes(),
    ] {
        transcript.extend_from_slice(&(part.len() as u64).to_le_bytes());
        transcript.extend_from_slice(part);
    }

    let transcript_hash: [u8; 32] = Sha256::digest(&transcript).into();

    let hk = Hkdf::<Sha256>::new(Some(KEY_SCHEDULE_SALT), &transcript);
    let mut session = [0u8; 32];
    let mut confirm = [0u8; 32];
    hk.expand(INFO_SESSION_KEY, &mut session)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    hk.expand(INFO_CONFIRM_KEY, &mut confirm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    transcript.zeroize();

    SessionKeys {
        session,
        confirm,
        transcript_hash,
    }
}

/// Decompresses a canonical Ristretto encoding.
fn decompress(bytes: &[u8]) -> Result<RistrettoPoint, CryptoError> {
    let arr: [u8; ELEMENT_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidPoint)?;
    CompressedRistretto(arr)
        .decompress()
        .ok_or(CryptoError::InvalidPoint)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn run_exchange(
        enroll_password: &[u8],
        login_password: &[u8],
    ) -> (SessionKeys, SessionKeys) {
        let verifier = derive_verifier(b"alice", enroll_password);
        let (client, u) = ClientLogin::start(b"alice", login_password);
        let (server, v) = ServerLogin::start(b"alice", &verifier).unwrap();
        let server_keys = server.finish(&u).unwrap();
        let client_keys = client.finish(&v).unwrap();
        (client_keys, server_keys)
    }

    #[test]
    fn honest_exchange_agrees() {
        let (client, server) = run_exchange(b"hunter2", b"hunter2");
        assert_eq!(client.session_key(), server.session_key());
        assert!(client.verify_confirmation(&server.confirmation_tag()));
    }

    #[test]
    fn wrong_password_diverges() {
        let (client, server) = run_exchange(b"hunter2", b"hunter3");
        assert_ne!(client.session_key(), server.session_key());
        assert!(!client.verify_confirmation(&server.confirmation_tag()));
    }

    #[test]
    fn username_binds_the_verifier() {
        let verifier = derive_verifier(b"alice", b"hunter2");
        let (client, u) = ClientLogin::start(b"bob", b"hunter2");
        let (server, v) = ServerLogin::start(b"alice", &verifier).unwrap();
        let server_keys = server.finish(&u).unwrap();
        let client_keys = client.finish(&v).unwrap();
        assert_ne!(client_keys.session_key(), server_keys.session_key());
    }

    #[test]
    fn tampered_confirmation_rejected() {
        let (client, server) = run_exchange(b"hunter2", b"hunter2");
        let mut tag = server.confirmation_tag();
        tag[0] ^= 0x01;
        assert!(!client.verify_confirmation(&tag));
    }

    #[test]
    fn malformed_elements_rejected() {
        let verifier = derive_verifier(b"alice", b"pw");
        let (server, _) = ServerLogin::start(b"alice", &verifier).unwrap();
        assert!(matches!(
            server.finish(&[0xFF; 32]),
            Err(CryptoError::InvalidPoint)
        ));

        let (client, _) = ClientLogin::start(b"alice", b"pw");
        assert!(matches!(client.finish(b"short"), Err(CryptoError::InvalidPoint)));
    }

    #[test]
    fn non_canonical_verifier_scalar_rejected() {
        let verifier = Verifier::new([0xFF; 32], derive_verifier(b"alice", b"pw").c);
        assert!(matches!(
            ServerLogin::start(b"alice", &verifier),
            Err(CryptoError::InvalidScalar)
        ));
    }

    #[test]
    fn zeroed_client_element_rejected() {
        // u = π₀·M makes the unblinded client element the identity; the
        // server must refuse to derive a key from it.
        let verifier = derive_verifier(b"alice", b"pw");
        let (server, _) = ServerLogin::start(b"alice", &verifier).unwrap();
        let (pi0, _) = derive_scalars(b"alice", b"pw");
        let u = (*BLIND_M * pi0).compress();
        assert!(matches!(
            server.finish(u.as_bytes()),
            Err(CryptoError::IdentityElement)
        ));
    }

    #[test]
    fn exchanges_use_fresh_randomness() {
        let (_, u1) = ClientLogin::start(b"alice", b"pw");
        let (_, u2) = ClientLogin::start(b"alice", b"pw");
        assert_ne!(u1, u2);
    }
}
