//! Protocol messages.
//!
//! This module defines all messages used in the put/get quorum protocol and
//! the user-facing enroll/login exchange:
//!
//! ## User ↔ Gateway
//! - [`EnrollRequest`] / [`EnrollResponse`] — register a username/password
//! - [`LoginRequest`] / [`LoginResponse`] — SPAKE2+ exchange
//!
//! ## Gateway ↔ Replicas (replicated write)
//! - [`PutMessage`] — Gateway → Replica: commit this verifier blob
//! - [`PutAcceptMessage`] — Replica → Replica: I accept this Put
//! - [`PutCompleteMessage`] — Replica → Gateway: the Put is stored
//!
//! ## Gateway ↔ Replicas (threshold read)
//! - [`GetMessage`] — Gateway → Replica: reconstruct this verifier
//! - [`DecryptionShareMessage`] — Replica → Replica: my share of the
//!   stored ciphertext
//! - [`GetResponseMessage`] — Replica → Gateway: the recovered blob
//!
//! ## Connection management
//! - [`IntroMessage`] — first message on every outbound connection
//!
//! Every replica- and gateway-originated message is signed over its
//! canonical postcard encoding minus the `sig` field (JSON is the wire
//! encoding but is not canonical, so signatures never cover it). Messages
//! that embed another message verify the embedded signature too.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use palisade_crypto::SignatureService;
use palisade_types::{NodeId, Timestamp, Username};

// ============================================================================
// Base64 field encoding
// ============================================================================

mod b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

mod b64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Canonical bytes for signing.
///
/// The tuple of signed fields is serialized with postcard; serialization of
/// these plain-data types cannot fail.
macro_rules! signable {
    ($($field:expr),+ $(,)?) => {
        postcard::to_allocvec(&($(&$field),+))
            .expect("message fields are plain data and always serialize")
    };
}

// ============================================================================
// Message Envelope
// ============================================================================

/// A protocol message, tagged on the wire by a `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// First message on every outbound connection.
    #[serde(rename = "IntroMessage")]
    Intro(IntroMessage),

    /// User → Gateway: register a username/password.
    EnrollRequest(EnrollRequest),

    /// Gateway → User: enrollment committed.
    EnrollResponse(EnrollResponse),

    /// User → Gateway: begin a SPAKE2+ login.
    LoginRequest(LoginRequest),

    /// Gateway → User: SPAKE2+ server element plus key confirmation.
    LoginResponse(LoginResponse),

    /// Gateway → Replica: commit this verifier blob.
    #[serde(rename = "PutMessage")]
    Put(PutMessage),

    /// Replica → Replica: I accept this Put.
    #[serde(rename = "PutAcceptMessage")]
    PutAccept(PutAcceptMessage),

    /// Replica → Gateway: the Put is stored.
    #[serde(rename = "PutCompleteMessage")]
    PutComplete(PutCompleteMessage),

    /// Gateway → Replica: reconstruct the verifier under this username.
    #[serde(rename = "GetMessage")]
    Get(GetMessage),

    /// Replica → Replica: my decryption share for this Get.
    #[serde(rename = "DecryptionShareMessage")]
    DecryptionShare(DecryptionShareMessage),

    /// Replica → Gateway: the recovered verifier blob.
    #[serde(rename = "GetResponseMessage")]
    GetResponse(GetResponseMessage),
}

impl Message {
    /// Returns a human-readable name for the message type.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Intro(_) => "IntroMessage",
            Message::EnrollRequest(_) => "EnrollRequest",
            Message::EnrollResponse(_) => "EnrollResponse",
            Message::LoginRequest(_) => "LoginRequest",
            Message::LoginResponse(_) => "LoginResponse",
            Message::Put(_) => "PutMessage",
            Message::PutAccept(_) => "PutAcceptMessage",
            Message::PutComplete(_) => "PutCompleteMessage",
            Message::Get(_) => "GetMessage",
            Message::DecryptionShare(_) => "DecryptionShareMessage",
            Message::GetResponse(_) => "GetResponseMessage",
        }
    }

    /// Verifies every signature this message carries, embedded messages
    /// included.
    ///
    /// User-originated messages and responses to users are unsigned (users
    /// are outside the signing directory); they verify trivially. Quorum
    /// messages with a bad or missing signature must not reach a state
    /// machine.
    pub fn verify(&self, signatures: &SignatureService) -> bool {
        match self {
            Message::Intro(_)
            | Message::EnrollRequest(_)
            | Message::EnrollResponse(_)
            | Message::LoginRequest(_)
            | Message::LoginResponse(_) => true,
            Message::Put(m) => m.verify(signatures),
            Message::PutAccept(m) => m.verify(signatures),
            Message::PutComplete(m) => m.verify(signatures),
            Message::Get(m) => m.verify(signatures),
            Message::DecryptionShare(m) => m.verify(signatures),
            Message::GetResponse(m) => m.verify(signatures),
        }
    }

    /// Serializes to the JSON wire encoding.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("message enums always serialize to JSON")
    }

    /// Parses the JSON wire encoding.
    pub fn from_json(bytes: &[u8]) -> Result<Self, crate::WireError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ============================================================================
// Connection Management
// ============================================================================

/// Identifies the initiating node; sent first on every outbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroMessage {
    pub id: NodeId,
}

// ============================================================================
// User ↔ Gateway
// ============================================================================

/// User → Gateway: register `username` under `password`.
///
/// The password travels to the gateway, which derives the verifier and
/// discards it; it never reaches a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub username: Username,
    pub password: String,
    pub user_id: NodeId,
    pub timestamp: Timestamp,
}

/// Gateway → User: the enrollment was committed by a replica quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub username: Username,
    pub timestamp: Timestamp,
}

/// User → Gateway: begin a login; `u` is the SPAKE2+ client element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: Username,
    #[serde(with = "b64")]
    pub u: Vec<u8>,
    pub user_id: NodeId,
    pub timestamp: Timestamp,
}

/// Gateway → User: the SPAKE2+ server element and key confirmation tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub username: Username,
    #[serde(with = "b64")]
    pub v: Vec<u8>,
    #[serde(with = "b64")]
    pub confirmation: Vec<u8>,
    pub timestamp: Timestamp,
}

// ============================================================================
// Replicated Write
// ============================================================================

/// Gateway → Replica: commit `secret` (a verifier blob) under `key`.
///
/// Also travels embedded inside [`PutAcceptMessage`] and
/// [`PutCompleteMessage`], so a replica that sees an accept before the Put
/// itself can still drive the transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutMessage {
    pub key: Username,
    #[serde(with = "b64_bytes")]
    pub secret: Bytes,
    pub client_id: NodeId,
    pub timestamp: Timestamp,
    #[serde(with = "b64")]
    pub sig: Vec<u8>,
}

impl PutMessage {
    pub fn new(
        key: Username,
        secret: Bytes,
        timestamp: Timestamp,
        signatures: &SignatureService,
    ) -> Self {
        let client_id = signatures.id();
        let sig = signatures
            .sign(&signable!(key, secret, client_id, timestamp))
            .to_vec();
        Self {
            key,
            secret,
            client_id,
            timestamp,
            sig,
        }
    }

    pub fn verify(&self, signatures: &SignatureService) -> bool {
        signatures.verify(
            self.client_id,
            &signable!(self.key, self.secret, self.client_id, self.timestamp),
            &self.sig,
        )
    }
}

/// Replica → Replica: acceptance of an embedded Put.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutAcceptMessage {
    pub put_msg: PutMessage,
    pub sender_id: NodeId,
    #[serde(with = "b64")]
    pub sig: Vec<u8>,
}

impl PutAcceptMessage {
    pub fn new(put_msg: PutMessage, signatures: &SignatureService) -> Self {
        let sender_id = signatures.id();
        let sig = signatures.sign(&signable!(put_msg, sender_id)).to_vec();
        Self {
            put_msg,
            sender_id,
            sig,
        }
    }

    /// Verifies this accept's signature and the embedded Put's.
    pub fn verify(&self, signatures: &SignatureService) -> bool {
        signatures.verify(
            self.sender_id,
            &signable!(self.put_msg, self.sender_id),
            &self.sig,
        ) && self.put_msg.verify(signatures)
    }
}

/// Replica → Gateway: the embedded Put has been durably stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutCompleteMessage {
    pub put_msg: PutMessage,
    pub sender_id: NodeId,
    #[serde(with = "b64")]
    pub sig: Vec<u8>,
}

impl PutCompleteMessage {
    pub fn new(put_msg: PutMessage, signatures: &SignatureService) -> Self {
        let sender_id = signatures.id();
        let sig = signatures.sign(&signable!(put_msg, sender_id)).to_vec();
        Self {
            put_msg,
            sender_id,
            sig,
        }
    }

    pub fn verify(&self, signatures: &SignatureService) -> bool {
        signatures.verify(
            self.sender_id,
            &signable!(self.put_msg, self.sender_id),
            &self.sig,
        ) && self.put_msg.verify(signatures)
    }
}

// ============================================================================
// Threshold Read
// ============================================================================

/// Gateway → Replica: reconstruct the verifier stored under `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetMessage {
    pub key: Username,
    pub client_id: NodeId,
    pub timestamp: Timestamp,
    #[serde(with = "b64")]
    pub sig: Vec<u8>,
}

impl GetMessage {
    pub fn new(key: Username, timestamp: Timestamp, signatures: &SignatureService) -> Self {
        let client_id = signatures.id();
        let sig = signatures
            .sign(&signable!(key, client_id, timestamp))
            .to_vec();
        Self {
            key,
            client_id,
            timestamp,
            sig,
        }
    }

    pub fn verify(&self, signatures: &SignatureService) -> bool {
        signatures.verify(
            self.client_id,
            &signable!(self.key, self.client_id, self.timestamp),
            &self.sig,
        )
    }
}

/// Replica → Replica: one decryption share for the embedded Get.
///
/// The share bytes are the compressed partial-decryption point; they are
/// only meaningful against the ciphertext the receiving replica loaded for
/// the same username.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionShareMessage {
    #[serde(with = "b64")]
    pub decryption_share: Vec<u8>,
    pub sender_id: NodeId,
    pub get_msg: GetMessage,
    #[serde(with = "b64")]
    pub sig: Vec<u8>,
}

impl DecryptionShareMessage {
    pub fn new(
        decryption_share: Vec<u8>,
        get_msg: GetMessage,
        signatures: &SignatureService,
    ) -> Self {
        let sender_id = signatures.id();
        let sig = signatures
            .sign(&signable!(decryption_share, sender_id, get_msg))
            .to_vec();
        Self {
            decryption_share,
            sender_id,
            get_msg,
            sig,
        }
    }

    pub fn verify(&self, signatures: &SignatureService) -> bool {
        signatures.verify(
            self.sender_id,
            &signable!(self.decryption_share, self.sender_id, self.get_msg),
            &self.sig,
        ) && self.get_msg.verify(signatures)
    }
}

/// Replica → Gateway: the verifier blob recovered for the embedded Get.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResponseMessage {
    pub get_msg: GetMessage,
    #[serde(with = "b64_bytes")]
    pub secret: Bytes,
    pub sender_id: NodeId,
    #[serde(with = "b64")]
    pub sig: Vec<u8>,
}

impl GetResponseMessage {
    pub fn new(get_msg: GetMessage, secret: Bytes, signatures: &SignatureService) -> Self {
        let sender_id = signatures.id();
        let sig = signatures
            .sign(&signable!(get_msg, secret, sender_id))
            .to_vec();
        Self {
            get_msg,
            secret,
            sender_id,
            sig,
        }
    }

    pub fn verify(&self, signatures: &SignatureService) -> bool {
        signatures.verify(
            self.sender_id,
            &signable!(self.get_msg, self.secret, self.sender_id),
            &self.sig,
        ) && self.get_msg.verify(signatures)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_crypto::KeyDirectory;

    fn services(n: u8) -> Vec<SignatureService> {
        let keypairs: Vec<_> = (0..n).map(|_| SignatureService::generate_keypair()).collect();
        let mut directory = KeyDirectory::new();
        for (i, (_, public)) in keypairs.iter().enumerate() {
            directory.insert(NodeId::new(i as u8), public).unwrap();
        }
        keypairs
            .iter()
            .enumerate()
            .map(|(i, (seed, _))| {
                SignatureService::new(NodeId::new(i as u8), seed, directory.clone()).unwrap()
            })
            .collect()
    }

    fn sample_put(signatures: &SignatureService) -> PutMessage {
        PutMessage::new(
            "alice".into(),
            Bytes::from_static(b"verifier-blob"),
            Timestamp::new(100),
            signatures,
        )
    }

    #[test]
    fn intro_wire_shape() {
        let json = Message::Intro(IntroMessage { id: NodeId::new(5) }).to_json();
        assert_eq!(
            String::from_utf8(json).unwrap(),
            r#"{"type":"IntroMessage","id":5}"#
        );
    }

    #[test]
    fn tagged_names_match_the_schema() {
        let svc = &services(1)[0];
        let put = sample_put(svc);
        for (msg, expected) in [
            (Message::Put(put.clone()), "PutMessage"),
            (
                Message::PutAccept(PutAcceptMessage::new(put.clone(), svc)),
                "PutAcceptMessage",
            ),
            (
                Message::PutComplete(PutCompleteMessage::new(put, svc)),
                "PutCompleteMessage",
            ),
        ] {
            let value: serde_json::Value = serde_json::from_slice(&msg.to_json()).unwrap();
            assert_eq!(value["type"], expected);
            assert_eq!(msg.name(), expected);
        }
    }

    #[test]
    fn json_roundtrip_every_variant() {
        let svc = &services(2)[0];
        let put = sample_put(svc);
        let get = GetMessage::new("alice".into(), Timestamp::new(200), svc);
        let variants = vec![
            Message::Intro(IntroMessage { id: NodeId::new(9) }),
            Message::EnrollRequest(EnrollRequest {
                username: "alice".into(),
                password: "hunter2".into(),
                user_id: NodeId::new(9),
                timestamp: Timestamp::new(1),
            }),
            Message::EnrollResponse(EnrollResponse {
                username: "alice".into(),
                timestamp: Timestamp::new(1),
            }),
            Message::LoginRequest(LoginRequest {
                username: "alice".into(),
                u: vec![1, 2, 3],
                user_id: NodeId::new(9),
                timestamp: Timestamp::new(2),
            }),
            Message::LoginResponse(LoginResponse {
                username: "alice".into(),
                v: vec![4, 5, 6],
                confirmation: vec![7, 8],
                timestamp: Timestamp::new(2),
            }),
            Message::Put(put.clone()),
            Message::PutAccept(PutAcceptMessage::new(put.clone(), svc)),
            Message::PutComplete(PutCompleteMessage::new(put, svc)),
            Message::Get(get.clone()),
            Message::DecryptionShare(DecryptionShareMessage::new(vec![0xAB; 32], get.clone(), svc)),
            Message::GetResponse(GetResponseMessage::new(
                get,
                Bytes::from_static(b"blob"),
                svc,
            )),
        ];
        for msg in variants {
            let back = Message::from_json(&msg.to_json()).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn signed_messages_verify() {
        let svcs = services(2);
        let put = sample_put(&svcs[0]);
        let accept = PutAcceptMessage::new(put.clone(), &svcs[1]);
        assert!(Message::Put(put).verify(&svcs[1]));
        assert!(Message::PutAccept(accept).verify(&svcs[0]));
    }

    #[test]
    fn tampered_field_fails_verification() {
        let svcs = services(2);
        let mut put = sample_put(&svcs[0]);
        put.secret = Bytes::from_static(b"swapped-blob");
        assert!(!put.verify(&svcs[1]));
    }

    #[test]
    fn tampered_embedded_put_fails_outer_verification() {
        let svcs = services(2);
        let put = sample_put(&svcs[0]);
        let mut accept = PutAcceptMessage::new(put, &svcs[1]);
        accept.put_msg.secret = Bytes::from_static(b"swapped-blob");
        // Re-sign the outer message so only the inner signature is stale.
        let resigned = PutAcceptMessage::new(accept.put_msg, &svcs[1]);
        assert!(!resigned.verify(&svcs[0]));
    }

    #[test]
    fn forged_sender_fails_verification() {
        let svcs = services(3);
        let put = sample_put(&svcs[0]);
        let mut accept = PutAcceptMessage::new(put, &svcs[1]);
        // Claim the accept came from replica 2.
        accept.sender_id = NodeId::new(2);
        assert!(!accept.verify(&svcs[0]));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(Message::from_json(br#"{"type":"FlushMessage"}"#).is_err());
    }

    #[test]
    fn user_messages_are_exempt_from_signing() {
        let svc = &services(1)[0];
        let msg = Message::EnrollRequest(EnrollRequest {
            username: "alice".into(),
            password: "hunter2".into(),
            user_id: NodeId::new(9),
            timestamp: Timestamp::new(1),
        });
        assert!(msg.verify(svc));
    }
}
