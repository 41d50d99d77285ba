//! # palisade-wire: Wire protocol for Palisade
//!
//! Two layers:
//!
//! - [`frame`] — length framing: every message travels as a 4-byte
//!   big-endian length prefix followed by a UTF-8 JSON body of exactly that
//!   length.
//! - [`message`] — the tagged JSON message model, plus signing and
//!   boundary verification. Every replica- and gateway-originated message
//!   carries an Ed25519 signature over its canonical (postcard) encoding
//!   minus the `sig` field; receivers verify before any state effect,
//!   including the signatures of embedded messages.

pub mod frame;
pub mod message;

use thiserror::Error;

pub use frame::{FRAME_HEADER_SIZE, Frame, MAX_FRAME_LEN};
pub use message::{
    DecryptionShareMessage, EnrollRequest, EnrollResponse, GetMessage, GetResponseMessage,
    IntroMessage, LoginRequest, LoginResponse, Message, PutAcceptMessage, PutCompleteMessage,
    PutMessage,
};

/// Errors from framing and message codecs.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed message body: {0}")]
    Json(#[from] serde_json::Error),
}
