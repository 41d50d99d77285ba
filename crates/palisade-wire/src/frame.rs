//! Length framing.
//!
//! A receiver alternates between reading exactly four bytes (the big-endian
//! payload length) and exactly that many payload bytes. [`Frame::decode`]
//! runs against a growable read buffer and returns `None` until a complete
//! frame has arrived, so partial delivery needs no connection state beyond
//! the buffer itself.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::WireError;

/// Size of the length prefix in bytes.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Upper bound on a frame payload.
///
/// Nothing in the protocol legitimately approaches this; a larger length
/// prefix is a protocol violation, not a big message.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One length-delimited payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Bytes,
}

impl Frame {
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Attempts to decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// frame; consumed bytes are removed from `buf` only once a whole frame
    /// is available.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        if buf.len() < FRAME_HEADER_SIZE + len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(len).freeze();
        Ok(Some(Frame { payload }))
    }

    /// Appends the encoded frame to a write buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn roundtrip() {
        let frame = Frame::new(Bytes::from_static(b"{\"type\":\"IntroMessage\",\"id\":3}"));
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_header_is_incomplete() {
        let mut buf = BytesMut::from(&[0u8, 0][..]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn partial_body_is_incomplete() {
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.extend_from_slice(b"half");
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        // Nothing consumed until the full frame arrives.
        assert_eq!(buf.len(), FRAME_HEADER_SIZE + 4);
    }

    #[test]
    fn oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        assert!(matches!(
            Frame::decode(&mut buf),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn back_to_back_frames() {
        let mut buf = BytesMut::new();
        Frame::new(Bytes::from_static(b"one")).encode(&mut buf);
        Frame::new(Bytes::from_static(b"two")).encode(&mut buf);
        assert_eq!(Frame::decode(&mut buf).unwrap().unwrap().payload(), b"one");
        assert_eq!(Frame::decode(&mut buf).unwrap().unwrap().payload(), b"two");
        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }

    proptest! {
        /// A frame split across arbitrary chunk boundaries decodes once the
        /// final chunk lands, regardless of where the splits fall.
        #[test]
        fn chunked_arrival(payload in proptest::collection::vec(any::<u8>(), 0..512),
                           split in 0usize..520) {
            let frame = Frame::new(Bytes::from(payload));
            let mut wire = BytesMut::new();
            frame.encode(&mut wire);

            let split = split.min(wire.len());
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&wire[..split]);
            if split < FRAME_HEADER_SIZE + frame.payload().len() {
                prop_assert!(Frame::decode(&mut buf).unwrap().is_none());
            }
            buf.extend_from_slice(&wire[split..]);
            let decoded = Frame::decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded.payload(), frame.payload());
        }
    }
}
