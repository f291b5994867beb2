//! Length-prefixed framing for byte-stream ports.
//!
//! ## Wire format
//!
//! ```text
//! magic:     u32  (4)   "FBH0"
//! kind:      u32  (4)
//! flags:     u32  (4)
//! sequence:  u32  (4)
//! length:    u32  (4)
//! body:      [u8] (length, ≤ MAX_BODY_SIZE)
//! ```
//!
//! All integers are little-endian.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FramebufferError;
use crate::flags::MessageFlags;
use crate::protocol::{MAX_BODY_SIZE, RawMessage};

/// `"FBH0"` read as a little-endian `u32`.
pub const MAGIC: u32 = u32::from_le_bytes(*b"FBH0");

/// Encoded header size on the wire.
pub const HEADER_SIZE: usize = 20;

#[derive(Debug, Default, Clone, Copy)]
pub struct FramebufferCodec;

impl Decoder for FramebufferCodec {
    type Item = RawMessage;
    type Error = FramebufferError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &src[..HEADER_SIZE];
        let magic = header.get_u32_le();
        if magic != MAGIC {
            return Err(FramebufferError::InvalidMagic);
        }
        let kind = header.get_u32_le();
        let flags = MessageFlags::from_bits_truncate(header.get_u32_le());
        let sequence = header.get_u32_le();
        let length = header.get_u32_le() as usize;

        if length > MAX_BODY_SIZE {
            return Err(FramebufferError::MessageTooLarge {
                size: length,
                max: MAX_BODY_SIZE,
            });
        }

        if src.len() < HEADER_SIZE + length {
            src.reserve(HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let body = src.split_to(length).freeze();

        Ok(Some(RawMessage {
            kind,
            flags,
            sequence,
            body,
        }))
    }
}

impl Encoder<RawMessage> for FramebufferCodec {
    type Error = FramebufferError;

    fn encode(&mut self, item: RawMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.body.len() > MAX_BODY_SIZE {
            return Err(FramebufferError::MessageTooLarge {
                size: item.body.len(),
                max: MAX_BODY_SIZE,
            });
        }
        dst.reserve(HEADER_SIZE + item.body.len());
        dst.put_u32_le(MAGIC);
        dst.put_u32_le(item.kind);
        dst.put_u32_le(item.flags.bits());
        dst.put_u32_le(item.sequence);
        dst.put_u32_le(item.body.len() as u32);
        dst.extend_from_slice(&item.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;
    use crate::protocol::Request;

    fn encoded(msg: RawMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        FramebufferCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let msg = Request::Flush(Rect::new(0, 0, 8, 8))
            .encode(3, MessageFlags::empty())
            .unwrap();
        let full = encoded(msg.clone());

        let mut codec = FramebufferCodec;
        let mut partial = BytesMut::from(&full[..HEADER_SIZE + 2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[HEADER_SIZE + 2..]);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(msg));
        assert!(partial.is_empty());
    }

    #[test]
    fn back_to_back_frames_split_cleanly() {
        let a = Request::QueryDimensions.encode(1, MessageFlags::empty()).unwrap();
        let b = Request::Rotate { angle: 90.0 }.encode(2, MessageFlags::empty()).unwrap();
        let mut buf = encoded(a.clone());
        buf.extend_from_slice(&encoded(b.clone()));

        let mut codec = FramebufferCodec;
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(a));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(b));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn bad_magic_is_an_error() {
        let mut buf = BytesMut::from(&[0u8; HEADER_SIZE][..]);
        assert!(matches!(
            FramebufferCodec.decode(&mut buf),
            Err(FramebufferError::InvalidMagic)
        ));
    }

    #[test]
    fn oversized_length_is_rejected_before_buffering() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(MAGIC);
        buf.put_u32_le(0x05);
        buf.put_u32_le(0);
        buf.put_u32_le(1);
        buf.put_u32_le((MAX_BODY_SIZE + 1) as u32);
        assert!(matches!(
            FramebufferCodec.decode(&mut buf),
            Err(FramebufferError::MessageTooLarge { .. })
        ));
    }
}
