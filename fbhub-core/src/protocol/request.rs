//! Requests a render server sends to the service.

use bytes::Bytes;

use crate::error::FramebufferError;
use crate::flags::MessageFlags;
use crate::geometry::{Dimensions, Rect};
use crate::message::MessageKind;
use crate::protocol::{MAX_BODY_SIZE, RawMessage};

/// A decoded inbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    QueryDimensions,
    SetDimensions(Dimensions),
    RegisterClient { token: u64 },
    UnregisterClient { token: u64 },
    Flush(Rect),
    Rotate { angle: f64 },
}

impl Request {
    pub fn kind(&self) -> MessageKind {
        match self {
            Request::QueryDimensions => MessageKind::QueryDimensions,
            Request::SetDimensions(_) => MessageKind::SetDimensions,
            Request::RegisterClient { .. } => MessageKind::RegisterClient,
            Request::UnregisterClient { .. } => MessageKind::UnregisterClient,
            Request::Flush(_) => MessageKind::Flush,
            Request::Rotate { .. } => MessageKind::Rotate,
        }
    }

    /// Decode a raw message into a request.
    ///
    /// Fails for unknown kinds, reply/notification kinds, oversized
    /// bodies, and bodies that do not deserialize.
    pub fn decode(raw: &RawMessage) -> Result<Self, FramebufferError> {
        if raw.body.len() > MAX_BODY_SIZE {
            return Err(FramebufferError::MessageTooLarge {
                size: raw.body.len(),
                max: MAX_BODY_SIZE,
            });
        }
        let kind = raw.message_kind()?;
        let body = &raw.body[..];
        match kind {
            MessageKind::QueryDimensions => Ok(Request::QueryDimensions),
            MessageKind::SetDimensions => Ok(Request::SetDimensions(bincode::deserialize(body)?)),
            MessageKind::RegisterClient => Ok(Request::RegisterClient {
                token: bincode::deserialize(body)?,
            }),
            MessageKind::UnregisterClient => Ok(Request::UnregisterClient {
                token: bincode::deserialize(body)?,
            }),
            MessageKind::Flush => Ok(Request::Flush(bincode::deserialize(body)?)),
            MessageKind::Rotate => Ok(Request::Rotate {
                angle: bincode::deserialize(body)?,
            }),
            _ => Err(FramebufferError::Malformed("not a request kind")),
        }
    }

    /// Encode into a message, as a render server would send it.
    pub fn encode(&self, sequence: u32, flags: MessageFlags) -> Result<RawMessage, FramebufferError> {
        let body = match self {
            Request::QueryDimensions => Vec::new(),
            Request::SetDimensions(dims) => bincode::serialize(dims)?,
            Request::RegisterClient { token } | Request::UnregisterClient { token } => {
                bincode::serialize(token)?
            }
            Request::Flush(rect) => bincode::serialize(rect)?,
            Request::Rotate { angle } => bincode::serialize(angle)?,
        };
        Ok(RawMessage::new(self.kind(), flags, sequence, Bytes::from(body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Size;

    #[test]
    fn flush_decodes_rect() {
        let raw = Request::Flush(Rect::new(1, 2, 3, 4))
            .encode(7, MessageFlags::empty())
            .unwrap();
        assert_eq!(raw.sequence, 7);
        assert_eq!(Request::decode(&raw).unwrap(), Request::Flush(Rect::new(1, 2, 3, 4)));
    }

    #[test]
    fn set_dimensions_keeps_negative_components() {
        // Validation is the pipeline's job, decoding must not hide bad input.
        let dims = Dimensions::new(Size::new(-1, 10), Size::new(10, 10));
        let raw = Request::SetDimensions(dims).encode(1, MessageFlags::empty()).unwrap();
        assert_eq!(Request::decode(&raw).unwrap(), Request::SetDimensions(dims));
    }

    #[test]
    fn truncated_body_is_malformed() {
        let raw = RawMessage::new(
            MessageKind::Flush,
            MessageFlags::empty(),
            1,
            Bytes::from_static(&[1, 2, 3]),
        );
        assert!(matches!(Request::decode(&raw), Err(FramebufferError::Encoding(_))));
    }

    #[test]
    fn unknown_kind_rejected() {
        let raw = RawMessage {
            kind: 0x42,
            flags: MessageFlags::empty(),
            sequence: 1,
            body: Bytes::new(),
        };
        assert!(matches!(
            Request::decode(&raw),
            Err(FramebufferError::UnknownVariant { .. })
        ));
    }

    #[test]
    fn reply_kind_is_not_a_request() {
        let raw = RawMessage::new(MessageKind::Ack, MessageFlags::REPLY, 1, Bytes::new());
        assert!(matches!(Request::decode(&raw), Err(FramebufferError::Malformed(_))));
    }
}
