//! Replies the service sends back to a render server.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::FramebufferError;
use crate::flags::MessageFlags;
use crate::geometry::Dimensions;
use crate::message::MessageKind;
use crate::protocol::RawMessage;

/// Answer to `QueryDimensions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionsReply {
    /// Dimensions of the backing store now in place.
    pub dimensions: Dimensions,
    /// Bumped every time a new store is allocated.
    pub generation: u64,
    /// Whether a full-frame flush has ever been received.
    pub have_received_full_flush: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Dimensions(DimensionsReply),
    Ack,
    Rejected(String),
}

impl Reply {
    pub fn kind(&self) -> MessageKind {
        match self {
            Reply::Dimensions(_) => MessageKind::DimensionsReply,
            Reply::Ack => MessageKind::Ack,
            Reply::Rejected(_) => MessageKind::Rejected,
        }
    }

    /// Encode as an answer to the request with `sequence`.
    pub fn encode(&self, sequence: u32) -> Result<RawMessage, FramebufferError> {
        let body = match self {
            Reply::Dimensions(d) => bincode::serialize(d)?,
            Reply::Ack => Vec::new(),
            Reply::Rejected(reason) => bincode::serialize(reason)?,
        };
        Ok(RawMessage::new(
            self.kind(),
            MessageFlags::REPLY,
            sequence,
            Bytes::from(body),
        ))
    }

    /// Decode a reply, as a render server would on its side.
    pub fn decode(raw: &RawMessage) -> Result<Self, FramebufferError> {
        match raw.message_kind()? {
            MessageKind::DimensionsReply => Ok(Reply::Dimensions(bincode::deserialize(&raw.body)?)),
            MessageKind::Ack => Ok(Reply::Ack),
            MessageKind::Rejected => Ok(Reply::Rejected(bincode::deserialize(&raw.body)?)),
            _ => Err(FramebufferError::Malformed("not a reply kind")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Size;

    #[test]
    fn dimensions_reply_echoes_sequence() {
        let reply = Reply::Dimensions(DimensionsReply {
            dimensions: Dimensions::new(Size::new(320, 480), Size::new(640, 960)),
            generation: 3,
            have_received_full_flush: false,
        });
        let raw = reply.encode(99).unwrap();
        assert_eq!(raw.sequence, 99);
        assert!(raw.flags.contains(MessageFlags::REPLY));
        assert_eq!(Reply::decode(&raw).unwrap(), reply);
    }

    #[test]
    fn rejected_carries_reason() {
        let raw = Reply::Rejected("invalid dimensions".into()).encode(1).unwrap();
        match Reply::decode(&raw).unwrap() {
            Reply::Rejected(reason) => assert!(reason.contains("invalid")),
            other => panic!("unexpected reply {other:?}"),
        }
    }
}
