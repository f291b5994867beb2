//! Message kind discriminants carried in every frame header.
//!
//! Uses proper enums with `TryFrom`; no panics on unknown values.

use crate::error::FramebufferError;
use std::fmt;

// ── MessageKind ──────────────────────────────────────────────────

/// Every message kind understood on a framebuffer port.
///
/// Organized by direction:
/// - `0x01..0x7F`: requests (render server → service)
/// - `0x80..0x8F`: replies (service → render server)
/// - `0x90..0x9F`: notifications (service → remote client)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    // ── Requests (0x0x) ──────────────────────────────────────────
    /// Ask for the current dimensions; creates the store if needed.
    QueryDimensions = 0x01,
    /// Request new device/scaled dimensions.
    SetDimensions = 0x02,
    /// Register the sending peer as a notification client.
    RegisterClient = 0x03,
    /// Drop a client registered by the sending peer.
    UnregisterClient = 0x04,
    /// A region of the backing store was written.
    Flush = 0x05,
    /// The device rotated.
    Rotate = 0x06,

    // ── Replies (0x8x) ───────────────────────────────────────────
    /// Current dimensions and store generation.
    DimensionsReply = 0x81,
    /// Request accepted.
    Ack = 0x82,
    /// Request refused before any state changed.
    Rejected = 0x83,

    // ── Notifications (0x9x) ─────────────────────────────────────
    /// New frame content is available.
    FrameUpdated = 0x91,
    /// Device orientation changed.
    Rotated = 0x92,
    /// The service is gone.
    Terminated = 0x93,
}

impl TryFrom<u32> for MessageKind {
    type Error = FramebufferError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageKind::QueryDimensions),
            0x02 => Ok(MessageKind::SetDimensions),
            0x03 => Ok(MessageKind::RegisterClient),
            0x04 => Ok(MessageKind::UnregisterClient),
            0x05 => Ok(MessageKind::Flush),
            0x06 => Ok(MessageKind::Rotate),

            0x81 => Ok(MessageKind::DimensionsReply),
            0x82 => Ok(MessageKind::Ack),
            0x83 => Ok(MessageKind::Rejected),

            0x91 => Ok(MessageKind::FrameUpdated),
            0x92 => Ok(MessageKind::Rotated),
            0x93 => Ok(MessageKind::Terminated),

            _ => Err(FramebufferError::UnknownVariant {
                type_name: "MessageKind",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl MessageKind {
    /// Returns `true` if the service always answers this request.
    pub fn always_replies(&self) -> bool {
        matches!(self, MessageKind::QueryDimensions | MessageKind::RegisterClient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrip() {
        let kinds = [
            MessageKind::QueryDimensions,
            MessageKind::SetDimensions,
            MessageKind::RegisterClient,
            MessageKind::UnregisterClient,
            MessageKind::Flush,
            MessageKind::Rotate,
            MessageKind::DimensionsReply,
            MessageKind::Ack,
            MessageKind::Rejected,
            MessageKind::FrameUpdated,
            MessageKind::Rotated,
            MessageKind::Terminated,
        ];
        for kind in kinds {
            assert_eq!(MessageKind::try_from(kind as u32).unwrap(), kind);
        }
    }

    #[test]
    fn kind_invalid() {
        assert!(MessageKind::try_from(0xDEAD).is_err());
        assert!(MessageKind::try_from(0x00).is_err());
    }

    #[test]
    fn reply_policy() {
        assert!(MessageKind::QueryDimensions.always_replies());
        assert!(!MessageKind::Flush.always_replies());
    }
}
