//! Notifications delivered to registered clients.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{FramebufferError, TerminalReason};
use crate::flags::MessageFlags;
use crate::geometry::{Dimensions, Rect};
use crate::message::MessageKind;
use crate::protocol::RawMessage;

/// Details of one dirty-region notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameUpdate {
    /// Monotonic per-service event counter.
    pub sequence: u64,
    /// Dirty region in backing-store pixels, clipped to the store.
    pub region: Rect,
    /// Dimensions of the store the region refers to.
    pub dimensions: Dimensions,
    /// The region covers the whole store.
    pub full_frame: bool,
}

/// What a client receives on its queue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FrameEvent {
    FrameUpdated(FrameUpdate),
    Rotated { sequence: u64, angle: f64 },
    /// Last event a client will ever see from this service.
    Terminated(TerminalReason),
}

impl FrameEvent {
    pub fn kind(&self) -> MessageKind {
        match self {
            FrameEvent::FrameUpdated(_) => MessageKind::FrameUpdated,
            FrameEvent::Rotated { .. } => MessageKind::Rotated,
            FrameEvent::Terminated(_) => MessageKind::Terminated,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FrameEvent::Terminated(_))
    }

    /// Encode as a notification message for a remote client.
    pub fn to_message(&self, sequence: u32) -> Result<RawMessage, FramebufferError> {
        let body = bincode::serialize(self)?;
        Ok(RawMessage::new(
            self.kind(),
            MessageFlags::NOTIFICATION,
            sequence,
            Bytes::from(body),
        ))
    }

    pub fn from_message(raw: &RawMessage) -> Result<Self, FramebufferError> {
        if !raw.flags.contains(MessageFlags::NOTIFICATION) {
            return Err(FramebufferError::Malformed("missing notification flag"));
        }
        Ok(bincode::deserialize(&raw.body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_event_is_flagged_notification() {
        let ev = FrameEvent::Terminated(TerminalReason::PortCancelled);
        let raw = ev.to_message(5).unwrap();
        assert_eq!(raw.message_kind().unwrap(), MessageKind::Terminated);
        assert!(raw.flags.contains(MessageFlags::NOTIFICATION));
        assert!(FrameEvent::from_message(&raw).unwrap().is_terminal());
    }

    #[test]
    fn reply_is_not_a_notification() {
        let raw = RawMessage::new(MessageKind::Ack, MessageFlags::REPLY, 1, Bytes::new());
        assert!(FrameEvent::from_message(&raw).is_err());
    }
}
