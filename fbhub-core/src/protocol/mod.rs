//! Message schema for framebuffer ports.
//!
//! # Wire Protocol
//!
//! Every message is a [`RawMessage`]: a kind, header flags, a sequence
//! number, and a `bincode` body. The framing on byte streams is done by
//! [`FramebufferCodec`](crate::codec::FramebufferCodec).
//!
//! ## Dimension query
//! ```text
//! Render server ──[QueryDimensions]──────────► Service
//! Service       ──[DimensionsReply + REPLY]──► Render server
//!   Payload: DimensionsReply (bincode), sent once the store exists
//! ```
//!
//! ## Flush / rotate (no reply)
//! ```text
//! Render server ──[Flush]────────────────────► Service   Payload: Rect
//! Render server ──[Rotate]───────────────────► Service   Payload: f64 degrees
//! ```
//!
//! ## Remote clients
//! ```text
//! Peer    ──[RegisterClient]─────────────────► Service   Payload: u64 token
//! Service ──[Ack + REPLY]────────────────────► Peer
//! Service ──[FrameUpdated + NOTIFICATION]────► Peer      (repeated)
//! ```

pub mod event;
pub mod reply;
pub mod request;

use bytes::Bytes;

use crate::flags::MessageFlags;
use crate::message::MessageKind;

pub use event::{FrameEvent, FrameUpdate};
pub use reply::{DimensionsReply, Reply};
pub use request::Request;

/// Maximum body size accepted on any port.
pub const MAX_BODY_SIZE: usize = 64 * 1024;

// ── RawMessage ───────────────────────────────────────────────────

/// One undecoded message as delivered by a port.
///
/// `kind` stays a raw `u32` so that unknown kinds survive framing and
/// can be dropped (and logged) by the receive pipeline instead of
/// tearing down the whole stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub kind: u32,
    pub flags: MessageFlags,
    pub sequence: u32,
    pub body: Bytes,
}

impl RawMessage {
    pub fn new(kind: MessageKind, flags: MessageFlags, sequence: u32, body: Bytes) -> Self {
        Self {
            kind: kind as u32,
            flags,
            sequence,
            body,
        }
    }

    /// Parse the kind discriminant.
    pub fn message_kind(&self) -> Result<MessageKind, crate::FramebufferError> {
        MessageKind::try_from(self.kind)
    }

    pub fn expects_reply(&self) -> bool {
        self.flags.contains(MessageFlags::EXPECTS_REPLY)
    }
}
