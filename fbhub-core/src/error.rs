//! Domain-specific error types for the framebuffer service.
//!
//! All fallible operations return `Result<T, FramebufferError>`.
//! Nothing here panics on bad input from a peer; every failure is typed
//! so callers can tell a construction problem from a dead reply path.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::geometry::Dimensions;

/// The canonical error type for the framebuffer service.
#[derive(Debug, Error)]
pub enum FramebufferError {
    // ── Construction Errors ──────────────────────────────────────
    /// The port's message source is gone or was never valid.
    #[error("invalid port: message source is not receiving")]
    InvalidPort,

    /// Another service already owns the port's message source.
    #[error("port is already bound to a framebuffer service")]
    PortAlreadyBound,

    /// No service with this name is published on the device.
    #[error("no framebuffer service named {name:?} on device {device}")]
    UnknownService { name: String, device: String },

    /// The device has not finished booting.
    #[error("device {0} is not booted")]
    DeviceNotBooted(String),

    /// The device does not publish a main screen.
    #[error("device {0} has no main screen")]
    NoMainScreen(String),

    /// A Tokio runtime is required to spawn the service pipelines.
    #[error("no tokio runtime available to host the service")]
    NoRuntime,

    // ── Geometry / Store Errors ──────────────────────────────────
    /// A dimension pair had a non-positive component.
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(Dimensions),

    /// A rotation angle was NaN or infinite.
    #[error("invalid rotation angle: {0}")]
    InvalidAngle(f64),

    /// The backing store could not be allocated at the requested size.
    #[error("backing store too large: {size} bytes (max {max})")]
    BackingStoreTooLarge { size: u64, max: u64 },

    // ── Protocol Errors ──────────────────────────────────────────
    /// Received bytes that do not start with the framebuffer magic.
    #[error("invalid magic bytes: expected FBH0")]
    InvalidMagic,

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// A message body did not match what its kind requires.
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    /// Frame size exceeded the codec limit.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Encoding or decoding of a body failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    // ── Reply Errors ─────────────────────────────────────────────
    /// The peer no longer has a reply path.
    #[error("reply failed: peer {0} is gone")]
    PeerGone(u64),

    /// The peer's outbound queue is full.
    #[error("reply failed: queue for peer {0} is full")]
    ReplyQueueFull(u64),

    // ── Lifecycle Errors ─────────────────────────────────────────
    /// The service was invalidated; nothing further can be done with it.
    #[error("service terminated: {0}")]
    Terminated(TerminalReason),

    /// A pipeline state machine was asked for a transition it does not allow.
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),

    /// An internal channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    // ── I/O ──────────────────────────────────────────────────────
    /// The socket layer reported an error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── TerminalReason ───────────────────────────────────────────────

/// Why a service stopped for good.
///
/// Cloned into a [`FrameEvent::Terminated`](crate::FrameEvent) for every
/// registered client when the service is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminalReason {
    /// `invalidate()` was called.
    Invalidated,
    /// The message source was cancelled from outside (port deallocated,
    /// every peer exited).
    PortCancelled,
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalReason::Invalidated => write!(f, "invalidated"),
            TerminalReason::PortCancelled => write!(f, "port cancelled"),
        }
    }
}

// ── PostError ────────────────────────────────────────────────────

/// Failure to hand a notification to a client queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PostError {
    /// The client is not keeping up; this notification was skipped.
    #[error("client queue is full")]
    Full,

    /// The client went away; its registration should be dropped.
    #[error("client queue is disconnected")]
    Disconnected,
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for FramebufferError {
    fn from(s: String) -> Self {
        FramebufferError::Other(s)
    }
}

impl From<&str> for FramebufferError {
    fn from(s: &str) -> Self {
        FramebufferError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for FramebufferError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        FramebufferError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for FramebufferError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        FramebufferError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for FramebufferError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        FramebufferError::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Size;

    #[test]
    fn error_display_messages() {
        let e = FramebufferError::UnknownService {
            name: "tv-out".into(),
            device: "A1B2".into(),
        };
        assert!(e.to_string().contains("tv-out"));
        assert!(e.to_string().contains("A1B2"));

        let e = FramebufferError::BackingStoreTooLarge { size: 1000, max: 500 };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));

        let dims = Dimensions::new(Size::new(0, 10), Size::new(10, 10));
        let e = FramebufferError::InvalidDimensions(dims);
        assert!(e.to_string().contains("0x10"));
    }

    #[test]
    fn terminated_carries_reason() {
        let e = FramebufferError::Terminated(TerminalReason::PortCancelled);
        assert_eq!(e.to_string(), "service terminated: port cancelled");
    }

    #[test]
    fn from_string() {
        let e: FramebufferError = "something broke".into();
        assert!(matches!(e, FramebufferError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: FramebufferError = io_err.into();
        assert!(matches!(e, FramebufferError::Io(_)));
    }
}
