//! Message ports: where render-server traffic enters the service.
//!
//! A [`Port`] is a cloneable handle (it can sit in a device's name table
//! and be looked up many times) around exactly one [`MessageSource`].
//! Binding a service to the port takes the source out, so a port can be
//! bound at most once.
//!
//! A source offers the three capabilities the service relies on:
//!
//! | Capability     | Method                                   |
//! |----------------|------------------------------------------|
//! | receive-next   | [`MessageSource::recv`] / `try_recv`     |
//! | send-reply     | [`ReplySender::send_reply`]              |
//! | cancel-notify  | `recv` returning `None`                  |
//!
//! Two transports ship with the crate: [`channel`] (in-process) and
//! [`unix`] (Unix domain sockets).

pub mod channel;
#[cfg(unix)]
pub mod unix;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::FramebufferError;
use crate::protocol::RawMessage;

// ── PeerId ───────────────────────────────────────────────────────

/// Identity of one connection on a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

// ── SourceEvent ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// A message arrived from `peer`.
    Message { peer: PeerId, message: RawMessage },
    /// `peer` went away. Clients it registered should be dropped.
    PeerDisconnected(PeerId),
}

// ── Traits ───────────────────────────────────────────────────────

/// The receive side of a port.
#[async_trait]
pub trait MessageSource: Send {
    /// Wait for the next event.
    ///
    /// Must be cancel-safe: the receive pipeline races this against
    /// cancellation and suspension. Returns `None` once the source is
    /// cancelled or every sender is gone.
    async fn recv(&mut self) -> Option<SourceEvent>;

    /// Next event if one is already queued.
    fn try_recv(&mut self) -> Option<SourceEvent>;

    /// Whether the source can still deliver messages.
    fn is_valid(&self) -> bool;

    /// The reply capability paired with this source.
    fn replier(&self) -> Arc<dyn ReplySender>;

    /// Stop receiving for good and release transport resources.
    fn cancel(&mut self);
}

/// Synchronous reply path back to a peer.
///
/// Failures are per-message: `PeerGone` or `ReplyQueueFull`. None of
/// them should be treated as fatal by the caller.
pub trait ReplySender: Send + Sync {
    fn send_reply(&self, peer: PeerId, message: RawMessage) -> Result<(), FramebufferError>;
}

// ── Port ─────────────────────────────────────────────────────────

struct PortInner {
    label: String,
    source: Mutex<Option<Box<dyn MessageSource>>>,
    bound: AtomicBool,
}

/// Shareable handle to a message source awaiting a service.
#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("label", &self.inner.label)
            .field("bound", &self.is_bound())
            .finish()
    }
}

impl Port {
    pub fn new(label: impl Into<String>, source: impl MessageSource + 'static) -> Self {
        Self {
            inner: Arc::new(PortInner {
                label: label.into(),
                source: Mutex::new(Some(Box::new(source))),
                bound: AtomicBool::new(false),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// A service has taken this port's source.
    pub fn is_bound(&self) -> bool {
        self.inner.bound.load(Ordering::SeqCst)
    }

    /// The source is present and still receiving.
    pub fn is_valid(&self) -> bool {
        let slot = self.inner.source.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().is_some_and(|source| source.is_valid())
    }

    /// Take the source. Fails if it is already bound or no longer valid.
    pub(crate) fn bind(&self) -> Result<Box<dyn MessageSource>, FramebufferError> {
        let mut slot = self.inner.source.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.take() {
            None => Err(FramebufferError::PortAlreadyBound),
            Some(source) if !source.is_valid() => {
                *slot = Some(source);
                Err(FramebufferError::InvalidPort)
            }
            Some(source) => {
                self.inner.bound.store(true, Ordering::SeqCst);
                Ok(source)
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
