//! In-process port built on Tokio channels.
//!
//! [`channel_port`] returns the [`Port`] (service side) and a
//! [`PortClient`] (render-server side). Each [`PeerConnection`] made
//! from the client gets its own reply queue; dropping it reports
//! `PeerDisconnected`. Once the client and every connection are
//! dropped, the source reports cancellation, the same way a port whose
//! last sender died would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::FramebufferError;
use crate::flags::MessageFlags;
use crate::port::{MessageSource, PeerId, Port, ReplySender, SourceEvent};
use crate::protocol::{RawMessage, Request};

/// Replies buffered per peer before `send_reply` reports a full queue.
pub const DEFAULT_REPLY_QUEUE_DEPTH: usize = 64;

/// Create an in-process port whose inbound queue holds `capacity` events.
pub fn channel_port(label: impl Into<String>, capacity: usize) -> (Port, PortClient) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let replier = Arc::new(ChannelReplier::default());
    let source = ChannelSource {
        events: rx,
        replier: Arc::clone(&replier),
        cancelled: false,
    };
    let client = PortClient {
        events: tx,
        replier,
        next_peer: Arc::new(AtomicU64::new(1)),
        reply_capacity: DEFAULT_REPLY_QUEUE_DEPTH,
    };
    (Port::new(label, source), client)
}

// ── Reply routing ────────────────────────────────────────────────

#[derive(Default)]
struct ChannelReplier {
    peers: Mutex<HashMap<PeerId, mpsc::Sender<RawMessage>>>,
}

impl ChannelReplier {
    fn insert(&self, peer: PeerId, tx: mpsc::Sender<RawMessage>) {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, tx);
    }

    fn remove(&self, peer: PeerId) {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&peer);
    }

    fn clear(&self) {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl ReplySender for ChannelReplier {
    fn send_reply(&self, peer: PeerId, message: RawMessage) -> Result<(), FramebufferError> {
        let peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = peers.get(&peer).ok_or(FramebufferError::PeerGone(peer.0))?;
        tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => FramebufferError::ReplyQueueFull(peer.0),
            TrySendError::Closed(_) => FramebufferError::PeerGone(peer.0),
        })
    }
}

// ── Service side ─────────────────────────────────────────────────

pub struct ChannelSource {
    events: mpsc::Receiver<SourceEvent>,
    replier: Arc<ChannelReplier>,
    cancelled: bool,
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn recv(&mut self) -> Option<SourceEvent> {
        if self.cancelled {
            return None;
        }
        let event = self.events.recv().await;
        if event.is_none() {
            self.cancelled = true;
        }
        event
    }

    fn try_recv(&mut self) -> Option<SourceEvent> {
        if self.cancelled {
            return None;
        }
        self.events.try_recv().ok()
    }

    fn is_valid(&self) -> bool {
        !self.cancelled
    }

    fn replier(&self) -> Arc<dyn ReplySender> {
        self.replier.clone()
    }

    fn cancel(&mut self) {
        self.cancelled = true;
        self.events.close();
        self.replier.clear();
    }
}

// ── Render-server side ───────────────────────────────────────────

/// Factory for peer connections on an in-process port.
#[derive(Clone)]
pub struct PortClient {
    events: mpsc::Sender<SourceEvent>,
    replier: Arc<ChannelReplier>,
    next_peer: Arc<AtomicU64>,
    reply_capacity: usize,
}

impl PortClient {
    /// Open a new peer connection with its own reply queue.
    pub fn connect(&self) -> PeerConnection {
        let peer = PeerId(self.next_peer.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.reply_capacity);
        self.replier.insert(peer, tx);
        PeerConnection {
            peer,
            events: self.events.clone(),
            replier: Arc::clone(&self.replier),
            replies: rx,
            sequence: AtomicU32::new(1),
        }
    }

    /// Limit for reply queues of connections opened after this call.
    pub fn set_reply_capacity(&mut self, capacity: usize) {
        self.reply_capacity = capacity.max(1);
    }
}

/// One render-server connection on an in-process port.
pub struct PeerConnection {
    peer: PeerId,
    events: mpsc::Sender<SourceEvent>,
    replier: Arc<ChannelReplier>,
    replies: mpsc::Receiver<RawMessage>,
    sequence: AtomicU32,
}

impl PeerConnection {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Encode and send a request, returning the sequence number used.
    pub async fn send(&self, request: &Request) -> Result<u32, FramebufferError> {
        self.send_with_flags(request, MessageFlags::empty()).await
    }

    pub async fn send_with_flags(
        &self,
        request: &Request,
        flags: MessageFlags,
    ) -> Result<u32, FramebufferError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.send_raw(request.encode(sequence, flags)?).await?;
        Ok(sequence)
    }

    /// Send an arbitrary message, bypassing request encoding.
    pub async fn send_raw(&self, message: RawMessage) -> Result<(), FramebufferError> {
        self.events
            .send(SourceEvent::Message {
                peer: self.peer,
                message,
            })
            .await?;
        Ok(())
    }

    /// Next reply or notification addressed to this peer.
    pub async fn recv(&mut self) -> Option<RawMessage> {
        self.replies.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RawMessage> {
        self.replies.try_recv().ok()
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.replier.remove(self.peer);
        let _ = self
            .events
            .try_send(SourceEvent::PeerDisconnected(self.peer));
    }
}

// ── Tests ────────────────────────────────────────────────────────
