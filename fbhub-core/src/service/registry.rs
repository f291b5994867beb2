//! Client registry: who wants frame notifications, and where.
//!
//! The registry is a plain map owned by the execution pipeline. It keeps
//! no client alive: a [`ChannelQueue`] whose receiver was dropped reports
//! `is_closed()` and is pruned before the next dispatch, and remote
//! clients are removed when their peer disconnects.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::error::{FramebufferError, PostError};
use crate::port::{PeerId, ReplySender};
use crate::protocol::FrameEvent;

static NEXT_LOCAL_CLIENT: AtomicU64 = AtomicU64::new(1);

// ── ClientId ─────────────────────────────────────────────────────

/// Identity of a registered client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClientId {
    /// An in-process consumer.
    Local(u64),
    /// A client registered over the port by `peer`, named by its token.
    Remote { peer: PeerId, token: u64 },
}

impl ClientId {
    /// A fresh identity, unique within this process.
    pub fn next_local() -> Self {
        ClientId::Local(NEXT_LOCAL_CLIENT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn peer(&self) -> Option<PeerId> {
        match self {
            ClientId::Local(_) => None,
            ClientId::Remote { peer, .. } => Some(*peer),
        }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientId::Local(id) => write!(f, "local#{id}"),
            ClientId::Remote { peer, token } => write!(f, "{peer}/token#{token}"),
        }
    }
}

// ── CallbackQueue ────────────────────────────────────────────────

/// Where a client wants its notifications delivered.
///
/// `post` must never block: the execution pipeline calls it for every
/// client in turn.
pub trait CallbackQueue: Send + Sync {
    fn post(&self, event: FrameEvent) -> Result<(), PostError>;

    /// The client behind this queue is gone.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Bounded in-process queue. A full queue skips the notification.
#[derive(Debug, Clone)]
pub struct ChannelQueue {
    tx: mpsc::Sender<FrameEvent>,
}

impl ChannelQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<FrameEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl CallbackQueue for ChannelQueue {
    fn post(&self, event: FrameEvent) -> Result<(), PostError> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => PostError::Full,
            TrySendError::Closed(_) => PostError::Disconnected,
        })
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Forwards notifications to a peer over the port's reply path.
pub struct RemoteClientQueue {
    peer: PeerId,
    replier: Arc<dyn ReplySender>,
    sequence: AtomicU32,
}

impl RemoteClientQueue {
    pub fn new(peer: PeerId, replier: Arc<dyn ReplySender>) -> Self {
        Self {
            peer,
            replier,
            sequence: AtomicU32::new(1),
        }
    }
}

impl CallbackQueue for RemoteClientQueue {
    fn post(&self, event: FrameEvent) -> Result<(), PostError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let message = event.to_message(sequence).map_err(|e| {
            debug!("cannot encode notification for {}: {e}", self.peer);
            PostError::Disconnected
        })?;
        self.replier.send_reply(self.peer, message).map_err(|e| match e {
            FramebufferError::ReplyQueueFull(_) => PostError::Full,
            _ => PostError::Disconnected,
        })
    }
}

// ── ClientRegistry ───────────────────────────────────────────────

/// Client identity → notification queue. One entry per identity.
#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, Arc<dyn CallbackQueue>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace. Returns `true` when an existing entry was replaced.
    pub fn register(&mut self, client: ClientId, queue: Arc<dyn CallbackQueue>) -> bool {
        self.clients.insert(client, queue).is_some()
    }

    /// Remove. Returns `false` if the client was not registered.
    pub fn unregister(&mut self, client: &ClientId) -> bool {
        self.clients.remove(client).is_some()
    }

    pub fn callback_queue(&self, client: &ClientId) -> Option<Arc<dyn CallbackQueue>> {
        self.clients.get(client).cloned()
    }

    pub fn contains(&self, client: &ClientId) -> bool {
        self.clients.contains_key(client)
    }

    /// Registered identities in a stable order.
    pub fn clients(&self) -> Vec<ClientId> {
        let mut ids: Vec<_> = self.clients.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Drop entries whose queues report closed. Returns how many.
    pub fn prune_closed(&mut self) -> usize {
        let before = self.clients.len();
        self.clients.retain(|_, queue| !queue.is_closed());
        before - self.clients.len()
    }

    /// Drop every client registered by `peer`. Returns how many.
    pub fn remove_peer(&mut self, peer: PeerId) -> usize {
        let before = self.clients.len();
        self.clients.retain(|client, _| client.peer() != Some(peer));
        before - self.clients.len()
    }

    /// Remove and return every entry.
    pub fn drain(&mut self) -> Vec<(ClientId, Arc<dyn CallbackQueue>)> {
        self.clients.drain().collect()
    }
}

// ── Tests ────────────────────────────────────────────────────────
