//! Unix domain socket port.
//!
//! Each accepted connection is one peer. A reader task decodes frames
//! with [`FramebufferCodec`] and forwards them to the shared event
//! queue; a writer task drains that peer's reply queue onto the socket.
//! When the connection closes the reader reports `PeerDisconnected`.

use std::collections::HashMap;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::FramebufferCodec;
use crate::error::FramebufferError;
use crate::port::{MessageSource, PeerId, Port, ReplySender, SourceEvent};
use crate::protocol::RawMessage;

/// Inbound events buffered across all peers.
const EVENT_QUEUE_DEPTH: usize = 256;

/// Replies buffered per peer before `send_reply` reports a full queue.
const REPLY_QUEUE_DEPTH: usize = 64;

/// Back-off after a failed `accept`.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Bind a listening socket at `path` and wrap it in a [`Port`].
///
/// A stale socket file at `path` is removed first. A live socket or any
/// other kind of file is left alone and reported as an I/O error. Must
/// be called from within a Tokio runtime.
pub fn bind_unix_port(label: impl Into<String>, path: impl AsRef<Path>) -> Result<Port, FramebufferError> {
    let path = path.as_ref().to_path_buf();
    remove_stale_socket(&path)?;
    let listener = UnixListener::bind(&path)?;
    info!("framebuffer port listening on {}", path.display());

    let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let replier = Arc::new(StreamReplier::default());
    let shutdown = CancellationToken::new();

    tokio::spawn(accept_loop(
        listener,
        tx,
        Arc::clone(&replier),
        shutdown.clone(),
    ));

    let source = UnixSource {
        events: rx,
        replier,
        shutdown,
        path,
        cancelled: false,
    };
    Ok(Port::new(label, source))
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        ));
    }
    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("{} is in use by another listener", path.display()),
        ));
    }
    debug!("removing stale socket {}", path.display());
    std::fs::remove_file(path)
}

// ── Reply routing ────────────────────────────────────────────────

#[derive(Default)]
struct StreamReplier {
    peers: Mutex<HashMap<PeerId, mpsc::Sender<RawMessage>>>,
}

impl StreamReplier {
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

impl ReplySender for StreamReplier {
    fn send_reply(&self, peer: PeerId, message: RawMessage) -> Result<(), FramebufferError> {
        let peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = peers.get(&peer).ok_or(FramebufferError::PeerGone(peer.0))?;
        tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => FramebufferError::ReplyQueueFull(peer.0),
            TrySendError::Closed(_) => FramebufferError::PeerGone(peer.0),
        })
    }
}

// ── Connection tasks ─────────────────────────────────────────────

async fn accept_loop(
    listener: UnixListener,
    events: mpsc::Sender<SourceEvent>,
    replier: Arc<StreamReplier>,
    shutdown: CancellationToken,
) {
    let next_peer = AtomicU64::new(1);
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("accept error: {e}");
                    if back_off(&shutdown).await {
                        continue;
                    }
                    break;
                }
            },
        };
        let peer = PeerId(next_peer.fetch_add(1, Ordering::Relaxed));
        debug!("{peer} connected");
        spawn_peer(stream, peer, events.clone(), Arc::clone(&replier), shutdown.clone());
    }
    debug!("accept loop stopped");
}

/// Waits out [`ACCEPT_RETRY_DELAY`]. Returns `false` on shutdown.
async fn back_off(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => true,
    }
}

fn spawn_peer(
    stream: UnixStream,
    peer: PeerId,
    events: mpsc::Sender<SourceEvent>,
    replier: Arc<StreamReplier>,
    shutdown: CancellationToken,
) {
    let (mut writer, mut reader) = Framed::new(stream, FramebufferCodec).split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<RawMessage>(REPLY_QUEUE_DEPTH);
    replier.insert(peer, reply_tx);

    // Writer task: replies -> socket
    tokio::spawn(async move {
        while let Some(message) = reply_rx.recv().await {
            if let Err(e) = writer.send(message).await {
                warn!("{peer} write error: {e}");
                break;
            }
        }
    });

    // Reader task: socket -> service
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                _ = shutdown.cancelled() => break,
                item = reader.next() => item,
            };
            match item {
                Some(Ok(message)) => {
                    if events.send(SourceEvent::Message { peer, message }).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    // Framing is lost; the stream cannot be resynchronized.
                    warn!("{peer} dropped: {e}");
                    break;
                }
                None => break,
            }
        }
        replier.remove(peer);
        debug!("{peer} disconnected");
        let _ = events.send(SourceEvent::PeerDisconnected(peer)).await;
    });
}

// ── Service side ─────────────────────────────────────────────────

pub struct UnixSource {
    events: mpsc::Receiver<SourceEvent>,
    replier: Arc<StreamReplier>,
    shutdown: CancellationToken,
    path: PathBuf,
    cancelled: bool,
}

#[async_trait]
impl MessageSource for UnixSource {
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
        !self.cancelled && !self.shutdown.is_cancelled()
    }

    fn replier(&self) -> Arc<dyn ReplySender> {
        self.replier.clone()
    }

    fn cancel(&mut self) {
        if self.cancelled && self.shutdown.is_cancelled() {
            return;
        }
        self.cancelled = true;
        self.shutdown.cancel();
        self.events.close();
        self.replier.clear();
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("could not remove {}: {e}", self.path.display());
        }
    }
}

impl Drop for UnixSource {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::MessageFlags;
    use crate::geometry::Rect;
    use crate::protocol::{Reply, Request};

    fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("fbhub-{}-{name}.sock", std::process::id()))
    }

    #[tokio::test]
    async fn frames_and_replies_cross_the_socket() {
        let path = socket_path("roundtrip");
        let port = bind_unix_port("main", &path).unwrap();
        let mut source = port.bind().unwrap();

        let stream = UnixStream::connect(&path).await.unwrap();
        let mut framed = Framed::new(stream, FramebufferCodec);
        let request = Request::Flush(Rect::new(0, 0, 4, 4))
            .encode(9, MessageFlags::empty())
            .unwrap();
        framed.send(request.clone()).await.unwrap();

        let peer = match source.recv().await.unwrap() {
            SourceEvent::Message { peer, message } => {
                assert_eq!(message, request);
                peer
            }
            other => panic!("unexpected event {other:?}"),
        };

        source
            .replier()
            .send_reply(peer, Reply::Ack.encode(9).unwrap())
            .unwrap();
        let reply = framed.next().await.unwrap().unwrap();
        assert_eq!(Reply::decode(&reply).unwrap(), Reply::Ack);

        drop(framed);
        assert_eq!(source.recv().await, Some(SourceEvent::PeerDisconnected(peer)));

        source.cancel();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn regular_file_at_path_is_left_alone() {
        let path = socket_path("regular");
        std::fs::write(&path, b"user data").unwrap();

        let err = bind_unix_port("main", &path).unwrap_err();
        match err {
            FramebufferError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::AlreadyExists),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"user data");
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn live_socket_is_not_taken_over() {
        let path = socket_path("live");
        let port = bind_unix_port("main", &path).unwrap();
        let mut source = port.bind().unwrap();

        let err = bind_unix_port("second", &path).unwrap_err();
        match err {
            FramebufferError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::AddrInUse),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(UnixStream::connect(&path).await.is_ok());
        source.cancel();
    }

    #[tokio::test]
    async fn stale_socket_is_replaced() {
        let path = socket_path("stale");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let port = bind_unix_port("main", &path).unwrap();
        let mut source = port.bind().unwrap();
        assert!(UnixStream::connect(&path).await.is_ok());
        source.cancel();
    }

    #[tokio::test]
    async fn accept_errors_back_off_until_shutdown() {
        let shutdown = CancellationToken::new();
        let started = tokio::time::Instant::now();
        assert!(back_off(&shutdown).await);
        assert!(started.elapsed() >= ACCEPT_RETRY_DELAY);

        shutdown.cancel();
        let started = tokio::time::Instant::now();
        assert!(!back_off(&shutdown).await);
        assert!(started.elapsed() < ACCEPT_RETRY_DELAY);
    }

    #[tokio::test]
    async fn garbage_drops_only_that_peer() {
        let path = socket_path("garbage");
        let port = bind_unix_port("main", &path).unwrap();
        let mut source = port.bind().unwrap();

        let mut bad = UnixStream::connect(&path).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut bad, &[0xAB; 32]).await.unwrap();

        match source.recv().await.unwrap() {
            SourceEvent::PeerDisconnected(_) => {}
            other => panic!("unexpected event {other:?}"),
        }
        assert!(source.is_valid());
        source.cancel();
    }
}
