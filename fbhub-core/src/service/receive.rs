//! The receive pipeline: decodes inbound messages in arrival order.
//!
//! Runs on its own task and never touches service state. Every decoded
//! request that affects state becomes an [`ExecutionCommand`]. Replies
//! that need an execution-side result are parked in a set of pending
//! futures, so a slow answer never holds up the next message.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{FramebufferError, TerminalReason};
use crate::port::{MessageSource, PeerId, ReplySender, SourceEvent};
use crate::protocol::{RawMessage, Reply, Request};
use crate::service::execution::{ExecutionCommand, ExecutionContext};
use crate::service::registry::{ClientId, RemoteClientQueue};
use crate::service::state::{Lifecycle, ReceivePhase};

type PendingReply = BoxFuture<'static, (PeerId, u32, Option<Reply>)>;

pub(crate) struct ReceivePipeline {
    source: Box<dyn MessageSource>,
    replier: Arc<dyn ReplySender>,
    execution: ExecutionContext,
    lifecycle: Arc<Lifecycle>,
    cancel: CancellationToken,
    suspended: watch::Receiver<bool>,
    phase: ReceivePhase,
    /// Events pulled off the source after a suspend landed.
    held: VecDeque<SourceEvent>,
    pending_replies: FuturesUnordered<PendingReply>,
}

impl ReceivePipeline {
    pub(crate) fn new(
        source: Box<dyn MessageSource>,
        execution: ExecutionContext,
        lifecycle: Arc<Lifecycle>,
        cancel: CancellationToken,
        suspended: watch::Receiver<bool>,
    ) -> Self {
        let replier = source.replier();
        Self {
            source,
            replier,
            execution,
            lifecycle,
            cancel,
            suspended,
            phase: ReceivePhase::default(),
            held: VecDeque::new(),
            pending_replies: FuturesUnordered::new(),
        }
    }

    fn is_suspended(&self) -> bool {
        *self.suspended.borrow()
    }

    /// Run until the source is cancelled or the service is invalidated.
    pub(crate) async fn run(mut self) {
        loop {
            let paused = self.is_suspended();
            if !paused && !self.held.is_empty() {
                self.process_held();
                continue;
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                Some((peer, sequence, reply)) = self.pending_replies.next(),
                    if !self.pending_replies.is_empty() =>
                {
                    if let Some(reply) = reply {
                        self.reply(peer, sequence, &reply);
                    }
                }

                changed = self.suspended.changed(), if paused => {
                    if changed.is_err() {
                        break;
                    }
                    trace!("receive pipeline resumed");
                }

                event = self.source.recv(), if !paused => match event {
                    Some(event) => self.process_mach_messages(event),
                    None => break,
                },
            }
        }
        self.did_cancel_receive_source();
    }

    /// Process `first`, then everything already queued behind it.
    fn process_mach_messages(&mut self, first: SourceEvent) {
        let mut next = Some(first);
        while let Some(event) = next.take() {
            if self.is_suspended() {
                self.held.push_back(event);
                return;
            }
            self.process_event(event);
            if self.cancel.is_cancelled() {
                return;
            }
            next = self.source.try_recv();
        }
    }

    fn process_held(&mut self) {
        while !self.is_suspended() && !self.cancel.is_cancelled() {
            let Some(event) = self.held.pop_front() else {
                break;
            };
            self.process_event(event);
        }
    }

    fn process_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Message { peer, message } => self.process_mach_message(peer, message),
            SourceEvent::PeerDisconnected(peer) => {
                debug!("{peer} disconnected");
                self.hand_off(ExecutionCommand::PeerGone(peer));
            }
        }
    }

    /// Decode and dispatch one message. Bad messages are logged and dropped.
    fn process_mach_message(&mut self, peer: PeerId, message: RawMessage) {
        if let Err(e) = self.phase.begin_processing() {
            warn!("receive pipeline {}: {e}", self.phase);
            return;
        }

        match Request::decode(&message) {
            Ok(request) => {
                trace!("{peer} -> {:?} (seq {})", request.kind(), message.sequence);
                self.handle_request(peer, &message, request);
            }
            Err(e) => warn!(
                "dropping message kind {:#x} seq {} from {peer}: {e}",
                message.kind, message.sequence
            ),
        }

        if let Err(e) = self.phase.finish_processing() {
            debug!("receive pipeline {}: {e}", self.phase);
        }
    }

    fn handle_request(&mut self, peer: PeerId, message: &RawMessage, request: Request) {
        let sequence = message.sequence;
        let wants_ack = message.expects_reply() || request.kind().always_replies();

        match request {
            Request::QueryDimensions => {
                let (tx, rx) = oneshot::channel();
                if self.hand_off(ExecutionCommand::QueryDimensions(tx)) {
                    self.pending_replies.push(Box::pin(async move {
                        let reply = match rx.await {
                            Ok(Ok(dimensions)) => Some(Reply::Dimensions(dimensions)),
                            Ok(Err(e)) => Some(Reply::Rejected(e.to_string())),
                            Err(_) => None,
                        };
                        (peer, sequence, reply)
                    }));
                }
            }
            Request::SetDimensions(dimensions) => match dimensions.validate() {
                Ok(dimensions) => {
                    if self.hand_off(ExecutionCommand::RequestDimensions(dimensions)) && wants_ack {
                        self.reply(peer, sequence, &Reply::Ack);
                    }
                }
                Err(e) => {
                    warn!("{peer} requested {e}");
                    self.reply(peer, sequence, &Reply::Rejected(e.to_string()));
                }
            },
            Request::RegisterClient { token } => {
                let client = ClientId::Remote { peer, token };
                let queue = Arc::new(RemoteClientQueue::new(peer, Arc::clone(&self.replier)));
                if self.hand_off(ExecutionCommand::Register { client, queue }) && wants_ack {
                    self.reply(peer, sequence, &Reply::Ack);
                }
            }
            Request::UnregisterClient { token } => {
                let client = ClientId::Remote { peer, token };
                if self.hand_off(ExecutionCommand::Unregister(client)) && wants_ack {
                    self.reply(peer, sequence, &Reply::Ack);
                }
            }
            Request::Flush(rect) => {
                self.hand_off(ExecutionCommand::DirtyRegion(rect));
            }
            Request::Rotate { angle } => {
                if angle.is_finite() {
                    self.hand_off(ExecutionCommand::Rotate(angle));
                } else {
                    let e = FramebufferError::InvalidAngle(angle);
                    warn!("{peer} sent {e}");
                    if wants_ack {
                        self.reply(peer, sequence, &Reply::Rejected(e.to_string()));
                    }
                }
            }
        }
    }

    /// Queue `command` on the execution pipeline. Returns `false` once it
    /// has gone away.
    fn hand_off(&self, command: ExecutionCommand) -> bool {
        match self.execution.submit(command) {
            Ok(()) => true,
            Err(e) => {
                debug!("execution pipeline unavailable: {e}");
                false
            }
        }
    }

    fn reply(&self, peer: PeerId, sequence: u32, reply: &Reply) {
        if let Err(e) = self.send_reply_to_render_server(peer, sequence, reply) {
            warn!("reply {:?} to {peer} (seq {sequence}) failed: {e}", reply.kind());
        }
    }

    /// Synchronous send on the port's reply path.
    ///
    /// Errors are per-message; the pipeline keeps running.
    pub(crate) fn send_reply_to_render_server(
        &self,
        peer: PeerId,
        sequence: u32,
        reply: &Reply,
    ) -> Result<(), FramebufferError> {
        let message = reply.encode(sequence)?;
        self.replier.send_reply(peer, message)
    }

    fn did_cancel_receive_source(&mut self) {
        self.phase.cancel();
        let reason = if self.lifecycle.is_invalidated() {
            TerminalReason::Invalidated
        } else {
            TerminalReason::PortCancelled
        };
        self.source.cancel();
        self.held.clear();
        debug!("receive pipeline cancelled ({reason})");
        self.hand_off(ExecutionCommand::Teardown(reason));
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::flags::MessageFlags;
    use crate::geometry::{Dimensions, Rect, Size};
    use crate::message::MessageKind;
    use crate::port::channel::{PeerConnection, PortClient, channel_port};

    struct Harness {
        client: PortClient,
        commands: mpsc::UnboundedReceiver<ExecutionCommand>,
        cancel: CancellationToken,
        suspended: watch::Sender<bool>,
        lifecycle: Arc<Lifecycle>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start() -> Harness {
        let (port, client) = channel_port("receive-test", 16);
        let source = port.bind().unwrap();
        let (execution, commands) = ExecutionContext::new();
        let lifecycle = Arc::new(Lifecycle::new());
        let cancel = CancellationToken::new();
        let (suspended, suspended_rx) = watch::channel(false);
        let pipeline = ReceivePipeline::new(
            source,
            execution,
            Arc::clone(&lifecycle),
            cancel.clone(),
            suspended_rx,
        );
        Harness {
            client,
            commands,
            cancel,
            suspended,
            lifecycle,
            task: tokio::spawn(pipeline.run()),
        }
    }

    async fn next_command(commands: &mut mpsc::UnboundedReceiver<ExecutionCommand>) -> ExecutionCommand {
        timeout(Duration::from_secs(2), commands.recv())
            .await
            .expect("timed out waiting for a command")
            .expect("command channel closed")
    }

    async fn next_reply(conn: &mut PeerConnection) -> Reply {
        let raw = timeout(Duration::from_secs(2), conn.recv())
            .await
            .expect("timed out waiting for a reply")
            .expect("reply channel closed");
        Reply::decode(&raw).unwrap()
    }

    #[tokio::test]
    async fn malformed_messages_do_not_stop_the_pipeline() {
        let mut h = start();
        let conn = h.client.connect();

        let mut garbage = RawMessage::new(MessageKind::Flush, MessageFlags::empty(), 1, Bytes::new());
        garbage.kind = 0x7f;
        conn.send_raw(garbage).await.unwrap();
        let truncated = RawMessage::new(
            MessageKind::SetDimensions,
            MessageFlags::empty(),
            2,
            Bytes::from_static(&[1, 2]),
        );
        conn.send_raw(truncated).await.unwrap();
        conn.send(&Request::Flush(Rect::new(0, 0, 4, 4))).await.unwrap();

        assert!(matches!(
            next_command(&mut h.commands).await,
            ExecutionCommand::DirtyRegion(r) if r == Rect::new(0, 0, 4, 4)
        ));
    }

    #[tokio::test]
    async fn invalid_dimensions_are_rejected_without_hand_off() {
        let mut h = start();
        let mut conn = h.client.connect();
        let bad = Dimensions::new(Size::new(-1, 10), Size::new(10, 10));

        conn.send(&Request::SetDimensions(bad)).await.unwrap();
        assert!(matches!(next_reply(&mut conn).await, Reply::Rejected(_)));

        conn.send(&Request::Rotate { angle: 90.0 }).await.unwrap();
        assert!(matches!(
            next_command(&mut h.commands).await,
            ExecutionCommand::Rotate(a) if a == 90.0
        ));
    }

    #[tokio::test]
    async fn register_hands_off_then_acks() {
        let mut h = start();
        let mut conn = h.client.connect();
        conn.send(&Request::RegisterClient { token: 7 }).await.unwrap();

        match next_command(&mut h.commands).await {
            ExecutionCommand::Register { client, .. } => {
                assert_eq!(client, ClientId::Remote { peer: conn.peer(), token: 7 });
            }
            _ => panic!("expected a registration"),
        }
        assert_eq!(next_reply(&mut conn).await, Reply::Ack);
    }

    #[tokio::test]
    async fn query_reply_waits_for_execution_result() {
        let mut h = start();
        let mut conn = h.client.connect();
        let seq = conn.send(&Request::QueryDimensions).await.unwrap();

        let ExecutionCommand::QueryDimensions(answer) = next_command(&mut h.commands).await else {
            panic!("expected a dimension query");
        };
        assert!(conn.try_recv().is_none());

        let dims = Dimensions::new(Size::new(10, 10), Size::new(20, 20));
        answer.send(Ok(answered(dims))).unwrap();

        let raw = timeout(Duration::from_secs(2), conn.recv()).await.unwrap().unwrap();
        assert_eq!(raw.sequence, seq);
        match Reply::decode(&raw).unwrap() {
            Reply::Dimensions(reply) => assert_eq!(reply.dimensions, dims),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    fn answered(dimensions: Dimensions) -> crate::protocol::DimensionsReply {
        crate::protocol::DimensionsReply {
            dimensions,
            generation: 1,
            have_received_full_flush: false,
        }
    }

    #[tokio::test]
    async fn full_reply_queue_does_not_stop_the_pipeline() {
        let mut h = start();
        h.client.set_reply_capacity(1);
        let mut conn = h.client.connect();
        let bad = Dimensions::new(Size::new(0, 10), Size::new(10, 10));
        let good = Dimensions::new(Size::new(10, 10), Size::new(20, 20));

        // Only the first rejection fits; the rest hit a full queue.
        for _ in 0..3 {
            conn.send(&Request::SetDimensions(bad)).await.unwrap();
        }
        for _ in 0..2 {
            conn.send(&Request::QueryDimensions).await.unwrap();
            let ExecutionCommand::QueryDimensions(answer) = next_command(&mut h.commands).await else {
                panic!("expected a dimension query");
            };
            answer.send(Ok(answered(good))).unwrap();
        }

        conn.send(&Request::Flush(Rect::new(0, 0, 2, 2))).await.unwrap();
        assert!(matches!(
            next_command(&mut h.commands).await,
            ExecutionCommand::DirtyRegion(r) if r == Rect::new(0, 0, 2, 2)
        ));
        assert!(matches!(next_reply(&mut conn).await, Reply::Rejected(_)));
        assert!(!h.task.is_finished());
    }

    #[tokio::test]
    async fn reply_to_departed_peer_is_dropped() {
        let mut h = start();
        let conn = h.client.connect();
        let peer = conn.peer();

        conn.send(&Request::QueryDimensions).await.unwrap();
        let ExecutionCommand::QueryDimensions(answer) = next_command(&mut h.commands).await else {
            panic!("expected a dimension query");
        };
        drop(conn);
        assert!(matches!(
            next_command(&mut h.commands).await,
            ExecutionCommand::PeerGone(p) if p == peer
        ));

        answer
            .send(Ok(answered(Dimensions::new(Size::new(10, 10), Size::new(20, 20)))))
            .unwrap();
        let other = h.client.connect();
        other.send(&Request::Rotate { angle: 180.0 }).await.unwrap();
        assert!(matches!(
            next_command(&mut h.commands).await,
            ExecutionCommand::Rotate(a) if a == 180.0
        ));
        assert!(!h.task.is_finished());
    }

    #[tokio::test]
    async fn suspended_messages_wait_for_resume() {
        let mut h = start();
        let conn = h.client.connect();
        h.suspended.send_replace(true);
        tokio::task::yield_now().await;

        conn.send(&Request::Rotate { angle: 1.0 }).await.unwrap();
        conn.send(&Request::Rotate { angle: 2.0 }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.commands.try_recv().is_err());

        h.suspended.send_replace(false);
        for expected in [1.0, 2.0] {
            assert!(matches!(
                next_command(&mut h.commands).await,
                ExecutionCommand::Rotate(a) if a == expected
            ));
        }
    }

    #[tokio::test]
    async fn peer_disconnect_is_forwarded() {
        let mut h = start();
        let conn = h.client.connect();
        let peer = conn.peer();
        drop(conn);
        assert!(matches!(
            next_command(&mut h.commands).await,
            ExecutionCommand::PeerGone(p) if p == peer
        ));
    }

    #[tokio::test]
    async fn source_loss_tears_down_as_port_cancelled() {
        let mut h = start();
        drop(h.client);
        assert!(matches!(
            next_command(&mut h.commands).await,
            ExecutionCommand::Teardown(TerminalReason::PortCancelled)
        ));
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn invalidate_tears_down_as_invalidated() {
        let mut h = start();
        h.lifecycle.mark_invalidated();
        h.cancel.cancel();
        assert!(matches!(
            next_command(&mut h.commands).await,
            ExecutionCommand::Teardown(TerminalReason::Invalidated)
        ));
        h.task.await.unwrap();
    }
}
