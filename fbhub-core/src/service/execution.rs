//! The execution pipeline: the single writer of service state.
//!
//! Every mutation of the backing store, the client registry, the
//! requested dimensions, and the orientation happens inside
//! [`ExecutionState::handle`], which only ever runs on one Tokio task
//! draining an unbounded command queue. The task runs inside a
//! task-local scope carrying its [`ContextId`], so each execution-only
//! method can check, in debug builds, that it really is on that task.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::error::{FramebufferError, PostError, TerminalReason};
use crate::geometry::{Dimensions, Rect};
use crate::port::PeerId;
use crate::protocol::{DimensionsReply, FrameEvent, FrameUpdate};
use crate::service::ServiceConfig;
use crate::service::backing_store::FramebufferBackingStore;
use crate::service::registry::{CallbackQueue, ClientId, ClientRegistry};
use crate::service::state::{BackingStoreInfo, Lifecycle, ServicePhase, ServiceSnapshot};

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static EXECUTION_CONTEXT: ContextId;
}

// ── ContextId ────────────────────────────────────────────────────

/// Identity of one service's execution pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        ContextId(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Whether the calling task is this pipeline.
    pub fn is_current(&self) -> bool {
        EXECUTION_CONTEXT
            .try_with(|current| current == self)
            .unwrap_or(false)
    }
}

// ── ExecutionCommand ─────────────────────────────────────────────

pub(crate) type DimensionsResult = Result<DimensionsReply, FramebufferError>;

/// Work handed to the execution pipeline.
pub(crate) enum ExecutionCommand {
    RequestDimensions(Dimensions),
    QueryDimensions(oneshot::Sender<DimensionsResult>),
    DirtyRegion(Rect),
    Rotate(f64),
    Register {
        client: ClientId,
        queue: Arc<dyn CallbackQueue>,
    },
    Unregister(ClientId),
    PeerGone(PeerId),
    Suspend(oneshot::Sender<()>),
    Resume,
    Snapshot(oneshot::Sender<ServiceSnapshot>),
    Teardown(TerminalReason),
}

impl ExecutionCommand {
    /// Commands held back while the pipeline is suspended.
    fn is_deferrable(&self) -> bool {
        matches!(
            self,
            ExecutionCommand::RequestDimensions(_)
                | ExecutionCommand::QueryDimensions(_)
                | ExecutionCommand::DirtyRegion(_)
                | ExecutionCommand::Rotate(_)
        )
    }
}

// ── ExecutionContext ─────────────────────────────────────────────

/// Handle to a service's execution pipeline.
///
/// Cloned into the receive pipeline and held by the façade, so both
/// submit into exactly one serialization domain.
#[derive(Clone)]
pub struct ExecutionContext {
    id: ContextId,
    tx: mpsc::UnboundedSender<ExecutionCommand>,
}

impl ExecutionContext {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<ExecutionCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: ContextId::next(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn is_current(&self) -> bool {
        self.id.is_current()
    }

    /// Panics in debug builds when called off the execution pipeline.
    pub fn assert_on_execution_context(&self) {
        debug_assert!(
            self.is_current(),
            "must be called on execution context {:?}",
            self.id
        );
    }

    /// Queue a command. Fails once the pipeline has stopped.
    pub(crate) fn submit(&self, command: ExecutionCommand) -> Result<(), FramebufferError> {
        self.tx.send(command)?;
        Ok(())
    }
}

// ── Flow ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

// ── ExecutionState ───────────────────────────────────────────────

/// Everything the execution pipeline owns.
pub(crate) struct ExecutionState {
    context: ContextId,
    config: ServiceConfig,
    lifecycle: Arc<Lifecycle>,
    requested: Dimensions,
    backing_store: Option<FramebufferBackingStore>,
    registry: ClientRegistry,
    have_received_full_flush: bool,
    angle: f64,
    suspended: bool,
    deferred: VecDeque<ExecutionCommand>,
    event_sequence: u64,
    stores_created: u64,
    torn_down: bool,
}

impl ExecutionState {
    pub(crate) fn new(
        context: ContextId,
        config: ServiceConfig,
        requested: Dimensions,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            context,
            config,
            lifecycle,
            requested,
            backing_store: None,
            registry: ClientRegistry::new(),
            have_received_full_flush: false,
            angle: 0.0,
            suspended: false,
            deferred: VecDeque::new(),
            event_sequence: 0,
            stores_created: 0,
            torn_down: false,
        }
    }

    fn assert_on_execution_context(&self) {
        debug_assert!(
            self.context.is_current(),
            "must be called on execution context {:?}",
            self.context
        );
    }

    /// Apply one command.
    pub(crate) fn handle(&mut self, command: ExecutionCommand) -> Flow {
        self.assert_on_execution_context();

        if self.lifecycle.is_invalidated() && !matches!(command, ExecutionCommand::Teardown(_)) {
            trace!("dropping command queued behind invalidate");
            return Flow::Continue;
        }
        if self.suspended && command.is_deferrable() {
            self.deferred.push_back(command);
            return Flow::Continue;
        }

        match command {
            ExecutionCommand::RequestDimensions(dimensions) => self.request_dimensions(dimensions),
            ExecutionCommand::QueryDimensions(reply) => {
                let _ = reply.send(self.query_dimensions());
            }
            ExecutionCommand::DirtyRegion(rect) => self.did_dirty_framebuffer_region(rect),
            ExecutionCommand::Rotate(angle) => self.did_rotate_to_angle(angle),
            ExecutionCommand::Register { client, queue } => self.register_client(client, queue),
            ExecutionCommand::Unregister(client) => self.unregister_client(&client),
            ExecutionCommand::PeerGone(peer) => {
                let removed = self.registry.remove_peer(peer);
                if removed > 0 {
                    debug!("{peer} disconnected; dropped {removed} client(s)");
                }
            }
            ExecutionCommand::Suspend(ack) => {
                self.suspend();
                let _ = ack.send(());
            }
            ExecutionCommand::Resume => self.resume(),
            ExecutionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            ExecutionCommand::Teardown(reason) => {
                self.teardown(reason);
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    // ── Backing store ────────────────────────────────────────────

    /// The only allocation point for the backing store.
    ///
    /// Returns the current store if it matches `dimensions`; otherwise
    /// the old one is torn down first and a new one allocated.
    pub(crate) fn framebuffer_backing_store_creating_if_needed(
        &mut self,
        dimensions: Dimensions,
    ) -> Result<&mut FramebufferBackingStore, FramebufferError> {
        self.assert_on_execution_context();

        if self
            .backing_store
            .as_ref()
            .is_some_and(|store| store.dimensions() != dimensions)
        {
            self.teardown_framebuffer_backing_store();
        }

        let store = match self.backing_store.take() {
            Some(store) => store,
            None => {
                let generation = self.stores_created + 1;
                let store = FramebufferBackingStore::create(
                    dimensions,
                    self.config.pixel_format,
                    generation,
                    self.config.max_backing_store_bytes,
                )?;
                self.stores_created = generation;
                debug!(
                    "allocated backing store #{generation} at {dimensions} ({} bytes)",
                    store.byte_len()
                );
                store
            }
        };
        Ok(self.backing_store.insert(store))
    }

    pub(crate) fn teardown_framebuffer_backing_store(&mut self) {
        self.assert_on_execution_context();
        if let Some(store) = self.backing_store.take() {
            debug!("tore down backing store #{}", store.generation());
        }
    }

    fn request_dimensions(&mut self, dimensions: Dimensions) {
        self.assert_on_execution_context();
        if let Err(e) = dimensions.validate() {
            warn!("ignoring dimension request: {e}");
            return;
        }
        if dimensions == self.requested {
            trace!("dimensions unchanged at {dimensions}");
            return;
        }
        debug!("dimensions {} -> {dimensions}", self.requested);
        self.requested = dimensions;
        self.teardown_framebuffer_backing_store();
    }

    fn query_dimensions(&mut self) -> DimensionsResult {
        self.assert_on_execution_context();
        let requested = self.requested;
        let have_received_full_flush = self.have_received_full_flush;
        let store = self.framebuffer_backing_store_creating_if_needed(requested)?;
        Ok(DimensionsReply {
            dimensions: store.dimensions(),
            generation: store.generation(),
            have_received_full_flush,
        })
    }

    // ── Notifications ────────────────────────────────────────────

    pub(crate) fn did_dirty_framebuffer_region(&mut self, rect: Rect) {
        self.assert_on_execution_context();
        let requested = self.requested;
        let store = match self.framebuffer_backing_store_creating_if_needed(requested) {
            Ok(store) => store,
            Err(e) => {
                error!("flush of {rect} dropped: {e}");
                return;
            }
        };
        if store.mark_dirty(rect).is_none() {
            debug!("flush of {rect} lies outside the backing store");
            return;
        }
        let Some(region) = store.take_dirty() else {
            return;
        };
        let dimensions = store.dimensions();
        let full_frame = region == store.bounds();

        self.event_sequence += 1;
        let event = FrameEvent::FrameUpdated(FrameUpdate {
            sequence: self.event_sequence,
            region,
            dimensions,
            full_frame,
        });
        self.dispatch(event);

        if full_frame && !self.have_received_full_flush {
            self.have_received_full_flush = true;
            info!("received first full-frame flush at {dimensions}");
        }
    }

    pub(crate) fn did_rotate_to_angle(&mut self, angle: f64) {
        self.assert_on_execution_context();
        if !angle.is_finite() {
            warn!("ignoring rotation to non-finite angle {angle}");
            return;
        }
        self.angle = angle;
        self.event_sequence += 1;
        self.dispatch(FrameEvent::Rotated {
            sequence: self.event_sequence,
            angle,
        });
    }

    /// Post `event` to every live client. Returns how many accepted it.
    fn dispatch(&mut self, event: FrameEvent) -> usize {
        let pruned = self.registry.prune_closed();
        if pruned > 0 {
            debug!("pruned {pruned} vanished client(s)");
        }

        let mut delivered = 0;
        let mut vanished = Vec::new();
        for client in self.registry.clients() {
            let Some(queue) = self.callback_queue_for_client(&client) else {
                continue;
            };
            match queue.post(event) {
                Ok(()) => delivered += 1,
                Err(PostError::Full) => trace!("{client} is behind; notification skipped"),
                Err(PostError::Disconnected) => vanished.push(client),
            }
        }
        for client in vanished {
            debug!("{client} disconnected during dispatch");
            self.registry.unregister(&client);
        }
        delivered
    }

    // ── Registry ─────────────────────────────────────────────────

    pub(crate) fn callback_queue_for_client(
        &self,
        client: &ClientId,
    ) -> Option<Arc<dyn CallbackQueue>> {
        self.assert_on_execution_context();
        self.registry.callback_queue(client)
    }

    fn register_client(&mut self, client: ClientId, queue: Arc<dyn CallbackQueue>) {
        self.assert_on_execution_context();
        if self.registry.register(client, queue) {
            debug!("{client} re-registered; queue replaced");
        } else {
            debug!("{client} registered");
        }
    }

    fn unregister_client(&mut self, client: &ClientId) {
        self.assert_on_execution_context();
        if self.registry.unregister(client) {
            debug!("{client} unregistered");
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Stop dispatching new frame work until `resume`.
    ///
    /// Everything queued ahead of the suspend command has already been
    /// applied by the time this runs. Later frame work is deferred in
    /// order, never dropped.
    pub(crate) fn suspend(&mut self) {
        self.assert_on_execution_context();
        if !self.suspended {
            debug!("execution pipeline suspended");
            self.suspended = true;
        }
    }

    fn resume(&mut self) {
        self.assert_on_execution_context();
        if !self.suspended {
            return;
        }
        self.suspended = false;
        debug!(
            "execution pipeline resumed; replaying {} deferred command(s)",
            self.deferred.len()
        );
        while let Some(command) = self.deferred.pop_front() {
            self.handle(command);
        }
    }

    fn teardown(&mut self, reason: TerminalReason) {
        self.assert_on_execution_context();
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.lifecycle.mark_invalidated();

        self.deferred.clear();
        self.suspended = false;
        self.teardown_framebuffer_backing_store();

        let event = FrameEvent::Terminated(reason);
        let clients = self.registry.drain();
        for (client, queue) in &clients {
            if let Err(e) = queue.post(event) {
                debug!("{client} missed the terminal notification: {e}");
            }
        }
        self.have_received_full_flush = false;
        self.lifecycle.set_phase(ServicePhase::Terminated(reason));
        info!(
            "framebuffer service torn down ({reason}); notified {} client(s)",
            clients.len()
        );
    }

    fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            requested: self.requested,
            backing_store: self.backing_store.as_ref().map(|store| BackingStoreInfo {
                dimensions: store.dimensions(),
                format: store.format(),
                generation: store.generation(),
                byte_len: store.byte_len(),
                dirty: store.dirty(),
            }),
            have_received_full_flush: self.have_received_full_flush,
            angle: self.angle,
            clients: self.registry.clients(),
            suspended: self.suspended,
            deferred: self.deferred.len(),
            stores_created: self.stores_created,
        }
    }
}

/// Drive the execution pipeline until teardown.
pub(crate) async fn run(mut state: ExecutionState, mut commands: mpsc::UnboundedReceiver<ExecutionCommand>) {
    let context = state.context;
    EXECUTION_CONTEXT
        .scope(context, async move {
            while let Some(command) = commands.recv().await {
                if state.handle(command) == Flow::Stop {
                    break;
                }
            }
            // Every handle dropped without a teardown: treat as invalidate.
            if !state.torn_down {
                state.teardown(TerminalReason::Invalidated);
            }
        })
        .await;
    trace!("execution pipeline {context:?} exited");
}

// ── Tests ────────────────────────────────────────────────────────
