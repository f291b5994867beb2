//! The framebuffer service façade.
//!
//! A [`FramebufferService`] owns two Tokio tasks:
//!
//! - the **receive pipeline** ([`receive`]) decodes port traffic strictly
//!   in arrival order and hands every state-affecting request off;
//! - the **execution pipeline** ([`execution`]) is the only writer of the
//!   backing store, the client registry, and the orientation.
//!
//! The façade itself holds no mutable state beyond the lifecycle flags.
//! Everything it does is a command on the execution pipeline, so callers
//! on any thread share one serialization domain with port traffic.
//!
//! ```text
//!  port ──► receive task ──(unbounded mpsc)──► execution task ──► client queues
//!                ▲                                   ▲
//!                └──── suspend / cancel ──── façade ─┘
//! ```

pub mod backing_store;
pub mod execution;
pub(crate) mod receive;
pub mod registry;
pub mod state;

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::device::{Device, DeviceState};
use crate::error::{FramebufferError, TerminalReason};
use crate::geometry::{Dimensions, Rect, Size};
use crate::port::Port;
use crate::protocol::{DimensionsReply, FrameEvent};
use backing_store::PixelFormat;
use execution::{ExecutionCommand, ExecutionContext, ExecutionState};
use receive::ReceivePipeline;
use registry::{CallbackQueue, ChannelQueue, ClientId};
use state::{Lifecycle, ServicePhase, ServiceSnapshot};

/// Default cap on a single backing store: 256 MiB.
pub const DEFAULT_MAX_BACKING_STORE_BYTES: u64 = 256 * 1024 * 1024;

/// Default capacity of queues made by [`FramebufferService::register_channel_client`].
pub const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 16;

// ── ServiceConfig ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub pixel_format: PixelFormat,
    /// Allocation limit for one backing store.
    pub max_backing_store_bytes: u64,
    pub client_queue_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            pixel_format: PixelFormat::default(),
            max_backing_store_bytes: DEFAULT_MAX_BACKING_STORE_BYTES,
            client_queue_capacity: DEFAULT_CLIENT_QUEUE_CAPACITY,
        }
    }
}

// ── ServiceBuilder ───────────────────────────────────────────────

/// Builds a [`FramebufferService`] through one of the three factory paths.
///
/// Construction either yields a running service or an error; nothing is
/// spawned and the port is not bound until every check has passed.
#[derive(Debug, Clone, Default)]
pub struct ServiceBuilder {
    config: ServiceConfig,
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pixel_format(mut self, format: PixelFormat) -> Self {
        self.config.pixel_format = format;
        self
    }

    pub fn max_backing_store_bytes(mut self, bytes: u64) -> Self {
        self.config.max_backing_store_bytes = bytes;
        self
    }

    pub fn client_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.client_queue_capacity = capacity.max(1);
        self
    }

    /// Bind to an existing port at the given dimensions.
    pub fn with_port(
        self,
        port: &Port,
        device: Size,
        scaled: Size,
    ) -> Result<FramebufferService, FramebufferError> {
        self.build(port, Dimensions::new(device, scaled))
    }

    /// Resolve `name` on `device` and bind to the port published there.
    pub fn with_name(
        self,
        name: &str,
        device: &dyn Device,
    ) -> Result<FramebufferService, FramebufferError> {
        let endpoint = device
            .lookup_service(name)
            .ok_or_else(|| FramebufferError::UnknownService {
                name: name.to_string(),
                device: device.udid().to_string(),
            })?;
        self.build(&endpoint.port, endpoint.dimensions)
    }

    /// Resolve the main screen of a booted device.
    pub fn main_screen(self, device: &dyn Device) -> Result<FramebufferService, FramebufferError> {
        if device.state() != DeviceState::Booted {
            return Err(FramebufferError::DeviceNotBooted(device.udid().to_string()));
        }
        let endpoint = device
            .main_screen_service()
            .and_then(|name| device.lookup_service(&name))
            .ok_or_else(|| FramebufferError::NoMainScreen(device.udid().to_string()))?;
        self.build(&endpoint.port, endpoint.dimensions)
    }

    fn build(self, port: &Port, dimensions: Dimensions) -> Result<FramebufferService, FramebufferError> {
        let dimensions = dimensions.validate()?;
        let runtime = Handle::try_current().map_err(|_| FramebufferError::NoRuntime)?;
        let source = port.bind()?;

        let lifecycle = Arc::new(Lifecycle::new());
        let cancel = CancellationToken::new();
        let (suspended, suspended_rx) = watch::channel(false);
        let (execution, commands) = ExecutionContext::new();

        let state = ExecutionState::new(
            execution.id(),
            self.config.clone(),
            dimensions,
            Arc::clone(&lifecycle),
        );
        runtime.spawn(execution::run(state, commands));

        let receive = ReceivePipeline::new(
            source,
            execution.clone(),
            Arc::clone(&lifecycle),
            cancel.clone(),
            suspended_rx,
        );
        runtime.spawn(receive.run());

        info!("framebuffer service bound to port {:?} at {dimensions}", port.label());

        Ok(FramebufferService {
            execution,
            lifecycle,
            suspended,
            cancel,
            port_label: port.label().to_string(),
            config: self.config,
        })
    }
}

// ── FramebufferService ───────────────────────────────────────────

/// A live framebuffer service.
///
/// Dropping the service invalidates it.
pub struct FramebufferService {
    execution: ExecutionContext,
    lifecycle: Arc<Lifecycle>,
    suspended: watch::Sender<bool>,
    cancel: CancellationToken,
    port_label: String,
    config: ServiceConfig,
}

impl FramebufferService {
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::new()
    }

    /// Bind to `port` with the default configuration.
    pub fn with_port(port: &Port, device: Size, scaled: Size) -> Result<Self, FramebufferError> {
        ServiceBuilder::new().with_port(port, device, scaled)
    }

    /// Resolve a named service on `device` with the default configuration.
    pub fn with_name(name: &str, device: &dyn Device) -> Result<Self, FramebufferError> {
        ServiceBuilder::new().with_name(name, device)
    }

    /// Resolve the main screen of `device` with the default configuration.
    pub fn main_screen(device: &dyn Device) -> Result<Self, FramebufferError> {
        ServiceBuilder::new().main_screen(device)
    }

    pub fn port_label(&self) -> &str {
        &self.port_label
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    // ── Execution context ────────────────────────────────────────

    /// The single serialization domain for backing-store and registry work.
    pub fn execution_context(&self) -> &ExecutionContext {
        &self.execution
    }

    /// Panics in debug builds unless called on the execution pipeline.
    pub fn assert_on_execution_context(&self) {
        self.execution.assert_on_execution_context();
    }

    // ── Requests ─────────────────────────────────────────────────

    /// Ask for new dimensions. Returns once the request is queued.
    ///
    /// Non-positive dimensions are refused here and never reach the
    /// execution pipeline.
    pub fn request_dimensions(&self, device: Size, scaled: Size) -> Result<(), FramebufferError> {
        self.ensure_live()?;
        let dimensions = Dimensions::new(device, scaled).validate()?;
        self.submit(ExecutionCommand::RequestDimensions(dimensions))
    }

    /// Report a changed region, as a local render server would.
    pub fn flush(&self, rect: Rect) -> Result<(), FramebufferError> {
        self.submit(ExecutionCommand::DirtyRegion(rect))
    }

    /// Report a new orientation in degrees.
    pub fn rotate(&self, angle: f64) -> Result<(), FramebufferError> {
        if !angle.is_finite() {
            return Err(FramebufferError::InvalidAngle(angle));
        }
        self.submit(ExecutionCommand::Rotate(angle))
    }

    /// Current backing-store dimensions, allocating the store if needed.
    pub async fn query_dimensions(&self) -> Result<DimensionsReply, FramebufferError> {
        let (tx, rx) = oneshot::channel();
        self.submit(ExecutionCommand::QueryDimensions(tx))?;
        rx.await.map_err(|_| self.lifecycle.terminated_error())?
    }

    // ── Clients ──────────────────────────────────────────────────

    /// Add `client`, replacing any queue it was registered with before.
    pub fn register_client(
        &self,
        client: ClientId,
        queue: impl CallbackQueue + 'static,
    ) -> Result<(), FramebufferError> {
        self.submit(ExecutionCommand::Register {
            client,
            queue: Arc::new(queue),
        })
    }

    /// Register a fresh local client on a bounded channel.
    ///
    /// Dropping the receiver unregisters the client before the next
    /// dispatch.
    pub fn register_channel_client(
        &self,
    ) -> Result<(ClientId, mpsc::Receiver<FrameEvent>), FramebufferError> {
        let client = ClientId::next_local();
        let (queue, rx) = ChannelQueue::new(self.config.client_queue_capacity);
        self.register_client(client, queue)?;
        Ok((client, rx))
    }

    /// Remove `client`. Unknown clients and terminated services are a no-op.
    pub fn unregister_client(&self, client: &ClientId) {
        if self.lifecycle.is_invalidated() {
            return;
        }
        let _ = self.execution.submit(ExecutionCommand::Unregister(*client));
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Pause inbound processing.
    ///
    /// Resolves once frame work queued ahead of the call has been
    /// applied. Nothing received afterwards is processed until
    /// [`resume`](Self::resume), and nothing is dropped.
    pub async fn suspend(&self) -> Result<(), FramebufferError> {
        self.ensure_live()?;
        self.suspended.send_replace(true);
        self.lifecycle.set_phase(ServicePhase::Suspended);

        let (tx, rx) = oneshot::channel();
        self.submit(ExecutionCommand::Suspend(tx))?;
        rx.await.map_err(|_| self.lifecycle.terminated_error())?;
        debug!("service on {:?} suspended", self.port_label);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), FramebufferError> {
        self.ensure_live()?;
        self.submit(ExecutionCommand::Resume)?;
        self.suspended.send_replace(false);
        self.lifecycle.set_phase(ServicePhase::Running);
        debug!("service on {:?} resumed", self.port_label);
        Ok(())
    }

    /// Terminate the service for good. Safe to call more than once.
    pub fn invalidate(&self) {
        if self.lifecycle.mark_invalidated() {
            info!("invalidating framebuffer service on {:?}", self.port_label);
        }
        self.cancel.cancel();
    }

    pub fn is_invalidated(&self) -> bool {
        self.lifecycle.is_invalidated()
    }

    pub fn phase(&self) -> ServicePhase {
        self.lifecycle.phase()
    }

    /// Wait for teardown to finish.
    pub async fn terminated(&self) -> TerminalReason {
        let mut phase = self.lifecycle.subscribe();
        let reached = phase
            .wait_for(ServicePhase::is_terminated)
            .await
            .map(|phase| *phase);
        match reached {
            Ok(ServicePhase::Terminated(reason)) => reason,
            _ => TerminalReason::Invalidated,
        }
    }

    /// Point-in-time view of execution-side state.
    pub async fn snapshot(&self) -> Result<ServiceSnapshot, FramebufferError> {
        let (tx, rx) = oneshot::channel();
        self.submit(ExecutionCommand::Snapshot(tx))?;
        rx.await.map_err(|_| self.lifecycle.terminated_error())
    }

    // ── Helpers ──────────────────────────────────────────────────

    fn ensure_live(&self) -> Result<(), FramebufferError> {
        if self.lifecycle.is_invalidated() {
            return Err(self.lifecycle.terminated_error());
        }
        Ok(())
    }

    fn submit(&self, command: ExecutionCommand) -> Result<(), FramebufferError> {
        self.ensure_live()?;
        self.execution
            .submit(command)
            .map_err(|_| self.lifecycle.terminated_error())
    }
}

impl Drop for FramebufferService {
    fn drop(&mut self) {
        self.invalidate();
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LocalDevice;
    use crate::port::channel::channel_port;

    fn device() -> Size {
        Size::new(320, 240)
    }

    fn scaled() -> Size {
        Size::new(640, 480)
    }

    #[test]
    fn construction_needs_a_runtime() {
        let (port, _client) = channel_port("no-runtime", 4);
        let err = FramebufferService::with_port(&port, device(), scaled()).err();
        assert!(matches!(err, Some(FramebufferError::NoRuntime)));
        // A failed construction leaves the port free.
        assert!(!port.is_bound());
    }

    #[tokio::test]
    async fn construction_rejects_bad_dimensions_before_binding() {
        let (port, _client) = channel_port("bad-dims", 4);
        let err = FramebufferService::with_port(&port, Size::new(0, 240), scaled()).err();
        assert!(matches!(err, Some(FramebufferError::InvalidDimensions(_))));
        assert!(!port.is_bound());
    }

    #[tokio::test]
    async fn second_service_on_a_port_fails() {
        let (port, _client) = channel_port("shared", 4);
        let _first = FramebufferService::with_port(&port, device(), scaled()).unwrap();
        let err = FramebufferService::with_port(&port, device(), scaled()).err();
        assert!(matches!(err, Some(FramebufferError::PortAlreadyBound)));
    }

    #[tokio::test]
    async fn builder_config_reaches_the_store() {
        let (port, _client) = channel_port("tiny", 4);
        let service = FramebufferService::builder()
            .max_backing_store_bytes(1024)
            .with_port(&port, device(), scaled())
            .unwrap();

        let err = service.query_dimensions().await.unwrap_err();
        assert!(matches!(err, FramebufferError::BackingStoreTooLarge { .. }));
        assert!(!service.is_invalidated());
    }

    #[tokio::test]
    async fn factory_paths_report_lookup_failures() {
        let dev = LocalDevice::new("A1B2");
        assert!(matches!(
            FramebufferService::with_name("tv-out", &dev).err(),
            Some(FramebufferError::UnknownService { .. })
        ));
        assert!(matches!(
            FramebufferService::main_screen(&dev).err(),
            Some(FramebufferError::DeviceNotBooted(_))
        ));

        dev.set_state(DeviceState::Booted);
        assert!(matches!(
            FramebufferService::main_screen(&dev).err(),
            Some(FramebufferError::NoMainScreen(_))
        ));

        let (port, _client) = channel_port("main", 4);
        dev.publish_main_screen("framebuffer.main", port, Dimensions::new(device(), scaled()));
        let service = FramebufferService::main_screen(&dev).unwrap();
        assert_eq!(service.port_label(), "main");
    }

    #[tokio::test]
    async fn request_dimensions_validates_synchronously() {
        let (port, _client) = channel_port("validate", 4);
        let service = FramebufferService::with_port(&port, device(), scaled()).unwrap();
        assert!(matches!(
            service.request_dimensions(Size::new(10, -1), scaled()),
            Err(FramebufferError::InvalidDimensions(_))
        ));
        assert!(matches!(
            service.rotate(f64::NAN),
            Err(FramebufferError::InvalidAngle(_))
        ));
    }

    #[tokio::test]
    async fn dropping_the_service_invalidates_it() {
        let (port, client) = channel_port("dropped", 4);
        let service = FramebufferService::with_port(&port, device(), scaled()).unwrap();
        let (_id, mut rx) = service.register_channel_client().unwrap();
        // Let the registration land before the drop.
        service.snapshot().await.unwrap();
        drop(service);

        assert_eq!(
            rx.recv().await,
            Some(FrameEvent::Terminated(TerminalReason::Invalidated))
        );
        drop(client);
    }

    #[tokio::test]
    async fn off_context_check_is_false_on_caller_task() {
        let (port, _client) = channel_port("ctx", 4);
        let service = FramebufferService::with_port(&port, device(), scaled()).unwrap();
        assert!(!service.execution_context().is_current());
    }
}
