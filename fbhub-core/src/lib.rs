//! # fbhub-core
//!
//! Core library for the fbhub framebuffer distribution service.
//!
//! This crate contains:
//! - **Geometry**: `Size`, `Rect`, `Dimensions`
//! - **Message schema**: `MessageKind`, `MessageFlags`, `RawMessage`, and the
//!   typed `Request` / `Reply` / `FrameEvent` bodies
//! - **Codec**: `FramebufferCodec` for framed stream I/O via `tokio_util`
//! - **Ports**: the `MessageSource` / `ReplySender` seam, with in-process
//!   and Unix-socket transports
//! - **Device**: the `Device` lookup trait and `LocalDevice`
//! - **Service**: `FramebufferService`, its receive and execution
//!   pipelines, the backing store, and the client registry
//! - **Error**: `FramebufferError`, typed and `thiserror`-based

pub mod codec;
pub mod device;
pub mod error;
pub mod flags;
pub mod geometry;
pub mod message;
pub mod port;
pub mod protocol;
pub mod service;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::{FramebufferCodec, HEADER_SIZE, MAGIC};
pub use device::{Device, DeviceState, LocalDevice, MAIN_SCREEN_SERVICE, ServiceEndpoint};
pub use error::{FramebufferError, PostError, TerminalReason};
pub use flags::MessageFlags;
pub use geometry::{Dimensions, Rect, Size};
pub use message::MessageKind;
pub use port::channel::{PeerConnection, PortClient, channel_port};
#[cfg(unix)]
pub use port::unix::bind_unix_port;
pub use port::{MessageSource, PeerId, Port, ReplySender, SourceEvent};
pub use protocol::{DimensionsReply, FrameEvent, FrameUpdate, MAX_BODY_SIZE, RawMessage, Reply, Request};
pub use service::backing_store::{FramebufferBackingStore, PixelFormat};
pub use service::execution::{ContextId, ExecutionContext};
pub use service::registry::{CallbackQueue, ChannelQueue, ClientId, ClientRegistry, RemoteClientQueue};
pub use service::state::{BackingStoreInfo, ReceivePhase, ServicePhase, ServiceSnapshot};
pub use service::{FramebufferService, ServiceBuilder, ServiceConfig};
