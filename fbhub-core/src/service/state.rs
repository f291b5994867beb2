//! Lifecycle state shared by the façade and both pipelines.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

use crate::error::{FramebufferError, TerminalReason};
use crate::geometry::{Dimensions, Rect};
use crate::service::backing_store::PixelFormat;
use crate::service::registry::ClientId;

// ── ReceivePhase ─────────────────────────────────────────────────

/// State of the receive pipeline.
///
/// ```text
///  Listening ──► Processing ──► Listening
///      │              │
///      └──────────────┴──────► Cancelled (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceivePhase {
    #[default]
    Listening,
    Processing,
    Cancelled,
}

impl fmt::Display for ReceivePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listening => write!(f, "Listening"),
            Self::Processing => write!(f, "Processing"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl ReceivePhase {
    /// Valid from: `Listening`.
    pub fn begin_processing(&mut self) -> Result<(), FramebufferError> {
        match self {
            Self::Listening => {
                *self = Self::Processing;
                Ok(())
            }
            _ => Err(FramebufferError::InvalidTransition(
                "cannot process: not in Listening state",
            )),
        }
    }

    /// Valid from: `Processing`.
    pub fn finish_processing(&mut self) -> Result<(), FramebufferError> {
        match self {
            Self::Processing => {
                *self = Self::Listening;
                Ok(())
            }
            _ => Err(FramebufferError::InvalidTransition(
                "cannot finish: not in Processing state",
            )),
        }
    }

    /// Valid from any state; idempotent.
    pub fn cancel(&mut self) {
        *self = Self::Cancelled;
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

// ── ServicePhase ─────────────────────────────────────────────────

/// Externally visible state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServicePhase {
    #[default]
    Running,
    Suspended,
    Terminated(TerminalReason),
}

impl ServicePhase {
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated(_))
    }
}

impl fmt::Display for ServicePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Suspended => write!(f, "Suspended"),
            Self::Terminated(reason) => write!(f, "Terminated({reason})"),
        }
    }
}

// ── Lifecycle ────────────────────────────────────────────────────

/// The invalidation flag plus a watchable phase.
///
/// `invalidated` flips the moment `invalidate()` is called (or teardown
/// runs), before the pipelines have wound down, so the execution
/// pipeline can refuse any mutation queued behind it.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    invalidated: AtomicBool,
    phase: watch::Sender<ServicePhase>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (phase, _) = watch::channel(ServicePhase::Running);
        Self {
            invalidated: AtomicBool::new(false),
            phase,
        }
    }

    pub(crate) fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    /// Returns `true` for the call that actually flipped the flag.
    pub(crate) fn mark_invalidated(&self) -> bool {
        !self.invalidated.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn phase(&self) -> ServicePhase {
        *self.phase.borrow()
    }

    /// Move to `next`. `Terminated` is sticky.
    pub(crate) fn set_phase(&self, next: ServicePhase) {
        self.phase.send_if_modified(|phase| {
            if phase.is_terminated() || *phase == next {
                false
            } else {
                *phase = next;
                true
            }
        });
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ServicePhase> {
        self.phase.subscribe()
    }

    /// Error to hand callers once the service is gone.
    pub(crate) fn terminated_error(&self) -> FramebufferError {
        match self.phase() {
            ServicePhase::Terminated(reason) => FramebufferError::Terminated(reason),
            _ => FramebufferError::Terminated(TerminalReason::Invalidated),
        }
    }
}

// ── Snapshots ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackingStoreInfo {
    pub dimensions: Dimensions,
    pub format: PixelFormat,
    pub generation: u64,
    pub byte_len: usize,
    pub dirty: Option<Rect>,
}

/// Point-in-time view of execution-pipeline state.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSnapshot {
    pub requested: Dimensions,
    pub backing_store: Option<BackingStoreInfo>,
    pub have_received_full_flush: bool,
    pub angle: f64,
    pub clients: Vec<ClientId>,
    pub suspended: bool,
    pub deferred: usize,
    pub stores_created: u64,
}

// ── Tests ────────────────────────────────────────────────────────
