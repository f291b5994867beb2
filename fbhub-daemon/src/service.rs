//! Daemon core logic.
//!
//! Publishes a Unix-socket port as the main screen of a local device,
//! creates the main-screen framebuffer service on it, and keeps it
//! running until stopped or until the port goes away.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, info};

use fbhub_core::{DeviceState, FrameEvent, LocalDevice, ServiceBuilder, TerminalReason, bind_unix_port};

use crate::config::DaemonConfig;

// ── FramebufferDaemon ────────────────────────────────────────────

/// The top-level daemon.
pub struct FramebufferDaemon {
    config: DaemonConfig,
    running: Arc<AtomicBool>,
}

impl FramebufferDaemon {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a handle that can be used to stop the daemon from another
    /// task (e.g. a Ctrl-C handler). Store `false` to stop.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Run until stopped or until the service terminates on its own.
    ///
    /// 1. Binds the Unix socket port.
    /// 2. Publishes it as the main screen of a local device.
    /// 3. Creates the main-screen service and the optional frame logger.
    /// 4. On stop, invalidates the service and waits for teardown.
    pub async fn run(&self) -> Result<TerminalReason, Box<dyn std::error::Error>> {
        self.running.store(true, Ordering::SeqCst);

        let screen = &self.config.screen;
        let port = bind_unix_port(screen.service_name.as_str(), &self.config.transport.socket_path)?;

        let device = LocalDevice::new(self.config.device.udid.as_str());
        device.set_state(if self.config.device.booted {
            DeviceState::Booted
        } else {
            DeviceState::Booting
        });
        device.publish_main_screen(screen.service_name.as_str(), port, self.config.dimensions());

        let service = match ServiceBuilder::new()
            .config(self.config.to_service_config())
            .main_screen(&device)
        {
            Ok(service) => service,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        info!(
            "main screen {:?} on device {} at {}",
            screen.service_name,
            self.config.device.udid,
            self.config.dimensions()
        );

        if self.config.clients.frame_logger {
            let (client, events) = service.register_channel_client()?;
            debug!("frame logger registered as {client}");
            tokio::spawn(log_frames(events));
        }

        let reason = tokio::select! {
            reason = service.terminated() => reason,
            _ = Self::wait_for_stop(&self.running) => {
                service.invalidate();
                service.terminated().await
            }
        };

        self.running.store(false, Ordering::SeqCst);
        info!("framebuffer daemon stopped ({reason})");
        Ok(reason)
    }

    /// Signal the daemon to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Resolves when `running` becomes false.
    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}

/// Built-in client: logs every notification until the terminal one.
async fn log_frames(mut events: mpsc::Receiver<FrameEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            FrameEvent::FrameUpdated(update) => debug!(
                "frame #{}: {} of {}{}",
                update.sequence,
                update.region,
                update.dimensions,
                if update.full_frame { " (full)" } else { "" }
            ),
            FrameEvent::Rotated { sequence, angle } => info!("frame #{sequence}: rotated to {angle}°"),
            FrameEvent::Terminated(reason) => {
                info!("frame logger: service terminated ({reason})");
                break;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
