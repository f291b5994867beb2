//! Devices and the framebuffer services they publish.
//!
//! The service core only needs a way to resolve a name on a device to a
//! port plus the dimensions that screen should start with. [`Device`]
//! is that seam; [`LocalDevice`] is an in-process table used by the
//! daemon and by tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use crate::geometry::Dimensions;
use crate::port::Port;

/// Conventional name of the main screen's framebuffer service.
pub const MAIN_SCREEN_SERVICE: &str = "framebuffer.main";

// ── DeviceState ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    #[default]
    Shutdown,
    Booting,
    Booted,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Shutdown => write!(f, "Shutdown"),
            DeviceState::Booting => write!(f, "Booting"),
            DeviceState::Booted => write!(f, "Booted"),
        }
    }
}

// ── ServiceEndpoint ──────────────────────────────────────────────

/// A published framebuffer service: where to receive, and at what size.
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub port: Port,
    pub dimensions: Dimensions,
}

// ── Device ───────────────────────────────────────────────────────

pub trait Device: Send + Sync {
    /// Unique device identifier, used in error messages and logs.
    fn udid(&self) -> &str;

    fn state(&self) -> DeviceState;

    /// Resolve a framebuffer service by name.
    fn lookup_service(&self, name: &str) -> Option<ServiceEndpoint>;

    /// Name of the main screen's service, if the device has one.
    fn main_screen_service(&self) -> Option<String>;
}

// ── LocalDevice ──────────────────────────────────────────────────

/// In-process device with a mutable service table.
#[derive(Debug, Default)]
pub struct LocalDevice {
    udid: String,
    state: RwLock<DeviceState>,
    services: RwLock<HashMap<String, ServiceEndpoint>>,
    main_screen: RwLock<Option<String>>,
}

impl LocalDevice {
    pub fn new(udid: impl Into<String>) -> Self {
        Self {
            udid: udid.into(),
            ..Default::default()
        }
    }

    pub fn set_state(&self, state: DeviceState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Publish `port` under `name`, replacing any previous entry.
    pub fn publish(&self, name: impl Into<String>, port: Port, dimensions: Dimensions) {
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), ServiceEndpoint { port, dimensions });
    }

    /// Publish `port` and mark it as the main screen.
    pub fn publish_main_screen(&self, name: impl Into<String>, port: Port, dimensions: Dimensions) {
        let name = name.into();
        self.publish(name.clone(), port, dimensions);
        *self.main_screen.write().unwrap_or_else(PoisonError::into_inner) = Some(name);
    }

    /// Remove a published service. Returns `true` if it existed.
    pub fn withdraw(&self, name: &str) -> bool {
        let removed = self
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        let mut main = self.main_screen.write().unwrap_or_else(PoisonError::into_inner);
        if main.as_deref() == Some(name) {
            *main = None;
        }
        removed
    }
}

impl Device for LocalDevice {
    fn udid(&self) -> &str {
        &self.udid
    }

    fn state(&self) -> DeviceState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup_service(&self, name: &str) -> Option<ServiceEndpoint> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn main_screen_service(&self) -> Option<String> {
        self.main_screen
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Size;
    use crate::port::channel::channel_port;

    fn dims() -> Dimensions {
        Dimensions::new(Size::new(320, 480), Size::new(640, 960))
    }

    #[tokio::test]
    async fn publish_and_lookup() {
        let device = LocalDevice::new("DEV-1");
        let (port, _client) = channel_port("tv", 4);
        device.publish("tv-out", port, dims());

        let endpoint = device.lookup_service("tv-out").unwrap();
        assert_eq!(endpoint.dimensions, dims());
        assert_eq!(endpoint.port.label(), "tv");
        assert!(device.lookup_service("missing").is_none());
        assert!(device.main_screen_service().is_none());
    }

    #[tokio::test]
    async fn withdrawing_main_screen_clears_it() {
        let device = LocalDevice::new("DEV-1");
        let (port, _client) = channel_port("main", 4);
        device.publish_main_screen(MAIN_SCREEN_SERVICE, port, dims());
        assert_eq!(device.main_screen_service().as_deref(), Some(MAIN_SCREEN_SERVICE));

        assert!(device.withdraw(MAIN_SCREEN_SERVICE));
        assert!(device.main_screen_service().is_none());
        assert!(!device.withdraw(MAIN_SCREEN_SERVICE));
    }

    #[test]
    fn new_device_is_shut_down() {
        let device = LocalDevice::new("DEV-1");
        assert_eq!(device.state(), DeviceState::Shutdown);
        device.set_state(DeviceState::Booted);
        assert_eq!(device.state(), DeviceState::Booted);
    }
}
