//! Configuration for the framebuffer daemon.

use std::path::{Path, PathBuf};

use fbhub_core::{Dimensions, PixelFormat, ServiceConfig, Size, MAIN_SCREEN_SERVICE};
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// The simulated device the screen belongs to.
    pub device: DeviceConfig,
    /// Main-screen geometry.
    pub screen: ScreenConfig,
    /// Where render servers connect.
    pub transport: TransportConfig,
    /// Built-in clients.
    pub clients: ClientsConfig,
    /// Service limits.
    pub service: ServiceLimits,
    /// Logging settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device identifier used in logs and errors.
    pub udid: String,
    /// Whether the device reports itself as booted at startup.
    pub booted: bool,
}

/// Main-screen configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenConfig {
    /// Name the service is published under.
    pub service_name: String,
    /// Logical size in points.
    pub device_width: i32,
    pub device_height: i32,
    /// Backing size in pixels.
    pub scaled_width: i32,
    pub scaled_height: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Unix domain socket path. A stale socket here is replaced.
    pub socket_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientsConfig {
    /// Register a client that logs every frame notification.
    pub frame_logger: bool,
    /// Capacity of in-process client queues.
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceLimits {
    /// Largest backing store the service will allocate, in MiB.
    pub max_backing_store_mib: u64,
    /// Pixel layout: "bgra8" or "rgba8".
    pub pixel_format: PixelFormat,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            udid: "fbhub-local".into(),
            booted: true,
        }
    }
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            service_name: MAIN_SCREEN_SERVICE.into(),
            device_width: 390,
            device_height: 844,
            scaled_width: 1170,
            scaled_height: 2532,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socket_path: std::env::temp_dir().join("fbhub.sock"),
        }
    }
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            frame_logger: true,
            queue_capacity: fbhub_core::service::DEFAULT_CLIENT_QUEUE_CAPACITY,
        }
    }
}

impl Default for ServiceLimits {
    fn default() -> Self {
        Self {
            max_backing_store_mib: 256,
            pixel_format: PixelFormat::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

/// Where a loaded configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    Missing,
    /// The file exists but does not parse; defaults were used.
    Invalid(String),
}

impl ConfigSource {
    pub fn log(&self, path: &Path) {
        match self {
            ConfigSource::File => tracing::info!("config loaded from {}", path.display()),
            ConfigSource::Missing => tracing::info!("no config at {}; using defaults", path.display()),
            ConfigSource::Invalid(e) => {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display())
            }
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        let (config, source) = Self::read(path);
        source.log(path);
        config
    }

    /// Like [`DaemonConfig::load`], but leaves reporting to the caller.
    /// Usable before a subscriber is installed.
    pub fn read(path: &Path) -> (Self, ConfigSource) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => (config, ConfigSource::File),
                Err(e) => (Self::default(), ConfigSource::Invalid(e.to_string())),
            },
            Err(_) => (Self::default(), ConfigSource::Missing),
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Initial dimensions of the main screen.
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(
            Size::new(self.screen.device_width, self.screen.device_height),
            Size::new(self.screen.scaled_width, self.screen.scaled_height),
        )
    }

    /// Service settings, clamped into usable ranges.
    pub fn to_service_config(&self) -> ServiceConfig {
        ServiceConfig {
            pixel_format: self.service.pixel_format,
            max_backing_store_bytes: self.service.max_backing_store_mib.clamp(1, 4096) * 1024 * 1024,
            client_queue_capacity: self.clients.queue_capacity.clamp(1, 4096),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
