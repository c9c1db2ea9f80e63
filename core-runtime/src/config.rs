//! # Bridge Configuration Module
//!
//! Provides configuration management for the extension bridge.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a
//! `BridgeConfig` that both processes share: where bus sockets live, how the
//! extension bus is named, transport limits, and the content-side policy
//! collaborators. It validates eagerly so a misconfigured process fails at
//! startup rather than on the first script call.
//!
//! ## Usage
//!
//! ```no_run
//! use core_runtime::config::BridgeConfig;
//!
//! let config = BridgeConfig::builder()
//!     .runtime_dir("/run/user/5000")
//!     .max_frame_bytes(1024 * 1024)
//!     .build()
//!     .expect("valid bridge config");
//!
//! assert_eq!(
//!     config.extension_bus_name("2f1c7a4e"),
//!     "2f1c7a4e.Extension"
//! );
//! ```
//!
//! ## Error Handling
//!
//! The builder returns actionable errors:
//!
//! ```should_panic
//! use core_runtime::config::BridgeConfig;
//!
//! // Frames smaller than 1 KiB cannot carry an extension listing.
//! let config = BridgeConfig::builder()
//!     .runtime_dir("/run/user/5000")
//!     .max_frame_bytes(16)
//!     .build()
//!     .expect("Should fail - frame ceiling too small");
//! ```

use crate::error::{Error, Result};
use bridge_traits::ResourceResolver;
use std::path::PathBuf;
use std::sync::Arc;

/// Default service-name suffix of the extension bus.
pub const DEFAULT_EXTENSION_BUS_SUFFIX: &str = "Extension";

/// Default transport frame ceiling (4 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Smallest accepted frame ceiling.
pub const MIN_FRAME_BYTES: usize = 1024;

/// Largest accepted frame ceiling.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Configuration shared by the host and content sides of the bridge.
#[derive(Clone)]
pub struct BridgeConfig {
    /// Directory bus sockets are created in
    pub runtime_dir: PathBuf,

    /// Suffix appended to the application id to name the extension bus
    pub extension_bus_suffix: String,

    /// Maximum encoded size of one transport frame
    pub max_frame_bytes: usize,

    /// Capacity of the event bus
    pub event_buffer_size: usize,

    /// Whether documents loaded from http(s) may use extensions
    pub allow_remote_origins: bool,

    /// Navigation URL policy (optional; URLs pass through unchanged without it)
    pub resource_resolver: Option<Arc<dyn ResourceResolver>>,
}

impl std::fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("runtime_dir", &self.runtime_dir)
            .field("extension_bus_suffix", &self.extension_bus_suffix)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("event_buffer_size", &self.event_buffer_size)
            .field("allow_remote_origins", &self.allow_remote_origins)
            .field(
                "resource_resolver",
                &self
                    .resource_resolver
                    .as_ref()
                    .map(|_| "ResourceResolver { ... }"),
            )
            .finish()
    }
}

impl BridgeConfig {
    /// Creates a new builder for constructing a `BridgeConfig`.
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }

    /// Name of the extension bus for an application, `"{app_id}.{suffix}"`.
    pub fn extension_bus_name(&self, app_id: &str) -> String {
        format!("{}.{}", app_id, self.extension_bus_suffix)
    }

    /// Filesystem path of the socket for a named bus.
    ///
    /// Bus sockets are hidden files in the runtime directory.
    pub fn socket_path(&self, bus_name: &str) -> PathBuf {
        self.runtime_dir.join(format!(".{}", bus_name))
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Runtime directory is set
    /// - Bus suffix is a single non-empty path component
    /// - Frame ceiling is within 1 KiB..=64 MiB
    /// - Event buffer is not zero
    pub fn validate(&self) -> Result<()> {
        if self.runtime_dir.as_os_str().is_empty() {
            return Err(Error::Config(
                "Runtime directory cannot be empty".to_string(),
            ));
        }

        if self.extension_bus_suffix.is_empty() {
            return Err(Error::Config(
                "Extension bus suffix cannot be empty. Use the default \"Extension\" \
                 unless the host registers its bus under another name."
                    .to_string(),
            ));
        }

        if self.extension_bus_suffix.contains('/') {
            return Err(Error::Config(format!(
                "Extension bus suffix '{}' must not contain '/'",
                self.extension_bus_suffix
            )));
        }

        if self.max_frame_bytes < MIN_FRAME_BYTES {
            return Err(Error::Config(format!(
                "Frame ceiling of {} bytes is below the minimum of {} bytes",
                self.max_frame_bytes, MIN_FRAME_BYTES
            )));
        }

        if self.max_frame_bytes > MAX_FRAME_BYTES {
            return Err(Error::Config(format!(
                "Frame ceiling of {} bytes exceeds maximum of {} bytes (64 MiB)",
                self.max_frame_bytes, MAX_FRAME_BYTES
            )));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn runtime_dir_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "RuntimeDir".to_string(),
        message: "No per-user runtime directory is available for bus sockets. \
                 Set XDG_RUNTIME_DIR in the process environment, \
                 or call .runtime_dir() with a private directory."
            .to_string(),
    }
}

fn default_runtime_dir() -> Result<PathBuf> {
    dirs::runtime_dir().ok_or_else(runtime_dir_missing_error)
}

#[derive(Default)]
pub struct BridgeConfigBuilder {
    runtime_dir: Option<PathBuf>,
    extension_bus_suffix: Option<String>,
    max_frame_bytes: Option<usize>,
    event_buffer_size: Option<usize>,
    allow_remote_origins: bool,
    resource_resolver: Option<Arc<dyn ResourceResolver>>,
}

impl BridgeConfigBuilder {
    /// Sets the directory bus sockets live in.
    ///
    /// Default: the per-user runtime directory (`$XDG_RUNTIME_DIR`).
    ///
    /// # Examples
    ///
    /// ```
    /// use core_runtime::config::BridgeConfig;
    ///
    /// let builder = BridgeConfig::builder().runtime_dir("/run/user/5000");
    /// ```
    pub fn runtime_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.runtime_dir = Some(path.into());
        self
    }

    /// Sets the extension bus suffix. Default: `"Extension"`.
    pub fn extension_bus_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.extension_bus_suffix = Some(suffix.into());
        self
    }

    /// Sets the maximum transport frame size in bytes. Default: 4 MiB.
    pub fn max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = Some(bytes);
        self
    }

    /// Sets the event bus capacity. Default: 100.
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Allows documents loaded over http(s) to use extensions.
    pub fn allow_remote_origins(mut self, allow: bool) -> Self {
        self.allow_remote_origins = allow;
        self
    }

    /// Installs the navigation URL policy.
    pub fn resource_resolver(mut self, resolver: Arc<dyn ResourceResolver>) -> Self {
        self.resource_resolver = Some(resolver);
        self
    }

    /// Builds the final `BridgeConfig` instance.
    ///
    /// # Errors
    ///
    /// - `CapabilityMissing` if no runtime directory was set and the
    ///   environment does not provide one
    /// - `Config` if any value is out of range
    pub fn build(self) -> Result<BridgeConfig> {
        let runtime_dir = match self.runtime_dir {
            Some(dir) => dir,
            None => default_runtime_dir()?,
        };

        let config = BridgeConfig {
            runtime_dir,
            extension_bus_suffix: self
                .extension_bus_suffix
                .unwrap_or_else(|| DEFAULT_EXTENSION_BUS_SUFFIX.to_string()),
            max_frame_bytes: self.max_frame_bytes.unwrap_or(DEFAULT_MAX_FRAME_BYTES),
            event_buffer_size: self
                .event_buffer_size
                .unwrap_or(crate::events::DEFAULT_EVENT_BUFFER_SIZE),
            allow_remote_origins: self.allow_remote_origins,
            resource_resolver: self.resource_resolver,
        };

        config.validate()?;

        Ok(config)
    }
}
