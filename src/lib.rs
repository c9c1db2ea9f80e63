//! Workspace façade crate.
//!
//! This crate exists to expose shared feature flags that map to the individual
//! workspace crates (`core-transport`, `core-extension`, `bridge-bundle`).
//! Embedders can depend on `extension-bridge-workspace` and enable only the
//! layer they need: `transport` for the raw message bus, `host` for the
//! privileged extension side, `bundle` for the content-process script bridge.

#[cfg(feature = "bundle")]
pub use bridge_bundle as bundle;

#[cfg(feature = "host")]
pub use core_extension as extension;

#[cfg(feature = "transport")]
pub use core_transport as transport;
