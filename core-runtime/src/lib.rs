//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the extension bridge:
//! - Logging and tracing infrastructure
//! - Configuration management
//! - Event bus system
//!
//! ## Overview
//!
//! This crate contains the runtime utilities that the transport, protocol and
//! script-bridge crates depend on. It establishes the logging conventions,
//! configuration validation and event broadcasting used on both sides of the
//! bridge.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
