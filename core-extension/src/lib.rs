//! # Core Extension
//!
//! The extension call protocol layered on the bus transport.
//!
//! ## Overview
//!
//! - [`message`]: message kinds and the envelope both sides exchange
//! - [`IpcClient`]: content side; fire-and-forget, blocking and asynchronous
//!   sends with call-id correlation
//! - [`ExtensionHost`]: privileged side; extension registry and live
//!   instances, dispatched from the bus
//!
//! ```text
//! script ─> IpcClient ──Deliver──> ExtensionHost ─> ExtensionInstance
//!              ^                        │
//!              └──── Message signal ────┘  (async replies, events)
//! ```

pub mod error;
pub mod extension;
pub mod host;
pub mod ipc_client;
pub mod message;
pub mod pending;
pub mod registry;

pub use error::{ProtocolError, Result};
pub use extension::{AsyncReply, Extension, ExtensionInstance, InstanceContext};
pub use host::ExtensionHost;
pub use ipc_client::{IpcClient, MessageListener};
pub use message::{CallId, InstanceId, Message, MessageKind, Status};
pub use pending::{CallOwner, Completion, PendingCall, PendingCalls};
pub use registry::ExtensionRegistry;
