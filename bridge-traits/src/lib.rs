//! # Host Bridge Traits
//!
//! Collaborator contracts that the embedding process must implement.
//!
//! ## Overview
//!
//! The extension bridge runs inside two processes: a privileged host that owns
//! extensions, and a sandboxed content process that runs script. Neither side
//! owns the script engine, the application's resource policy, or the host's
//! log pipeline. This crate names exactly what the bridge needs from those
//! collaborators and nothing more.
//!
//! ## Traits
//!
//! ### Script Engine
//! - [`ScriptContext`](script::ScriptContext) - Identity of a live context and a
//!   queue onto its script thread
//! - [`ScriptFunction`](script::ScriptFunction) - A callable script value
//!
//! ### Application Policy
//! - [`ResourceResolver`](resource::ResourceResolver) - Allow/deny and localize
//!   navigation URLs
//!
//! ### Utilities
//! - [`LoggerSink`](log::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! All collaborator traits use [`BridgeError`](error::BridgeError). Adapters
//! should convert engine-specific failures (a thrown script exception, a
//! destroyed context) into the matching variant rather than panicking across
//! the script boundary.
//!
//! ## Thread Safety
//!
//! `ScriptContext` and `ResourceResolver` require `Send + Sync` because they
//! are consulted from the I/O side. `ScriptFunction` is only `Send`: it is
//! moved between tasks but invoked on its owning script thread.
//!
//! ## Examples
//!
//! ### Implementing ScriptContext
//!
//! ```ignore
//! use bridge_traits::error::{BridgeError, Result};
//! use bridge_traits::script::{ContextId, ScriptContext, ScriptTask};
//!
//! pub struct EngineContext {
//!     id: ContextId,
//!     runner: engine::TaskRunner,
//! }
//!
//! impl ScriptContext for EngineContext {
//!     fn id(&self) -> ContextId {
//!         self.id
//!     }
//!
//!     fn post_task(&self, task: ScriptTask) -> Result<()> {
//!         self.runner
//!             .post(task)
//!             .map_err(|_| BridgeError::ContextClosed(self.id.to_string()))
//!     }
//! }
//! ```

pub mod error;
pub mod log;
pub mod resource;
pub mod script;

pub use error::BridgeError;

// Re-export commonly used types
pub use log::{ConsoleLogger, LogEntry, LogLevel, LoggerSink};
pub use resource::ResourceResolver;
pub use script::{ContextId, ScriptContext, ScriptFunction, ScriptTask, ScriptValue};
