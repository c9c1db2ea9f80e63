//! # Injected Bundle
//!
//! Script bridge of the content process.
//!
//! ## Overview
//!
//! The script engine loads this crate into every content process and drives
//! it through the lifecycle entry points of [`InjectedBundle`]. The bundle
//! owns one [`Session`] per live script context and exposes the extension
//! protocol to script:
//! - `extensions` / `api_script` for discovery
//! - `create_instance` / `destroy_instance`
//! - `post_message`, `call_sync` and `call_async`
//! - `set_message_listener` for events pushed by an instance
//!
//! Script functions are wrapped in a [`ScriptCallback`] bound to the script
//! thread that created them. Async results and host events are queued back to
//! that thread through the context's task queue, and never run once the
//! session has stopped.
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_bundle::{InjectedBundle, QueuedScriptContext, SessionStart};
//! use bridge_traits::ContextId;
//! use core_runtime::config::BridgeConfig;
//!
//! let bundle = InjectedBundle::with_runtime(config, runtime.handle().clone(), None);
//! bundle.on_process_attach("2f1c7a4e")?;
//!
//! let (context, mut queue) = QueuedScriptContext::new(ContextId::new(1));
//! bundle.on_session_start(context, SessionStart::new(1, "file:///app/index.html"))?;
//!
//! let echo = bundle.create_instance(ContextId::new(1), "echo")?;
//! let reply = bundle.call_sync(ContextId::new(1), echo, "ping", "x".into())?;
//! queue.run_pending();
//! ```

mod bundle;
mod callback;
mod context;
mod error;
mod session;

pub use bundle::{InjectedBundle, BLANK_URL};
pub use callback::ScriptCallback;
pub use context::{QueuedScriptContext, ScriptQueue};
pub use error::{BundleError, Result};
pub use session::{Session, SessionStart};
