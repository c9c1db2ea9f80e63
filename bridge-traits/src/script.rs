//! Script Engine Abstractions
//!
//! The embedding script engine is an external collaborator. The bridge only
//! needs three things from it: a stable identity per script context, a way to
//! run a closure on that context's script thread, and callable function
//! values.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// Value exchanged with script code.
///
/// Script engines expose their own value types; adapters convert to and from
/// JSON at the boundary so the bridge never holds engine handles directly.
pub type ScriptValue = serde_json::Value;

/// Work item executed on a script thread.
pub type ScriptTask = Box<dyn FnOnce() + Send + 'static>;

/// Identifier of one script context (one document/frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(u64);

impl ContextId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

impl From<u64> for ContextId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// A function value owned by script.
///
/// Implementations keep the engine-side reference alive and release it on
/// drop. `call` is only ever made from the owning context's script thread.
pub trait ScriptFunction: Send {
    /// Invoke the function with already-converted arguments.
    fn call(&self, args: Vec<ScriptValue>) -> Result<()>;
}

impl<F> ScriptFunction for F
where
    F: Fn(Vec<ScriptValue>) -> Result<()> + Send,
{
    fn call(&self, args: Vec<ScriptValue>) -> Result<()> {
        self(args)
    }
}

/// A live script context provided by the engine.
///
/// # Thread Model
///
/// Script values may only be touched on the context's script thread. Anything
/// that arrives from the I/O side must be handed to [`post_task`](Self::post_task),
/// which queues it for that thread. Once the context is torn down `post_task`
/// fails with [`BridgeError::ContextClosed`](crate::error::BridgeError::ContextClosed)
/// and the task is dropped unrun.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::script::{ScriptContext, ScriptTask};
///
/// fn deliver(ctx: &dyn ScriptContext, payload: String) {
///     let task: ScriptTask = Box::new(move || println!("on script thread: {payload}"));
///     if let Err(e) = ctx.post_task(task) {
///         eprintln!("context gone: {e}");
///     }
/// }
/// ```
pub trait ScriptContext: Send + Sync {
    /// Stable identifier of this context.
    fn id(&self) -> ContextId;

    /// Queue `task` for execution on the script thread.
    fn post_task(&self, task: ScriptTask) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_context_id_display() {
        let id = ContextId::new(7);
        assert_eq!(id.to_string(), "ctx-7");
        assert_eq!(ContextId::from(7), id);
        assert_eq!(id.as_u64(), 7);
    }

    #[test]
    fn test_closure_is_script_function() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let func = move |args: Vec<ScriptValue>| -> Result<()> {
            counter.fetch_add(args.len(), Ordering::SeqCst);
            Ok(())
        };

        let boxed: Box<dyn ScriptFunction> = Box::new(func);
        boxed
            .call(vec![ScriptValue::from("a"), ScriptValue::from(1)])
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_script_function_error_propagates() {
        let func = |_args: Vec<ScriptValue>| -> Result<()> {
            Err(BridgeError::OperationFailed("thrown".into()))
        };
        assert!(matches!(
            ScriptFunction::call(&func, vec![]),
            Err(BridgeError::OperationFailed(_))
        ));
    }
}
