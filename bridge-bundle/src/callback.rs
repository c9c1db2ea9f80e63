//! Thread-bound handles to script functions.

use std::fmt;
use std::mem;
use std::thread::{self, ThreadId};

use bridge_traits::error::{BridgeError, Result};
use bridge_traits::{ContextId, ScriptFunction, ScriptValue};
use tracing::warn;

/// Single-owner binding to a script function.
///
/// Bound to the thread that created it, which is the owning context's script
/// thread. It can be moved across threads (a pending call carries it to the
/// I/O side and back) but only invoked on that thread. Dropping it on that
/// thread releases the engine-side reference; dropping it anywhere else leaks
/// the reference instead, so the engine never sees a release off its thread.
pub struct ScriptCallback {
    context: ContextId,
    owner: ThreadId,
    function: Option<Box<dyn ScriptFunction>>,
}

impl ScriptCallback {
    /// Bind `function` to the calling thread.
    pub fn new(context: ContextId, function: Box<dyn ScriptFunction>) -> Self {
        Self {
            context,
            owner: thread::current().id(),
            function: Some(function),
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Invoke the function.
    ///
    /// # Errors
    ///
    /// `WrongThread` when called off the owning thread; the function is not
    /// invoked. Otherwise whatever the function returns.
    pub fn call(&self, args: Vec<ScriptValue>) -> Result<()> {
        if thread::current().id() != self.owner {
            return Err(BridgeError::WrongThread);
        }
        match &self.function {
            Some(function) => function.call(args),
            None => Err(BridgeError::ContextClosed(self.context.to_string())),
        }
    }
}

impl Drop for ScriptCallback {
    fn drop(&mut self) {
        let Some(function) = self.function.take() else {
            return;
        };
        if thread::current().id() != self.owner {
            warn!(context = %self.context, "script callback dropped off its script thread; leaking it");
            mem::forget(function);
        }
    }
}

impl fmt::Debug for ScriptCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptCallback")
            .field("context", &self.context)
            .field("owner", &self.owner)
            .finish()
    }
}
