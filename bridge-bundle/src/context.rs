//! Queue-backed [`ScriptContext`] for embedders without their own task
//! runner, and for tests.
//!
//! The thread that drives the [`ScriptQueue`] is the context's script
//! thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bridge_traits::error::{BridgeError, Result};
use bridge_traits::{ContextId, ScriptContext, ScriptTask};
use tokio::sync::mpsc;

pub struct QueuedScriptContext {
    id: ContextId,
    sender: mpsc::UnboundedSender<ScriptTask>,
    closed: AtomicBool,
}

/// Receiving end of a [`QueuedScriptContext`].
pub struct ScriptQueue {
    receiver: mpsc::UnboundedReceiver<ScriptTask>,
}

impl QueuedScriptContext {
    pub fn new(id: ContextId) -> (Arc<Self>, ScriptQueue) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let context = Arc::new(Self {
            id,
            sender,
            closed: AtomicBool::new(false),
        });
        (context, ScriptQueue { receiver })
    }

    /// Refuse further tasks.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ScriptContext for QueuedScriptContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn post_task(&self, task: ScriptTask) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::ContextClosed(self.id.to_string()));
        }
        self.sender
            .send(task)
            .map_err(|_| BridgeError::ContextClosed(self.id.to_string()))
    }
}

impl ScriptQueue {
    /// Run every task queued so far. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.receiver.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Park until a task arrives and run it. Returns false once the context
    /// is gone and the queue is empty.
    ///
    /// Must not be called from an async task.
    pub fn run_next_blocking(&mut self) -> bool {
        match self.receiver.blocking_recv() {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }
}
