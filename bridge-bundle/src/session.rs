//! Per-context session state.
//!
//! A session binds one live script context to the routing id of its content
//! view. It owns the instances that context created and the message listener
//! registered for each of them. Work headed for script is queued through
//! [`Session::marshal`], which re-checks on the script thread that the session
//! is still running before touching anything.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bridge_traits::error::Result;
use bridge_traits::{ContextId, ScriptContext, ScriptValue};
use core_extension::InstanceId;
use tracing::{debug, warn};

use crate::callback::ScriptCallback;

/// Document parameters reported when a script context starts.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStart {
    /// Content view the context renders into.
    pub routing_id: i32,
    /// Device scale factor.
    pub scale: f64,
    /// Path of the application bundle.
    pub bundle_descriptor: String,
    /// UI theme name.
    pub theme: String,
    /// Document base URL, when the engine knows it.
    pub base_url: Option<String>,
}

impl SessionStart {
    pub fn new(routing_id: i32, base_url: impl Into<String>) -> Self {
        Self {
            routing_id,
            scale: 1.0,
            bundle_descriptor: String::new(),
            theme: String::new(),
            base_url: Some(base_url.into()),
        }
    }
}

pub struct Session {
    context: Arc<dyn ScriptContext>,
    routing_id: i32,
    base_url: String,
    scale: f64,
    bundle_descriptor: String,
    theme: String,
    instances: Mutex<HashSet<InstanceId>>,
    listeners: Mutex<HashMap<InstanceId, ScriptCallback>>,
    endpoint_ready: AtomicBool,
    stopped: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    pub(crate) fn new(context: Arc<dyn ScriptContext>, start: SessionStart, base_url: String) -> Self {
        Self {
            context,
            routing_id: start.routing_id,
            base_url,
            scale: start.scale,
            bundle_descriptor: start.bundle_descriptor,
            theme: start.theme,
            instances: Mutex::new(HashSet::new()),
            listeners: Mutex::new(HashMap::new()),
            endpoint_ready: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn context_id(&self) -> ContextId {
        self.context.id()
    }

    pub fn routing_id(&self) -> i32 {
        self.routing_id
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn bundle_descriptor(&self) -> &str {
        &self.bundle_descriptor
    }

    pub fn theme(&self) -> &str {
        &self.theme
    }

    /// Whether the host has announced its endpoint for this routing id.
    pub fn endpoint_ready(&self) -> bool {
        self.endpoint_ready.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_endpoint_ready(&self) {
        self.endpoint_ready.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn instances(&self) -> Vec<InstanceId> {
        lock(&self.instances).iter().copied().collect()
    }

    /// Whether this session created `instance` and has not destroyed it.
    pub fn owns(&self, instance: InstanceId) -> bool {
        lock(&self.instances).contains(&instance)
    }

    pub(crate) fn track(&self, instance: InstanceId) {
        lock(&self.instances).insert(instance);
    }

    pub(crate) fn untrack(&self, instance: InstanceId) {
        lock(&self.instances).remove(&instance);
        lock(&self.listeners).remove(&instance);
    }

    pub(crate) fn set_listener(&self, instance: InstanceId, callback: ScriptCallback) {
        lock(&self.listeners).insert(instance, callback);
    }

    pub fn has_listener(&self, instance: InstanceId) -> bool {
        lock(&self.listeners).contains_key(&instance)
    }

    /// End the session: nothing queued afterwards reaches script, and every
    /// listener is released. Returns the instances it still owned.
    pub(crate) fn stop(&self) -> Vec<InstanceId> {
        self.stopped.store(true, Ordering::SeqCst);
        lock(&self.listeners).clear();
        lock(&self.instances).drain().collect()
    }

    /// Queue `task` for the script thread.
    ///
    /// The task holds only a weak reference; it is skipped if the session
    /// has been stopped or dropped by the time the script thread runs it.
    ///
    /// # Errors
    ///
    /// `ContextClosed` if the context no longer accepts tasks; `task` is
    /// dropped unrun.
    pub fn marshal<F>(self: &Arc<Self>, task: F) -> Result<()>
    where
        F: FnOnce(&Session) + Send + 'static,
    {
        let session = Arc::downgrade(self);
        self.context.post_task(Box::new(move || {
            match session.upgrade() {
                Some(session) if !session.is_stopped() => task(session.as_ref()),
                _ => debug!("session gone before script task ran"),
            }
        }))
    }

    /// Hand an unsolicited host event to the instance's listener on the
    /// script thread.
    pub(crate) fn deliver_event(self: &Arc<Self>, instance: InstanceId, value: ScriptValue) {
        let queued = self.marshal(move |session| {
            // Taken out while it runs so the listener may replace itself.
            let Some(listener) = lock(&session.listeners).remove(&instance) else {
                debug!(%instance, "no listener for instance event");
                return;
            };
            if let Err(e) = listener.call(vec![value]) {
                warn!(%instance, error = %e, "message listener failed");
            }
            if !session.is_stopped() && lock(&session.instances).contains(&instance) {
                lock(&session.listeners).entry(instance).or_insert(listener);
            }
        });
        if let Err(e) = queued {
            debug!(%instance, error = %e, "dropping event for closed context");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("context", &self.context_id())
            .field("routing_id", &self.routing_id)
            .field("base_url", &self.base_url)
            .field("endpoint_ready", &self.endpoint_ready())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
