//! # Injected Bundle
//!
//! Content-process side of the bridge, driven by the script engine.
//!
//! ## Overview
//!
//! The engine calls the seven lifecycle entry points (`on_process_attach`,
//! `on_session_start`, `on_session_stop`, `on_url_rewrite`,
//! `on_database_attach`, `on_preload`, `on_ipc_message`). Script reaches
//! extensions through the script API methods, each keyed by the calling
//! context's [`ContextId`].
//!
//! ## Threads
//!
//! Script API methods run on the calling context's script thread. Sync calls
//! park that thread until the host answers. Async answers and host events
//! arrive on the transport's reader task and are marshaled back through the
//! context's [`ScriptContext::post_task`] before any script function runs.
//!
//! ## Degraded mode
//!
//! Without a host connection (attach failed, or the connection dropped) the
//! extension list is empty and calls fail with `NotConnected` or
//! `ConnectionLost`. Nothing panics across the script boundary.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bridge_traits::{ContextId, ScriptContext, ScriptFunction, ScriptValue};
use core_extension::{CallId, InstanceId, IpcClient, Message, MessageKind, ProtocolError};
use core_runtime::config::BridgeConfig;
use core_runtime::events::{BridgeEvent, EventBus, SessionEvent};
use core_runtime::logging::summarize_payload;
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tracing::{debug, info, instrument, warn};

use crate::callback::ScriptCallback;
use crate::error::{BundleError, Result};
use crate::session::{Session, SessionStart};

/// Replacement for navigation targets the resolver denies.
pub const BLANK_URL: &str = "about:blank";

/// URL schemes that name packaged resources.
const LOCAL_SCHEMES: [&str; 2] = ["file:/", "app:/"];

/// Routing id used for requests not tied to a content view.
const PRELOAD_ROUTING_ID: i32 = 0;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct BundleShared {
    config: BridgeConfig,
    runtime: Handle,
    event_bus: Option<EventBus>,
    app_id: Mutex<Option<String>>,
    ipc: Mutex<Option<Arc<IpcClient>>>,
    sessions: Mutex<HashMap<ContextId, Arc<Session>>>,
    extensions: Mutex<Option<Value>>,
}

impl BundleShared {
    fn emit(&self, event: SessionEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit(BridgeEvent::Session(event)).ok();
        }
    }

    /// Every session rendering into `routing_id`. Frames of one view share it.
    fn sessions_for_routing(&self, routing_id: i32) -> Vec<Arc<Session>> {
        lock(&self.sessions)
            .values()
            .filter(|session| session.routing_id() == routing_id)
            .cloned()
            .collect()
    }

    /// The session that created `instance`, if it renders into `routing_id`.
    fn session_owning(&self, instance: InstanceId, routing_id: i32) -> Option<Arc<Session>> {
        lock(&self.sessions)
            .values()
            .find(|session| session.routing_id() == routing_id && session.owns(instance))
            .cloned()
    }

    /// Host messages that are not answers to an async call.
    fn route_host_message(&self, message: Message) {
        match message.kind {
            MessageKind::EndpointCreated => {
                let sessions = self.sessions_for_routing(message.routing_id);
                if sessions.is_empty() {
                    debug!(routing_id = message.routing_id, "endpoint for unknown view");
                }
                for session in sessions {
                    debug!(routing_id = message.routing_id, context = %session.context_id(), "endpoint ready");
                    session.mark_endpoint_ready();
                }
            }
            MessageKind::PostMessageToJs => {
                let Some(instance) = message.instance else {
                    warn!(routing_id = message.routing_id, "event without an instance");
                    return;
                };
                match self.session_owning(instance, message.routing_id) {
                    Some(session) => {
                        debug!(
                            routing_id = message.routing_id,
                            %instance,
                            payload = %summarize_payload(&message.value.to_string()),
                            "instance event"
                        );
                        session.deliver_event(instance, message.value)
                    }
                    None => debug!(routing_id = message.routing_id, %instance, "event for unowned instance"),
                }
            }
            other => warn!(kind = %other, "unexpected host message"),
        }
    }
}

/// The script bridge of one content process.
#[derive(Clone)]
pub struct InjectedBundle {
    shared: Arc<BundleShared>,
}

impl InjectedBundle {
    /// Create a bundle bound to the current tokio runtime.
    ///
    /// # Errors
    ///
    /// `Runtime(CapabilityMissing)` when called outside a tokio runtime.
    pub fn new(config: BridgeConfig, event_bus: Option<EventBus>) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            BundleError::Runtime(core_runtime::Error::CapabilityMissing {
                capability: "AsyncRuntime".to_string(),
                message: format!(
                    "The bundle drives its host connection on a tokio runtime. \
                     Create it inside one, or use InjectedBundle::with_runtime ({})",
                    e
                ),
            })
        })?;
        Ok(Self::with_runtime(config, runtime, event_bus))
    }

    /// Create a bundle that runs its connection on `runtime`.
    pub fn with_runtime(config: BridgeConfig, runtime: Handle, event_bus: Option<EventBus>) -> Self {
        Self {
            shared: Arc::new(BundleShared {
                config,
                runtime,
                event_bus,
                app_id: Mutex::new(None),
                ipc: Mutex::new(None),
                sessions: Mutex::new(HashMap::new()),
                extensions: Mutex::new(None),
            }),
        }
    }

    // ========================================================================
    // Engine entry points
    // ========================================================================

    /// Connect to the host's extension bus.
    ///
    /// Blocks the calling thread on the bundle's runtime. On failure the
    /// bundle stays in degraded mode and the error is returned for the
    /// engine to log.
    ///
    /// # Errors
    ///
    /// `Runtime(CapabilityMissing)` when called from a thread that is already
    /// driving a runtime, such as inside an async task. Use
    /// [`attach`](Self::attach) there.
    pub fn on_process_attach(&self, app_id: &str) -> Result<()> {
        let blocking = AssertUnwindSafe(|| self.shared.runtime.block_on(self.attach(app_id)));
        panic::catch_unwind(blocking).unwrap_or_else(|_| {
            Err(BundleError::Runtime(core_runtime::Error::CapabilityMissing {
                capability: "BlockingThread".to_string(),
                message: "on_process_attach blocks until connected and cannot run \
                          inside an async task; await InjectedBundle::attach instead"
                    .to_string(),
            }))
        })
    }

    /// [`on_process_attach`](Self::on_process_attach) for async callers.
    #[instrument(skip(self))]
    pub async fn attach(&self, app_id: &str) -> Result<()> {
        *lock(&self.shared.app_id) = Some(app_id.to_string());

        let client = match IpcClient::connect(
            &self.shared.config,
            app_id,
            self.shared.event_bus.clone(),
        )
        .await
        {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "extension host unavailable; no extensions will load");
                return Err(e.into());
            }
        };

        let shared: Weak<BundleShared> = Arc::downgrade(&self.shared);
        client.set_message_listener(move |message| {
            if let Some(shared) = shared.upgrade() {
                shared.route_host_message(message);
            }
        });

        let previous = lock(&self.shared.ipc).replace(Arc::new(client));
        if let Some(previous) = previous {
            previous.close();
        }
        *lock(&self.shared.extensions) = None;
        info!("attached to extension host");
        Ok(())
    }

    /// Bind a new script context to its content view.
    ///
    /// # Errors
    ///
    /// - `ExternalOriginRejected` if the document has no base URL or is
    ///   remote and remote origins are not allowed; no session is created
    /// - `SessionAlreadyStarted` if the context already has one
    #[instrument(skip(self, context, start), fields(context = %context.id(), routing_id = start.routing_id))]
    pub fn on_session_start(
        &self,
        context: Arc<dyn ScriptContext>,
        start: SessionStart,
    ) -> Result<()> {
        let context_id = context.id();
        let routing_id = start.routing_id;

        let base_url = match start.base_url.clone() {
            Some(url) if self.shared.config.allow_remote_origins || !url.starts_with("http") => url,
            rejected => {
                let base_url = rejected.unwrap_or_default();
                info!(%base_url, "extensions withheld from remote document");
                self.shared.emit(SessionEvent::ExternalOriginRejected {
                    routing_id,
                    base_url: base_url.clone(),
                });
                return Err(BundleError::ExternalOriginRejected(base_url));
            }
        };

        {
            let mut sessions = lock(&self.shared.sessions);
            if sessions.contains_key(&context_id) {
                return Err(BundleError::SessionAlreadyStarted(context_id));
            }
            let session = Session::new(context, start, base_url.clone());
            sessions.insert(context_id, Arc::new(session));
        }

        info!(%base_url, "session started");
        self.shared.emit(SessionEvent::Started {
            routing_id,
            context_id: context_id.as_u64(),
            base_url,
        });
        Ok(())
    }

    /// Release a script context.
    ///
    /// Pending async calls issued from this context are dropped without
    /// completing, its listeners are released and its instances are
    /// destroyed on the host. Other contexts sharing its routing id are left
    /// alone. Returns how many pending calls were released.
    #[instrument(skip(self))]
    pub fn on_session_stop(&self, context_id: ContextId) -> Result<usize> {
        let session = lock(&self.shared.sessions)
            .remove(&context_id)
            .ok_or(BundleError::UnknownContext(context_id))?;
        let routing_id = session.routing_id();
        let instances = session.stop();

        let released_calls = match self.ipc() {
            Ok(ipc) => {
                let released = ipc.release_owner(context_id.as_u64());
                for instance in instances {
                    let destroy = Message::new(MessageKind::DestroyInstance, routing_id)
                        .with_instance(instance);
                    if let Err(e) = ipc.send_message(destroy) {
                        debug!(%instance, error = %e, "could not destroy instance");
                    }
                }
                released
            }
            Err(_) => 0,
        };

        info!(routing_id, released_calls, "session stopped");
        self.shared.emit(SessionEvent::Stopped {
            routing_id,
            context_id: context_id.as_u64(),
            released_calls,
        });
        Ok(released_calls)
    }

    /// Map a navigation URL to what should actually load.
    ///
    /// Denied URLs become `about:blank`. Allowed `file:` and `app:` URLs are
    /// localized. Everything else, and every URL when no resolver is
    /// configured, is returned unchanged.
    pub fn on_url_rewrite(&self, url: &str) -> String {
        let Some(resolver) = &self.shared.config.resource_resolver else {
            return url.to_string();
        };

        if !resolver.allowed(url) {
            debug!(url, "navigation denied");
            return BLANK_URL.to_string();
        }

        if LOCAL_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
            let localized = resolver.localized_path(url);
            if localized != url {
                debug!(url, %localized, "navigation localized");
            }
            return localized;
        }

        url.to_string()
    }

    /// Storage attach notification. The bridge keeps no storage state.
    pub fn on_database_attach(&self, enabled: bool) {
        debug!(enabled, "database attach");
    }

    /// Warm the extension list before the first document asks for it.
    ///
    /// Blocks the calling thread while the host answers.
    pub fn on_preload(&self) {
        let Ok(ipc) = self.ipc() else {
            debug!("preload without a host connection");
            return;
        };
        if lock(&self.shared.extensions).is_some() {
            return;
        }
        match ipc.send_sync_message(Message::new(MessageKind::GetExtensions, PRELOAD_ROUTING_ID)) {
            Ok(reply) => *lock(&self.shared.extensions) = Some(reply.value),
            Err(e) => warn!(error = %e, "could not preload extension list"),
        }
    }

    /// Raw protocol message forwarded by the engine.
    pub fn on_ipc_message(&self, data: &[u8]) -> Result<()> {
        let message = Message::from_slice(data)?;
        self.ipc()?.handle_message_from_runtime(message);
        Ok(())
    }

    // ========================================================================
    // Script API
    // ========================================================================

    /// Extension metadata as a JSON array. Empty in degraded mode.
    pub fn extensions(&self, context_id: ContextId) -> Result<Value> {
        let session = self.session(context_id)?;
        if let Some(cached) = lock(&self.shared.extensions).clone() {
            return Ok(cached);
        }

        let Ok(ipc) = self.ipc() else {
            return Ok(json!([]));
        };
        match ipc.send_sync_message(Message::new(MessageKind::GetExtensions, session.routing_id()))
        {
            Ok(reply) => {
                *lock(&self.shared.extensions) = Some(reply.value.clone());
                Ok(reply.value)
            }
            Err(e) if e.is_connection_lost() => {
                warn!("extension host lost; no extensions available");
                Ok(json!([]))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Script source of an extension's API.
    pub fn api_script(&self, context_id: ContextId, extension: &str) -> Result<String> {
        let reply = self.send_sync(
            context_id,
            |routing_id| Message::new(MessageKind::GetApiScript, routing_id).with_value(json!(extension)),
        )?;
        Ok(reply.value.as_str().unwrap_or_default().to_string())
    }

    /// Create an instance of `extension` owned by this context.
    pub fn create_instance(&self, context_id: ContextId, extension: &str) -> Result<InstanceId> {
        let session = self.session(context_id)?;
        let reply = self.ipc()?.send_sync_message(
            Message::new(MessageKind::CreateInstance, session.routing_id()).with_value(json!(extension)),
        )?;

        let handle = reply.value.as_str().ok_or_else(|| {
            ProtocolError::InvalidMessage("create-instance reply without a handle".to_string())
        })?;
        let instance = InstanceId::parse(handle)?;
        session.track(instance);
        debug!(%context_id, extension, %instance, "instance created");
        Ok(instance)
    }

    pub fn destroy_instance(&self, context_id: ContextId, instance: InstanceId) -> Result<()> {
        let session = self.session(context_id)?;
        session.untrack(instance);
        self.ipc()?.send_sync_message(
            Message::new(MessageKind::DestroyInstance, session.routing_id()).with_instance(instance),
        )?;
        Ok(())
    }

    /// Fire-and-forget message to an instance.
    pub fn post_message(
        &self,
        context_id: ContextId,
        instance: InstanceId,
        value: ScriptValue,
    ) -> Result<()> {
        let session = self.session(context_id)?;
        self.ipc()?.send_message(
            Message::new(MessageKind::PostMessage, session.routing_id())
                .with_instance(instance)
                .with_value(value),
        )?;
        Ok(())
    }

    /// Call an instance method and park the script thread for the result.
    pub fn call_sync(
        &self,
        context_id: ContextId,
        instance: InstanceId,
        method: &str,
        args: ScriptValue,
    ) -> Result<ScriptValue> {
        let reply = self.send_sync(context_id, |routing_id| {
            Message::new(MessageKind::CallSync, routing_id)
                .with_instance(instance)
                .with_method(method)
                .with_value(args)
        })?;
        Ok(reply.value)
    }

    /// Call an instance method and return at once.
    ///
    /// `callback` is bound to the calling thread and later invoked there,
    /// exactly once, with `[null, result]` or `[{code, message}, null]`. It
    /// is released without being invoked if the session stops first.
    pub fn call_async(
        &self,
        context_id: ContextId,
        instance: InstanceId,
        method: &str,
        args: ScriptValue,
        callback: Box<dyn ScriptFunction>,
    ) -> Result<CallId> {
        let session = self.session(context_id)?;
        let ipc = self.ipc()?;
        let callback = ScriptCallback::new(context_id, callback);
        let owner = Arc::downgrade(&session);

        let message = Message::new(MessageKind::CallAsync, session.routing_id())
            .with_instance(instance)
            .with_method(method)
            .with_value(args);

        let call_id = ipc.send_async_message(context_id.as_u64(), message, move |result| {
            let args = match result {
                Ok(reply) => vec![Value::Null, reply.value],
                Err(e) => vec![json!({ "code": e.code(), "message": e.detail() }), Value::Null],
            };
            let Some(session) = owner.upgrade() else {
                debug!("async reply for a stopped session");
                return;
            };
            let queued = session.marshal(move |_| {
                if let Err(e) = callback.call(args) {
                    warn!(error = %e, "async callback failed");
                }
            });
            if let Err(e) = queued {
                debug!(error = %e, "async reply for a closed context");
            }
        })?;
        Ok(call_id)
    }

    /// Register the receiver of unsolicited events from `instance`,
    /// replacing any earlier one.
    pub fn set_message_listener(
        &self,
        context_id: ContextId,
        instance: InstanceId,
        listener: Box<dyn ScriptFunction>,
    ) -> Result<()> {
        let session = self.session(context_id)?;
        session.set_listener(instance, ScriptCallback::new(context_id, listener));
        Ok(())
    }

    /// Whether the host has announced its endpoint for this context's view.
    pub fn endpoint_ready(&self, context_id: ContextId) -> Result<bool> {
        Ok(self.session(context_id)?.endpoint_ready())
    }

    // ========================================================================
    // State
    // ========================================================================

    pub fn app_id(&self) -> Option<String> {
        lock(&self.shared.app_id).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.ipc().map(|ipc| ipc.is_connected()).unwrap_or(false)
    }

    pub fn session_count(&self) -> usize {
        lock(&self.shared.sessions).len()
    }

    /// Async calls awaiting an answer, across all sessions.
    pub fn pending_calls(&self) -> usize {
        self.ipc().map(|ipc| ipc.pending_calls()).unwrap_or(0)
    }

    /// Close the host connection. Pending calls complete with
    /// `ConnectionLost`.
    pub fn detach(&self) {
        let ipc = lock(&self.shared.ipc).take();
        if let Some(ipc) = ipc {
            ipc.close();
        }
        *lock(&self.shared.extensions) = None;
    }

    fn session(&self, context_id: ContextId) -> Result<Arc<Session>> {
        lock(&self.shared.sessions)
            .get(&context_id)
            .cloned()
            .ok_or(BundleError::UnknownContext(context_id))
    }

    fn ipc(&self) -> Result<Arc<IpcClient>> {
        lock(&self.shared.ipc)
            .clone()
            .ok_or(BundleError::NotConnected)
    }

    fn send_sync(
        &self,
        context_id: ContextId,
        build: impl FnOnce(i32) -> Message,
    ) -> Result<Message> {
        let session = self.session(context_id)?;
        let message = build(session.routing_id());
        Ok(self.ipc()?.send_sync_message(message)?)
    }
}

impl std::fmt::Debug for InjectedBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectedBundle")
            .field("app_id", &self.app_id())
            .field("sessions", &self.session_count())
            .field("connected", &self.is_connected())
            .finish()
    }
}
