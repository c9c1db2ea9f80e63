//! # Extension Host
//!
//! Privileged end of the extension protocol.
//!
//! The host serves the extension bus of one application, owns the extension
//! registry, and keeps the live instances created by the content process.
//!
//! ## Instance lifecycle
//!
//! ```text
//! create-instance ──> Created ──> calls ──> destroy-instance ──> gone
//!                                   │
//!                      peer disconnect destroys every instance
//! ```
//!
//! Calls naming a handle the host does not hold fail with `InvalidInstance`.
//!
//! ## Usage
//!
//! ```ignore
//! let host = ExtensionHost::new(&config, Some(event_bus));
//! host.register_extension(Arc::new(EchoExtension))?;
//! host.start(&app_id).await?;
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use core_runtime::config::BridgeConfig;
use core_runtime::events::{BridgeEvent, EventBus, ExtensionEvent, SessionEvent};
use core_runtime::logging::summarize_payload;
use core_transport::{Fault, PeerAuthenticator, ServerConnection, TransportServer};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::{ProtocolError, Result};
use crate::extension::{send_to_content, AsyncReply, Extension, ExtensionInstance, InstanceContext};
use crate::message::{InstanceId, Message, MessageKind, DELIVER_METHOD, EXTENSION_INTERFACE};
use crate::registry::ExtensionRegistry;

type SharedInstance = Arc<Mutex<Box<dyn ExtensionInstance>>>;

struct LiveInstance {
    extension: String,
    routing_id: i32,
    connection_id: u64,
    instance: SharedInstance,
}

#[derive(Default)]
struct Tables {
    instances: HashMap<InstanceId, LiveInstance>,
    /// Routing ids announced with `endpoint-created`, per connection.
    routed: HashSet<(u64, i32)>,
}

struct HostShared {
    registry: Mutex<ExtensionRegistry>,
    tables: Mutex<Tables>,
    event_bus: Option<EventBus>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serves the extension bus for one application.
pub struct ExtensionHost {
    config: BridgeConfig,
    server: TransportServer,
    shared: Arc<HostShared>,
}

impl ExtensionHost {
    pub fn new(config: &BridgeConfig, event_bus: Option<EventBus>) -> Self {
        let server = TransportServer::new(config, event_bus.clone());
        let shared = Arc::new(HostShared {
            registry: Mutex::new(ExtensionRegistry::new()),
            tables: Mutex::new(Tables::default()),
            event_bus,
        });

        let dispatcher = Arc::clone(&shared);
        server.register_method(EXTENSION_INTERFACE, move |connection, method, args| {
            if method != DELIVER_METHOD {
                return Err(Fault::no_such_method(EXTENSION_INTERFACE, method));
            }
            let request = Message::from_value(args).map_err(|e| Fault::failed(e.to_string()))?;
            let reply = dispatcher.deliver(connection, request);
            reply.to_value().map_err(|e| Fault::failed(e.to_string()))
        });

        let cleanup = Arc::clone(&shared);
        server.set_disconnected_callback(move |connection| cleanup.disconnected(connection));

        Self {
            config: config.clone(),
            server,
            shared,
        }
    }

    /// Add an extension. Extensions may be registered before or after
    /// [`start`](Self::start).
    pub fn register_extension(&self, extension: Arc<dyn Extension>) -> Result<()> {
        let name = extension.name().to_string();
        let entry_points = extension.entry_points();
        lock(&self.shared.registry).register(extension)?;

        info!(extension = %name, "extension registered");
        self.shared.emit(ExtensionEvent::Registered { name, entry_points });
        Ok(())
    }

    /// Serve the extension bus of `app_id`.
    #[instrument(skip(self))]
    pub async fn start(&self, app_id: &str) -> Result<()> {
        let bus_name = self.config.extension_bus_name(app_id);
        self.server.start(&bus_name).await?;
        Ok(())
    }

    /// Restrict which processes may connect.
    pub fn set_peer_authenticator(&self, authenticator: PeerAuthenticator) {
        self.server.set_peer_authenticator(authenticator);
    }

    pub fn client_address(&self) -> Result<String> {
        Ok(self.server.client_address()?)
    }

    pub fn extension_names(&self) -> Vec<String> {
        lock(&self.shared.registry).names()
    }

    pub fn instance_count(&self) -> usize {
        lock(&self.shared.tables).instances.len()
    }

    /// Stop serving. Instances of the connected peer are destroyed.
    pub fn shutdown(&self) {
        self.server.shutdown();
    }
}

impl fmt::Debug for ExtensionHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionHost")
            .field("server", &self.server)
            .field("extensions", &self.extension_names())
            .field("instances", &self.instance_count())
            .finish()
    }
}

impl HostShared {
    fn emit(&self, event: ExtensionEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit(BridgeEvent::Extension(event)).ok();
        }
    }

    /// Handle one content message; the returned message is the method reply.
    fn deliver(&self, connection: &ServerConnection, request: Message) -> Message {
        debug!(
            kind = %request.kind,
            routing_id = request.routing_id,
            instance = ?request.instance,
            args = %summarize_payload(&request.value.to_string()),
            "deliver"
        );
        self.announce_endpoint(connection, request.routing_id);

        let outcome = match request.kind {
            MessageKind::GetExtensions => Ok(lock(&self.registry).describe()),
            MessageKind::GetApiScript => self.api_script(&request),
            MessageKind::CreateInstance => self.create_instance(connection, &request),
            MessageKind::DestroyInstance => self.destroy_instance(&request),
            MessageKind::PostMessage => self.post_message(&request),
            MessageKind::CallSync => self.call_sync(&request),
            MessageKind::CallAsync => self.call_async(connection, &request),
            MessageKind::PostMessageToJs | MessageKind::EndpointCreated => Err(
                ProtocolError::InvalidMessage(format!("{} is not a request", request.kind)),
            ),
        };

        match outcome {
            Ok(value) => request.reply(value),
            Err(e) => {
                debug!(kind = %request.kind, error = %e, "request failed");
                request.fault(&e)
            }
        }
    }

    fn announce_endpoint(&self, connection: &ServerConnection, routing_id: i32) {
        let first = lock(&self.tables)
            .routed
            .insert((connection.id(), routing_id));
        if !first {
            return;
        }

        debug!(routing_id, "endpoint created");
        let message = Message::new(MessageKind::EndpointCreated, routing_id);
        if let Err(e) = send_to_content(connection, &message) {
            warn!(routing_id, error = %e, "could not announce endpoint");
        }
        if let Some(bus) = &self.event_bus {
            bus.emit(BridgeEvent::Session(SessionEvent::EndpointCreated { routing_id }))
                .ok();
        }
    }

    fn extension_name(request: &Message) -> Result<&str> {
        request
            .value
            .as_str()
            .ok_or_else(|| ProtocolError::InvalidMessage("expected an extension name".to_string()))
    }

    fn api_script(&self, request: &Message) -> Result<Value> {
        let name = Self::extension_name(request)?;
        let extension = lock(&self.registry)
            .get(name)
            .ok_or_else(|| ProtocolError::UnknownExtension(name.to_string()))?;
        Ok(Value::String(extension.javascript_api().to_string()))
    }

    fn create_instance(&self, connection: &ServerConnection, request: &Message) -> Result<Value> {
        let name = Self::extension_name(request)?;
        let extension = lock(&self.registry)
            .get(name)
            .ok_or_else(|| ProtocolError::UnknownExtension(name.to_string()))?;

        let instance_id = InstanceId::new();
        let context = InstanceContext::new(instance_id, request.routing_id, connection.clone());
        let instance = extension.create_instance(context).ok_or_else(|| {
            ProtocolError::RemoteFault(format!("extension '{}' refused to create an instance", name))
        })?;

        lock(&self.tables).instances.insert(
            instance_id,
            LiveInstance {
                extension: name.to_string(),
                routing_id: request.routing_id,
                connection_id: connection.id(),
                instance: Arc::new(Mutex::new(instance)),
            },
        );

        info!(extension = name, %instance_id, routing_id = request.routing_id, "instance created");
        self.emit(ExtensionEvent::InstanceCreated {
            extension: name.to_string(),
            instance_id: instance_id.to_string(),
        });
        Ok(Value::String(instance_id.to_string()))
    }

    fn target(&self, request: &Message) -> Result<(InstanceId, SharedInstance)> {
        let instance_id = request
            .instance
            .ok_or_else(|| ProtocolError::InvalidInstance("no instance handle".to_string()))?;
        lock(&self.tables)
            .instances
            .get(&instance_id)
            .map(|live| (instance_id, Arc::clone(&live.instance)))
            .ok_or_else(|| ProtocolError::InvalidInstance(instance_id.to_string()))
    }

    fn destroy_instance(&self, request: &Message) -> Result<Value> {
        let instance_id = request
            .instance
            .ok_or_else(|| ProtocolError::InvalidInstance("no instance handle".to_string()))?;
        let live = lock(&self.tables)
            .instances
            .remove(&instance_id)
            .ok_or_else(|| ProtocolError::InvalidInstance(instance_id.to_string()))?;

        info!(extension = %live.extension, %instance_id, routing_id = live.routing_id, "instance destroyed");
        drop(live);
        self.emit(ExtensionEvent::InstanceDestroyed {
            instance_id: instance_id.to_string(),
        });
        Ok(Value::Null)
    }

    fn post_message(&self, request: &Message) -> Result<Value> {
        let (_, instance) = self.target(request)?;
        lock(&instance).handle_message(request.value.clone());
        Ok(Value::Null)
    }

    fn call_sync(&self, request: &Message) -> Result<Value> {
        let (_, instance) = self.target(request)?;
        let method = request.method.as_deref().unwrap_or_default();
        let outcome = lock(&instance)
            .handle_sync_message(method, request.value.clone())
            .map_err(ProtocolError::RemoteFault);
        outcome
    }

    fn call_async(&self, connection: &ServerConnection, request: &Message) -> Result<Value> {
        if request.call_id.is_none() {
            return Err(ProtocolError::InvalidMessage(
                "call-async without a call id".to_string(),
            ));
        }

        let reply = AsyncReply::new(connection.clone(), request.clone());
        match self.target(request) {
            Ok((_, instance)) => {
                let method = request.method.as_deref().unwrap_or_default();
                lock(&instance).handle_async_message(method, request.value.clone(), reply);
            }
            Err(e) => {
                debug!(call_id = ?request.call_id, error = %e, "async call on missing instance");
                reply.fail_with(&e);
            }
        }
        Ok(Value::Null)
    }

    fn disconnected(&self, connection: &ServerConnection) {
        let destroyed: Vec<(InstanceId, LiveInstance)> = {
            let mut tables = lock(&self.tables);
            tables
                .routed
                .retain(|(connection_id, _)| *connection_id != connection.id());
            let ids: Vec<InstanceId> = tables
                .instances
                .iter()
                .filter(|(_, live)| live.connection_id == connection.id())
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| tables.instances.remove(&id).map(|live| (id, live)))
                .collect()
        };

        if !destroyed.is_empty() {
            info!(count = destroyed.len(), "destroying instances of departed peer");
        }
        for (instance_id, live) in destroyed {
            drop(live);
            self.emit(ExtensionEvent::InstanceDestroyed {
                instance_id: instance_id.to_string(),
            });
        }
    }
}
