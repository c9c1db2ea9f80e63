//! # Transport Server
//!
//! Listens on a named bus socket, admits exactly one authenticated peer at a
//! time, and dispatches its method calls and property requests to handlers
//! registered per interface.
//!
//! ## Dispatch model
//!
//! Handlers are plain closures run synchronously on the connection's dispatch
//! task, one frame at a time, so a handler observes calls in wire order. The
//! registration table lock is released before a handler runs; handlers may
//! register or replace other handlers freely.
//!
//! ```ignore
//! use core_transport::{Fault, TransportServer};
//! use serde_json::Value;
//!
//! let server = TransportServer::new(&config, None);
//! server.register_method("org.test.Echo", |_conn, method, args| match method {
//!     "ping" => Ok(Value::String(args.as_str().unwrap_or_default().to_uppercase())),
//!     other => Err(Fault::no_such_method("org.test.Echo", other)),
//! });
//! server.start("app.Echo").await?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use core_runtime::config::BridgeConfig;
use core_runtime::events::{BridgeEvent, ConnectionEvent, EventBus};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::address::BusAddress;
use crate::credentials::{PeerAuthenticator, PeerCredentials};
use crate::error::{Result, TransportError};
use crate::frame::{Fault, Frame, FrameCodec, RejectReason};
use crate::lock;

/// Interface answered by the server itself with the installed schema.
pub const INTROSPECTABLE_INTERFACE: &str = "org.bridge.Introspectable";

/// Method of [`INTROSPECTABLE_INTERFACE`] returning the schema.
pub const INTROSPECT_METHOD: &str = "Introspect";

pub type MethodHandler =
    Arc<dyn Fn(&ServerConnection, &str, Value) -> std::result::Result<Value, Fault> + Send + Sync>;
pub type PropertyGetter = Arc<dyn Fn(&ServerConnection, &str) -> Option<Value> + Send + Sync>;
pub type PropertySetter = Arc<dyn Fn(&ServerConnection, &str, Value) -> bool + Send + Sync>;
pub type DisconnectedCallback = Arc<dyn Fn(&ServerConnection) + Send + Sync>;

// ============================================================================
// Server Connection
// ============================================================================

/// Handle to the peer connection currently held by a server.
///
/// Cheap to clone. Handlers receive it to emit signals back to the peer; the
/// host keeps one to answer asynchronous calls after a handler returned.
#[derive(Clone)]
pub struct ServerConnection {
    inner: Arc<ConnectionShared>,
}

struct ConnectionShared {
    id: u64,
    credentials: PeerCredentials,
    outbound: mpsc::UnboundedSender<Frame>,
    closed: CancellationToken,
}

impl ServerConnection {
    /// Server-unique connection number.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn credentials(&self) -> PeerCredentials {
        self.inner.credentials
    }

    /// Send a signal to the peer.
    ///
    /// # Errors
    ///
    /// `ConnectionLost` once the connection is closing.
    pub fn emit_signal(&self, interface: &str, signal: &str, args: Value) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::ConnectionLost);
        }
        self.send(Frame::Signal {
            interface: interface.to_string(),
            signal: signal.to_string(),
            args,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Drop the connection. Frames not yet written are discarded.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    fn send(&self, frame: Frame) -> Result<()> {
        self.inner
            .outbound
            .send(frame)
            .map_err(|_| TransportError::ConnectionLost)
    }
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("id", &self.inner.id)
            .field("credentials", &self.inner.credentials)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Server
// ============================================================================

#[derive(Default)]
struct Registry {
    methods: HashMap<String, MethodHandler>,
    getters: HashMap<String, PropertyGetter>,
    setters: HashMap<String, PropertySetter>,
}

#[derive(Default)]
struct Hooks {
    authenticator: Option<PeerAuthenticator>,
    disconnected: Option<DisconnectedCallback>,
    introspection: Option<String>,
}

struct Listening {
    address: BusAddress,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct ServerState {
    listening: Option<Listening>,
    active: Option<ServerConnection>,
}

struct ServerShared {
    config: BridgeConfig,
    event_bus: Option<EventBus>,
    registry: Mutex<Registry>,
    hooks: Mutex<Hooks>,
    state: Mutex<ServerState>,
    next_connection_id: AtomicU64,
}

/// Bus server for one named service.
pub struct TransportServer {
    shared: Arc<ServerShared>,
}

impl TransportServer {
    pub fn new(config: &BridgeConfig, event_bus: Option<EventBus>) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                config: config.clone(),
                event_bus,
                registry: Mutex::new(Registry::default()),
                hooks: Mutex::new(Hooks::default()),
                state: Mutex::new(ServerState::default()),
                next_connection_id: AtomicU64::new(1),
            }),
        }
    }

    /// Bind the socket for `service_name` and start accepting peers.
    ///
    /// A socket file left behind by a previous process is removed first. The
    /// new socket is only accessible to the owning user.
    ///
    /// # Errors
    ///
    /// - `AlreadyStarted` if this server is already listening
    /// - `Io` if the runtime directory or socket cannot be created
    #[instrument(skip(self))]
    pub async fn start(&self, service_name: &str) -> Result<()> {
        let mut state = lock(&self.shared.state);
        if state.listening.is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        let address = BusAddress::for_name(&self.shared.config, service_name);
        std::fs::create_dir_all(&self.shared.config.runtime_dir)?;
        remove_socket_file(address.path())?;

        let listener = UnixListener::bind(address.path())?;
        std::fs::set_permissions(address.path(), std::fs::Permissions::from_mode(0o600))?;

        let shutdown = CancellationToken::new();
        state.listening = Some(Listening {
            address: address.clone(),
            shutdown: shutdown.clone(),
        });
        drop(state);

        info!(%address, "bus server listening");
        self.shared.emit(ConnectionEvent::Listening {
            address: address.to_string(),
        });

        tokio::spawn(accept_loop(
            Arc::clone(&self.shared),
            listener,
            address,
            shutdown,
        ));
        Ok(())
    }

    /// Address a client passes to `TransportClient::connect`.
    ///
    /// # Errors
    ///
    /// `NotStarted` before [`start`](Self::start).
    pub fn client_address(&self) -> Result<String> {
        lock(&self.shared.state)
            .listening
            .as_ref()
            .map(|listening| listening.address.to_string())
            .ok_or(TransportError::NotStarted)
    }

    pub fn is_started(&self) -> bool {
        lock(&self.shared.state).listening.is_some()
    }

    /// Install a descriptive interface schema, served through
    /// [`INTROSPECTABLE_INTERFACE`]. Calls are not checked against it.
    pub fn set_introspection_schema(&self, schema: impl Into<String>) {
        lock(&self.shared.hooks).introspection = Some(schema.into());
    }

    /// Install the predicate every new peer must pass before any of its
    /// frames is read.
    pub fn set_peer_authenticator(&self, authenticator: PeerAuthenticator) {
        lock(&self.shared.hooks).authenticator = Some(authenticator);
    }

    /// Called once for each connection after it closed.
    pub fn set_disconnected_callback<F>(&self, callback: F)
    where
        F: Fn(&ServerConnection) + Send + Sync + 'static,
    {
        lock(&self.shared.hooks).disconnected = Some(Arc::new(callback));
    }

    /// Route method calls on `interface` to `handler`. Replaces any earlier
    /// handler for the interface.
    pub fn register_method<F>(&self, interface: impl Into<String>, handler: F)
    where
        F: Fn(&ServerConnection, &str, Value) -> std::result::Result<Value, Fault>
            + Send
            + Sync
            + 'static,
    {
        let interface = interface.into();
        let replaced = lock(&self.shared.registry)
            .methods
            .insert(interface.clone(), Arc::new(handler))
            .is_some();
        debug!(%interface, replaced, "method handler registered");
    }

    /// Route property reads on `interface` to `getter`. `None` from the
    /// getter answers `NoSuchProperty`.
    pub fn register_property_getter<F>(&self, interface: impl Into<String>, getter: F)
    where
        F: Fn(&ServerConnection, &str) -> Option<Value> + Send + Sync + 'static,
    {
        let interface = interface.into();
        let replaced = lock(&self.shared.registry)
            .getters
            .insert(interface.clone(), Arc::new(getter))
            .is_some();
        debug!(%interface, replaced, "property getter registered");
    }

    /// Route property writes on `interface` to `setter`. `false` from the
    /// setter answers a fault.
    pub fn register_property_setter<F>(&self, interface: impl Into<String>, setter: F)
    where
        F: Fn(&ServerConnection, &str, Value) -> bool + Send + Sync + 'static,
    {
        let interface = interface.into();
        let replaced = lock(&self.shared.registry)
            .setters
            .insert(interface.clone(), Arc::new(setter))
            .is_some();
        debug!(%interface, replaced, "property setter registered");
    }

    /// The peer connection, if one is held.
    pub fn active_connection(&self) -> Option<ServerConnection> {
        lock(&self.shared.state)
            .active
            .clone()
            .filter(|connection| !connection.is_closed())
    }

    /// Stop accepting, drop the active peer, and remove the socket file.
    pub fn shutdown(&self) {
        let (listening, active) = {
            let mut state = lock(&self.shared.state);
            (state.listening.take(), state.active.take())
        };

        if let Some(active) = active {
            active.close();
        }

        if let Some(listening) = listening {
            listening.shutdown.cancel();
            if let Err(e) = remove_socket_file(listening.address.path()) {
                warn!(address = %listening.address, error = %e, "could not remove bus socket");
            }
            info!(address = %listening.address, "bus server stopped");
        }
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TransportServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportServer")
            .field("address", &self.client_address().ok())
            .finish()
    }
}

fn remove_socket_file(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed bus socket");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

async fn accept_loop(
    shared: Arc<ServerShared>,
    listener: UnixListener,
    address: BusAddress,
    shutdown: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(%address, error = %e, "accept failed");
                    continue;
                }
            },
        };
        Arc::clone(&shared).admit(stream, &address, &shutdown).await;
    }
    debug!(%address, "accept loop stopped");
}

impl ServerShared {
    fn emit(&self, event: ConnectionEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit(BridgeEvent::Connection(event)).ok();
        }
    }

    fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.config.max_frame_bytes)
    }

    async fn admit(
        self: Arc<Self>,
        stream: UnixStream,
        address: &BusAddress,
        shutdown: &CancellationToken,
    ) {
        let credentials = match PeerCredentials::from_stream(&stream) {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(error = %e, "could not read peer credentials");
                self.reject(stream, None, RejectReason::Unauthorized).await;
                return;
            }
        };

        let authenticator = lock(&self.hooks).authenticator.clone();
        if let Some(authenticator) = authenticator {
            if !authenticator(&credentials) {
                self.reject(stream, Some(credentials.uid), RejectReason::Unauthorized)
                    .await;
                return;
            }
        }

        let admitted = {
            let mut state = lock(&self.state);
            let busy = state
                .active
                .as_ref()
                .is_some_and(|active| !active.is_closed());
            if busy {
                None
            } else {
                let (outbound, outbound_rx) = mpsc::unbounded_channel();
                let connection = ServerConnection {
                    inner: Arc::new(ConnectionShared {
                        id: self.next_connection_id.fetch_add(1, Ordering::Relaxed),
                        credentials,
                        outbound,
                        closed: shutdown.child_token(),
                    }),
                };
                state.active = Some(connection.clone());
                Some((connection, outbound_rx))
            }
        };

        let Some((connection, outbound_rx)) = admitted else {
            self.reject(stream, Some(credentials.uid), RejectReason::Busy)
                .await;
            return;
        };

        info!(
            connection = connection.id(),
            pid = ?credentials.pid,
            uid = credentials.uid,
            "peer accepted"
        );
        self.emit(ConnectionEvent::PeerAccepted {
            pid: credentials.pid,
            uid: credentials.uid,
            gid: credentials.gid,
        });

        tokio::spawn(self.serve(stream, connection, outbound_rx, address.clone()));
    }

    async fn reject(&self, stream: UnixStream, uid: Option<u32>, reason: RejectReason) {
        warn!(?uid, reason = reason.as_str(), "peer rejected");
        self.emit(ConnectionEvent::PeerRejected {
            uid,
            reason: reason.as_str().to_string(),
        });

        let mut framed = Framed::new(stream, self.codec());
        if let Err(e) = framed.send(Frame::Reject { reason }).await {
            debug!(error = %e, "could not deliver rejection");
        }
    }

    async fn serve(
        self: Arc<Self>,
        stream: UnixStream,
        connection: ServerConnection,
        outbound: mpsc::UnboundedReceiver<Frame>,
        address: BusAddress,
    ) {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, self.codec());
        let writer = FramedWrite::new(write_half, self.codec());
        let closed = connection.inner.closed.clone();

        let writer_task = tokio::spawn(write_loop(writer, outbound, closed.clone()));

        let reason = loop {
            let frame = tokio::select! {
                _ = closed.cancelled() => break None,
                frame = reader.next() => frame,
            };
            match frame {
                Some(Ok(frame)) => self.dispatch(&connection, frame),
                Some(Err(e)) => {
                    warn!(connection = connection.id(), error = %e, "dropping peer after bad frame");
                    break Some(e.to_string());
                }
                None => break None,
            }
        };

        connection.close();
        if let Err(e) = writer_task.await {
            warn!(error = %e, "connection writer ended abnormally");
        }

        {
            let mut state = lock(&self.state);
            if state
                .active
                .as_ref()
                .is_some_and(|active| active.id() == connection.id())
            {
                state.active = None;
            }
        }

        info!(connection = connection.id(), "peer disconnected");
        let callback = lock(&self.hooks).disconnected.clone();
        if let Some(callback) = callback {
            callback(&connection);
        }
        self.emit(ConnectionEvent::Disconnected {
            address: address.to_string(),
            reason,
        });
    }

    fn dispatch(&self, connection: &ServerConnection, frame: Frame) {
        match frame {
            Frame::MethodCall {
                serial,
                interface,
                method,
                args,
                no_reply,
            } => {
                debug!(serial, %interface, %method, no_reply, "method call");
                let outcome = self.invoke_method(connection, &interface, &method, args);
                if no_reply {
                    if let Err(fault) = outcome {
                        debug!(%interface, %method, fault = %fault.message, "fault on call without reply");
                    }
                    return;
                }
                self.reply(connection, Frame::outcome(serial, outcome));
            }
            Frame::GetProperty {
                serial,
                interface,
                property,
            } => {
                let getter = lock(&self.registry).getters.get(&interface).cloned();
                let outcome = match getter {
                    None => Err(Fault::no_such_interface(&interface)),
                    Some(getter) => getter(connection, &property)
                        .ok_or_else(|| Fault::no_such_property(&interface, &property)),
                };
                self.reply(connection, Frame::outcome(serial, outcome));
            }
            Frame::SetProperty {
                serial,
                interface,
                property,
                value,
            } => {
                let setter = lock(&self.registry).setters.get(&interface).cloned();
                let outcome = match setter {
                    None => Err(Fault::no_such_interface(&interface)),
                    Some(setter) => {
                        if setter(connection, &property, value) {
                            Ok(Value::Null)
                        } else {
                            Err(Fault::failed(format!(
                                "property {}.{} was not set",
                                interface, property
                            )))
                        }
                    }
                };
                self.reply(connection, Frame::outcome(serial, outcome));
            }
            other => {
                warn!(frame = other.kind(), "unexpected frame from peer");
            }
        }
    }

    fn invoke_method(
        &self,
        connection: &ServerConnection,
        interface: &str,
        method: &str,
        args: Value,
    ) -> std::result::Result<Value, Fault> {
        let handler = lock(&self.registry).methods.get(interface).cloned();
        match handler {
            Some(handler) => handler(connection, method, args),
            None if interface == INTROSPECTABLE_INTERFACE && method == INTROSPECT_METHOD => {
                lock(&self.hooks)
                    .introspection
                    .clone()
                    .map(Value::String)
                    .ok_or_else(|| Fault::failed("no introspection schema installed"))
            }
            None if interface == INTROSPECTABLE_INTERFACE => {
                Err(Fault::no_such_method(interface, method))
            }
            None => Err(Fault::no_such_interface(interface)),
        }
    }

    fn reply(&self, connection: &ServerConnection, frame: Frame) {
        if connection.send(frame).is_err() {
            debug!(connection = connection.id(), "reply dropped; connection closing");
        }
    }
}

async fn write_loop(
    mut writer: FramedWrite<tokio::net::unix::OwnedWriteHalf, FrameCodec>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    closed: CancellationToken,
) {
    if let Err(e) = writer.send(Frame::Accept).await {
        debug!(error = %e, "peer left before accept");
        closed.cancel();
        return;
    }

    loop {
        let frame = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let reply_serial = frame.reply_serial();
        match writer.send(frame).await {
            Ok(()) => {}
            Err(TransportError::FrameTooLarge { size, limit }) => {
                warn!(size, limit, "outbound frame over limit");
                let Some(serial) = reply_serial else {
                    continue;
                };
                let fault = Frame::fault(
                    serial,
                    Fault::failed(format!(
                        "reply of {} bytes exceeds the {} byte limit",
                        size, limit
                    )),
                );
                if writer.send(fault).await.is_err() {
                    closed.cancel();
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "write to peer failed");
                closed.cancel();
                break;
            }
        }
    }
}
