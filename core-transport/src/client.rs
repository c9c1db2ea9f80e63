//! # Transport Client
//!
//! Connects to a bus server, correlates replies to calls by serial, and routes
//! signals to one callback per interface.
//!
//! ## Calls
//!
//! - [`call`](TransportClient::call) awaits the reply and decodes it into the
//!   caller's expected type.
//! - [`call_blocking`](TransportClient::call_blocking) parks the calling
//!   thread instead. Use it from threads outside the async runtime only.
//! - [`post`](TransportClient::post) sends without waiting for any reply.
//!
//! When the connection drops, every call still waiting completes with
//! `ConnectionLost`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use core_runtime::config::{BridgeConfig, DEFAULT_MAX_FRAME_BYTES};
use core_runtime::events::{BridgeEvent, ConnectionEvent, EventBus};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::address::BusAddress;
use crate::error::{Result, TransportError};
use crate::frame::{Fault, Frame, FrameCodec, RejectReason};
use crate::lock;

/// How long a server may take to accept or reject a new connection.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub type SignalCallback = Arc<dyn Fn(&str, Value) + Send + Sync>;

type PendingReply = oneshot::Sender<Result<Value>>;
type DisconnectHook = Box<dyn FnOnce() + Send>;

/// Lifecycle of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Closed locally with [`TransportClient::close`].
    Closed,
}

/// Connection options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub max_frame_bytes: usize,
    pub event_bus: Option<EventBus>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            event_bus: None,
        }
    }
}

impl ClientOptions {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            max_frame_bytes: config.max_frame_bytes,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }
}

#[derive(Default)]
struct DisconnectSlot {
    fired: bool,
    hook: Option<DisconnectHook>,
}

struct ClientShared {
    address: BusAddress,
    event_bus: Option<EventBus>,
    next_serial: AtomicU64,
    pending: Mutex<HashMap<u64, PendingReply>>,
    signal_callbacks: Mutex<HashMap<String, SignalCallback>>,
    state: Mutex<ConnectionState>,
    disconnect: Mutex<DisconnectSlot>,
    outbound: mpsc::UnboundedSender<Frame>,
    closed: CancellationToken,
}

/// Client end of a bus connection.
pub struct TransportClient {
    shared: Arc<ClientShared>,
}

impl TransportClient {
    /// Connect to a bus address such as `unix:path=/run/user/5000/.app.Extension`.
    ///
    /// # Errors
    ///
    /// - `InvalidAddress` if the address cannot be parsed
    /// - `Connection` if the socket cannot be reached or the server is busy
    /// - `Authentication` if the server refused our credentials
    pub async fn connect(address: &str, options: ClientOptions) -> Result<Self> {
        let address: BusAddress = address.parse()?;
        Self::connect_to(address, options).await
    }

    /// Connect to a bus registered by name in the configured runtime directory.
    pub async fn connect_by_name(
        config: &BridgeConfig,
        name: &str,
        options: ClientOptions,
    ) -> Result<Self> {
        Self::connect_to(BusAddress::for_name(config, name), options).await
    }

    #[instrument(skip_all, fields(address = %address))]
    async fn connect_to(address: BusAddress, options: ClientOptions) -> Result<Self> {
        debug!(state = ?ConnectionState::Connecting, "dialing bus");

        let stream = UnixStream::connect(address.path())
            .await
            .map_err(|e| TransportError::Connection(format!("{}: {}", address, e)))?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, FrameCodec::new(options.max_frame_bytes));
        let writer = FramedWrite::new(write_half, FrameCodec::new(options.max_frame_bytes));

        let greeting = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.next())
            .await
            .map_err(|_| TransportError::Connection(format!("{}: handshake timed out", address)))?;

        match greeting {
            Some(Ok(Frame::Accept)) => {}
            Some(Ok(Frame::Reject {
                reason: RejectReason::Unauthorized,
            })) => return Err(TransportError::Authentication),
            Some(Ok(Frame::Reject {
                reason: RejectReason::Busy,
            })) => {
                return Err(TransportError::Connection(format!(
                    "{} already serves another peer",
                    address
                )))
            }
            Some(Ok(other)) => {
                return Err(TransportError::Connection(format!(
                    "unexpected {} frame during handshake",
                    other.kind()
                )))
            }
            Some(Err(e)) => {
                return Err(TransportError::Connection(format!(
                    "handshake failed: {}",
                    e
                )))
            }
            None => {
                return Err(TransportError::Connection(
                    "server closed the connection during handshake".to_string(),
                ))
            }
        }

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ClientShared {
            address,
            event_bus: options.event_bus,
            next_serial: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            signal_callbacks: Mutex::new(HashMap::new()),
            state: Mutex::new(ConnectionState::Connected),
            disconnect: Mutex::new(DisconnectSlot::default()),
            outbound,
            closed: CancellationToken::new(),
        });

        tokio::spawn(write_loop(Arc::clone(&shared), writer, outbound_rx));
        tokio::spawn(read_loop(Arc::clone(&shared), reader));

        info!(address = %shared.address, "connected to bus");
        shared.emit(ConnectionEvent::Connected {
            address: shared.address.to_string(),
        });

        Ok(Self { shared })
    }

    /// Call `method` on `interface` and decode the reply as `T`.
    ///
    /// # Errors
    ///
    /// - `NoSuchInterface`/`NoSuchMethod`/`RemoteFault` from the server
    /// - `ConnectionLost` if the connection drops first
    /// - `InvalidReply` if the reply does not decode as `T`
    pub async fn call<T: DeserializeOwned>(
        &self,
        interface: &str,
        method: &str,
        args: Value,
    ) -> Result<T> {
        let reply = self.shared.request(|serial| Frame::MethodCall {
            serial,
            interface: interface.to_string(),
            method: method.to_string(),
            args,
            no_reply: false,
        })?;
        decode_reply(reply.await)
    }

    /// Blocking form of [`call`](Self::call).
    ///
    /// Parks the current thread until the reply arrives or the connection is
    /// lost. Must not be called from an async task: the reply is delivered by
    /// a task on the runtime.
    pub fn call_blocking<T: DeserializeOwned>(
        &self,
        interface: &str,
        method: &str,
        args: Value,
    ) -> Result<T> {
        let reply = self.shared.request(|serial| Frame::MethodCall {
            serial,
            interface: interface.to_string(),
            method: method.to_string(),
            args,
            no_reply: false,
        })?;
        decode_reply(reply.blocking_recv())
    }

    /// Fire-and-forget call; the server sends no reply.
    pub fn post(&self, interface: &str, method: &str, args: Value) -> Result<()> {
        if self.shared.closed.is_cancelled() {
            return Err(self.shared.unavailable());
        }
        let serial = self.shared.next_serial();
        self.shared
            .outbound
            .send(Frame::MethodCall {
                serial,
                interface: interface.to_string(),
                method: method.to_string(),
                args,
                no_reply: true,
            })
            .map_err(|_| TransportError::ConnectionLost)
    }

    pub async fn get_property<T: DeserializeOwned>(
        &self,
        interface: &str,
        property: &str,
    ) -> Result<T> {
        let reply = self.shared.request(|serial| Frame::GetProperty {
            serial,
            interface: interface.to_string(),
            property: property.to_string(),
        })?;
        decode_reply(reply.await)
    }

    pub async fn set_property(&self, interface: &str, property: &str, value: Value) -> Result<()> {
        let reply = self.shared.request(|serial| Frame::SetProperty {
            serial,
            interface: interface.to_string(),
            property: property.to_string(),
            value,
        })?;
        decode_reply::<Value>(reply.await).map(|_| ())
    }

    /// Route signals on `interface` to `callback`, replacing any previous one.
    ///
    /// Callbacks run on the connection's reader task and must not block.
    pub fn set_signal_callback<F>(&self, interface: impl Into<String>, callback: F)
    where
        F: Fn(&str, Value) + Send + Sync + 'static,
    {
        lock(&self.shared.signal_callbacks).insert(interface.into(), Arc::new(callback));
    }

    pub fn remove_signal_callback(&self, interface: &str) {
        lock(&self.shared.signal_callbacks).remove(interface);
    }

    /// Run `hook` once the connection is gone and every waiting call was
    /// failed. Runs immediately if that already happened.
    pub fn set_disconnected_callback<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = lock(&self.shared.disconnect);
        if slot.fired {
            drop(slot);
            hook();
        } else {
            slot.hook = Some(Box::new(hook));
        }
    }

    pub fn address(&self) -> &BusAddress {
        &self.shared.address
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Calls sent and still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Close the connection. Waiting calls fail with `ConnectionLost`.
    pub fn close(&self) {
        {
            let mut state = lock(&self.shared.state);
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Closed;
            }
        }
        self.shared.closed.cancel();
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportClient")
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .finish()
    }
}

fn decode_reply<T: DeserializeOwned>(
    received: std::result::Result<Result<Value>, oneshot::error::RecvError>,
) -> Result<T> {
    let body = received.map_err(|_| TransportError::ConnectionLost)??;
    serde_json::from_value(body).map_err(|e| TransportError::InvalidReply(e.to_string()))
}

impl ClientShared {
    fn emit(&self, event: ConnectionEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit(BridgeEvent::Connection(event)).ok();
        }
    }

    fn next_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn unavailable(&self) -> TransportError {
        match *lock(&self.state) {
            ConnectionState::Closed => TransportError::NotConnected,
            _ => TransportError::ConnectionLost,
        }
    }

    /// Register a waiter and send the request built for its serial.
    fn request(
        &self,
        build: impl FnOnce(u64) -> Frame,
    ) -> Result<oneshot::Receiver<Result<Value>>> {
        let serial = self.next_serial();
        let (tx, rx) = oneshot::channel();
        {
            // Checked under the table lock so teardown cannot miss the entry.
            let mut pending = lock(&self.pending);
            if self.closed.is_cancelled() {
                drop(pending);
                return Err(self.unavailable());
            }
            pending.insert(serial, tx);
        }

        if self.outbound.send(build(serial)).is_err() {
            lock(&self.pending).remove(&serial);
            return Err(TransportError::ConnectionLost);
        }
        Ok(rx)
    }

    fn complete(&self, serial: u64, result: Result<Value>) {
        let waiter = lock(&self.pending).remove(&serial);
        match waiter {
            Some(waiter) => {
                if waiter.send(result).is_err() {
                    debug!(serial, "caller stopped waiting before the reply");
                }
            }
            None => debug!(serial, "reply for unknown serial"),
        }
    }

    fn route(&self, frame: Frame) {
        match frame {
            Frame::Reply { reply_serial, body } => self.complete(reply_serial, Ok(body)),
            Frame::Fault {
                reply_serial,
                kind,
                message,
            } => self.complete(reply_serial, Err(Fault { kind, message }.into_error())),
            Frame::Signal {
                interface,
                signal,
                args,
            } => {
                let callback = lock(&self.signal_callbacks).get(&interface).cloned();
                match callback {
                    Some(callback) => callback(&signal, args),
                    None => debug!(%interface, %signal, "no callback for signal"),
                }
            }
            other => warn!(frame = other.kind(), "unexpected frame from server"),
        }
    }

    fn teardown(&self, reason: Option<String>) {
        self.closed.cancel();
        {
            let mut state = lock(&self.state);
            if *state != ConnectionState::Closed {
                *state = ConnectionState::Disconnected;
            }
        }

        let waiting: Vec<PendingReply> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        if !waiting.is_empty() {
            warn!(count = waiting.len(), "failing calls on lost connection");
        }
        for waiter in waiting {
            waiter.send(Err(TransportError::ConnectionLost)).ok();
        }

        match &reason {
            Some(reason) => warn!(address = %self.address, %reason, "bus connection lost"),
            None => info!(address = %self.address, "bus connection closed"),
        }

        let hook = {
            let mut slot = lock(&self.disconnect);
            slot.fired = true;
            slot.hook.take()
        };
        if let Some(hook) = hook {
            hook();
        }

        self.emit(ConnectionEvent::Disconnected {
            address: self.address.to_string(),
            reason,
        });
    }
}

async fn read_loop(shared: Arc<ClientShared>, mut reader: FramedRead<OwnedReadHalf, FrameCodec>) {
    let reason = loop {
        let frame = tokio::select! {
            _ = shared.closed.cancelled() => break None,
            frame = reader.next() => frame,
        };
        match frame {
            Some(Ok(frame)) => shared.route(frame),
            Some(Err(e)) => break Some(e.to_string()),
            None => break Some("server closed the connection".to_string()),
        }
    };
    shared.teardown(reason);
}

async fn write_loop(
    shared: Arc<ClientShared>,
    mut writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let serial = frame.serial();
        match writer.send(frame).await {
            Ok(()) => {}
            Err(e @ TransportError::FrameTooLarge { .. }) => {
                warn!(error = %e, "request not sent");
                if let Some(serial) = serial {
                    shared.complete(serial, Err(e));
                }
            }
            Err(e) => {
                warn!(error = %e, "write to server failed");
                shared.closed.cancel();
                break;
            }
        }
    }
}
