//! # IPC Client
//!
//! Content-process end of the extension protocol.
//!
//! ## Overview
//!
//! `IpcClient` wraps a [`TransportClient`] connected to the host's extension
//! bus and offers the three ways of talking to the host:
//!
//! - [`send_message`](IpcClient::send_message): fire-and-forget
//! - [`send_sync_message`](IpcClient::send_sync_message): parks the calling
//!   thread until the reply arrives
//! - [`send_async_message`](IpcClient::send_async_message): records a pending
//!   call and returns; the completion runs when the host answers with a
//!   matching `reply_to`
//!
//! Everything the host sends arrives through
//! [`handle_message_from_runtime`](IpcClient::handle_message_from_runtime).
//! Async answers complete their pending call; all other messages go to the
//! message listener.
//!
//! ## Connection loss
//!
//! When the bus connection drops, every parked sync call returns
//! `ConnectionLost` and every pending async call completes once with
//! `ConnectionLost`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use core_runtime::config::BridgeConfig;
use core_runtime::events::{BridgeEvent, EventBus, ExtensionEvent};
use core_transport::{ClientOptions, TransportClient};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::{ProtocolError, Result};
use crate::message::{CallId, Message, DELIVER_METHOD, EXTENSION_INTERFACE, MESSAGE_SIGNAL};
use crate::pending::{CallOwner, Completion, PendingCalls};

/// Receives host messages that do not answer an async call.
pub type MessageListener = Arc<dyn Fn(Message) + Send + Sync>;

/// Routes host messages to pending calls or the listener.
///
/// Shared with the transport's signal and disconnect callbacks, so it must
/// not hold the transport itself.
struct Inbound {
    pending: PendingCalls,
    listener: Mutex<Option<MessageListener>>,
    event_bus: Option<EventBus>,
}

impl Inbound {
    fn dispatch(&self, message: Message) {
        if let Some(call_id) = message.reply_to {
            match self.pending.take(call_id) {
                Some(call) => {
                    debug!(%call_id, routing_id = message.routing_id, "async reply");
                    call.complete(message.into_result());
                }
                None => debug!(%call_id, "reply for a call that is no longer pending"),
            }
            return;
        }

        if !message.kind.is_host_to_content() {
            warn!(kind = %message.kind, "ignoring message not meant for content");
            return;
        }

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match listener {
            Some(listener) => listener(message),
            None => debug!(kind = %message.kind, "no listener for host message"),
        }
    }

    fn flush(&self, reason: &str) {
        let calls = self.pending.drain();
        if calls.is_empty() {
            return;
        }

        warn!(count = calls.len(), reason, "flushing pending calls");
        let count = calls.len();
        for call in calls {
            call.complete(Err(ProtocolError::ConnectionLost));
        }

        if let Some(bus) = &self.event_bus {
            bus.emit(BridgeEvent::Extension(ExtensionEvent::PendingCallsFlushed {
                count,
                reason: reason.to_string(),
            }))
            .ok();
        }
    }
}

/// Content-side protocol client.
pub struct IpcClient {
    transport: TransportClient,
    inbound: Arc<Inbound>,
    next_call_id: AtomicU64,
}

impl IpcClient {
    /// Connect to the extension bus of `app_id`.
    ///
    /// # Errors
    ///
    /// `Transport` if the bus cannot be reached or rejects this process.
    #[instrument(skip(config, event_bus))]
    pub async fn connect(
        config: &BridgeConfig,
        app_id: &str,
        event_bus: Option<EventBus>,
    ) -> Result<Self> {
        let mut options = ClientOptions::from_config(config);
        if let Some(bus) = &event_bus {
            options = options.with_event_bus(bus.clone());
        }

        let bus_name = config.extension_bus_name(app_id);
        let transport = TransportClient::connect_by_name(config, &bus_name, options).await?;
        info!(%bus_name, "extension bus connected");
        Ok(Self::new(transport, event_bus))
    }

    /// Wrap an established transport connection.
    pub fn new(transport: TransportClient, event_bus: Option<EventBus>) -> Self {
        let inbound = Arc::new(Inbound {
            pending: PendingCalls::new(),
            listener: Mutex::new(None),
            event_bus,
        });

        let signals = Arc::clone(&inbound);
        transport.set_signal_callback(EXTENSION_INTERFACE, move |signal, args| {
            if signal != MESSAGE_SIGNAL {
                debug!(signal, "ignoring unknown extension signal");
                return;
            }
            match Message::from_value(args) {
                Ok(message) => signals.dispatch(message),
                Err(e) => warn!(error = %e, "dropping malformed host message"),
            }
        });

        let teardown = Arc::clone(&inbound);
        transport.set_disconnected_callback(move || teardown.flush("connection lost"));

        Self {
            transport,
            inbound,
            next_call_id: AtomicU64::new(1),
        }
    }

    /// Install the receiver of host events (`post-message-to-js` without
    /// `reply_to`, and `endpoint-created`). Replaces any earlier listener.
    pub fn set_message_listener<F>(&self, listener: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        *self
            .inbound
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
    }

    /// Send without waiting for, or expecting, an answer.
    pub fn send_message(&self, message: Message) -> Result<()> {
        debug!(kind = %message.kind, routing_id = message.routing_id, "send");
        self.transport
            .post(EXTENSION_INTERFACE, DELIVER_METHOD, message.to_value()?)?;
        Ok(())
    }

    /// Send and park the calling thread until the host replies.
    ///
    /// Must not be called from an async task or from the transport's
    /// callbacks.
    ///
    /// # Errors
    ///
    /// - the error a fault reply describes (`InvalidInstance`,
    ///   `UnknownExtension`, `RemoteFault`)
    /// - `Transport(ConnectionLost)` if the connection drops first
    pub fn send_sync_message(&self, message: Message) -> Result<Message> {
        debug!(kind = %message.kind, routing_id = message.routing_id, "send sync");
        let args = message.to_value()?;
        let reply: Value = self
            .transport
            .call_blocking(EXTENSION_INTERFACE, DELIVER_METHOD, args)?;
        Message::from_value(reply)?.into_result()
    }

    /// [`send_sync_message`](Self::send_sync_message) for async callers.
    pub async fn send_sync_message_async(&self, message: Message) -> Result<Message> {
        let reply: Value = self
            .transport
            .call(EXTENSION_INTERFACE, DELIVER_METHOD, message.to_value()?)
            .await?;
        Message::from_value(reply)?.into_result()
    }

    /// Send a call whose answer arrives later, and return at once.
    ///
    /// The message is sent with a fresh call id and recorded under `owner`.
    /// `completion` runs exactly once, on the transport's reader task, with
    /// the answer or with `ConnectionLost`. It does not run if the call is
    /// released with [`release_owner`](Self::release_owner); it is dropped
    /// instead.
    ///
    /// # Errors
    ///
    /// If the message cannot be sent, the call is withdrawn, `completion` is
    /// dropped without running, and the send error is returned.
    pub fn send_async_message<F>(
        &self,
        owner: CallOwner,
        message: Message,
        completion: F,
    ) -> Result<CallId>
    where
        F: FnOnce(Result<Message>) + Send + 'static,
    {
        let call_id = CallId::from(self.next_call_id.fetch_add(1, Ordering::Relaxed));
        let message = message.with_call_id(call_id);
        let args = message.to_value()?;

        let completion: Completion = Box::new(completion);
        self.inbound
            .pending
            .insert(call_id, message.routing_id, owner, completion)?;
        debug!(%call_id, kind = %message.kind, routing_id = message.routing_id, owner, "send async");

        if let Err(e) = self.transport.post(EXTENSION_INTERFACE, DELIVER_METHOD, args) {
            // Teardown may already have completed the call with ConnectionLost.
            if self.inbound.pending.take(call_id).is_some() {
                return Err(e.into());
            }
        }
        Ok(call_id)
    }

    /// Single entry point for messages from the host.
    pub fn handle_message_from_runtime(&self, message: Message) {
        self.inbound.dispatch(message);
    }

    /// Drop the pending calls issued by `owner` without running their
    /// completions. Returns how many were released.
    pub fn release_owner(&self, owner: CallOwner) -> usize {
        self.inbound.pending.release_owner(owner)
    }

    pub fn pending_calls(&self) -> usize {
        self.inbound.pending.len()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Close the bus connection. Pending calls complete with
    /// `ConnectionLost`.
    pub fn close(&self) {
        self.transport.close();
    }
}

impl std::fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcClient")
            .field("transport", &self.transport)
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

