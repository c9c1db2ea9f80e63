//! Contracts implemented by host-side extensions.

use std::fmt;

use core_transport::ServerConnection;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};
use crate::message::{InstanceId, Message, MessageKind, EXTENSION_INTERFACE, MESSAGE_SIGNAL};

/// A capability offered to script by the host.
///
/// # Examples
///
/// ```
/// use core_extension::{Extension, ExtensionInstance, InstanceContext};
/// use serde_json::Value;
///
/// struct Echo;
///
/// impl Extension for Echo {
///     fn name(&self) -> &str {
///         "echo"
///     }
///
///     fn entry_points(&self) -> Vec<String> {
///         vec!["tizen.echo".to_string()]
///     }
///
///     fn create_instance(&self, _context: InstanceContext) -> Option<Box<dyn ExtensionInstance>> {
///         Some(Box::new(EchoInstance))
///     }
/// }
///
/// struct EchoInstance;
///
/// impl ExtensionInstance for EchoInstance {
///     fn handle_sync_message(&mut self, _method: &str, args: Value) -> Result<Value, String> {
///         Ok(args)
///     }
/// }
/// ```
pub trait Extension: Send + Sync {
    /// Unique name script uses to create instances.
    fn name(&self) -> &str;

    /// Script source installing the extension's API.
    fn javascript_api(&self) -> &str {
        ""
    }

    /// Additional global names the API defines.
    fn entry_points(&self) -> Vec<String> {
        Vec::new()
    }

    /// Create an instance for one script context. `None` refuses.
    fn create_instance(&self, context: InstanceContext) -> Option<Box<dyn ExtensionInstance>>;
}

/// Per-script-context state of an extension.
///
/// Methods run synchronously on the bus dispatch task, one at a time.
pub trait ExtensionInstance: Send {
    /// Unsolicited message from script.
    fn handle_message(&mut self, message: Value) {
        debug!(?message, "instance ignores posted message");
    }

    /// Blocking call from script. `Err` is sent back as a fault.
    fn handle_sync_message(&mut self, method: &str, args: Value) -> std::result::Result<Value, String>;

    /// Call whose answer may come later through `reply`.
    fn handle_async_message(&mut self, method: &str, args: Value, reply: AsyncReply) {
        match self.handle_sync_message(method, args) {
            Ok(value) => reply.send(value),
            Err(message) => reply.fail(message),
        }
    }
}

/// What an instance knows about where it lives.
#[derive(Clone)]
pub struct InstanceContext {
    instance_id: InstanceId,
    routing_id: i32,
    connection: ServerConnection,
}

impl InstanceContext {
    pub(crate) fn new(instance_id: InstanceId, routing_id: i32, connection: ServerConnection) -> Self {
        Self {
            instance_id,
            routing_id,
            connection,
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn routing_id(&self) -> i32 {
        self.routing_id
    }

    /// Push an event to the instance's listener in script.
    pub fn post_message(&self, value: Value) -> Result<()> {
        let message = Message::new(MessageKind::PostMessageToJs, self.routing_id)
            .with_instance(self.instance_id)
            .with_value(value);
        send_to_content(&self.connection, &message)
    }
}

impl fmt::Debug for InstanceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceContext")
            .field("instance_id", &self.instance_id)
            .field("routing_id", &self.routing_id)
            .finish()
    }
}

pub(crate) fn send_to_content(connection: &ServerConnection, message: &Message) -> Result<()> {
    connection.emit_signal(EXTENSION_INTERFACE, MESSAGE_SIGNAL, message.to_value()?)?;
    Ok(())
}

/// Single-use answer to an asynchronous call.
///
/// Dropping it unanswered sends a fault, so the caller's pending call still
/// completes exactly once.
pub struct AsyncReply {
    target: Option<(ServerConnection, Message)>,
}

impl AsyncReply {
    pub(crate) fn new(connection: ServerConnection, request: Message) -> Self {
        Self {
            target: Some((connection, request)),
        }
    }

    pub fn send(mut self, value: Value) {
        if let Some((connection, request)) = self.target.take() {
            deliver(&connection, request.reply(value));
        }
    }

    pub fn fail(self, message: impl Into<String>) {
        self.fail_with(&ProtocolError::RemoteFault(message.into()));
    }

    pub(crate) fn fail_with(mut self, error: &ProtocolError) {
        if let Some((connection, request)) = self.target.take() {
            deliver(&connection, request.fault(error));
        }
    }
}

impl Drop for AsyncReply {
    fn drop(&mut self) {
        if let Some((connection, request)) = self.target.take() {
            warn!(call_id = ?request.call_id, "async call dropped without an answer");
            deliver(
                &connection,
                request.fault(&ProtocolError::RemoteFault(
                    "extension dropped the call".to_string(),
                )),
            );
        }
    }
}

impl fmt::Debug for AsyncReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncReply")
            .field("call_id", &self.target.as_ref().and_then(|(_, m)| m.call_id))
            .finish()
    }
}

fn deliver(connection: &ServerConnection, reply: Message) {
    if let Err(e) = send_to_content(connection, &reply) {
        debug!(reply_to = ?reply.reply_to, error = %e, "async reply not delivered");
    }
}
