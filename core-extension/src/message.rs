//! # Protocol Messages
//!
//! Every exchange between the content process and the host is a [`Message`]
//! envelope carried over the extension bus:
//!
//! - content → host: a `Deliver` method call on [`EXTENSION_INTERFACE`]. Kinds
//!   that expect a reply wait for the method reply; the others are posted
//!   without one.
//! - host → content: a `Message` signal on the same interface. Asynchronous
//!   call results travel this way too, marked with `reply_to`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{ProtocolError, Result};

/// Bus interface of the extension protocol.
pub const EXTENSION_INTERFACE: &str = "org.bridge.Extension";

/// Method carrying content → host messages.
pub const DELIVER_METHOD: &str = "Deliver";

/// Signal carrying host → content messages.
pub const MESSAGE_SIGNAL: &str = "Message";

/// Prefix shared by every message type string.
pub const TYPE_PREFIX: &str = "bridge://extension/";

/// Message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "bridge://extension/get-extensions")]
    GetExtensions,
    #[serde(rename = "bridge://extension/get-api-script")]
    GetApiScript,
    #[serde(rename = "bridge://extension/create-instance")]
    CreateInstance,
    #[serde(rename = "bridge://extension/destroy-instance")]
    DestroyInstance,
    /// Unsolicited message from script to an instance.
    #[serde(rename = "bridge://extension/post-message")]
    PostMessage,
    #[serde(rename = "bridge://extension/call-sync")]
    CallSync,
    #[serde(rename = "bridge://extension/call-async")]
    CallAsync,
    /// Instance → script: an event, or an async result when `reply_to` is set.
    #[serde(rename = "bridge://extension/post-message-to-js")]
    PostMessageToJs,
    #[serde(rename = "bridge://extension/endpoint-created")]
    EndpointCreated,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::GetExtensions => "bridge://extension/get-extensions",
            MessageKind::GetApiScript => "bridge://extension/get-api-script",
            MessageKind::CreateInstance => "bridge://extension/create-instance",
            MessageKind::DestroyInstance => "bridge://extension/destroy-instance",
            MessageKind::PostMessage => "bridge://extension/post-message",
            MessageKind::CallSync => "bridge://extension/call-sync",
            MessageKind::CallAsync => "bridge://extension/call-async",
            MessageKind::PostMessageToJs => "bridge://extension/post-message-to-js",
            MessageKind::EndpointCreated => "bridge://extension/endpoint-created",
        }
    }

    /// Whether the host answers this kind with a method reply.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            MessageKind::GetExtensions
                | MessageKind::GetApiScript
                | MessageKind::CreateInstance
                | MessageKind::DestroyInstance
                | MessageKind::CallSync
        )
    }

    /// Whether the host sends this kind to the content process.
    pub fn is_host_to_content(&self) -> bool {
        matches!(
            self,
            MessageKind::PostMessageToJs | MessageKind::EndpointCreated
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| ProtocolError::InvalidMessage(format!("unknown message type '{}'", s)))
    }
}

/// Per-connection identifier of an asynchronous call.
///
/// Allocated in increasing order by the content side and echoed back by the
/// host in `reply_to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(u64);

impl CallId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for CallId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Handle of a live extension instance, issued by the host.
///
/// # Examples
///
/// ```
/// use core_extension::InstanceId;
///
/// let id = InstanceId::new();
/// let parsed = InstanceId::parse(&id.to_string()).unwrap();
/// assert_eq!(id, parsed);
/// assert!(InstanceId::parse("not-a-handle").is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a handle received from script.
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ProtocolError::InvalidInstance(s.to_string()))
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome discriminant of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Ok,
    Fault,
}

/// Protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// Content view the message belongs to.
    pub routing_id: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Set on `call-async` requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,

    /// Set on the `post-message-to-js` answering a `call-async`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<CallId>,

    #[serde(default)]
    pub status: Status,

    #[serde(default)]
    pub value: Value,
}

impl Message {
    pub fn new(kind: MessageKind, routing_id: i32) -> Self {
        Self {
            kind,
            routing_id,
            instance: None,
            method: None,
            call_id: None,
            reply_to: None,
            status: Status::Ok,
            value: Value::Null,
        }
    }

    pub fn with_instance(mut self, instance: InstanceId) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = value;
        self
    }

    pub fn with_call_id(mut self, call_id: CallId) -> Self {
        self.call_id = Some(call_id);
        self
    }

    /// Successful answer to this message.
    ///
    /// Answers to `call-async` become `post-message-to-js` with `reply_to`.
    pub fn reply(&self, value: Value) -> Message {
        let mut reply = self.answer();
        reply.value = value;
        reply
    }

    /// Fault answer to this message.
    pub fn fault(&self, error: &ProtocolError) -> Message {
        let mut reply = self.answer();
        reply.status = Status::Fault;
        reply.value = json!({
            "code": error.code(),
            "message": error.detail(),
        });
        reply
    }

    fn answer(&self) -> Message {
        let kind = match self.call_id {
            Some(_) => MessageKind::PostMessageToJs,
            None => self.kind,
        };
        Message {
            kind,
            routing_id: self.routing_id,
            instance: self.instance,
            method: None,
            call_id: None,
            reply_to: self.call_id,
            status: Status::Ok,
            value: Value::Null,
        }
    }

    pub fn is_fault(&self) -> bool {
        self.status == Status::Fault
    }

    /// The message, or the error its fault payload describes.
    pub fn into_result(self) -> Result<Message> {
        if !self.is_fault() {
            return Ok(self);
        }

        let message = self
            .value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unspecified fault")
            .to_string();
        let code = self.value.get("code").and_then(Value::as_str).unwrap_or("");

        Err(match code {
            "invalid_instance" => ProtocolError::InvalidInstance(message),
            "unknown_extension" => ProtocolError::UnknownExtension(message),
            "invalid_message" => ProtocolError::InvalidMessage(message),
            "connection_lost" => ProtocolError::ConnectionLost,
            _ => ProtocolError::RemoteFault(message),
        })
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
    }

    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
    }

    /// Parse a raw message delivered by the embedding engine.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
    }
}
