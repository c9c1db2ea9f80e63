//! Wire frames and their codec.
//!
//! Every frame is a JSON document behind a 4-byte big-endian length prefix.
//! The server speaks first on a fresh connection: `Accept`, or `Reject` and
//! close.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::{Result, TransportError};

/// Why a server refused a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The peer authenticator returned false.
    Unauthorized,
    /// Another peer already holds the connection.
    Busy,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Unauthorized => "unauthorized",
            RejectReason::Busy => "busy",
        }
    }
}

/// Discriminant of a fault reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    NoSuchInterface,
    NoSuchMethod,
    NoSuchProperty,
    Failed,
}

/// Error returned by a server-side handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Failed,
            message: message.into(),
        }
    }

    pub fn no_such_interface(interface: &str) -> Self {
        Self {
            kind: FaultKind::NoSuchInterface,
            message: interface.to_string(),
        }
    }

    pub fn no_such_method(interface: &str, method: &str) -> Self {
        Self {
            kind: FaultKind::NoSuchMethod,
            message: format!("{}.{}", interface, method),
        }
    }

    pub fn no_such_property(interface: &str, property: &str) -> Self {
        Self {
            kind: FaultKind::NoSuchProperty,
            message: format!("{}.{}", interface, property),
        }
    }

    /// Client-side error for this fault.
    pub fn into_error(self) -> TransportError {
        match self.kind {
            FaultKind::NoSuchInterface => TransportError::NoSuchInterface(self.message),
            FaultKind::NoSuchMethod => TransportError::NoSuchMethod(self.message),
            FaultKind::NoSuchProperty => TransportError::NoSuchProperty(self.message),
            FaultKind::Failed => TransportError::RemoteFault(self.message),
        }
    }
}

/// One message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Accept,
    Reject {
        reason: RejectReason,
    },
    MethodCall {
        serial: u64,
        interface: String,
        method: String,
        args: Value,
        /// Caller does not wait for a reply.
        #[serde(default)]
        no_reply: bool,
    },
    GetProperty {
        serial: u64,
        interface: String,
        property: String,
    },
    SetProperty {
        serial: u64,
        interface: String,
        property: String,
        value: Value,
    },
    Reply {
        reply_serial: u64,
        body: Value,
    },
    Fault {
        reply_serial: u64,
        kind: FaultKind,
        message: String,
    },
    Signal {
        interface: String,
        signal: String,
        args: Value,
    },
}

impl Frame {
    /// Frame type name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Accept => "accept",
            Frame::Reject { .. } => "reject",
            Frame::MethodCall { .. } => "method_call",
            Frame::GetProperty { .. } => "get_property",
            Frame::SetProperty { .. } => "set_property",
            Frame::Reply { .. } => "reply",
            Frame::Fault { .. } => "fault",
            Frame::Signal { .. } => "signal",
        }
    }

    /// Serial of a request frame.
    pub fn serial(&self) -> Option<u64> {
        match self {
            Frame::MethodCall { serial, .. }
            | Frame::GetProperty { serial, .. }
            | Frame::SetProperty { serial, .. } => Some(*serial),
            _ => None,
        }
    }

    /// Serial a reply or fault answers.
    pub fn reply_serial(&self) -> Option<u64> {
        match self {
            Frame::Reply { reply_serial, .. } | Frame::Fault { reply_serial, .. } => {
                Some(*reply_serial)
            }
            _ => None,
        }
    }

    pub fn fault(reply_serial: u64, fault: Fault) -> Self {
        Frame::Fault {
            reply_serial,
            kind: fault.kind,
            message: fault.message,
        }
    }

    /// Reply or fault frame for a handler outcome.
    pub fn outcome(reply_serial: u64, outcome: std::result::Result<Value, Fault>) -> Self {
        match outcome {
            Ok(body) => Frame::Reply { reply_serial, body },
            Err(fault) => Frame::fault(reply_serial, fault),
        }
    }
}

/// Length-prefixed JSON codec with a frame ceiling.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    max_frame_bytes: usize,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_bytes)
                .new_codec(),
            max_frame_bytes,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let Some(bytes) = self
            .inner
            .decode(src)
            .map_err(|e| TransportError::Codec(e.to_string()))?
        else {
            return Ok(None);
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| TransportError::Codec(format!("malformed frame: {}", e)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let bytes = serde_json::to_vec(&frame)
            .map_err(|e| TransportError::Codec(format!("unencodable frame: {}", e)))?;

        if bytes.len() > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                size: bytes.len(),
                limit: self.max_frame_bytes,
            });
        }

        self.inner
            .encode(Bytes::from(bytes), dst)
            .map_err(|e| TransportError::Codec(e.to_string()))
    }
}
