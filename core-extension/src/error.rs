use core_transport::TransportError;
use thiserror::Error;

use crate::message::CallId;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid extension instance: {0}")]
    InvalidInstance(String),

    #[error("Remote fault: {0}")]
    RemoteFault(String),

    #[error("Call {0} is already pending")]
    DuplicatePendingCall(CallId),

    #[error("Unknown extension: {0}")]
    UnknownExtension(String),

    #[error("Extension '{0}' is already registered")]
    DuplicateExtension(String),

    #[error("Entry point '{entry_point}' is already provided by '{owner}'")]
    DuplicateEntryPoint { entry_point: String, owner: String },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Message has no routing id")]
    NotRouted,
}

impl ProtocolError {
    /// Stable machine-readable code, used in fault payloads and script errors.
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Transport(TransportError::ConnectionLost) => "connection_lost",
            ProtocolError::Transport(_) => "transport",
            ProtocolError::InvalidInstance(_) => "invalid_instance",
            ProtocolError::RemoteFault(_) => "remote_fault",
            ProtocolError::DuplicatePendingCall(_) => "duplicate_pending_call",
            ProtocolError::UnknownExtension(_) => "unknown_extension",
            ProtocolError::DuplicateExtension(_) => "duplicate_extension",
            ProtocolError::DuplicateEntryPoint { .. } => "duplicate_entry_point",
            ProtocolError::InvalidMessage(_) => "invalid_message",
            ProtocolError::ConnectionLost => "connection_lost",
            ProtocolError::NotRouted => "not_routed",
        }
    }

    /// Error text without the variant prefix.
    pub fn detail(&self) -> String {
        match self {
            ProtocolError::InvalidInstance(detail)
            | ProtocolError::RemoteFault(detail)
            | ProtocolError::UnknownExtension(detail)
            | ProtocolError::DuplicateExtension(detail)
            | ProtocolError::InvalidMessage(detail) => detail.clone(),
            other => other.to_string(),
        }
    }

    /// Whether the error means the link to the host is gone.
    pub fn is_connection_lost(&self) -> bool {
        self.code() == "connection_lost"
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
