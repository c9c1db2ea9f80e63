use bridge_traits::{BridgeError, ContextId};
use core_extension::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Script engine error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] core_runtime::Error),

    #[error("No session for script context {0}")]
    UnknownContext(ContextId),

    #[error("Script context {0} already has a session")]
    SessionAlreadyStarted(ContextId),

    #[error("Extensions are not available to '{0}'")]
    ExternalOriginRejected(String),

    #[error("Not connected to the extension host")]
    NotConnected,
}

impl BundleError {
    /// Stable machine-readable code handed to script.
    pub fn code(&self) -> &'static str {
        match self {
            BundleError::Protocol(e) => e.code(),
            BundleError::Bridge(_) => "script",
            BundleError::Runtime(_) => "runtime",
            BundleError::UnknownContext(_) => "unknown_context",
            BundleError::SessionAlreadyStarted(_) => "session_already_started",
            BundleError::ExternalOriginRejected(_) => "external_origin_rejected",
            BundleError::NotConnected => "not_connected",
        }
    }
}

pub type Result<T> = std::result::Result<T, BundleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_codes_pass_through() {
        let lost = BundleError::from(ProtocolError::ConnectionLost);
        assert_eq!(lost.code(), "connection_lost");

        let invalid = BundleError::from(ProtocolError::InvalidInstance("x".to_string()));
        assert_eq!(invalid.code(), "invalid_instance");

        assert_eq!(BundleError::NotConnected.code(), "not_connected");
        assert_eq!(
            BundleError::UnknownContext(ContextId::new(3)).to_string(),
            "No session for script context ctx-3"
        );
    }
}
