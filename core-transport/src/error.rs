use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Server already started")]
    AlreadyStarted,

    #[error("Server not started")]
    NotStarted,

    #[error("Invalid bus address '{0}'")]
    InvalidAddress(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Peer rejected our credentials")]
    Authentication,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Not connected")]
    NotConnected,

    #[error("No such interface: {0}")]
    NoSuchInterface(String),

    #[error("No such method: {0}")]
    NoSuchMethod(String),

    #[error("No such property: {0}")]
    NoSuchProperty(String),

    #[error("Remote fault: {0}")]
    RemoteFault(String),

    #[error("Reply does not match the expected shape: {0}")]
    InvalidReply(String),

    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
