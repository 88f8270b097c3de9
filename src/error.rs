use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Remote failure: {0}")]
    Remote(String),

    #[error("No handler registered for kind: {0}")]
    UnknownKind(String),

    #[error("Handler already registered for kind: {0}")]
    DuplicateHandler(String),

    #[error("Kinds without a handler: {0:?}")]
    UnhandledKinds(Vec<String>),

    #[error("Envelope field too large: {size} bytes (max: {max})")]
    FieldTooLarge { size: usize, max: usize },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel {0} already claimed")]
    ChannelAlreadyClaimed(u32),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, RpcError>;
pub type TransportResult<T> = std::result::Result<T, TransportError>;

impl From<bincode::Error> for RpcError {
    fn from(err: bincode::Error) -> Self {
        RpcError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Transport(TransportError::Io(err))
    }
}

impl From<TransportError> for std::io::Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io(e) => e,
            TransportError::Closed => {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection closed")
            }
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}
