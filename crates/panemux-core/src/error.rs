use thiserror::Error;

/// Errors produced by the session engine and its transport adapters.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MuxError {
    /// Whether the error means the referenced session no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, MuxError::SessionNotFound(_))
    }
}

impl From<ciborium::de::Error<std::io::Error>> for MuxError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        MuxError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for MuxError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        MuxError::Codec(e.to_string())
    }
}

pub type MuxResult<T> = Result<T, MuxError>;

/// Returned by a listener that could not take delivery of a chunk.
///
/// The engine drops the failing listener and keeps serving the others.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("listener closed")]
    Closed,

    #[error("delivery failed: {0}")]
    Failed(String),
}
