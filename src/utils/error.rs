//! The `error` module defines the error taxonomy of the consumer group core.
//!
//! None of these conditions is fatal to the process. Each variant maps to a
//! recovery path: transport errors trigger reconnection, storage errors
//! degrade to in-memory operation, protocol violations discard the offending
//! packet and handler failures withhold the acknowledgment.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("handler failure: {0}")]
    HandlerFailure(String),

    #[error("invalid topic filter: {0}")]
    InvalidTopicFilter(String),

    #[error("invalid topic name: {0}")]
    InvalidTopicName(String),

    #[error("no free packet identifier")]
    PacketIdsExhausted,

    #[error("not connected")]
    NotConnected,

    #[error("client has shut down")]
    Shutdown,
}

impl Error {
    /// Whether the error means the current link is unusable and the
    /// reconnection controller has to take over.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::StorageUnavailable(e.to_string())
    }
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
