use mbus_api::ConnectionError;
use thiserror::Error;

/// Errors that can occur on a STOMP connection.
#[derive(Debug, Error)]
pub enum Error {
    /// The broker closed the connection, or it was closed locally.
    #[error("connection closed")]
    Disconnected,

    /// Bytes on the wire do not form a valid frame.
    #[error("malformed frame: {0}")]
    Frame(String),

    /// Socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The broker answered with an unexpected frame.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The broker answered with an ERROR frame.
    #[error("broker refused request: {0}")]
    Refused(String),

    /// Nothing arrived in time.
    #[error("timed out waiting for the broker")]
    Timeout,
}

impl ConnectionError for Error {
    fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}
