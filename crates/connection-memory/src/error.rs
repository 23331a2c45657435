use crate::Operation;

use mbus_api::{BrokerEndpoint, ConnectionError};
use thiserror::Error;

/// Errors that can occur on an in-process connection.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection was closed by either side.
    #[error("connection closed")]
    Disconnected,

    /// A failure injected with [`crate::MemoryBroker::fail_next`].
    #[error("injected {0} failure")]
    Injected(Operation),

    /// No frame arrived in time.
    #[error("timed out waiting for a frame")]
    Timeout,

    /// No broker is registered or reachable at the endpoint.
    #[error("broker {0} is unreachable")]
    Unreachable(BrokerEndpoint),
}

impl ConnectionError for Error {
    fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}
