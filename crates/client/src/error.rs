use std::time::Duration;

use mbus_api::{BrokerEndpoint, SessionStatus};
use thiserror::Error;

/// Errors raised by fetchers and sessions.
#[derive(Debug, Error)]
pub enum Error {
    /// An acknowledgment could not be delivered.
    #[error("ack failed: {0}")]
    AckFailed(String),

    /// No receipt arrived for a receipt-confirmed acknowledgment.
    #[error("no ack receipt within {0:?}")]
    AckTimeout(Duration),

    /// Data model error.
    #[error(transparent)]
    Api(#[from] mbus_api::Error),

    /// A single connection attempt failed.
    #[error("failed to connect to broker {endpoint}: {reason}")]
    BrokerConnectionFailed {
        /// The broker that could not be reached.
        endpoint: BrokerEndpoint,
        /// Why the attempt failed.
        reason: String,
    },

    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operation is not allowed in the current lifecycle state.
    #[error("cannot {operation} while the session is {status}")]
    InvalidStatus {
        /// The rejected operation.
        operation: &'static str,
        /// The status at the time of the call.
        status: SessionStatus,
    },

    /// A heartbeat could not be delivered.
    #[error("keepalive failed: {0}")]
    KeepAliveFailed(String),

    /// The membership list could not be fetched.
    #[error("membership fetch failed: {0}")]
    Membership(String),

    /// A negative acknowledgment could not be delivered.
    #[error("nack failed: {0}")]
    NackFailed(String),

    /// No message arrived in time.
    #[error("no message received within {0:?}")]
    ReceiveTimeout(Duration),

    /// Every publish attempt failed.
    #[error("failed to send message in {attempts} attempts to {destination}")]
    SendFailed {
        /// Destination of the message.
        destination: String,
        /// Attempts made.
        attempts: u32,
    },

    /// Every connection attempt in a retry cycle failed.
    #[error("gave up connecting to broker {endpoint} after {attempts} attempts")]
    TooManyConnectionRetryAttempts {
        /// The broker that could not be reached.
        endpoint: BrokerEndpoint,
        /// Attempts made.
        attempts: u32,
    },
}
