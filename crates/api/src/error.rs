use crate::message::PayloadType;

use thiserror::Error;

/// Errors raised by the data model.
#[derive(Debug, Error)]
pub enum Error {
    /// An ack token could not be decoded.
    #[error("invalid ack token: {0}")]
    InvalidAckToken(String),

    /// A destination name does not match its type.
    #[error("invalid destination `{name}`: {reason}")]
    InvalidDestination {
        /// The offending destination name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An endpoint string could not be parsed.
    #[error("invalid broker endpoint `{0}`")]
    InvalidEndpoint(String),

    /// A membership URL could not be built.
    #[error("invalid membership url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// A payload was read as the wrong type.
    #[error("cannot read {expected} payload from a {actual} message")]
    PayloadType {
        /// The type the caller asked for.
        expected: PayloadType,
        /// The type the message carries.
        actual: PayloadType,
    },

    /// Base64 decoding failed.
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),

    /// JSON encoding or decoding failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
