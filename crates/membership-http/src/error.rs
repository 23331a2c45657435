use mbus_api::MembershipError;
use thiserror::Error;

/// Errors that can occur while fetching the broker list.
#[derive(Debug, Error)]
pub enum Error {
    /// Request failed or the service answered with an error status.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// An entry of the broker list is not `host:port`.
    #[error("invalid broker entry {entry:?}: {source}")]
    InvalidBroker {
        /// The offending entry.
        entry: String,

        /// Why it could not be parsed.
        source: mbus_api::Error,
    },

    /// The membership url could not be built.
    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),
}

impl MembershipError for Error {}
