//! STOMP-over-TCP implementation of the message bus connection API.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Frame codec for the STOMP wire format.
pub mod codec;

/// Connections to STOMP brokers.
pub mod connection;

mod error;

pub use codec::StompCodec;
pub use connection::{StompConnection, StompConnector};
pub use error::Error;
