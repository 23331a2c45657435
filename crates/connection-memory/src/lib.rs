//! In-process broker and connection implementation of the message bus API.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// The in-process broker.
pub mod broker;

/// Connections to in-process brokers.
pub mod connection;

mod error;

pub use broker::{MemoryBroker, Operation};
pub use connection::{MemoryConnection, MemoryConnector};
pub use error::Error;
