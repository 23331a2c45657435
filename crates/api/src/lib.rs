//! Abstract interface and data model for the message bus client.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Opaque tokens used to route acknowledgments back to a broker.
pub mod ack_token;

/// Wire-level connections to a single broker.
pub mod connection;

/// Queue and topic destinations.
pub mod destination;

/// Broker endpoints.
pub mod endpoint;

mod error;

/// Protocol frames exchanged with a broker.
pub mod frame;

/// Discovery of the current set of brokers.
pub mod membership;

/// Messages and their wire encoding.
pub mod message;

/// Session lifecycle status.
pub mod status;

pub use ack_token::AckToken;
pub use connection::{Connection, ConnectionError, Connector, Headers, SubscriptionAckMode};
pub use destination::{Destination, DestinationType, QUEUE_PREFIX, TOPIC_PREFIX};
pub use endpoint::BrokerEndpoint;
pub use error::Error;
pub use frame::{Frame, FrameCommand};
pub use membership::{MembershipError, MembershipSource, StaticMembership};
pub use message::{Message, Payload, PayloadType};
pub use status::SessionStatus;
