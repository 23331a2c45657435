//! Multi-broker consumer and retrying producer sessions for the message bus.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod consumer;
mod error;
mod fetcher;
mod producer;

pub use config::{AckMode, ConsumerConfig, ProducerConfig, SendOptions};
pub use consumer::ConsumerSession;
pub use error::Error;
pub use fetcher::BrokerFetcher;
pub use producer::ProducerSession;
