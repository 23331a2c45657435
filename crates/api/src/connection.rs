use crate::{BrokerEndpoint, Frame};

use std::collections::HashMap;
use std::error::Error;
use std::fmt::{self, Debug, Display};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// Frame headers.
pub type Headers = HashMap<String, String>;

/// Marker trait for connection errors.
pub trait ConnectionError: Error + Send + Sync + 'static {
    /// Whether the error is a read timeout rather than a broken connection.
    fn is_timeout(&self) -> bool;
}

/// Acknowledgment mode requested on subscribe.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum SubscriptionAckMode {
    /// Broker considers messages acknowledged on delivery.
    Auto,

    /// An ack covers the message and everything delivered before it.
    #[default]
    Client,

    /// An ack covers only the named message.
    ClientIndividual,
}

impl SubscriptionAckMode {
    /// The wire value of the `ack` header.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Client => "client",
            Self::ClientIndividual => "client-individual",
        }
    }
}

impl Display for SubscriptionAckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opens connections to brokers.
#[async_trait]
pub trait Connector
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The connection type produced.
    type Connection: Connection;

    /// Opens a transport-level connection to a broker. The returned
    /// connection still needs [`Connection::connect`].
    async fn open(
        &self,
        endpoint: &BrokerEndpoint,
    ) -> Result<Self::Connection, <Self::Connection as Connection>::Error>;
}

/// A session with a single broker.
///
/// Reads and writes may run concurrently: a pending [`Connection::receive`]
/// must not block [`Connection::ack`] or [`Connection::send`].
#[async_trait]
pub trait Connection
where
    Self: Debug + Send + Sync + 'static,
{
    /// The error type for the connection.
    type Error: ConnectionError;

    /// Logs in to the broker.
    async fn connect(
        &self,
        username: &str,
        password: &str,
        client_id: Option<&str>,
    ) -> Result<(), Self::Error>;

    /// Subscribes to a destination.
    async fn subscribe(
        &self,
        destination: &str,
        ack_mode: SubscriptionAckMode,
        headers: &Headers,
    ) -> Result<(), Self::Error>;

    /// Publishes a message body without waiting for confirmation.
    async fn send(
        &self,
        destination: &str,
        body: Bytes,
        headers: &Headers,
    ) -> Result<(), Self::Error>;

    /// Publishes a message body and waits for the broker receipt.
    async fn send_safe(
        &self,
        destination: &str,
        body: Bytes,
        headers: &Headers,
    ) -> Result<(), Self::Error>;

    /// Reads the next inbound frame, failing with a timeout-class error when
    /// nothing arrives in time.
    async fn receive(&self, timeout: Duration) -> Result<Frame, Self::Error>;

    /// Acknowledges a message. When `receipt_id` is set the broker answers
    /// with a receipt frame on the read side.
    async fn ack(
        &self,
        message_id: &str,
        transaction: Option<&str>,
        subscription_id: Option<&str>,
        connection_id: Option<&str>,
        receipt_id: Option<&str>,
    ) -> Result<(), Self::Error>;

    /// Rejects a message so the broker redelivers it.
    async fn nack(&self, message_id: &str, subscription_id: Option<&str>)
    -> Result<(), Self::Error>;

    /// Sends a heartbeat.
    async fn keep_alive(&self) -> Result<(), Self::Error>;

    /// Grants the broker credit to deliver the next message.
    async fn credit(&self, message_id: &str) -> Result<(), Self::Error>;

    /// Logs out of the broker.
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Releases the transport.
    async fn close(&self) -> Result<(), Self::Error>;

    /// Whether the transport is still usable.
    fn is_connected(&self) -> bool;
}
