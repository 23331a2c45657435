use crate::{Error, MemoryBroker, Operation};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mbus_api::{
    BrokerEndpoint, Connection, Connector, Frame, Headers, SubscriptionAckMode,
};
use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Opens connections to in-process brokers registered with it.
#[derive(Clone, Debug, Default)]
pub struct MemoryConnector {
    brokers: Arc<RwLock<HashMap<BrokerEndpoint, MemoryBroker>>>,
}

impl MemoryConnector {
    /// Creates a connector with no brokers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a broker for the endpoint, or returns the one already there.
    pub fn add_broker(&self, endpoint: BrokerEndpoint) -> MemoryBroker {
        self.brokers
            .write()
            .entry(endpoint.clone())
            .or_insert_with(|| MemoryBroker::new(endpoint))
            .clone()
    }

    /// Looks up the broker serving an endpoint.
    #[must_use]
    pub fn broker(&self, endpoint: &BrokerEndpoint) -> Option<MemoryBroker> {
        self.brokers.read().get(endpoint).cloned()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn open(&self, endpoint: &BrokerEndpoint) -> Result<MemoryConnection, Error> {
        self.broker(endpoint)
            .ok_or_else(|| Error::Unreachable(endpoint.clone()))?
            .open()
    }
}

/// A connection to an in-process broker.
///
/// Dropping the connection closes it on the broker side.
#[derive(Debug)]
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    frames: Mutex<mpsc::UnboundedReceiver<Frame>>,
    open: AtomicBool,
}

impl MemoryConnection {
    pub(crate) fn new(
        broker: MemoryBroker,
        id: u64,
        frames: mpsc::UnboundedReceiver<Frame>,
    ) -> Self {
        Self {
            broker,
            id,
            frames: Mutex::new(frames),
            open: AtomicBool::new(true),
        }
    }

    /// The broker this connection talks to.
    #[must_use]
    pub const fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    fn ensure_open(&self, operation: Operation) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }

        self.broker.check(operation)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    type Error = Error;

    async fn connect(
        &self,
        username: &str,
        _password: &str,
        client_id: Option<&str>,
    ) -> Result<(), Error> {
        self.ensure_open(Operation::Connect)?;

        debug!(
            endpoint = %self.broker.endpoint(),
            username,
            client_id = client_id.unwrap_or_default(),
            "memory connection logged in"
        );

        Ok(())
    }

    async fn subscribe(
        &self,
        destination: &str,
        _ack_mode: SubscriptionAckMode,
        headers: &Headers,
    ) -> Result<(), Error> {
        self.ensure_open(Operation::Subscribe)?;

        self.broker.subscribe(self.id, destination, headers)
    }

    async fn send(&self, destination: &str, body: Bytes, headers: &Headers) -> Result<(), Error> {
        self.ensure_open(Operation::Send)?;

        self.broker.send(destination, headers, body);

        Ok(())
    }

    async fn send_safe(
        &self,
        destination: &str,
        body: Bytes,
        headers: &Headers,
    ) -> Result<(), Error> {
        self.ensure_open(Operation::SendSafe)?;

        if self.broker.receipts_suppressed() {
            return Err(Error::Timeout);
        }

        self.broker.send(destination, headers, body);

        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Frame, Error> {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }

        let mut frames = self.frames.lock().await;

        match tokio::time::timeout(timeout, frames.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => {
                self.open.store(false, Ordering::SeqCst);
                Err(Error::Disconnected)
            }
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn ack(
        &self,
        message_id: &str,
        _transaction: Option<&str>,
        _subscription_id: Option<&str>,
        _connection_id: Option<&str>,
        receipt_id: Option<&str>,
    ) -> Result<(), Error> {
        self.ensure_open(Operation::Ack)?;

        self.broker.ack(self.id, message_id, receipt_id);

        Ok(())
    }

    async fn nack(&self, message_id: &str, _subscription_id: Option<&str>) -> Result<(), Error> {
        self.ensure_open(Operation::Nack)?;

        self.broker.nack(message_id);

        Ok(())
    }

    async fn keep_alive(&self) -> Result<(), Error> {
        self.ensure_open(Operation::KeepAlive)
    }

    async fn credit(&self, _message_id: &str) -> Result<(), Error> {
        self.ensure_open(Operation::Credit)?;

        self.broker.credit(self.id);

        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Error> {
        self.ensure_open(Operation::Disconnect)
    }

    async fn close(&self) -> Result<(), Error> {
        self.broker.check(Operation::Close)?;

        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.close_connection(self.id);
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.broker.is_open(self.id)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.broker.close_connection(self.id);
    }
}
