use crate::{Error, StompCodec};

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use mbus_api::frame::{CONNECTION_ID_HEADER, MESSAGE_ID_HEADER};
use mbus_api::{
    BrokerEndpoint, Connection, Connector, Frame, FrameCommand, Headers, SubscriptionAckMode,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};
use uuid::Uuid;

const RECEIPT_HEADER: &str = "receipt";
const ERROR_MESSAGE_HEADER: &str = "message";

/// Opens STOMP connections over TCP.
#[derive(Clone, Debug)]
pub struct StompConnector {
    connect_timeout: Duration,
    receipt_timeout: Duration,
}

impl StompConnector {
    /// Creates a connector.
    ///
    /// `connect_timeout` bounds the TCP handshake and the wait for
    /// CONNECTED; `receipt_timeout` bounds the wait for a publish receipt.
    #[must_use]
    pub const fn new(connect_timeout: Duration, receipt_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            receipt_timeout,
        }
    }
}

impl Default for StompConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(30))
    }
}

#[async_trait]
impl Connector for StompConnector {
    type Connection = StompConnection;

    async fn open(&self, endpoint: &BrokerEndpoint) -> Result<StompConnection, Error> {
        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((endpoint.host(), endpoint.port())),
        )
        .await
        .map_err(|_| Error::Timeout)??;

        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();

        debug!(%endpoint, "stomp transport opened");

        Ok(StompConnection {
            endpoint: endpoint.clone(),
            reader: Mutex::new(FramedRead::new(read_half, StompCodec::new())),
            writer: Mutex::new(FramedWrite::new(write_half, StompCodec::new())),
            connected: AtomicBool::new(true),
            connect_timeout: self.connect_timeout,
            receipt_timeout: self.receipt_timeout,
        })
    }
}

/// A STOMP session over one TCP stream.
///
/// The read and write halves are locked independently.
pub struct StompConnection {
    endpoint: BrokerEndpoint,
    reader: Mutex<FramedRead<OwnedReadHalf, StompCodec>>,
    writer: Mutex<FramedWrite<OwnedWriteHalf, StompCodec>>,
    connected: AtomicBool,
    connect_timeout: Duration,
    receipt_timeout: Duration,
}

impl Debug for StompConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StompConnection")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

fn headers<const N: usize>(pairs: [(&str, &str); N]) -> Headers {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn refusal(frame: &Frame) -> Error {
    let reason = frame
        .header(ERROR_MESSAGE_HEADER)
        .map_or_else(|| String::from_utf8_lossy(&frame.body).into_owned(), str::to_string);

    Error::Refused(reason)
}

impl StompConnection {
    /// The broker this connection talks to.
    #[must_use]
    pub const fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!(endpoint = %self.endpoint, "stomp connection lost");
        }
    }

    async fn write(&self, command: &str, headers: Headers, body: Bytes) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }

        let frame = Frame::new(FrameCommand::parse(command), headers, body);

        let result = self.writer.lock().await.send(frame).await;
        if result.is_err() {
            self.mark_disconnected();
        }

        result
    }

    async fn read(&self, wait: Duration) -> Result<Frame, Error> {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }

        let next = {
            let mut reader = self.reader.lock().await;
            timeout(wait, reader.next()).await
        };

        match next {
            Err(_) => Err(Error::Timeout),
            Ok(None) => {
                self.mark_disconnected();
                Err(Error::Disconnected)
            }
            Ok(Some(Err(e))) => {
                self.mark_disconnected();
                Err(e)
            }
            Ok(Some(Ok(frame))) => Ok(frame),
        }
    }

    /// Reads until the receipt for `receipt_id` arrives. Other frames are
    /// dropped; an ERROR fails the wait.
    async fn await_receipt(&self, receipt_id: &str) -> Result<(), Error> {
        let deadline = Instant::now() + self.receipt_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }

            let frame = self.read(remaining).await?;
            match frame.command {
                FrameCommand::Receipt if frame.receipt_id() == Some(receipt_id) => return Ok(()),
                FrameCommand::Error => return Err(refusal(&frame)),
                _ => {
                    debug!(
                        endpoint = %self.endpoint,
                        command = %frame.command,
                        "ignoring frame while waiting for receipt"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl Connection for StompConnection {
    type Error = Error;

    async fn connect(
        &self,
        username: &str,
        password: &str,
        client_id: Option<&str>,
    ) -> Result<(), Error> {
        let mut connect = headers([("login", username), ("passcode", password)]);
        if let Some(client_id) = client_id {
            connect.insert("client-id".to_string(), client_id.to_string());
        }

        self.write("CONNECT", connect, Bytes::new()).await?;

        let frame = self.read(self.connect_timeout).await?;
        match frame.command {
            FrameCommand::Connected => {
                debug!(endpoint = %self.endpoint, "stomp session established");
                Ok(())
            }
            FrameCommand::Error => Err(refusal(&frame)),
            other => Err(Error::Protocol(format!("expected CONNECTED, got {other}"))),
        }
    }

    async fn subscribe(
        &self,
        destination: &str,
        ack_mode: SubscriptionAckMode,
        headers: &Headers,
    ) -> Result<(), Error> {
        let mut subscribe = headers.clone();
        subscribe.insert("destination".to_string(), destination.to_string());
        subscribe.insert("ack".to_string(), ack_mode.as_str().to_string());

        self.write("SUBSCRIBE", subscribe, Bytes::new()).await
    }

    async fn send(&self, destination: &str, body: Bytes, headers: &Headers) -> Result<(), Error> {
        let mut send = headers.clone();
        send.insert("destination".to_string(), destination.to_string());
        send.insert("persistent".to_string(), "true".to_string());

        self.write("SEND", send, body).await
    }

    async fn send_safe(
        &self,
        destination: &str,
        body: Bytes,
        headers: &Headers,
    ) -> Result<(), Error> {
        let receipt_id = Uuid::new_v4().to_string();

        let mut send = headers.clone();
        send.insert("destination".to_string(), destination.to_string());
        send.insert("persistent".to_string(), "true".to_string());
        send.insert(RECEIPT_HEADER.to_string(), receipt_id.clone());

        self.write("SEND", send, body).await?;

        self.await_receipt(&receipt_id).await.inspect_err(|e| {
            warn!(endpoint = %self.endpoint, %destination, error = %e, "no receipt for send");
        })
    }

    async fn receive(&self, timeout: Duration) -> Result<Frame, Error> {
        self.read(timeout).await
    }

    async fn ack(
        &self,
        message_id: &str,
        transaction: Option<&str>,
        subscription_id: Option<&str>,
        connection_id: Option<&str>,
        receipt_id: Option<&str>,
    ) -> Result<(), Error> {
        let mut ack = headers([(MESSAGE_ID_HEADER, message_id)]);

        if let Some(transaction) = transaction {
            ack.insert("transaction".to_string(), transaction.to_string());
        }
        if let Some(subscription_id) = subscription_id.filter(|id| !id.is_empty()) {
            ack.insert("subscription".to_string(), subscription_id.to_string());
        }
        if let Some(connection_id) = connection_id.filter(|id| *id != "null") {
            ack.insert(CONNECTION_ID_HEADER.to_string(), connection_id.to_string());
        }
        if let Some(receipt_id) = receipt_id {
            ack.insert(RECEIPT_HEADER.to_string(), receipt_id.to_string());
        }

        self.write("ACK", ack, Bytes::new()).await
    }

    async fn nack(&self, message_id: &str, subscription_id: Option<&str>) -> Result<(), Error> {
        let mut nack = headers([(MESSAGE_ID_HEADER, message_id)]);

        if let Some(subscription_id) = subscription_id.filter(|id| !id.is_empty()) {
            nack.insert("subscription".to_string(), subscription_id.to_string());
        }

        self.write("NACK", nack, Bytes::new()).await
    }

    async fn keep_alive(&self) -> Result<(), Error> {
        self.write("KEEPALIVE", Headers::new(), Bytes::new()).await
    }

    async fn credit(&self, message_id: &str) -> Result<(), Error> {
        self.write(
            "CREDIT",
            headers([(MESSAGE_ID_HEADER, message_id)]),
            Bytes::new(),
        )
        .await
    }

    async fn disconnect(&self) -> Result<(), Error> {
        self.write("DISCONNECT", Headers::new(), Bytes::new()).await
    }

    async fn close(&self) -> Result<(), Error> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut writer = self.writer.lock().await;
        match writer.get_mut().shutdown().await {
            Err(e) if e.kind() != std::io::ErrorKind::NotConnected => return Err(e.into()),
            _ => {}
        }

        debug!(endpoint = %self.endpoint, "stomp transport closed");

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
