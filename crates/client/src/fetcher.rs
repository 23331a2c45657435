use crate::{AckMode, ConsumerConfig, Error};

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mbus_api::{
    BrokerEndpoint, Connection, ConnectionError, Connector, Frame, FrameCommand,
    SubscriptionAckMode,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

type ConnectionOf<C> = <C as Connector>::Connection;
type ConnectionErrorOf<C> = <ConnectionOf<C> as Connection>::Error;

#[derive(Clone, Debug)]
struct Delivered {
    message_id: String,
    connection_id: Option<String>,
}

struct Inner<C: Connector> {
    endpoint: BrokerEndpoint,
    connector: C,
    config: Arc<ConsumerConfig>,
    connection: RwLock<Option<Arc<ConnectionOf<C>>>>,
    // Only started fetchers subscribe; the rest connect to carry acks.
    subscribing: AtomicBool,
    // Serializes every write to the broker and every reconnect.
    operation_lock: tokio::sync::Mutex<()>,
    prefetch_sender: mpsc::Sender<Frame>,
    prefetch_receiver: Mutex<mpsc::Receiver<Frame>>,
    last_delivered: Mutex<Option<Delivered>>,
    pending_receipts: Mutex<HashMap<String, oneshot::Sender<Frame>>>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

/// Keeps one subscription alive against one broker and prefetches one
/// message at a time.
///
/// A background task owns the read side of the connection. Everything that
/// writes to the broker (acks, nacks, credits, heartbeats, reconnects) is
/// serialized through a per-fetcher lock so it can run while the task is
/// blocked on a read.
pub struct BrokerFetcher<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for BrokerFetcher<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> Debug for BrokerFetcher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerFetcher")
            .field("endpoint", &self.inner.endpoint)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> BrokerFetcher<C> {
    /// Creates a fetcher. Nothing connects until [`Self::start`] or the
    /// first acknowledgment.
    ///
    /// A fetcher that is never started only logs in on demand and never
    /// subscribes, so no message is delivered to it.
    #[must_use]
    pub fn new(endpoint: BrokerEndpoint, connector: C, config: Arc<ConsumerConfig>) -> Self {
        let (prefetch_sender, prefetch_receiver) = mpsc::channel(1);

        Self {
            inner: Arc::new(Inner {
                endpoint,
                connector,
                config,
                connection: RwLock::new(None),
                subscribing: AtomicBool::new(false),
                operation_lock: tokio::sync::Mutex::new(()),
                prefetch_sender,
                prefetch_receiver: Mutex::new(prefetch_receiver),
                last_delivered: Mutex::new(None),
                pending_receipts: Mutex::new(HashMap::new()),
                shutdown_token: CancellationToken::new(),
                task_tracker: TaskTracker::new(),
            }),
        }
    }

    /// The broker this fetcher talks to.
    #[must_use]
    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.inner.endpoint
    }

    /// Whether [`Self::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown_token.is_cancelled()
    }

    /// Whether a usable connection is currently held.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.current().is_some()
    }

    /// Whether [`Self::start`] has been called.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.subscribing.load(Ordering::SeqCst)
    }

    /// Whether both handles refer to the same fetcher.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Spawns the background fetch task. Calling it again, or after
    /// [`Self::close`], does nothing.
    pub fn start(&self) {
        if self.inner.task_tracker.is_closed() {
            return;
        }

        self.inner.subscribing.store(true, Ordering::SeqCst);

        let fetcher = self.clone();
        self.inner.task_tracker.spawn(async move { fetcher.run().await });
        self.inner.task_tracker.close();

        debug!(endpoint = %self.inner.endpoint, "fetcher started");
    }

    async fn run(&self) {
        let shutdown_token = self.inner.shutdown_token.clone();

        if self.current().is_some() {
            // Connected earlier to carry acks only; subscribe afresh.
            let _guard = self.inner.operation_lock.lock().await;
            if let Err(e) = self.reconnect_locked().await {
                warn!(endpoint = %self.inner.endpoint, error = %e, "failed to resubscribe");
            }
        }

        loop {
            if shutdown_token.is_cancelled() {
                break;
            }

            let connection = match self.ensure_connected().await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(
                        endpoint = %self.inner.endpoint,
                        error = %e,
                        cooldown = ?self.inner.config.reconnect_cooldown,
                        "broker unreachable, backing off"
                    );

                    tokio::select! {
                        () = shutdown_token.cancelled() => break,
                        () = tokio::time::sleep(self.inner.config.reconnect_cooldown) => continue,
                    }
                }
            };

            let received = tokio::select! {
                () = shutdown_token.cancelled() => break,
                received = connection.receive(self.inner.config.fetch_timeout) => received,
            };

            match received {
                Ok(frame) => {
                    if !self.dispatch(frame).await {
                        break;
                    }
                }
                Err(e) if e.is_timeout() => {
                    debug!(endpoint = %self.inner.endpoint, "no frame within fetch timeout");
                }
                Err(e) => {
                    warn!(
                        endpoint = %self.inner.endpoint,
                        error = %e,
                        "connection lost, reconnecting"
                    );
                    self.discard(&connection).await;
                }
            }
        }

        debug!(endpoint = %self.inner.endpoint, "fetch loop stopped");
    }

    /// Routes an inbound frame. Returns false once the fetcher is closing.
    async fn dispatch(&self, frame: Frame) -> bool {
        if let Some(receipt_id) = frame.receipt_id().map(str::to_string) {
            let waiter = self.inner.pending_receipts.lock().remove(&receipt_id);

            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(frame);
                }
                None => {
                    debug!(endpoint = %self.inner.endpoint, %receipt_id, "receipt with no waiter");
                }
            }

            return true;
        }

        let command = frame.command.clone();

        match command {
            FrameCommand::Message => {
                tokio::select! {
                    () = self.inner.shutdown_token.cancelled() => false,
                    sent = self.inner.prefetch_sender.send(frame) => sent.is_ok(),
                }
            }
            FrameCommand::Error => {
                warn!(
                    endpoint = %self.inner.endpoint,
                    detail = frame.header("message").unwrap_or_default(),
                    "broker reported an error"
                );
                true
            }
            command => {
                debug!(endpoint = %self.inner.endpoint, %command, "ignoring frame");
                true
            }
        }
    }

    fn current(&self) -> Option<Arc<ConnectionOf<C>>> {
        let connection = self.inner.connection.read().clone();

        connection.filter(|connection| connection.is_connected())
    }

    async fn ensure_connected(&self) -> Result<Arc<ConnectionOf<C>>, Error> {
        if let Some(connection) = self.current() {
            return Ok(connection);
        }

        let _guard = self.inner.operation_lock.lock().await;

        // Someone else may have reconnected while we waited.
        if let Some(connection) = self.current() {
            return Ok(connection);
        }

        self.reconnect_locked().await
    }

    /// Drops a connection the read side found broken, unless it was
    /// already replaced.
    async fn discard(&self, stale: &Arc<ConnectionOf<C>>) {
        let _guard = self.inner.operation_lock.lock().await;

        let removed = {
            let mut slot = self.inner.connection.write();
            if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, stale)) {
                slot.take()
            } else {
                None
            }
        };

        if let Some(connection) = removed {
            if let Err(e) = connection.close().await {
                debug!(endpoint = %self.inner.endpoint, error = %e, "error closing broken connection");
            }
        }
    }

    /// Replaces the connection. The caller must hold the operation lock.
    async fn reconnect_locked(&self) -> Result<Arc<ConnectionOf<C>>, Error> {
        let previous = self.inner.connection.write().take();
        if let Some(previous) = previous {
            if let Err(e) = previous.close().await {
                debug!(endpoint = %self.inner.endpoint, error = %e, "error closing previous connection");
            }
        }

        let config = &self.inner.config;
        let attempts = config.connect_retry_attempts.max(1);

        for attempt in 1..=attempts {
            if self.is_closed() {
                return Err(Error::BrokerConnectionFailed {
                    endpoint: self.inner.endpoint.clone(),
                    reason: "fetcher closed".to_string(),
                });
            }

            match self.open_session().await {
                Ok(connection) => {
                    let connection = Arc::new(connection);
                    *self.inner.connection.write() = Some(connection.clone());

                    info!(
                        endpoint = %self.inner.endpoint,
                        destination = %config.destination,
                        subscribed = self.is_started(),
                        attempt,
                        "connected to broker"
                    );

                    return Ok(connection);
                }
                Err(e) => {
                    warn!(
                        endpoint = %self.inner.endpoint,
                        attempt,
                        error = %e,
                        "failed to connect to broker"
                    );

                    if attempt < attempts {
                        tokio::select! {
                            () = self.inner.shutdown_token.cancelled() => {}
                            () = tokio::time::sleep(config.connect_retry_delay) => {}
                        }
                    }
                }
            }
        }

        Err(Error::TooManyConnectionRetryAttempts {
            endpoint: self.inner.endpoint.clone(),
            attempts,
        })
    }

    async fn open_session(&self) -> Result<ConnectionOf<C>, ConnectionErrorOf<C>> {
        let config = &self.inner.config;
        let connection = self.inner.connector.open(&self.inner.endpoint).await?;

        connection
            .connect(
                &config.username,
                &config.password,
                config.subscription_id.as_deref(),
            )
            .await?;

        if !self.is_started() {
            return Ok(connection);
        }

        connection
            .subscribe(
                config.destination.name(),
                SubscriptionAckMode::Client,
                &config.subscription_headers(),
            )
            .await?;

        Ok(connection)
    }

    /// Runs a write against the current connection, reconnecting and
    /// retrying once on failure.
    async fn with_connection<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, String>
    where
        F: Fn(Arc<ConnectionOf<C>>) -> Fut,
        Fut: Future<Output = Result<T, ConnectionErrorOf<C>>>,
    {
        if self.is_closed() {
            return Err("fetcher closed".to_string());
        }

        let _guard = self.inner.operation_lock.lock().await;

        let first = match self.current() {
            Some(connection) => f(connection).await.map_err(|e| e.to_string()),
            None => Err("not connected".to_string()),
        };

        match first {
            Ok(value) => Ok(value),
            Err(reason) => {
                debug!(
                    endpoint = %self.inner.endpoint,
                    operation,
                    error = %reason,
                    "operation failed, reconnecting and retrying once"
                );

                let connection = self.reconnect_locked().await.map_err(|e| e.to_string())?;

                f(connection).await.map_err(|e| e.to_string())
            }
        }
    }

    /// Takes the prefetched message, if any, without waiting.
    ///
    /// Credits the broker for the next message. In
    /// [`AckMode::AutoClientAck`] the message is acknowledged before it is
    /// returned; if that fails it is withheld so the broker redelivers it.
    pub async fn receive_last(&self) -> Option<Frame> {
        let frame = self.inner.prefetch_receiver.lock().try_recv().ok()?;

        let Some(message_id) = frame.message_id().map(str::to_string) else {
            warn!(endpoint = %self.inner.endpoint, "message frame without a message id");
            return Some(frame);
        };

        let delivered = Delivered {
            message_id: message_id.clone(),
            connection_id: frame.connection_id().map(str::to_string),
        };
        *self.inner.last_delivered.lock() = Some(delivered.clone());

        let credited = self
            .with_connection("credit", |connection| {
                let message_id = message_id.clone();
                async move { connection.credit(&message_id).await }
            })
            .await;

        if let Err(reason) = credited {
            warn!(endpoint = %self.inner.endpoint, %message_id, error = %reason, "credit failed");
        }

        if self.inner.config.ack_mode == AckMode::AutoClientAck {
            if let Err(e) = self
                .ack_message(&delivered.message_id, delivered.connection_id.as_deref())
                .await
            {
                warn!(
                    endpoint = %self.inner.endpoint,
                    message_id = %delivered.message_id,
                    error = %e,
                    "auto-ack failed, message will be redelivered"
                );
                return None;
            }
        }

        Some(frame)
    }

    fn last_delivered(&self) -> Result<Delivered, String> {
        self.inner
            .last_delivered
            .lock()
            .clone()
            .ok_or_else(|| "no message delivered".to_string())
    }

    fn forget_delivered(&self, message_id: &str) {
        let mut last = self.inner.last_delivered.lock();
        if last
            .as_ref()
            .is_some_and(|delivered| delivered.message_id == message_id)
        {
            *last = None;
        }
    }

    /// Acknowledges the last delivered message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AckFailed`] when nothing was delivered or both
    /// attempts fail.
    pub async fn ack(&self) -> Result<(), Error> {
        let delivered = self.last_delivered().map_err(Error::AckFailed)?;

        self.ack_message(&delivered.message_id, delivered.connection_id.as_deref())
            .await
    }

    /// Acknowledges a message by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AckFailed`] when both attempts fail.
    pub async fn ack_message(&self, message_id: &str, connection_id: Option<&str>) -> Result<(), Error> {
        let subscription_id = self.inner.config.subscription_id.as_deref();

        self.with_connection("ack", |connection| {
            let message_id = message_id.to_string();
            let subscription_id = subscription_id.map(str::to_string);
            let connection_id = connection_id.map(str::to_string);

            async move {
                connection
                    .ack(
                        &message_id,
                        None,
                        subscription_id.as_deref(),
                        connection_id.as_deref(),
                        None,
                    )
                    .await
            }
        })
        .await
        .map_err(Error::AckFailed)?;

        self.forget_delivered(message_id);
        debug!(endpoint = %self.inner.endpoint, message_id, "acknowledged");

        Ok(())
    }

    /// Acknowledges the last delivered message and waits for the broker
    /// receipt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AckFailed`] when the ack cannot be sent or the broker
    /// answers with something other than a receipt, and
    /// [`Error::AckTimeout`] when no answer arrives in time.
    pub async fn ack_safe(&self, timeout: Duration) -> Result<(), Error> {
        let delivered = self.last_delivered().map_err(Error::AckFailed)?;

        self.ack_safe_message(
            &delivered.message_id,
            delivered.connection_id.as_deref(),
            timeout,
        )
        .await
    }

    /// Acknowledges a message by id and waits for the broker receipt.
    ///
    /// # Errors
    ///
    /// As [`Self::ack_safe`].
    pub async fn ack_safe_message(
        &self,
        message_id: &str,
        connection_id: Option<&str>,
        timeout: Duration,
    ) -> Result<(), Error> {
        let receipt_id = Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();

        self.inner
            .pending_receipts
            .lock()
            .insert(receipt_id.clone(), sender);

        let result = self
            .await_receipt(message_id, connection_id, &receipt_id, receiver, timeout)
            .await;

        self.inner.pending_receipts.lock().remove(&receipt_id);

        if result.is_ok() {
            self.forget_delivered(message_id);
            debug!(endpoint = %self.inner.endpoint, message_id, %receipt_id, "acknowledged with receipt");
        }

        result
    }

    async fn await_receipt(
        &self,
        message_id: &str,
        connection_id: Option<&str>,
        receipt_id: &str,
        receiver: oneshot::Receiver<Frame>,
        timeout: Duration,
    ) -> Result<(), Error> {
        let subscription_id = self.inner.config.subscription_id.as_deref();

        self.with_connection("ack_safe", |connection| {
            let message_id = message_id.to_string();
            let subscription_id = subscription_id.map(str::to_string);
            let connection_id = connection_id.map(str::to_string);
            let receipt_id = receipt_id.to_string();

            async move {
                connection
                    .ack(
                        &message_id,
                        None,
                        subscription_id.as_deref(),
                        connection_id.as_deref(),
                        Some(&receipt_id),
                    )
                    .await
            }
        })
        .await
        .map_err(Error::AckFailed)?;

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(frame)) if frame.command == FrameCommand::Receipt => Ok(()),
            Ok(Ok(frame)) => Err(Error::AckFailed(format!(
                "broker answered with {}: {}",
                frame.command,
                frame.header("message").unwrap_or_default()
            ))),
            Ok(Err(_)) => Err(Error::AckFailed("receipt channel closed".to_string())),
            Err(_) => Err(Error::AckTimeout(timeout)),
        }
    }

    /// Rejects the last delivered message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NackFailed`] when nothing was delivered or both
    /// attempts fail.
    pub async fn nack(&self) -> Result<(), Error> {
        let delivered = self.last_delivered().map_err(Error::NackFailed)?;

        self.nack_message(&delivered.message_id).await
    }

    /// Rejects a message by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NackFailed`] when both attempts fail.
    pub async fn nack_message(&self, message_id: &str) -> Result<(), Error> {
        let subscription_id = self.inner.config.subscription_id.as_deref();

        self.with_connection("nack", |connection| {
            let message_id = message_id.to_string();
            let subscription_id = subscription_id.map(str::to_string);

            async move {
                connection
                    .nack(&message_id, subscription_id.as_deref())
                    .await
            }
        })
        .await
        .map_err(Error::NackFailed)?;

        self.forget_delivered(message_id);
        debug!(endpoint = %self.inner.endpoint, message_id, "rejected");

        Ok(())
    }

    /// Sends a heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeepAliveFailed`] when both attempts fail.
    pub async fn keep_alive(&self) -> Result<(), Error> {
        self.with_connection("keepalive", |connection| async move {
            connection.keep_alive().await
        })
        .await
        .map_err(Error::KeepAliveFailed)
    }

    /// Stops the fetch task, drops any prefetched message and closes the
    /// connection. Safe to call more than once.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }

        self.inner.shutdown_token.cancel();
        self.inner.task_tracker.close();
        self.inner.task_tracker.wait().await;

        {
            let mut receiver = self.inner.prefetch_receiver.lock();
            while receiver.try_recv().is_ok() {}
        }
        self.inner.last_delivered.lock().take();
        self.inner.pending_receipts.lock().clear();

        let _guard = self.inner.operation_lock.lock().await;
        let connection = self.inner.connection.write().take();

        if let Some(connection) = connection {
            if let Err(e) = connection.disconnect().await {
                debug!(endpoint = %self.inner.endpoint, error = %e, "error disconnecting");
            }
            if let Err(e) = connection.close().await {
                debug!(endpoint = %self.inner.endpoint, error = %e, "error closing connection");
            }
        }

        info!(endpoint = %self.inner.endpoint, "fetcher closed");
    }
}
