use crate::{Error, ProducerConfig, SendOptions};

use std::fmt::{self, Debug};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use mbus_api::{Connection, Connector, Message, SessionStatus};
use parking_lot::RwLock;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct Inner<C: Connector> {
    connector: C,
    status: RwLock<SessionStatus>,
    lifecycle: tokio::sync::Mutex<()>,
    config: RwLock<Option<Arc<ProducerConfig>>>,
    // Held for the whole of each publish attempt and each refresh.
    connection: tokio::sync::Mutex<Option<C::Connection>>,
    refresh_token: CancellationToken,
}

/// Publishes to one broker over one connection.
///
/// Failed publishes are retried on a fresh connection. A background task
/// replaces the connection every `connection_lifetime` so that no
/// connection lives forever.
pub struct ProducerSession<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ProducerSession<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> Debug for ProducerSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerSession")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> ProducerSession<C> {
    /// Creates an idle session.
    #[must_use]
    pub fn new(connector: C) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                status: RwLock::new(SessionStatus::Initialized),
                lifecycle: tokio::sync::Mutex::new(()),
                config: RwLock::new(None),
                connection: tokio::sync::Mutex::new(None),
                refresh_token: CancellationToken::new(),
            }),
        }
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.inner.status.read()
    }

    /// The configuration the session was started with.
    #[must_use]
    pub fn config(&self) -> Option<Arc<ProducerConfig>> {
        self.inner.config.read().clone()
    }

    fn running_config(&self, operation: &'static str) -> Result<Arc<ProducerConfig>, Error> {
        let status = self.status();
        if status != SessionStatus::Running {
            return Err(Error::InvalidStatus { operation, status });
        }

        self.config().ok_or(Error::InvalidStatus { operation, status })
    }

    /// Validates the configuration, connects and schedules the periodic
    /// connection refresh.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStatus`] unless the session is new,
    /// [`Error::InvalidConfig`] for a bad configuration and
    /// [`Error::TooManyConnectionRetryAttempts`] when the broker cannot be
    /// reached.
    pub async fn start(&self, config: ProducerConfig) -> Result<(), Error> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let status = self.status();
        if status != SessionStatus::Initialized {
            return Err(Error::InvalidStatus {
                operation: "start",
                status,
            });
        }

        config.validate()?;

        let connection = self.open_with_retries(&config).await?;
        *self.inner.connection.lock().await = Some(connection);

        let config = Arc::new(config);
        *self.inner.config.write() = Some(config.clone());
        *self.inner.status.write() = SessionStatus::Running;

        self.spawn_refresh(config.connection_lifetime);

        info!(
            broker = %config.broker,
            destination = %config.destination,
            "producer session started"
        );

        Ok(())
    }

    async fn open_with_retries(&self, config: &ProducerConfig) -> Result<C::Connection, Error> {
        let attempts = config.connect_retry_attempts.max(1);

        for attempt in 1..=attempts {
            match self.open_once(config).await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    warn!(broker = %config.broker, attempt, error = %e, "failed to connect producer");

                    if attempt < attempts {
                        tokio::time::sleep(config.connect_retry_delay).await;
                    }
                }
            }
        }

        Err(Error::TooManyConnectionRetryAttempts {
            endpoint: config.broker.clone(),
            attempts,
        })
    }

    async fn open_once(&self, config: &ProducerConfig) -> Result<C::Connection, Error> {
        let connection = self
            .inner
            .connector
            .open(&config.broker)
            .await
            .map_err(|e| Error::BrokerConnectionFailed {
                endpoint: config.broker.clone(),
                reason: e.to_string(),
            })?;

        connection
            .connect(&config.username, &config.password, None)
            .await
            .map_err(|e| Error::BrokerConnectionFailed {
                endpoint: config.broker.clone(),
                reason: e.to_string(),
            })?;

        Ok(connection)
    }

    fn spawn_refresh(&self, period: Duration) {
        let session: Weak<Inner<C>> = Arc::downgrade(&self.inner);
        let refresh_token = self.inner.refresh_token.clone();

        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);

            loop {
                tokio::select! {
                    () = refresh_token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let Some(inner) = session.upgrade() else {
                    break;
                };

                Self { inner }.refresh_connection().await;
            }

            debug!("connection refresh stopped");
        });
    }

    /// Publishes a message without waiting for confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SendFailed`] when every attempt fails,
    /// [`Error::Api`] when the message cannot be encoded and
    /// [`Error::InvalidStatus`] unless the session is running.
    pub async fn send(&self, message: &Message, options: SendOptions) -> Result<(), Error> {
        self.publish(message, options, false).await
    }

    /// Publishes a message and waits for the broker receipt.
    ///
    /// # Errors
    ///
    /// As [`Self::send`].
    pub async fn send_safe(&self, message: &Message, options: SendOptions) -> Result<(), Error> {
        self.publish(message, options, true).await
    }

    async fn publish(&self, message: &Message, options: SendOptions, safe: bool) -> Result<(), Error> {
        let config = self.running_config(if safe { "send_safe" } else { "send" })?;

        let destination = options
            .destination
            .unwrap_or_else(|| config.destination.name().to_string());
        let body = Bytes::try_from(message)?;
        let started = Instant::now();
        let attempts = config.publish_max_retry_attempts.max(1);

        for attempt in 1..=attempts {
            let result = {
                let connection = self.inner.connection.lock().await;

                match connection.as_ref() {
                    Some(connection) if safe => connection
                        .send_safe(&destination, body.clone(), &options.headers)
                        .await
                        .map_err(|e| e.to_string()),
                    Some(connection) => connection
                        .send(&destination, body.clone(), &options.headers)
                        .await
                        .map_err(|e| e.to_string()),
                    None => Err("not connected".to_string()),
                }
            };

            match result {
                Ok(()) => {
                    if config.verbose_log {
                        info!(
                            %destination,
                            message_id = message.id(),
                            attempt,
                            elapsed = ?started.elapsed(),
                            "message published"
                        );
                    }

                    return Ok(());
                }
                Err(reason) => {
                    warn!(
                        %destination,
                        message_id = message.id(),
                        attempt,
                        error = %reason,
                        "publish failed, refreshing connection"
                    );

                    self.refresh_connection().await;
                }
            }
        }

        Err(Error::SendFailed {
            destination,
            attempts,
        })
    }

    /// Closes the connection and opens a new one. Does nothing unless the
    /// session is running; failures are logged.
    pub async fn refresh_connection(&self) {
        let Ok(config) = self.running_config("refresh connection") else {
            debug!(status = %self.status(), "skipping connection refresh");
            return;
        };

        let mut slot = self.inner.connection.lock().await;

        // Stop may have run while we waited for the lock.
        if self.status() != SessionStatus::Running {
            debug!(status = %self.status(), "skipping connection refresh");
            return;
        }

        if let Some(previous) = slot.take() {
            Self::close_quietly(&previous).await;
        }

        match self.open_with_retries(&config).await {
            Ok(connection) => {
                *slot = Some(connection);
                debug!(broker = %config.broker, "producer connection refreshed");
            }
            Err(e) => {
                error!(broker = %config.broker, error = %e, "failed to refresh producer connection");
            }
        }
    }

    async fn close_quietly(connection: &C::Connection) {
        if let Err(e) = connection.disconnect().await {
            debug!(error = %e, "error disconnecting producer");
        }
        if let Err(e) = connection.close().await {
            debug!(error = %e, "error closing producer connection");
        }
    }

    /// Cancels the refresh task and closes the connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStatus`] if the session was never started.
    pub async fn stop(&self) -> Result<(), Error> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        match self.status() {
            SessionStatus::Stopped => return Ok(()),
            SessionStatus::Initialized => {
                return Err(Error::InvalidStatus {
                    operation: "stop",
                    status: SessionStatus::Initialized,
                });
            }
            SessionStatus::Running => {}
        }

        *self.inner.status.write() = SessionStatus::Stopped;
        self.inner.refresh_token.cancel();

        let connection = self.inner.connection.lock().await.take();
        if let Some(connection) = connection {
            Self::close_quietly(&connection).await;
        }

        info!("producer session stopped");

        Ok(())
    }
}
