use crate::{AckMode, BrokerFetcher, ConsumerConfig, Error};

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug};
use std::sync::{Arc, Weak};
use std::time::Duration;

use mbus_api::{
    AckToken, BrokerEndpoint, Connector, Frame, MembershipSource, Message, SessionStatus,
};
use mbus_api::frame::MESSAGE_ID_HEADER;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

type Delivery<C> = (BrokerFetcher<C>, Message);

struct Registry<C: Connector> {
    by_endpoint: HashMap<BrokerEndpoint, Vec<BrokerFetcher<C>>>,
    ordered: Vec<BrokerFetcher<C>>,
    cursor: Option<usize>,
    last_source: Option<BrokerFetcher<C>>,
}

impl<C: Connector> Default for Registry<C> {
    fn default() -> Self {
        Self {
            by_endpoint: HashMap::new(),
            ordered: Vec::new(),
            cursor: None,
            last_source: None,
        }
    }
}

impl<C: Connector> Registry<C> {
    fn register(&mut self, fetcher: BrokerFetcher<C>) {
        self.by_endpoint
            .entry(fetcher.endpoint().clone())
            .or_default()
            .push(fetcher.clone());
        self.ordered.push(fetcher);
    }

    fn first(&self, endpoint: &BrokerEndpoint) -> Option<BrokerFetcher<C>> {
        self.by_endpoint
            .get(endpoint)
            .and_then(|fetchers| fetchers.first())
            .cloned()
    }

    fn remove(&mut self, endpoint: &BrokerEndpoint) -> Vec<BrokerFetcher<C>> {
        let removed = self.by_endpoint.remove(endpoint).unwrap_or_default();

        self.ordered
            .retain(|fetcher| !removed.iter().any(|gone| gone.same_as(fetcher)));

        if self
            .last_source
            .as_ref()
            .is_some_and(|source| removed.iter().any(|gone| gone.same_as(source)))
        {
            self.last_source = None;
        }

        removed
    }

    fn clear(&mut self) -> Vec<BrokerFetcher<C>> {
        self.by_endpoint.clear();
        self.cursor = None;
        self.last_source = None;

        std::mem::take(&mut self.ordered)
    }
}

struct Inner<C: Connector, M: MembershipSource> {
    connector: C,
    membership: M,
    status: RwLock<SessionStatus>,
    lifecycle: tokio::sync::Mutex<()>,
    config: RwLock<Option<Arc<ConsumerConfig>>>,
    membership_url: RwLock<Option<Url>>,
    registry: Mutex<Registry<C>>,
    refresh_token: CancellationToken,
}

/// Consumes from a set of brokers, one [`BrokerFetcher`] per broker.
///
/// Receives rotate over the fetchers round-robin. With dynamic membership
/// the broker set is reconciled against the membership source every
/// `connection_lifetime`.
pub struct ConsumerSession<C: Connector, M: MembershipSource> {
    inner: Arc<Inner<C, M>>,
}

impl<C: Connector, M: MembershipSource> Clone for ConsumerSession<C, M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector, M: MembershipSource> Debug for ConsumerSession<C, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSession")
            .field("status", &self.status())
            .field("endpoints", &self.registered_endpoints())
            .finish_non_exhaustive()
    }
}

impl<C: Connector, M: MembershipSource> ConsumerSession<C, M> {
    /// Creates an idle session.
    #[must_use]
    pub fn new(connector: C, membership: M) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                membership,
                status: RwLock::new(SessionStatus::Initialized),
                lifecycle: tokio::sync::Mutex::new(()),
                config: RwLock::new(None),
                membership_url: RwLock::new(None),
                registry: Mutex::new(Registry::default()),
                refresh_token: CancellationToken::new(),
            }),
        }
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.inner.status.read()
    }

    /// Endpoints with a registered fetcher, in round-robin order.
    #[must_use]
    pub fn registered_endpoints(&self) -> Vec<BrokerEndpoint> {
        self.inner
            .registry
            .lock()
            .ordered
            .iter()
            .map(|fetcher| fetcher.endpoint().clone())
            .collect()
    }

    /// The fetcher serving an endpoint.
    #[must_use]
    pub fn fetcher(&self, endpoint: &BrokerEndpoint) -> Option<BrokerFetcher<C>> {
        self.inner.registry.lock().first(endpoint)
    }

    /// The configuration the session was started with.
    #[must_use]
    pub fn config(&self) -> Option<Arc<ConsumerConfig>> {
        self.inner.config.read().clone()
    }

    fn running_config(&self, operation: &'static str) -> Result<Arc<ConsumerConfig>, Error> {
        let status = self.status();
        if status != SessionStatus::Running {
            return Err(Error::InvalidStatus { operation, status });
        }

        self.config().ok_or(Error::InvalidStatus { operation, status })
    }

    /// Validates the configuration, resolves the broker set and starts a
    /// fetcher per broker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStatus`] unless the session is new,
    /// [`Error::InvalidConfig`] for a bad configuration and
    /// [`Error::Membership`] when the initial membership fetch fails.
    pub async fn start(&self, config: ConsumerConfig) -> Result<(), Error> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let status = self.status();
        if status != SessionStatus::Initialized {
            return Err(Error::InvalidStatus {
                operation: "start",
                status,
            });
        }

        config.validate()?;
        let config = Arc::new(config);

        let brokers = if config.dynamic_membership {
            let url = self.resolve_membership_url(&config)?;
            let fetched = self
                .inner
                .membership
                .fetch(&url)
                .await
                .map_err(|e| Error::Membership(e.to_string()))?;

            if fetched.is_empty() {
                warn!(%url, "membership source returned no brokers");
            }

            *self.inner.membership_url.write() = Some(url);

            let mut brokers: Vec<BrokerEndpoint> = fetched.into_iter().collect();
            brokers.sort_by_key(ToString::to_string);
            brokers
        } else {
            let mut seen = HashSet::new();
            config
                .brokers
                .iter()
                .filter(|endpoint| seen.insert((*endpoint).clone()))
                .cloned()
                .collect()
        };

        {
            let mut registry = self.inner.registry.lock();
            for endpoint in &brokers {
                let fetcher =
                    BrokerFetcher::new(endpoint.clone(), self.inner.connector.clone(), config.clone());
                fetcher.start();
                registry.register(fetcher);
            }
        }

        *self.inner.config.write() = Some(config.clone());
        *self.inner.status.write() = SessionStatus::Running;

        if config.dynamic_membership {
            self.spawn_refresh(config.connection_lifetime);
        }

        info!(
            destination = %config.destination,
            brokers = brokers.len(),
            dynamic = config.dynamic_membership,
            "consumer session started"
        );

        Ok(())
    }

    fn resolve_membership_url(&self, config: &ConsumerConfig) -> Result<Url, Error> {
        if let Some(url) = &config.membership_url {
            return Ok(url.clone());
        }

        config
            .brokers
            .first()
            .and_then(|seed| self.inner.membership.derive_url(seed))
            .ok_or_else(|| Error::InvalidConfig("cannot derive a membership url".to_string()))
    }

    fn spawn_refresh(&self, period: Duration) {
        let session: Weak<Inner<C, M>> = Arc::downgrade(&self.inner);
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

                Self { inner }.refresh_servers().await;
            }

            debug!("membership refresh stopped");
        });
    }

    /// Closes every fetcher and stops membership reconciliation.
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

        let fetchers = self.inner.registry.lock().clear();
        for fetcher in fetchers {
            fetcher.close().await;
        }

        info!("consumer session stopped");

        Ok(())
    }

    /// Returns a prefetched message if any fetcher has one, without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStatus`] unless the session is running.
    pub async fn receive_immediate(&self) -> Result<Option<Message>, Error> {
        self.running_config("receive")?;

        Ok(self.scan().await)
    }

    /// Waits until a message arrives.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStatus`] unless the session is running, or
    /// once it stops.
    pub async fn receive(&self) -> Result<Message, Error> {
        let config = self.running_config("receive")?;

        loop {
            if let Some(message) = self.scan().await {
                return Ok(message);
            }

            tokio::time::sleep(config.receive_poll_interval).await;
            self.running_config("receive")?;
        }
    }

    /// Waits up to `timeout` for a message.
    ///
    /// The wait runs on a separate task. A message that task takes after
    /// the deadline is handed back to its broker and never becomes the
    /// session's last received message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStatus`] unless the session is running and
    /// [`Error::ReceiveTimeout`] when nothing arrives in time or the wait
    /// fails.
    pub async fn receive_timeout(&self, timeout: Duration) -> Result<Message, Error> {
        let config = self.running_config("receive")?;

        let cancel_token = CancellationToken::new();
        let session = self.clone();
        let task_token = cancel_token.clone();
        let mut handle = tokio::spawn(async move { session.receive_until(task_token).await });

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(Some((fetcher, message))))) => {
                self.commit(&fetcher);
                Ok(message)
            }
            Ok(Ok(Ok(None))) => Err(Error::ReceiveTimeout(timeout)),
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "receive failed");
                Err(Error::ReceiveTimeout(timeout))
            }
            Ok(Err(e)) => {
                warn!(error = %e, "receive task failed");
                Err(Error::ReceiveTimeout(timeout))
            }
            Err(_) => {
                cancel_token.cancel();
                tokio::spawn(Self::release_late(handle, config.ack_mode));
                Err(Error::ReceiveTimeout(timeout))
            }
        }
    }

    async fn receive_until(
        &self,
        cancel_token: CancellationToken,
    ) -> Result<Option<Delivery<C>>, Error> {
        let config = self.running_config("receive")?;

        loop {
            if cancel_token.is_cancelled() {
                return Ok(None);
            }

            if let Some(delivery) = self.poll_fetchers().await {
                return Ok(Some(delivery));
            }

            tokio::select! {
                () = cancel_token.cancelled() => return Ok(None),
                () = tokio::time::sleep(config.receive_poll_interval) => {}
            }

            self.running_config("receive")?;
        }
    }

    /// Hands a message back to its broker when the receive task that took
    /// it outlived its caller.
    async fn release_late(
        handle: JoinHandle<Result<Option<Delivery<C>>, Error>>,
        ack_mode: AckMode,
    ) {
        let Ok(Ok(Some((fetcher, message)))) = handle.await else {
            return;
        };

        let Some(message_id) = message.properties().get(MESSAGE_ID_HEADER).cloned() else {
            warn!(endpoint = %fetcher.endpoint(), "late message without an id dropped");
            return;
        };

        let endpoint = fetcher.endpoint();

        if ack_mode == AckMode::AutoClientAck {
            warn!(%endpoint, %message_id, "late message was already acknowledged");
            return;
        }

        match fetcher.nack_message(&message_id).await {
            Ok(()) => debug!(%endpoint, %message_id, "late message returned to broker"),
            Err(e) => warn!(%endpoint, %message_id, error = %e, "failed to return late message"),
        }
    }

    /// One round over every fetcher, recording the one that delivered.
    async fn scan(&self) -> Option<Message> {
        let (fetcher, message) = self.poll_fetchers().await?;
        self.commit(&fetcher);

        Some(message)
    }

    /// One round over every fetcher, starting after the last one that
    /// delivered. Leaves the cursor and last source alone.
    async fn poll_fetchers(&self) -> Option<Delivery<C>> {
        let (fetchers, start) = {
            let registry = self.inner.registry.lock();
            (
                registry.ordered.clone(),
                registry.cursor.map_or(0, |cursor| cursor + 1),
            )
        };

        let count = fetchers.len();

        for offset in 0..count {
            let fetcher = &fetchers[(start + offset) % count];

            let Some(frame) = fetcher.receive_last().await else {
                continue;
            };

            if let Some(message) = Self::to_message(fetcher, frame) {
                return Some((fetcher.clone(), message));
            }
        }

        None
    }

    fn commit(&self, fetcher: &BrokerFetcher<C>) {
        let mut registry = self.inner.registry.lock();

        if let Some(position) = registry
            .ordered
            .iter()
            .position(|registered| registered.same_as(fetcher))
        {
            registry.cursor = Some(position);
        }
        registry.last_source = Some(fetcher.clone());
    }

    fn to_message(fetcher: &BrokerFetcher<C>, frame: Frame) -> Option<Message> {
        let mut message = match Message::try_from(frame.body.clone()) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    endpoint = %fetcher.endpoint(),
                    message_id = frame.message_id().unwrap_or_default(),
                    error = %e,
                    "dropping undecodable message"
                );
                return None;
            }
        };

        match frame.message_id() {
            Some(message_id) => {
                let token = AckToken::new(
                    fetcher.endpoint().clone(),
                    message_id,
                    frame.connection_id().map(str::to_string),
                );
                message.set_ack_token(&token);
            }
            None => {
                debug!(endpoint = %fetcher.endpoint(), "message without an id carries no ack token");
            }
        }
        message.properties_mut().extend(frame.headers);

        Some(message)
    }

    fn take_last_source(&self) -> Option<BrokerFetcher<C>> {
        self.inner.registry.lock().last_source.take()
    }

    fn refuses_explicit_acks(config: &ConsumerConfig, operation: &str) -> bool {
        if config.ack_mode == AckMode::AutoClientAck {
            warn!(operation, "session acknowledges automatically; call ignored");
            return true;
        }

        false
    }

    /// Acknowledges the most recently received message.
    ///
    /// Returns `false` when there is nothing to acknowledge (including a
    /// repeated call without a new receive), in auto-ack mode, or when the
    /// broker could not be reached.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStatus`] unless the session is running.
    pub async fn ack(&self) -> Result<bool, Error> {
        let config = self.running_config("ack")?;
        if Self::refuses_explicit_acks(&config, "ack") {
            return Ok(false);
        }

        let Some(source) = self.take_last_source() else {
            debug!("no received message to ack");
            return Ok(false);
        };

        Ok(Self::report(source.endpoint(), "ack", source.ack().await))
    }

    /// Rejects the most recently received message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStatus`] unless the session is running.
    pub async fn nack(&self) -> Result<bool, Error> {
        let config = self.running_config("nack")?;
        if Self::refuses_explicit_acks(&config, "nack") {
            return Ok(false);
        }

        let Some(source) = self.take_last_source() else {
            debug!("no received message to nack");
            return Ok(false);
        };

        Ok(Self::report(source.endpoint(), "nack", source.nack().await))
    }

    /// Acknowledges the most recently received message and waits for the
    /// broker receipt, up to `timeout` or the configured default.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStatus`] unless the session is running.
    pub async fn ack_safe(&self, timeout: Option<Duration>) -> Result<bool, Error> {
        let config = self.running_config("ack_safe")?;
        if Self::refuses_explicit_acks(&config, "ack_safe") {
            return Ok(false);
        }

        let Some(source) = self.take_last_source() else {
            debug!("no received message to ack");
            return Ok(false);
        };

        let timeout = timeout.unwrap_or(config.ack_safe_timeout);

        Ok(Self::report(
            source.endpoint(),
            "ack_safe",
            source.ack_safe(timeout).await,
        ))
    }

    /// Acknowledges the message an ack token was issued for, on any session
    /// consuming the same destination.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStatus`] unless the session is running.
    pub async fn ack_token(&self, token: &str) -> Result<bool, Error> {
        let config = self.running_config("ack")?;
        if Self::refuses_explicit_acks(&config, "ack") {
            return Ok(false);
        }

        let Some((fetcher, token)) = self.route(token, &config) else {
            return Ok(false);
        };

        let result = fetcher
            .ack_message(token.message_id(), token.connection_id())
            .await;

        Ok(Self::report(fetcher.endpoint(), "ack", result))
    }

    /// Rejects the message an ack token was issued for.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStatus`] unless the session is running.
    pub async fn nack_token(&self, token: &str) -> Result<bool, Error> {
        let config = self.running_config("nack")?;
        if Self::refuses_explicit_acks(&config, "nack") {
            return Ok(false);
        }

        let Some((fetcher, token)) = self.route(token, &config) else {
            return Ok(false);
        };

        let result = fetcher.nack_message(token.message_id()).await;

        Ok(Self::report(fetcher.endpoint(), "nack", result))
    }

    /// Acknowledges the message an ack token was issued for and waits for
    /// the broker receipt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStatus`] unless the session is running.
    pub async fn ack_safe_token(&self, token: &str, timeout: Option<Duration>) -> Result<bool, Error> {
        let config = self.running_config("ack_safe")?;
        if Self::refuses_explicit_acks(&config, "ack_safe") {
            return Ok(false);
        }

        let Some((fetcher, token)) = self.route(token, &config) else {
            return Ok(false);
        };

        let timeout = timeout.unwrap_or(config.ack_safe_timeout);
        let result = fetcher
            .ack_safe_message(token.message_id(), token.connection_id(), timeout)
            .await;

        Ok(Self::report(fetcher.endpoint(), "ack_safe", result))
    }

    fn report(endpoint: &BrokerEndpoint, operation: &str, result: Result<(), Error>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(%endpoint, operation, error = %e, "acknowledgment failed");
                false
            }
        }
    }

    /// Decodes a token and finds the fetcher for its broker. An unknown
    /// broker gets a fetcher that is registered but never started, so it
    /// carries acks without consuming.
    fn route(
        &self,
        token: &str,
        config: &Arc<ConsumerConfig>,
    ) -> Option<(BrokerFetcher<C>, AckToken)> {
        let token = match AckToken::decode(token) {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "cannot decode ack token");
                return None;
            }
        };

        let mut registry = self.inner.registry.lock();

        if let Some(fetcher) = registry.first(token.endpoint()) {
            return Some((fetcher, token));
        }

        if self.status() != SessionStatus::Running {
            return None;
        }

        let fetcher = BrokerFetcher::new(
            token.endpoint().clone(),
            self.inner.connector.clone(),
            config.clone(),
        );
        registry.register(fetcher.clone());
        drop(registry);

        info!(endpoint = %token.endpoint(), "registered ack-only fetcher");

        Some((fetcher, token))
    }

    /// Sends a heartbeat on the first fetcher of every registered broker.
    /// Returns `true` only if every heartbeat succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStatus`] unless the session is running.
    pub async fn keep_alive(&self) -> Result<bool, Error> {
        self.running_config("keep_alive")?;

        let fetchers: Vec<BrokerFetcher<C>> = self
            .inner
            .registry
            .lock()
            .by_endpoint
            .values()
            .filter_map(|fetchers| fetchers.first().cloned())
            .collect();

        let mut all_alive = true;
        for fetcher in fetchers {
            if let Err(e) = fetcher.keep_alive().await {
                warn!(endpoint = %fetcher.endpoint(), error = %e, "keepalive failed");
                all_alive = false;
            }
        }

        Ok(all_alive)
    }

    /// Reconciles the registered brokers with the membership source.
    ///
    /// Fetchers of brokers that left are closed, brokers that joined get a
    /// new fetcher and everything else is left alone. Failures are logged
    /// and leave the registry untouched.
    pub async fn refresh_servers(&self) {
        if self.status() != SessionStatus::Running {
            debug!("skipping membership refresh; session not running");
            return;
        }

        let Some(config) = self.config() else {
            return;
        };

        let url = self.inner.membership_url.read().clone();
        let Some(url) = url else {
            debug!("no membership url; nothing to refresh");
            return;
        };

        let fetched = match self.inner.membership.fetch(&url).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(%url, error = %e, "membership refresh failed");
                return;
            }
        };

        let (removed, added) = {
            let mut registry = self.inner.registry.lock();

            // Stop may have cleared the registry while we were fetching.
            if self.status() != SessionStatus::Running {
                return;
            }

            let current: HashSet<BrokerEndpoint> = registry.by_endpoint.keys().cloned().collect();

            let mut removed = Vec::new();
            for endpoint in current.difference(&fetched) {
                removed.extend(registry.remove(endpoint));
            }
            if !removed.is_empty() {
                registry.cursor = None;
            }

            // Fetchers registered only to carry acks start consuming once
            // their broker is a member.
            for endpoint in fetched.intersection(&current) {
                if let Some(fetcher) = registry.first(endpoint) {
                    if !fetcher.is_started() {
                        fetcher.start();
                        info!(%endpoint, "ack-only fetcher joined membership");
                    }
                }
            }

            let mut joined: Vec<BrokerEndpoint> = fetched.difference(&current).cloned().collect();
            joined.sort_by_key(ToString::to_string);

            for endpoint in &joined {
                let fetcher =
                    BrokerFetcher::new(endpoint.clone(), self.inner.connector.clone(), config.clone());
                fetcher.start();
                registry.register(fetcher);
            }

            (removed, joined)
        };

        for endpoint in &added {
            info!(%endpoint, "broker joined membership");
        }

        for fetcher in removed {
            info!(endpoint = %fetcher.endpoint(), "broker left membership");
            fetcher.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use mbus_api::{FrameCommand, Headers, StaticMembership};
    use mbus_connection_memory::MemoryConnector;

    type Session = ConsumerSession<MemoryConnector, StaticMembership>;

    fn endpoint() -> BrokerEndpoint {
        BrokerEndpoint::new("broker-0", 61613)
    }

    fn fetcher() -> BrokerFetcher<MemoryConnector> {
        BrokerFetcher::new(
            endpoint(),
            MemoryConnector::new(),
            Arc::new(ConsumerConfig::default()),
        )
    }

    fn frame(headers: &[(&str, &str)]) -> Frame {
        let headers: Headers = headers
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        let body = Bytes::try_from(&Message::string("hello")).unwrap();

        Frame::new(FrameCommand::Message, headers, body)
    }

    #[test]
    fn test_message_carries_ack_token() {
        let message = Session::to_message(
            &fetcher(),
            frame(&[("message-id", "ID:1"), ("connection-id", "conn-7")]),
        )
        .unwrap();

        let token = AckToken::decode(message.ack_token().unwrap()).unwrap();
        assert_eq!(token.endpoint(), &endpoint());
        assert_eq!(token.message_id(), "ID:1");
        assert_eq!(token.connection_id(), Some("conn-7"));
        assert_eq!(
            message.properties().get("connection-id").map(String::as_str),
            Some("conn-7")
        );
    }

    #[test]
    fn test_message_without_id_has_no_ack_token() {
        let message = Session::to_message(&fetcher(), frame(&[("connection-id", "conn-7")])).unwrap();

        assert_eq!(message.as_string().unwrap(), "hello");
        assert!(message.ack_token().is_none());
    }

    #[test]
    fn test_undecodable_body_is_dropped() {
        let frame = Frame::new(FrameCommand::Message, Headers::new(), "not an envelope");

        assert!(Session::to_message(&fetcher(), frame).is_none());
    }
}
