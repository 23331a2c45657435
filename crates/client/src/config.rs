use crate::Error;

use std::time::Duration;

use mbus_api::{BrokerEndpoint, Destination, DestinationType, Headers};
use url::Url;

/// How a consumer acknowledges delivered messages.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum AckMode {
    /// The application acknowledges each message.
    #[default]
    ClientAck,

    /// Messages are acknowledged as they are handed to the application.
    AutoClientAck,
}

/// Configuration for a consumer session.
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    /// Static broker list. With dynamic membership the first entry seeds the
    /// membership URL.
    pub brokers: Vec<BrokerEndpoint>,

    /// Queue or topic to consume from.
    pub destination: Destination,

    /// Acknowledgment mode.
    pub ack_mode: AckMode,

    /// Subscription id. Required for topics; also sent as the client id.
    pub subscription_id: Option<String>,

    /// Interval between membership reconciliations.
    pub connection_lifetime: Duration,

    /// Whether the broker set comes from the membership source.
    pub dynamic_membership: bool,

    /// Membership URL. Derived from the first broker when unset.
    pub membership_url: Option<Url>,

    /// Broker login.
    pub username: String,

    /// Broker passcode.
    pub password: String,

    /// Sleep between receive scan rounds.
    pub receive_poll_interval: Duration,

    /// Read timeout of a single fetch from a broker.
    pub fetch_timeout: Duration,

    /// Connection attempts per reconnect cycle.
    pub connect_retry_attempts: u32,

    /// Delay between connection attempts within a cycle.
    pub connect_retry_delay: Duration,

    /// Pause after a failed reconnect cycle before the next one.
    pub reconnect_cooldown: Duration,

    /// Receipt timeout for `ack_safe` calls that do not name one.
    pub ack_safe_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            destination: Destination::new(String::new(), DestinationType::Queue),
            ack_mode: AckMode::ClientAck,
            subscription_id: None,
            connection_lifetime: Duration::from_secs(300),
            dynamic_membership: true,
            membership_url: None,
            username: "guest".to_string(),
            password: "guest".to_string(),
            receive_poll_interval: Duration::from_millis(1),
            fetch_timeout: Duration::from_secs(300),
            connect_retry_attempts: 3,
            connect_retry_delay: Duration::from_secs(1),
            reconnect_cooldown: Duration::from_secs(60),
            ack_safe_timeout: Duration::from_secs(1),
        }
    }
}

impl ConsumerConfig {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        self.destination
            .validate()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        if self.destination.destination_type() == DestinationType::Topic
            && self.subscription_id.as_deref().is_none_or(str::is_empty)
        {
            return Err(Error::InvalidConfig(
                "topic consumers need a subscription id".to_string(),
            ));
        }

        if self.brokers.is_empty() && !(self.dynamic_membership && self.membership_url.is_some()) {
            return Err(Error::InvalidConfig(
                "at least one broker is required".to_string(),
            ));
        }

        if self.connect_retry_attempts == 0 {
            return Err(Error::InvalidConfig(
                "connect_retry_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Extra headers sent with the subscribe request.
    ///
    /// Topic subscriptions are durable and named after the subscription id.
    pub(crate) fn subscription_headers(&self) -> Headers {
        let mut headers = Headers::new();

        if self.destination.destination_type() == DestinationType::Topic {
            if let Some(subscription_id) = &self.subscription_id {
                for name in ["durable-subscriber-name", "id", "client-id"] {
                    headers.insert(name.to_string(), subscription_id.clone());
                }
            }
        }

        headers
    }
}

/// Configuration for a producer session.
#[derive(Clone, Debug)]
pub struct ProducerConfig {
    /// The broker to publish to.
    pub broker: BrokerEndpoint,

    /// Default queue or topic to publish to.
    pub destination: Destination,

    /// Interval between forced connection refreshes.
    pub connection_lifetime: Duration,

    /// Broker login.
    pub username: String,

    /// Broker passcode.
    pub password: String,

    /// Publish attempts before giving up.
    pub publish_max_retry_attempts: u32,

    /// Connection attempts per (re)connect.
    pub connect_retry_attempts: u32,

    /// Delay between connection attempts.
    pub connect_retry_delay: Duration,

    /// Log every publish at info level.
    pub verbose_log: bool,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            broker: BrokerEndpoint::new("localhost", 61613),
            destination: Destination::new(String::new(), DestinationType::Queue),
            connection_lifetime: Duration::from_secs(300),
            username: "rocketman".to_string(),
            password: "rocketman".to_string(),
            publish_max_retry_attempts: 3,
            connect_retry_attempts: 3,
            connect_retry_delay: Duration::from_secs(1),
            verbose_log: false,
        }
    }
}

impl ProducerConfig {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        self.destination
            .validate()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        if self.publish_max_retry_attempts == 0 {
            return Err(Error::InvalidConfig(
                "publish_max_retry_attempts must be at least 1".to_string(),
            ));
        }

        if self.connect_retry_attempts == 0 {
            return Err(Error::InvalidConfig(
                "connect_retry_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Per-call publish options.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// Overrides the configured destination.
    pub destination: Option<String>,

    /// Extra frame headers.
    pub headers: Headers,
}
