//! Broker membership fetched from the cluster's HTTP management endpoint.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use mbus_api::{BrokerEndpoint, MembershipSource};
use reqwest::Client;
use tracing::debug;
use url::Url;

/// Port the management endpoint listens on.
pub const DEFAULT_MEMBERSHIP_PORT: u16 = 8081;

static MEMBERSHIP_PATH: &str = "/jmx";
static BROKER_LIST_ATTRIBUTE: &str = "org.hornetq:module=Core,type=Server ListOfBrokers";

/// Builds the URL listing the brokers known to `host`.
///
/// # Errors
///
/// Returns [`Error::InvalidUrl`] if `host` is not a valid host.
pub fn membership_url(host: &str, port: u16) -> Result<Url, Error> {
    let mut url = Url::parse(&format!("http://{host}:{port}{MEMBERSHIP_PATH}"))?;

    url.query_pairs_mut()
        .append_pair("command", "get_attribute")
        .append_pair("args", BROKER_LIST_ATTRIBUTE);

    Ok(url)
}

/// Parses a comma separated `host:port` list. A blank body is an empty
/// cluster.
///
/// # Errors
///
/// Returns [`Error::InvalidBroker`] for the first entry that is not
/// `host:port`.
pub fn parse_brokers(body: &str) -> Result<HashSet<BrokerEndpoint>, Error> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(HashSet::new());
    }

    body.split(',')
        .map(|entry| {
            entry
                .parse::<BrokerEndpoint>()
                .map_err(|source| Error::InvalidBroker {
                    entry: entry.trim().to_string(),
                    source,
                })
        })
        .collect()
}

/// Membership source backed by the management endpoint.
#[derive(Clone, Debug)]
pub struct HttpMembership {
    client: Client,
    port: u16,
}

impl HttpMembership {
    /// Creates a source querying the default management port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the HTTP client cannot be built.
    pub fn new() -> Result<Self, Error> {
        Self::with_port(DEFAULT_MEMBERSHIP_PORT)
    }

    /// Creates a source querying the management endpoint on `port`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the HTTP client cannot be built.
    pub fn with_port(port: u16) -> Result<Self, Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(1))
            .timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self { client, port })
    }
}

#[async_trait]
impl MembershipSource for HttpMembership {
    type Error = Error;

    async fn fetch(&self, url: &Url) -> Result<HashSet<BrokerEndpoint>, Error> {
        let body = self
            .client
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let brokers = parse_brokers(&body)?;
        debug!(%url, brokers = brokers.len(), "fetched broker membership");

        Ok(brokers)
    }

    fn derive_url(&self, seed: &BrokerEndpoint) -> Option<Url> {
        membership_url(seed.host(), self.port).ok()
    }
}
