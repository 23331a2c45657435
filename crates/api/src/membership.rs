use crate::BrokerEndpoint;

use std::collections::HashSet;
use std::convert::Infallible;
use std::error::Error;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use url::Url;

/// Marker trait for membership errors.
pub trait MembershipError: Error + Send + Sync + 'static {}

impl MembershipError for Infallible {}

/// Discovers the brokers currently serving the cluster.
#[async_trait]
pub trait MembershipSource
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for fetches.
    type Error: MembershipError;

    /// Fetches the current broker set.
    async fn fetch(&self, url: &Url) -> Result<HashSet<BrokerEndpoint>, Self::Error>;

    /// Builds the default membership URL from a seed broker.
    fn derive_url(&self, seed: &BrokerEndpoint) -> Option<Url>;
}

/// A membership source backed by a set held in memory.
///
/// Ignores the URL. Useful for fixed clusters and for driving
/// reconciliation in tests via [`StaticMembership::replace`].
#[derive(Clone, Debug, Default)]
pub struct StaticMembership {
    brokers: Arc<RwLock<HashSet<BrokerEndpoint>>>,
}

impl StaticMembership {
    /// Creates a source returning the given brokers.
    pub fn new(brokers: impl IntoIterator<Item = BrokerEndpoint>) -> Self {
        Self {
            brokers: Arc::new(RwLock::new(brokers.into_iter().collect())),
        }
    }

    /// Replaces the broker set returned by later fetches.
    pub fn replace(&self, brokers: impl IntoIterator<Item = BrokerEndpoint>) {
        *self.brokers.write() = brokers.into_iter().collect();
    }

    /// The broker set currently returned.
    #[must_use]
    pub fn brokers(&self) -> HashSet<BrokerEndpoint> {
        self.brokers.read().clone()
    }
}

#[async_trait]
impl MembershipSource for StaticMembership {
    type Error = Infallible;

    async fn fetch(&self, _url: &Url) -> Result<HashSet<BrokerEndpoint>, Self::Error> {
        Ok(self.brokers())
    }

    fn derive_url(&self, seed: &BrokerEndpoint) -> Option<Url> {
        Url::parse(&format!("memory://{}:{}/", seed.host(), seed.port())).ok()
    }
}
