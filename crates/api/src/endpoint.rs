use crate::Error;

use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Host and port of a single broker.
///
/// Two endpoints are equal when their ports match and their hosts match
/// ignoring ASCII case, so `Broker-1:61613` and `broker-1:61613` share a
/// registry slot.
#[derive(Clone, Debug, Eq)]
pub struct BrokerEndpoint {
    host: String,
    port: u16,
}

impl BrokerEndpoint {
    /// Creates a new endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The broker host name or address.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The broker port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl PartialEq for BrokerEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port && self.host.eq_ignore_ascii_case(&other.host)
    }
}

impl Hash for BrokerEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.host.bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
        self.port.hash(state);
    }
}

impl Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for BrokerEndpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidEndpoint(s.to_string()))?;

        if host.is_empty() {
            return Err(Error::InvalidEndpoint(s.to_string()));
        }

        let port = port
            .trim()
            .parse()
            .map_err(|_| Error::InvalidEndpoint(s.to_string()))?;

        Ok(Self::new(host.trim(), port))
    }
}
