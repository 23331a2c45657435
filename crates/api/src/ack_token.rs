use crate::{BrokerEndpoint, Error};

use std::fmt::{self, Display};
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

const NULL_CONNECTION_ID: &str = "null";

/// Routes an acknowledgment back to the broker, message and connection that
/// delivered a message.
///
/// Renders as base64 of `host:port:message-id:connection-id`, where a missing
/// connection id is written as the literal `null`. Message ids may contain
/// colons; the host and port are taken from the front and the connection id
/// from the back.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct AckToken {
    endpoint: BrokerEndpoint,
    message_id: String,
    connection_id: Option<String>,
}

impl AckToken {
    /// Creates a token.
    pub fn new(
        endpoint: BrokerEndpoint,
        message_id: impl Into<String>,
        connection_id: Option<String>,
    ) -> Self {
        Self {
            endpoint,
            message_id: message_id.into(),
            connection_id,
        }
    }

    /// Broker that delivered the message.
    #[must_use]
    pub const fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    /// Broker-assigned message id.
    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Connection the message was delivered on, if the broker reported one.
    #[must_use]
    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    /// Renders the opaque string form.
    #[must_use]
    pub fn encode(&self) -> String {
        let raw = format!(
            "{}:{}:{}:{}",
            self.endpoint.host(),
            self.endpoint.port(),
            self.message_id,
            self.connection_id.as_deref().unwrap_or(NULL_CONNECTION_ID)
        );

        STANDARD.encode(raw)
    }

    /// Parses the opaque string form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAckToken`] when the token is not base64, not
    /// UTF-8 or does not have four fields.
    pub fn decode(token: &str) -> Result<Self, Error> {
        let bytes = STANDARD
            .decode(token.trim())
            .map_err(|e| Error::InvalidAckToken(e.to_string()))?;
        let raw = String::from_utf8(bytes).map_err(|e| Error::InvalidAckToken(e.to_string()))?;

        let malformed = || Error::InvalidAckToken(format!("malformed token `{raw}`"));

        let (host, rest) = raw.split_once(':').ok_or_else(malformed)?;
        let (port, rest) = rest.split_once(':').ok_or_else(malformed)?;
        let (message_id, connection_id) = rest.rsplit_once(':').ok_or_else(malformed)?;

        if host.is_empty() || message_id.is_empty() {
            return Err(malformed());
        }

        let port = port.parse::<u16>().map_err(|_| malformed())?;

        let connection_id = match connection_id {
            "" | NULL_CONNECTION_ID => None,
            id => Some(id.to_string()),
        };

        Ok(Self::new(
            BrokerEndpoint::new(host, port),
            message_id,
            connection_id,
        ))
    }
}

impl Display for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for AckToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[test]
    fn test_token_round_trip() {
        let token = AckToken::new(
            BrokerEndpoint::new("broker-2", 61613),
            "ID:mem-7",
            Some("conn-3".to_string()),
        );

        let decoded = AckToken::decode(&token.encode()).unwrap();

        assert_eq!(decoded, token);
        assert_eq!(decoded.message_id(), "ID:mem-7");
        assert_eq!(decoded.connection_id(), Some("conn-3"));
    }

    #[test]
    fn test_missing_connection_id_is_written_as_null() {
        let token = AckToken::new(BrokerEndpoint::new("broker", 5445), "42", None);

        let raw = String::from_utf8(STANDARD.decode(token.encode()).unwrap()).unwrap();
        assert_eq!(raw, "broker:5445:42:null");

        let decoded: AckToken = token.to_string().parse().unwrap();
        assert_eq!(decoded.connection_id(), None);
    }

    #[test]
    fn test_decode_rejects_malformed_tokens() {
        assert_matches!(
            AckToken::decode("not base64!"),
            Err(Error::InvalidAckToken(_))
        );
        assert_matches!(
            AckToken::decode(&STANDARD.encode("broker:61613")),
            Err(Error::InvalidAckToken(_))
        );
        assert_matches!(
            AckToken::decode(&STANDARD.encode("broker:port:id:conn")),
            Err(Error::InvalidAckToken(_))
        );
    }
}
