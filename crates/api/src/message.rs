use crate::{AckToken, Error};

use std::collections::HashMap;
use std::fmt::{self, Display};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of payload a message carries.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PayloadType {
    /// UTF-8 text.
    String,

    /// Raw bytes.
    Binary,

    /// Rendered JSON document.
    Json,
}

impl Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Binary => write!(f, "binary"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Message payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Payload {
    /// UTF-8 text.
    String(String),

    /// Raw bytes.
    Binary(Bytes),

    /// Rendered JSON document.
    Json(String),
}

impl Payload {
    /// The kind of this payload.
    #[must_use]
    pub const fn payload_type(&self) -> PayloadType {
        match self {
            Self::String(_) => PayloadType::String,
            Self::Binary(_) => PayloadType::Binary,
            Self::Json(_) => PayloadType::Json,
        }
    }
}

/// A message published by a producer or delivered to a consumer.
///
/// The payload and id are fixed at construction. Properties and the ack
/// token are assigned by the consumer when the message is received.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    id: String,
    payload: Payload,
    properties: HashMap<String, String>,
    ack_token: Option<String>,
}

impl Message {
    fn generate_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Creates a message with an explicit id.
    pub fn with_id(id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            payload,
            properties: HashMap::new(),
            ack_token: None,
        }
    }

    /// Creates a text message with a generated id.
    pub fn string(text: impl Into<String>) -> Self {
        Self::with_id(Self::generate_id(), Payload::String(text.into()))
    }

    /// Creates a binary message with a generated id.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::with_id(Self::generate_id(), Payload::Binary(data.into()))
    }

    /// Creates a JSON message by serializing `value`, with a generated id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] when `value` cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, Error> {
        let rendered = serde_json::to_string(value)?;

        Ok(Self::with_id(Self::generate_id(), Payload::Json(rendered)))
    }

    /// Creates a JSON message from an already rendered document, with a
    /// generated id. The text is not checked.
    pub fn json_string(rendered: impl Into<String>) -> Self {
        Self::with_id(Self::generate_id(), Payload::Json(rendered.into()))
    }

    /// The message id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The payload.
    #[must_use]
    pub const fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The payload kind.
    #[must_use]
    pub const fn payload_type(&self) -> PayloadType {
        self.payload.payload_type()
    }

    /// Reads a text payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PayloadType`] for non-text payloads.
    pub fn as_string(&self) -> Result<&str, Error> {
        match &self.payload {
            Payload::String(text) => Ok(text),
            other => Err(Error::PayloadType {
                expected: PayloadType::String,
                actual: other.payload_type(),
            }),
        }
    }

    /// Reads a binary payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PayloadType`] for non-binary payloads.
    pub fn as_binary(&self) -> Result<&Bytes, Error> {
        match &self.payload {
            Payload::Binary(data) => Ok(data),
            other => Err(Error::PayloadType {
                expected: PayloadType::Binary,
                actual: other.payload_type(),
            }),
        }
    }

    /// Reads the rendered JSON text of a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PayloadType`] for non-JSON payloads.
    pub fn as_json_str(&self) -> Result<&str, Error> {
        match &self.payload {
            Payload::Json(rendered) => Ok(rendered),
            other => Err(Error::PayloadType {
                expected: PayloadType::Json,
                actual: other.payload_type(),
            }),
        }
    }

    /// Deserializes a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PayloadType`] for non-JSON payloads and
    /// [`Error::Json`] when the document does not match `T`.
    pub fn as_json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_str(self.as_json_str()?)?)
    }

    /// Message properties.
    #[must_use]
    pub const fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// Mutable access to the message properties.
    pub fn properties_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.properties
    }

    /// Replaces the message properties.
    pub fn set_properties(&mut self, properties: HashMap<String, String>) {
        self.properties = properties;
    }

    /// The ack token, present only on received messages.
    #[must_use]
    pub fn ack_token(&self) -> Option<&str> {
        self.ack_token.as_deref()
    }

    /// Stamps the message with the token that routes its acknowledgment.
    pub fn set_ack_token(&mut self, token: &AckToken) {
        self.ack_token = Some(token.encode());
    }
}

#[derive(Deserialize, Serialize)]
#[serde(tag = "format", rename_all = "snake_case")]
enum WirePayload {
    String { string_payload: String },
    Binary { binary_payload: String },
    Json { string_payload: String },
}

#[derive(Deserialize, Serialize)]
struct WireMessage {
    message_id: String,
    payload: WirePayload,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    properties: HashMap<String, String>,
}

impl TryFrom<Bytes> for Message {
    type Error = Error;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        let wire: WireMessage = serde_json::from_slice(&bytes)?;

        let payload = match wire.payload {
            WirePayload::String { string_payload } => Payload::String(string_payload),
            WirePayload::Binary { binary_payload } => {
                Payload::Binary(Bytes::from(STANDARD.decode(binary_payload)?))
            }
            WirePayload::Json { string_payload } => Payload::Json(string_payload),
        };

        let mut message = Self::with_id(wire.message_id, payload);
        message.properties = wire.properties;

        Ok(message)
    }
}

impl TryFrom<&Message> for Bytes {
    type Error = Error;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        let payload = match &message.payload {
            Payload::String(text) => WirePayload::String {
                string_payload: text.clone(),
            },
            Payload::Binary(data) => WirePayload::Binary {
                binary_payload: STANDARD.encode(data),
            },
            Payload::Json(rendered) => WirePayload::Json {
                string_payload: rendered.clone(),
            },
        };

        let wire = WireMessage {
            message_id: message.id.clone(),
            payload,
            properties: message.properties.clone(),
        };

        Ok(Self::from(serde_json::to_vec(&wire)?))
    }
}
