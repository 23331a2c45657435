use crate::connection::Headers;

use std::fmt::{self, Display};

use bytes::Bytes;

/// Header carrying the broker-assigned message id.
pub const MESSAGE_ID_HEADER: &str = "message-id";

/// Header carrying the id of the connection a message was delivered on.
pub const CONNECTION_ID_HEADER: &str = "connection-id";

/// Header carrying the id a receipt answers.
pub const RECEIPT_ID_HEADER: &str = "receipt-id";

/// Command of an inbound frame.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum FrameCommand {
    /// Connection accepted.
    Connected,

    /// Broker error report.
    Error,

    /// Delivered message.
    Message,

    /// Confirmation of a request carrying a receipt id.
    Receipt,

    /// Any other command.
    Other(String),
}

impl FrameCommand {
    /// Parses a wire command name.
    #[must_use]
    pub fn parse(command: &str) -> Self {
        match command {
            "CONNECTED" => Self::Connected,
            "ERROR" => Self::Error,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            other => Self::Other(other.to_string()),
        }
    }

    /// The wire command name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Connected => "CONNECTED",
            Self::Error => "ERROR",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Other(other) => other,
        }
    }
}

impl Display for FrameCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A frame received from a broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame command.
    pub command: FrameCommand,

    /// Frame headers.
    pub headers: Headers,

    /// Frame body.
    pub body: Bytes,
}

impl Frame {
    /// Creates a frame.
    pub fn new(command: FrameCommand, headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            command,
            headers,
            body: body.into(),
        }
    }

    /// Looks up a header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// The broker-assigned message id.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.header(MESSAGE_ID_HEADER)
    }

    /// The delivering connection id.
    #[must_use]
    pub fn connection_id(&self) -> Option<&str> {
        self.header(CONNECTION_ID_HEADER)
    }

    /// The receipt id this frame answers, if it is a receipt.
    #[must_use]
    pub fn receipt_id(&self) -> Option<&str> {
        self.header(RECEIPT_ID_HEADER)
    }

    /// Whether this frame is a broker error report.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.command == FrameCommand::Error
    }
}
