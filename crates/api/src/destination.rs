use crate::Error;

use std::fmt::{self, Display};

/// Name prefix every queue destination must carry.
pub const QUEUE_PREFIX: &str = "jms.queue.";

/// Name prefix every topic destination must carry.
pub const TOPIC_PREFIX: &str = "jms.topic.";

/// Kind of destination.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum DestinationType {
    /// Point-to-point queue.
    #[default]
    Queue,

    /// Publish/subscribe topic.
    Topic,
}

impl DestinationType {
    /// The name prefix required for this kind.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Queue => QUEUE_PREFIX,
            Self::Topic => TOPIC_PREFIX,
        }
    }
}

impl Display for DestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue => write!(f, "queue"),
            Self::Topic => write!(f, "topic"),
        }
    }
}

/// A named queue or topic.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Destination {
    name: String,
    destination_type: DestinationType,
}

impl Destination {
    /// Creates a destination without validating it.
    pub fn new(name: impl Into<String>, destination_type: DestinationType) -> Self {
        Self {
            name: name.into(),
            destination_type,
        }
    }

    /// Creates a queue destination.
    pub fn queue(name: impl Into<String>) -> Self {
        Self::new(name, DestinationType::Queue)
    }

    /// Creates a topic destination.
    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(name, DestinationType::Topic)
    }

    /// The full destination name, prefix included.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The destination kind.
    #[must_use]
    pub const fn destination_type(&self) -> DestinationType {
        self.destination_type
    }

    /// Checks that the name carries the prefix of its kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDestination`] when the prefix is missing.
    pub fn validate(&self) -> Result<(), Error> {
        let prefix = self.destination_type.prefix();

        if self.name.starts_with(prefix) {
            Ok(())
        } else {
            Err(Error::InvalidDestination {
                name: self.name.clone(),
                reason: format!("{} names must start with `{prefix}`", self.destination_type),
            })
        }
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
