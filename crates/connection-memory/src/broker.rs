use crate::{Error, MemoryConnection};

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{self, Display};
use std::sync::Arc;

use bytes::Bytes;
use mbus_api::frame::{CONNECTION_ID_HEADER, MESSAGE_ID_HEADER, RECEIPT_ID_HEADER};
use mbus_api::{BrokerEndpoint, Frame, FrameCommand, Headers, TOPIC_PREFIX};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

const DURABLE_SUBSCRIBER_HEADER: &str = "durable-subscriber-name";

/// Kinds of broker operation, used for counters and failure injection.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Operation {
    /// Opening a transport connection.
    Open,
    /// Logging in.
    Connect,
    /// Subscribing to a destination.
    Subscribe,
    /// Fire-and-forget publish.
    Send,
    /// Receipt-confirmed publish.
    SendSafe,
    /// Acknowledging a message.
    Ack,
    /// Rejecting a message.
    Nack,
    /// Heartbeat.
    KeepAlive,
    /// Granting delivery credit.
    Credit,
    /// Logging out.
    Disconnect,
    /// Releasing the transport.
    Close,
}

impl Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Connect => "connect",
            Self::Subscribe => "subscribe",
            Self::Send => "send",
            Self::SendSafe => "send-safe",
            Self::Ack => "ack",
            Self::Nack => "nack",
            Self::KeepAlive => "keepalive",
            Self::Credit => "credit",
            Self::Disconnect => "disconnect",
            Self::Close => "close",
        };

        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
struct StoredMessage {
    sequence: u64,
    message_id: String,
    destination: String,
    headers: Headers,
    body: Bytes,
}

#[derive(Debug)]
struct Subscription {
    queue: String,
    id: Option<String>,
}

#[derive(Debug)]
struct ConnectionState {
    connection_id: String,
    frames: mpsc::UnboundedSender<Frame>,
    subscription: Option<Subscription>,
    awaiting_credit: bool,
}

#[derive(Debug)]
struct InFlight {
    connection: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Debug)]
struct BrokerState {
    reachable: bool,
    suppress_receipts: bool,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    topic_queues: HashMap<String, HashSet<String>>,
    connections: HashMap<u64, ConnectionState>,
    in_flight: HashMap<String, InFlight>,
    acked: Vec<String>,
    nacked: Vec<String>,
    counts: HashMap<Operation, usize>,
    failures: HashMap<Operation, usize>,
    next_message: u64,
    next_connection: u64,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            reachable: true,
            suppress_receipts: false,
            queues: HashMap::new(),
            topic_queues: HashMap::new(),
            connections: HashMap::new(),
            in_flight: HashMap::new(),
            acked: Vec::new(),
            nacked: Vec::new(),
            counts: HashMap::new(),
            failures: HashMap::new(),
            next_message: 0,
            next_connection: 0,
        }
    }
}

impl BrokerState {
    /// Hands queued messages to every subscriber of `queue` that has credit.
    fn dispatch(&mut self, queue: &str) {
        let Self {
            queues,
            connections,
            in_flight,
            ..
        } = self;

        let Some(pending) = queues.get_mut(queue) else {
            return;
        };

        let mut ids: Vec<u64> = connections.keys().copied().collect();
        ids.sort_unstable();

        for id in ids {
            if pending.is_empty() {
                break;
            }

            let Some(connection) = connections.get_mut(&id) else {
                continue;
            };

            let subscribed = connection
                .subscription
                .as_ref()
                .is_some_and(|subscription| subscription.queue == queue);

            if !subscribed || connection.awaiting_credit {
                continue;
            }

            let Some(message) = pending.pop_front() else {
                break;
            };

            let mut headers = message.headers.clone();
            headers.insert("destination".to_string(), message.destination.clone());
            headers.insert(MESSAGE_ID_HEADER.to_string(), message.message_id.clone());
            headers.insert(
                CONNECTION_ID_HEADER.to_string(),
                connection.connection_id.clone(),
            );
            if let Some(subscription_id) = connection
                .subscription
                .as_ref()
                .and_then(|subscription| subscription.id.clone())
            {
                headers.insert("subscription".to_string(), subscription_id);
            }

            let frame = Frame::new(FrameCommand::Message, headers, message.body.clone());

            if connection.frames.send(frame).is_err() {
                pending.push_front(message);
                continue;
            }

            connection.awaiting_credit = true;
            in_flight.insert(
                message.message_id.clone(),
                InFlight {
                    connection: id,
                    queue: queue.to_string(),
                    message,
                },
            );
        }
    }

    fn queue_of(&self, connection: u64) -> Option<String> {
        self.connections
            .get(&connection)
            .and_then(|state| state.subscription.as_ref())
            .map(|subscription| subscription.queue.clone())
    }
}

#[derive(Debug)]
struct Inner {
    endpoint: BrokerEndpoint,
    state: Mutex<BrokerState>,
}

/// An in-process broker serving one endpoint.
///
/// Delivers at most one uncredited message per connection, requeues
/// messages that are nacked or left unacknowledged when their connection
/// closes, and can be told to fail operations on demand.
#[derive(Clone, Debug)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Creates a reachable broker with no messages.
    #[must_use]
    pub fn new(endpoint: BrokerEndpoint) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint,
                state: Mutex::new(BrokerState::default()),
            }),
        }
    }

    /// The endpoint this broker serves.
    #[must_use]
    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.inner.endpoint
    }

    /// Enqueues a message as if a producer had sent it, returning the
    /// broker-assigned message id.
    pub fn publish(&self, destination: &str, body: impl Into<Bytes>) -> String {
        self.store(destination, Headers::new(), body.into())
    }

    /// Makes new connections succeed or fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.state.lock().reachable = reachable;
    }

    /// Fails the next `times` operations of the given kind.
    pub fn fail_next(&self, operation: Operation, times: usize) {
        *self
            .inner
            .state
            .lock()
            .failures
            .entry(operation)
            .or_default() += times;
    }

    /// Stops or resumes answering receipt requests.
    pub fn suppress_receipts(&self, suppress: bool) {
        self.inner.state.lock().suppress_receipts = suppress;
    }

    /// How many operations of the given kind were attempted.
    #[must_use]
    pub fn count(&self, operation: Operation) -> usize {
        self.inner
            .state
            .lock()
            .counts
            .get(&operation)
            .copied()
            .unwrap_or_default()
    }

    /// Messages waiting for delivery on a queue destination.
    #[must_use]
    pub fn queue_depth(&self, destination: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(destination)
            .map_or(0, VecDeque::len)
    }

    /// Delivered messages not yet acknowledged.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    /// Ids of acknowledged messages, in acknowledgment order.
    #[must_use]
    pub fn acked(&self) -> Vec<String> {
        self.inner.state.lock().acked.clone()
    }

    /// Ids of rejected messages, in rejection order.
    #[must_use]
    pub fn nacked(&self) -> Vec<String> {
        self.inner.state.lock().nacked.clone()
    }

    /// Open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    /// Drops every open connection, as a broker restart would.
    pub fn drop_connections(&self) {
        let ids: Vec<u64> = self.inner.state.lock().connections.keys().copied().collect();

        for id in ids {
            self.close_connection(id);
        }
    }

    pub(crate) fn open(&self) -> Result<MemoryConnection, Error> {
        self.check(Operation::Open)?;

        let mut state = self.inner.state.lock();
        if !state.reachable {
            return Err(Error::Unreachable(self.inner.endpoint.clone()));
        }

        state.next_connection += 1;
        let id = state.next_connection;
        let connection_id = format!("conn-{id}");
        let (sender, receiver) = mpsc::unbounded_channel();

        state.connections.insert(
            id,
            ConnectionState {
                connection_id: connection_id.clone(),
                frames: sender,
                subscription: None,
                awaiting_credit: false,
            },
        );
        drop(state);

        debug!(endpoint = %self.inner.endpoint, %connection_id, "memory connection opened");

        Ok(MemoryConnection::new(self.clone(), id, receiver))
    }

    /// Counts the operation and consumes one injected failure if any.
    pub(crate) fn check(&self, operation: Operation) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        *state.counts.entry(operation).or_default() += 1;

        match state.failures.get_mut(&operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(Error::Injected(operation))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn is_open(&self, connection: u64) -> bool {
        self.inner.state.lock().connections.contains_key(&connection)
    }

    pub(crate) fn subscribe(
        &self,
        connection: u64,
        destination: &str,
        headers: &Headers,
    ) -> Result<(), Error> {
        let mut state = self.inner.state.lock();

        let subscription_id = headers.get("id").cloned();
        let queue = if destination.starts_with(TOPIC_PREFIX) {
            let subscriber = headers
                .get(DURABLE_SUBSCRIBER_HEADER)
                .cloned()
                .or_else(|| subscription_id.clone())
                .unwrap_or_else(|| format!("conn-{connection}"));
            let queue = format!("{destination}::{subscriber}");

            state
                .topic_queues
                .entry(destination.to_string())
                .or_default()
                .insert(queue.clone());

            queue
        } else {
            destination.to_string()
        };

        let Some(target) = state.connections.get_mut(&connection) else {
            return Err(Error::Disconnected);
        };

        target.subscription = Some(Subscription {
            queue: queue.clone(),
            id: subscription_id,
        });

        state.queues.entry(queue.clone()).or_default();
        state.dispatch(&queue);

        Ok(())
    }

    pub(crate) fn send(&self, destination: &str, headers: &Headers, body: Bytes) {
        self.store(destination, headers.clone(), body);
    }

    pub(crate) fn receipts_suppressed(&self) -> bool {
        self.inner.state.lock().suppress_receipts
    }

    pub(crate) fn ack(&self, connection: u64, message_id: &str, receipt_id: Option<&str>) {
        let mut state = self.inner.state.lock();

        state.in_flight.remove(message_id);
        state.acked.push(message_id.to_string());

        if let Some(receipt_id) = receipt_id {
            if !state.suppress_receipts {
                if let Some(target) = state.connections.get(&connection) {
                    let mut headers = Headers::new();
                    headers.insert(RECEIPT_ID_HEADER.to_string(), receipt_id.to_string());

                    let _ = target
                        .frames
                        .send(Frame::new(FrameCommand::Receipt, headers, Bytes::new()));
                }
            }
        }
    }

    pub(crate) fn nack(&self, message_id: &str) {
        let mut state = self.inner.state.lock();

        state.nacked.push(message_id.to_string());

        if let Some(in_flight) = state.in_flight.remove(message_id) {
            state
                .queues
                .entry(in_flight.queue.clone())
                .or_default()
                .push_front(in_flight.message);
            state.dispatch(&in_flight.queue);
        }
    }

    pub(crate) fn credit(&self, connection: u64) {
        let mut state = self.inner.state.lock();

        if let Some(target) = state.connections.get_mut(&connection) {
            target.awaiting_credit = false;
        }

        if let Some(queue) = state.queue_of(connection) {
            state.dispatch(&queue);
        }
    }

    /// Removes the connection and requeues its unacknowledged messages.
    pub(crate) fn close_connection(&self, connection: u64) {
        let mut state = self.inner.state.lock();

        if state.connections.remove(&connection).is_none() {
            return;
        }

        let mut returned: Vec<InFlight> = Vec::new();
        let ids: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, in_flight)| in_flight.connection == connection)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Some(in_flight) = state.in_flight.remove(&id) {
                returned.push(in_flight);
            }
        }

        // Newest first so the oldest ends up at the head of its queue.
        returned.sort_by(|a, b| b.message.sequence.cmp(&a.message.sequence));

        let mut touched = HashSet::new();
        for in_flight in returned {
            touched.insert(in_flight.queue.clone());
            state
                .queues
                .entry(in_flight.queue)
                .or_default()
                .push_front(in_flight.message);
        }
        for queue in &touched {
            state.dispatch(queue);
        }
        drop(state);

        debug!(endpoint = %self.inner.endpoint, connection, "memory connection closed");
    }

    fn store(&self, destination: &str, headers: Headers, body: Bytes) -> String {
        let mut state = self.inner.state.lock();

        state.next_message += 1;
        let sequence = state.next_message;
        let message_id = format!("ID:mem-{sequence}");

        let targets: Vec<String> = if destination.starts_with(TOPIC_PREFIX) {
            state
                .topic_queues
                .get(destination)
                .map(|queues| queues.iter().cloned().collect())
                .unwrap_or_default()
        } else {
            vec![destination.to_string()]
        };

        for queue in targets {
            state
                .queues
                .entry(queue.clone())
                .or_default()
                .push_back(StoredMessage {
                    sequence,
                    message_id: message_id.clone(),
                    destination: destination.to_string(),
                    headers: headers.clone(),
                    body: body.clone(),
                });
            state.dispatch(&queue);
        }

        message_id
    }
}
