use std::future::Future;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use mbus_api::{
    BrokerEndpoint, Connection, ConnectionError, Connector, Frame, FrameCommand, Headers,
    SubscriptionAckMode,
};
use mbus_connection_stomp::{Error, StompCodec, StompConnector};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

type BrokerSide = Framed<TcpStream, StompCodec>;

/// Accepts one connection and runs `script` against it.
async fn scripted_broker<F, Fut>(script: F) -> (BrokerEndpoint, JoinHandle<()>)
where
    F: FnOnce(BrokerSide) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        script(Framed::new(stream, StompCodec::new())).await;
    });

    (BrokerEndpoint::new("127.0.0.1", port), handle)
}

fn connector() -> StompConnector {
    StompConnector::new(Duration::from_secs(2), Duration::from_millis(200))
}

fn frame(command: &str, pairs: &[(&str, &str)], body: &'static str) -> Frame {
    let headers: Headers = pairs
        .iter()
        .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
        .collect();

    Frame::new(FrameCommand::parse(command), headers, body)
}

async fn expect(broker: &mut BrokerSide, command: &str) -> Frame {
    let frame = broker.next().await.unwrap().unwrap();
    assert_eq!(frame.command.as_str(), command);
    frame
}

async fn accept_login(broker: &mut BrokerSide) -> Frame {
    let connect = expect(broker, "CONNECT").await;
    broker.send(frame("CONNECTED", &[], "")).await.unwrap();
    connect
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_consume_and_ack() {
    let (endpoint, broker) = scripted_broker(|mut broker| async move {
        let connect = accept_login(&mut broker).await;
        assert_eq!(connect.header("login"), Some("guest"));
        assert_eq!(connect.header("passcode"), Some("secret"));
        assert_eq!(connect.header("client-id"), Some("pricing"));

        let subscribe = expect(&mut broker, "SUBSCRIBE").await;
        assert_eq!(subscribe.header("destination"), Some("jms.topic.prices"));
        assert_eq!(subscribe.header("ack"), Some("client"));
        assert_eq!(subscribe.header("durable-subscriber-name"), Some("pricing"));

        broker
            .send(frame(
                "MESSAGE",
                &[("message-id", "ID:7"), ("connection-id", "c-1")],
                "payload",
            ))
            .await
            .unwrap();

        let credit = expect(&mut broker, "CREDIT").await;
        assert_eq!(credit.message_id(), Some("ID:7"));

        let ack = expect(&mut broker, "ACK").await;
        assert_eq!(ack.message_id(), Some("ID:7"));
        assert_eq!(ack.header("subscription"), Some("pricing"));
        assert_eq!(ack.connection_id(), Some("c-1"));
        assert_eq!(ack.header("receipt"), Some("r-1"));
        assert_eq!(ack.header("transaction"), None);
        broker
            .send(frame("RECEIPT", &[("receipt-id", "r-1")], ""))
            .await
            .unwrap();

        let ack = expect(&mut broker, "ACK").await;
        assert_eq!(ack.connection_id(), None);
        assert_eq!(ack.header("subscription"), None);

        let nack = expect(&mut broker, "NACK").await;
        assert_eq!(nack.message_id(), Some("ID:8"));

        expect(&mut broker, "KEEPALIVE").await;
        expect(&mut broker, "DISCONNECT").await;
    })
    .await;

    let connection = connector().open(&endpoint).await.unwrap();
    connection
        .connect("guest", "secret", Some("pricing"))
        .await
        .unwrap();

    let subscription: Headers = [("durable-subscriber-name", "pricing")]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    connection
        .subscribe("jms.topic.prices", SubscriptionAckMode::Client, &subscription)
        .await
        .unwrap();

    let message = connection.receive(Duration::from_secs(2)).await.unwrap();
    assert_eq!(message.command, FrameCommand::Message);
    assert_eq!(message.body, Bytes::from_static(b"payload"));

    connection.credit("ID:7").await.unwrap();
    connection
        .ack("ID:7", None, Some("pricing"), Some("c-1"), Some("r-1"))
        .await
        .unwrap();

    let receipt = connection.receive(Duration::from_secs(2)).await.unwrap();
    assert_eq!(receipt.receipt_id(), Some("r-1"));

    connection
        .ack("ID:8", None, Some(""), Some("null"), None)
        .await
        .unwrap();
    connection.nack("ID:8", None).await.unwrap();
    connection.keep_alive().await.unwrap();
    connection.disconnect().await.unwrap();

    broker.await.unwrap();

    connection.close().await.unwrap();
    assert!(!connection.is_connected());
    connection.close().await.unwrap();
    assert_matches!(connection.keep_alive().await, Err(Error::Disconnected));
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_connect_refused() {
    let (endpoint, broker) = scripted_broker(|mut broker| async move {
        expect(&mut broker, "CONNECT").await;
        broker
            .send(frame("ERROR", &[("message", "bad credentials")], ""))
            .await
            .unwrap();
    })
    .await;

    let connection = connector().open(&endpoint).await.unwrap();
    assert_matches!(
        connection.connect("guest", "wrong", None).await,
        Err(Error::Refused(reason)) if reason == "bad credentials"
    );

    broker.await.unwrap();
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_connect_expects_connected() {
    let (endpoint, broker) = scripted_broker(|mut broker| async move {
        expect(&mut broker, "CONNECT").await;
        broker.send(frame("RECEIPT", &[], "")).await.unwrap();
    })
    .await;

    let connection = connector().open(&endpoint).await.unwrap();
    assert_matches!(
        connection.connect("guest", "guest", None).await,
        Err(Error::Protocol(_))
    );

    broker.await.unwrap();
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_send_safe_waits_for_matching_receipt() {
    let (endpoint, broker) = scripted_broker(|mut broker| async move {
        accept_login(&mut broker).await;

        let send = expect(&mut broker, "SEND").await;
        assert_eq!(send.header("destination"), Some("jms.queue.orders"));
        assert_eq!(send.header("persistent"), Some("true"));
        assert_eq!(send.header("priority"), Some("9"));
        assert_eq!(send.header("content-length"), Some("5"));
        assert_eq!(send.body, Bytes::from_static(b"order"));

        let receipt_id = send.header("receipt").unwrap().to_string();
        broker
            .send(frame("RECEIPT", &[("receipt-id", "someone-else")], ""))
            .await
            .unwrap();
        broker
            .send(frame("RECEIPT", &[("receipt-id", receipt_id.as_str())], ""))
            .await
            .unwrap();

        // Second publish is never confirmed.
        let send = expect(&mut broker, "SEND").await;
        assert!(send.header("receipt").is_some());

        let send = expect(&mut broker, "SEND").await;
        assert_eq!(send.header("receipt"), None);
        broker
            .send(frame("ERROR", &[("message", "queue full")], ""))
            .await
            .unwrap();

        expect(&mut broker, "SEND").await;
    })
    .await;

    let connection = connector().open(&endpoint).await.unwrap();
    connection.connect("guest", "guest", None).await.unwrap();

    let extra: Headers = [("priority".to_string(), "9".to_string())]
        .into_iter()
        .collect();
    connection
        .send_safe("jms.queue.orders", Bytes::from_static(b"order"), &extra)
        .await
        .unwrap();

    let result = connection
        .send_safe("jms.queue.orders", Bytes::from_static(b"lost"), &Headers::new())
        .await;
    assert_matches!(result, Err(ref e) if e.is_timeout());

    connection
        .send("jms.queue.orders", Bytes::from_static(b"plain"), &Headers::new())
        .await
        .unwrap();
    assert_matches!(
        connection
            .send_safe("jms.queue.orders", Bytes::from_static(b"full"), &Headers::new())
            .await,
        Err(Error::Refused(reason)) if reason == "queue full"
    );

    broker.await.unwrap();
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_receive_timeout_then_disconnect() {
    let (endpoint, broker) = scripted_broker(|mut broker| async move {
        accept_login(&mut broker).await;
        expect(&mut broker, "KEEPALIVE").await;
    })
    .await;

    let connection = connector().open(&endpoint).await.unwrap();
    connection.connect("guest", "guest", None).await.unwrap();

    let result = connection.receive(Duration::from_millis(50)).await;
    assert_matches!(result, Err(ref e) if e.is_timeout());
    assert!(connection.is_connected());

    connection.keep_alive().await.unwrap();
    broker.await.unwrap();

    assert_matches!(
        connection.receive(Duration::from_secs(2)).await,
        Err(Error::Disconnected)
    );
    assert!(!connection.is_connected());
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_open_fails_without_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let result = connector()
        .open(&BrokerEndpoint::new("127.0.0.1", port))
        .await;
    assert_matches!(result, Err(Error::Io(_)));
}
