use std::collections::HashSet;
use std::sync::Arc;

use assert_matches::assert_matches;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use mbus_api::{BrokerEndpoint, MembershipSource};
use mbus_membership_http::{Error, HttpMembership, membership_url};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::net::TcpListener;

#[derive(Deserialize)]
struct JmxQuery {
    command: String,
    args: String,
}

#[derive(Clone)]
struct Reply {
    status: StatusCode,
    body: Arc<Mutex<String>>,
}

async fn jmx(State(reply): State<Reply>, Query(query): Query<JmxQuery>) -> (StatusCode, String) {
    if query.command != "get_attribute"
        || query.args != "org.hornetq:module=Core,type=Server ListOfBrokers"
    {
        return (StatusCode::BAD_REQUEST, String::new());
    }

    (reply.status, reply.body.lock().clone())
}

/// Serves the broker list on an ephemeral port and returns that port.
async fn serve(status: StatusCode, body: &str) -> (u16, Arc<Mutex<String>>) {
    let body = Arc::new(Mutex::new(body.to_string()));
    let router = Router::new().route("/jmx", get(jmx)).with_state(Reply {
        status,
        body: body.clone(),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (port, body)
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_fetch_broker_list() {
    let (port, body) = serve(StatusCode::OK, "10.0.0.1:61613,10.0.0.2:61613").await;

    let membership = HttpMembership::with_port(port).unwrap();
    let url = membership
        .derive_url(&BrokerEndpoint::new("127.0.0.1", 61613))
        .unwrap();
    assert_eq!(url, membership_url("127.0.0.1", port).unwrap());

    let brokers = membership.fetch(&url).await.unwrap();
    assert_eq!(
        brokers,
        HashSet::from([
            BrokerEndpoint::new("10.0.0.1", 61613),
            BrokerEndpoint::new("10.0.0.2", 61613),
        ])
    );

    *body.lock() = String::new();
    assert!(membership.fetch(&url).await.unwrap().is_empty());

    *body.lock() = "10.0.0.1".to_string();
    assert_matches!(
        membership.fetch(&url).await,
        Err(Error::InvalidBroker { .. })
    );
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_fetch_fails_on_error_status() {
    let (port, _body) = serve(StatusCode::SERVICE_UNAVAILABLE, "").await;

    let membership = HttpMembership::with_port(port).unwrap();
    let url = membership_url("127.0.0.1", port).unwrap();

    assert_matches!(membership.fetch(&url).await, Err(Error::Http(_)));
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_fetch_fails_when_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let membership = HttpMembership::with_port(port).unwrap();
    let url = membership_url("127.0.0.1", port).unwrap();

    assert_matches!(membership.fetch(&url).await, Err(Error::Http(_)));
}
