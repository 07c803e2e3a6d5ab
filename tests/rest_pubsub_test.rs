//! REST client against a local stand-in for the Pub/Sub v1 API

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

use docrelay::messaging::{
    MessagingError, Publisher, RestConfig, RestPubSub, StaticToken, Subscription, TokenSource,
};

const TOPIC_PATH: &str = "/v1/projects/proj/topics/uploads";
const SUBSCRIPTION_PATH: &str = "/v1/projects/proj/subscriptions/worker";

#[derive(Debug, Clone)]
struct Recorded {
    method: Method,
    path: String,
    authorization: Option<String>,
    body: Value,
}

/// Records every request and answers from a per-path table (404 otherwise)
#[derive(Clone, Default)]
struct StubBroker {
    requests: Arc<Mutex<Vec<Recorded>>>,
    responses: Arc<Mutex<HashMap<String, (StatusCode, Value)>>>,
}

impl StubBroker {
    fn respond(&self, path: &str, status: StatusCode, body: Value) {
        self.responses
            .lock()
            .unwrap()
            .insert(path.to_string(), (status, body));
    }

    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    fn last(&self) -> Recorded {
        self.requests().pop().expect("no request recorded")
    }

    async fn serve(&self) -> String {
        let app = Router::new().fallback(record).with_state(self.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{address}")
    }
}

async fn record(
    State(stub): State<StubBroker>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = serde_json::from_slice(&body).unwrap_or(Value::Null);

    stub.requests.lock().unwrap().push(Recorded {
        method,
        path: path.clone(),
        authorization,
        body,
    });

    let reply = stub.responses.lock().unwrap().get(&path).cloned();
    match reply {
        Some((status, body)) => (status, Json(body)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"code": 404, "status": "NOT_FOUND"}})),
        )
            .into_response(),
    }
}

fn client(endpoint: &str, tokens: Arc<dyn TokenSource>) -> RestPubSub {
    RestPubSub::new(
        RestConfig::builder()
            .project_id("proj")
            .endpoint(endpoint)
            .connect_timeout(Duration::from_secs(1))
            .request_timeout(Duration::from_secs(5))
            .max_messages(10)
            .build(),
        tokens,
    )
    .unwrap()
}

fn anonymous(endpoint: &str) -> RestPubSub {
    client(endpoint, Arc::new(StaticToken::none()))
}

/// Hands out a new token on every call, like a refreshing credential
#[derive(Default)]
struct RotatingToken {
    issued: AtomicUsize,
}

#[async_trait]
impl TokenSource for RotatingToken {
    async fn token(&self) -> docrelay::messaging::Result<Option<String>> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(format!("token-{n}")))
    }
}

struct FailingToken;

#[async_trait]
impl TokenSource for FailingToken {
    async fn token(&self) -> docrelay::messaging::Result<Option<String>> {
        Err(MessagingError::Auth("metadata server unavailable".into()))
    }
}

#[tokio::test]
async fn test_publish_sends_base64_data() {
    let stub = StubBroker::default();
    stub.respond(
        &format!("{TOPIC_PATH}:publish"),
        StatusCode::OK,
        json!({"messageIds": ["m-1"]}),
    );
    let endpoint = stub.serve().await;
    let payload = br#"{"bucket":"b1","object":"u1/doc.pdf"}"#.to_vec();

    let id = anonymous(&endpoint)
        .publish("uploads", payload.clone())
        .await
        .unwrap();

    assert_eq!(id, "m-1");
    let request = stub.last();
    assert_eq!(request.method, Method::POST);
    assert_eq!(request.path, format!("{TOPIC_PATH}:publish"));
    assert!(request.authorization.is_none());
    let data = request.body["messages"][0]["data"].as_str().unwrap();
    assert_eq!(BASE64.decode(data).unwrap(), payload);
}

#[tokio::test]
async fn test_publish_rejection_is_publish_failure() {
    let stub = StubBroker::default();
    stub.respond(
        &format!("{TOPIC_PATH}:publish"),
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"error": {"code": 500}}),
    );
    let endpoint = stub.serve().await;

    let result = anonymous(&endpoint).publish("uploads", b"x".to_vec()).await;

    assert!(matches!(result, Err(MessagingError::PublishFailed(_))));
}

#[tokio::test]
async fn test_publish_without_message_id_is_invalid_response() {
    let stub = StubBroker::default();
    stub.respond(&format!("{TOPIC_PATH}:publish"), StatusCode::OK, json!({}));
    let endpoint = stub.serve().await;

    let result = anonymous(&endpoint).publish("uploads", b"x".to_vec()).await;

    assert!(matches!(result, Err(MessagingError::InvalidResponse(_))));
}

#[tokio::test]
async fn test_pull_decodes_and_settles() {
    let stub = StubBroker::default();
    stub.respond(
        &format!("{SUBSCRIPTION_PATH}:pull"),
        StatusCode::OK,
        json!({
            "receivedMessages": [
                {
                    "ackId": "a1",
                    "message": {
                        "data": BASE64.encode(b"hello"),
                        "messageId": "m-1",
                        "publishTime": "2024-01-01T00:00:00Z"
                    },
                    "deliveryAttempt": 2
                },
                {
                    "ackId": "a2",
                    "message": {"data": "not base64!", "messageId": "m-2"}
                }
            ]
        }),
    );
    stub.respond(&format!("{SUBSCRIPTION_PATH}:acknowledge"), StatusCode::OK, json!({}));
    stub.respond(&format!("{SUBSCRIPTION_PATH}:modifyAckDeadline"), StatusCode::OK, json!({}));
    let endpoint = stub.serve().await;
    let subscription = anonymous(&endpoint).subscription("worker");

    let mut batch = subscription.pull(50).await.unwrap();

    // The request is capped at the configured maximum
    assert_eq!(stub.last().body, json!({"maxMessages": 10}));
    assert_eq!(batch.len(), 2);

    let second = batch.pop().unwrap();
    let first = batch.pop().unwrap();
    assert_eq!(first.message_id, "m-1");
    assert_eq!(first.ack_id(), "a1");
    assert_eq!(&first.data[..], b"hello");
    assert_eq!(first.delivery_attempt, Some(2));
    assert!(first.publish_time.is_some());
    assert_eq!(&second.data[..], b"not base64!");

    first.ack().await.unwrap();
    let ack = stub.last();
    assert_eq!(ack.path, format!("{SUBSCRIPTION_PATH}:acknowledge"));
    assert_eq!(ack.body, json!({"ackIds": ["a1"]}));

    second.nack().await.unwrap();
    let nack = stub.last();
    assert_eq!(nack.path, format!("{SUBSCRIPTION_PATH}:modifyAckDeadline"));
    assert_eq!(nack.body, json!({"ackIds": ["a2"], "ackDeadlineSeconds": 0}));
}

#[tokio::test]
async fn test_modify_ack_deadline_sends_batch() {
    let stub = StubBroker::default();
    stub.respond(&format!("{SUBSCRIPTION_PATH}:modifyAckDeadline"), StatusCode::OK, json!({}));
    let endpoint = stub.serve().await;
    let subscription = anonymous(&endpoint).subscription("worker");

    subscription
        .modify_ack_deadline(&["a1".to_string(), "a2".to_string()], Duration::from_secs(60))
        .await
        .unwrap();
    subscription
        .modify_ack_deadline(&[], Duration::from_secs(60))
        .await
        .unwrap();

    let requests = stub.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].body,
        json!({"ackIds": ["a1", "a2"], "ackDeadlineSeconds": 60})
    );
}

#[tokio::test]
async fn test_pull_status_classification() {
    let stub = StubBroker::default();
    let endpoint = stub.serve().await;
    let subscription = anonymous(&endpoint).subscription("worker");
    let pull_path = format!("{SUBSCRIPTION_PATH}:pull");

    let cases = [
        (StatusCode::FORBIDDEN, true),
        (StatusCode::NOT_FOUND, true),
        (StatusCode::UNAUTHORIZED, false),
        (StatusCode::TOO_MANY_REQUESTS, false),
        (StatusCode::SERVICE_UNAVAILABLE, false),
    ];
    for (status, fatal) in cases {
        stub.respond(&pull_path, status, json!({"error": {"code": status.as_u16()}}));

        let error = subscription.pull(1).await.unwrap_err();

        assert!(
            matches!(&error, MessagingError::Rejected { status: s, .. } if *s == status.as_u16()),
            "{status}: {error}"
        );
        assert_eq!(error.is_fatal(), fatal, "{status}");
    }
}

#[tokio::test]
async fn test_health_checks_topic() {
    let stub = StubBroker::default();
    stub.respond(TOPIC_PATH, StatusCode::OK, json!({"name": "projects/proj/topics/uploads"}));
    let endpoint = stub.serve().await;
    let client = anonymous(&endpoint);

    assert!(client.health("uploads").await);
    let request = stub.last();
    assert_eq!(request.method, Method::GET);
    assert_eq!(request.path, TOPIC_PATH);

    assert!(!client.health("missing").await);
}

#[tokio::test]
async fn test_health_fails_when_broker_unreachable() {
    let client = anonymous("http://127.0.0.1:1");

    assert!(!client.health("uploads").await);
}

#[tokio::test]
async fn test_every_request_asks_for_a_fresh_token() {
    let stub = StubBroker::default();
    stub.respond(
        &format!("{TOPIC_PATH}:publish"),
        StatusCode::OK,
        json!({"messageIds": ["m-1"]}),
    );
    let endpoint = stub.serve().await;
    let client = client(&endpoint, Arc::new(RotatingToken::default()));

    client.publish("uploads", b"one".to_vec()).await.unwrap();
    client.publish("uploads", b"two".to_vec()).await.unwrap();

    let headers: Vec<_> = stub
        .requests()
        .into_iter()
        .map(|request| request.authorization)
        .collect();
    assert_eq!(
        headers,
        vec![
            Some("Bearer token-1".to_string()),
            Some("Bearer token-2".to_string())
        ]
    );
}

#[tokio::test]
async fn test_token_failure_is_retryable_and_sends_nothing() {
    let stub = StubBroker::default();
    let endpoint = stub.serve().await;
    let subscription = client(&endpoint, Arc::new(FailingToken)).subscription("worker");

    let error = subscription.pull(1).await.unwrap_err();

    assert!(matches!(error, MessagingError::Auth(_)));
    assert!(!error.is_fatal());
    assert!(stub.requests().is_empty());
}
