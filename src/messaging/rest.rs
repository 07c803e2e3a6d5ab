//! Pub/Sub client over the v1 REST API
//!
//! Works against the managed service (bearer token) and the local emulator
//! (plain HTTP, no auth).

use super::{Acker, Delivery, MessagingError, Publisher, Result, Subscription, TokenSource};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com";

/// REST client configuration
#[derive(Debug, Clone, bon::Builder)]
pub struct RestConfig {
    #[builder(into)]
    pub project_id: String,
    #[builder(into, default = DEFAULT_ENDPOINT.to_string())]
    pub endpoint: String,
    #[builder(default = Duration::from_secs(10))]
    pub connect_timeout: Duration,
    #[builder(default = Duration::from_secs(90))]
    pub request_timeout: Duration,
    /// Upper bound for one pull, whatever the caller asks for
    #[builder(default = 10)]
    pub max_messages: u32,
}

/// Longest ack deadline the service accepts
const MAX_ACK_DEADLINE_SECS: u64 = 600;

#[derive(Serialize)]
struct PublishRequest<'a> {
    messages: Vec<OutgoingMessage<'a>>,
}

#[derive(Serialize)]
struct OutgoingMessage<'a> {
    data: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: PubsubMessage,
    delivery_attempt: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubsubMessage {
    #[serde(default)]
    data: String,
    message_id: String,
    publish_time: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: Vec<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyAckDeadlineRequest<'a> {
    ack_ids: Vec<&'a str>,
    ack_deadline_seconds: u64,
}

/// Whole seconds, rounded up and capped at the service maximum
fn deadline_secs(deadline: Duration) -> u64 {
    let secs = deadline.as_secs() + u64::from(deadline.subsec_nanos() > 0);
    secs.min(MAX_ACK_DEADLINE_SECS)
}

/// Publisher and subscription factory bound to one project
#[derive(Clone)]
pub struct RestPubSub {
    client: Client,
    config: Arc<RestConfig>,
    tokens: Arc<dyn TokenSource>,
}

impl RestPubSub {
    pub fn new(config: RestConfig, tokens: Arc<dyn TokenSource>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(concat!("docrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MessagingError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            config: Arc::new(config),
            tokens,
        })
    }

    pub fn topic_path(&self, topic: &str) -> String {
        format!("projects/{}/topics/{}", self.config.project_id, topic)
    }

    pub fn subscription_path(&self, subscription: &str) -> String {
        format!(
            "projects/{}/subscriptions/{}",
            self.config.project_id, subscription
        )
    }

    /// Bind a pull subscription
    pub fn subscription(&self, subscription: &str) -> RestSubscription {
        RestSubscription {
            inner: Arc::new(SubscriptionInner {
                client: self.clone(),
                path: self.subscription_path(subscription),
            }),
        }
    }

    fn resource_url(&self, resource: &str) -> String {
        format!("{}/v1/{}", self.config.endpoint.trim_end_matches('/'), resource)
    }

    fn url(&self, resource: &str, verb: &str) -> String {
        format!("{}:{}", self.resource_url(resource), verb)
    }

    async fn post<B: Serialize>(&self, url: &str, body: &B) -> Result<reqwest::Response> {
        self.send(self.client.post(url).json(body)).await
    }

    /// Attach the current token, send, and turn non-2xx into `Rejected`
    async fn send(&self, mut request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        if let Some(token) = self.tokens.token().await? {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MessagingError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> MessagingError {
    if e.is_timeout() {
        MessagingError::Timeout
    } else {
        MessagingError::ConnectionError(e.to_string())
    }
}

#[async_trait]
impl Publisher for RestPubSub {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<String> {
        let topic_path = self.topic_path(topic);
        let encoded = BASE64.encode(&data);
        let body = PublishRequest {
            messages: vec![OutgoingMessage { data: &encoded }],
        };

        let response = self
            .post(&self.url(&topic_path, "publish"), &body)
            .await
            .map_err(|e| match e {
                MessagingError::Rejected { .. } => MessagingError::PublishFailed(e.to_string()),
                other => other,
            })?;

        let parsed: PublishResponse = response
            .json()
            .await
            .map_err(|e| MessagingError::InvalidResponse(e.to_string()))?;

        let message_id = parsed.message_ids.into_iter().next().ok_or_else(|| {
            MessagingError::InvalidResponse("publish response carried no message id".into())
        })?;

        debug!(topic = %topic_path, message_id, size = data.len(), "Message published");
        Ok(message_id)
    }

    /// `GET` the topic resource: reachable, authorized and existing
    async fn health(&self, topic: &str) -> bool {
        let url = self.resource_url(&self.topic_path(topic));
        match self.send(self.client.get(&url)).await {
            Ok(_) => true,
            Err(e) => {
                warn!(topic, error = %e, "Broker health check failed");
                false
            }
        }
    }
}

struct SubscriptionInner {
    client: RestPubSub,
    path: String,
}

impl SubscriptionInner {
    async fn modify_ack_deadline(&self, ack_ids: Vec<&str>, deadline_secs: u64) -> Result<()> {
        let body = ModifyAckDeadlineRequest {
            ack_ids,
            ack_deadline_seconds: deadline_secs,
        };
        self.client
            .post(&self.client.url(&self.path, "modifyAckDeadline"), &body)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Acker for SubscriptionInner {
    async fn ack(&self, ack_id: &str) -> Result<()> {
        let body = AcknowledgeRequest {
            ack_ids: vec![ack_id],
        };
        self.client
            .post(&self.client.url(&self.path, "acknowledge"), &body)
            .await?;
        Ok(())
    }

    async fn nack(&self, ack_id: &str) -> Result<()> {
        // A zero deadline makes the message immediately eligible for redelivery
        self.modify_ack_deadline(vec![ack_id], 0).await
    }
}

/// Pull subscription handle
#[derive(Clone)]
pub struct RestSubscription {
    inner: Arc<SubscriptionInner>,
}

#[async_trait]
impl Subscription for RestSubscription {
    fn name(&self) -> &str {
        &self.inner.path
    }

    async fn pull(&self, max_messages: usize) -> Result<Vec<Delivery>> {
        let client = &self.inner.client;
        let requested = u32::try_from(max_messages).unwrap_or(u32::MAX);
        let body = PullRequest {
            max_messages: requested.clamp(1, client.config.max_messages.max(1)),
        };

        let response = client
            .post(&client.url(&self.inner.path, "pull"), &body)
            .await?;
        let parsed: PullResponse = response
            .json()
            .await
            .map_err(|e| MessagingError::InvalidResponse(e.to_string()))?;

        let acker: Arc<dyn Acker> = self.inner.clone();
        let mut deliveries = Vec::with_capacity(parsed.received_messages.len());

        for received in parsed.received_messages {
            let data = match BASE64.decode(received.message.data.as_bytes()) {
                Ok(data) => Bytes::from(data),
                Err(e) => {
                    // Hand the raw text to the handler, which treats it as malformed
                    warn!(
                        message_id = %received.message.message_id,
                        error = %e,
                        "Message data is not valid base64"
                    );
                    Bytes::from(received.message.data.into_bytes())
                }
            };

            deliveries.push(
                Delivery::new(received.message.message_id, data, received.ack_id, acker.clone())
                    .with_publish_time(received.message.publish_time)
                    .with_delivery_attempt(received.delivery_attempt),
            );
        }

        debug!(subscription = %self.inner.path, count = deliveries.len(), "Pulled messages");
        Ok(deliveries)
    }

    async fn modify_ack_deadline(&self, ack_ids: &[String], deadline: Duration) -> Result<()> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        let ids = ack_ids.iter().map(String::as_str).collect();
        self.inner
            .modify_ack_deadline(ids, deadline_secs(deadline))
            .await
    }
}
