//! Message broker abstraction
//!
//! The broker is an external at-least-once delivery service. Publishing
//! blocks until the broker confirms the message; consuming yields
//! [`Delivery`] values that must each be settled with exactly one
//! [`Delivery::ack`] or [`Delivery::nack`].

pub mod auth;
pub mod memory;
pub mod rest;

pub use auth::{GcpTokenSource, StaticToken, TokenSource};
pub use memory::MemoryBroker;
pub use rest::{RestConfig, RestPubSub, RestSubscription};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum MessagingError {
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Broker rejected request with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid broker response: {0}")]
    InvalidResponse(String),

    #[error("Could not obtain broker credentials: {0}")]
    Auth(String),
}

impl MessagingError {
    /// Errors a later attempt cannot fix: the broker refused the request
    /// itself (permission denied, unknown subscription, ...).
    ///
    /// Stay retryable: 408/429, and 401, since every request asks the
    /// token source again and an expired token is replaced by then.
    pub fn is_fatal(&self) -> bool {
        match self {
            MessagingError::Rejected { status, .. } => {
                (400..500).contains(status) && !matches!(status, 401 | 408 | 429)
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, MessagingError>;

/// Publishes encoded payloads to a topic
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish and wait for the broker-assigned message id
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<String>;

    /// Whether `topic` is reachable with the current credentials
    async fn health(&self, topic: &str) -> bool;
}

/// Pull side of a subscription
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Fully qualified subscription name, for logging
    fn name(&self) -> &str;

    /// Wait for at most `max_messages` deliveries. An empty batch is not an
    /// error.
    async fn pull(&self, max_messages: usize) -> Result<Vec<Delivery>>;

    /// Push the redelivery deadline of held deliveries `deadline` into the
    /// future
    async fn modify_ack_deadline(&self, ack_ids: &[String], deadline: Duration) -> Result<()>;
}

/// Settles deliveries by their broker-assigned ack id
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self, ack_id: &str) -> Result<()>;

    /// Return the message to the broker for redelivery
    async fn nack(&self, ack_id: &str) -> Result<()>;
}

/// One delivered message plus the handle used to settle it
pub struct Delivery {
    pub message_id: String,
    pub data: Bytes,
    pub publish_time: Option<DateTime<Utc>>,
    pub delivery_attempt: Option<u32>,
    ack_id: String,
    acker: Arc<dyn Acker>,
}

impl Delivery {
    pub fn new(
        message_id: impl Into<String>,
        data: Bytes,
        ack_id: impl Into<String>,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            data,
            publish_time: None,
            delivery_attempt: None,
            ack_id: ack_id.into(),
            acker,
        }
    }

    pub fn with_publish_time(mut self, publish_time: Option<DateTime<Utc>>) -> Self {
        self.publish_time = publish_time;
        self
    }

    pub fn with_delivery_attempt(mut self, attempt: Option<u32>) -> Self {
        self.delivery_attempt = attempt;
        self
    }

    /// Broker-assigned lease id, distinct from the message id
    pub fn ack_id(&self) -> &str {
        &self.ack_id
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack(&self.ack_id).await
    }

    pub async fn nack(self) -> Result<()> {
        self.acker.nack(&self.ack_id).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.message_id)
            .field("size", &self.data.len())
            .field("publish_time", &self.publish_time)
            .field("delivery_attempt", &self.delivery_attempt)
            .finish_non_exhaustive()
    }
}
