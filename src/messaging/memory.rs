//! In-process broker for tests and local development
//!
//! Single topic, single subscription. Nacked messages go back to the end of
//! the queue with their delivery attempt incremented. With an ack deadline
//! set, a lease that is neither settled nor extended in time expires and the
//! message is redelivered under a new ack id, like the real service.

use super::{Acker, Delivery, MessagingError, Publisher, Result, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    data: Bytes,
    attempt: u32,
}

#[derive(Debug)]
struct Lease {
    message: StoredMessage,
    expires: Option<Instant>,
}

#[derive(Default)]
struct BrokerState {
    pending: VecDeque<StoredMessage>,
    outstanding: HashMap<String, Lease>,
    published: Vec<(String, Bytes)>,
    acked: Vec<String>,
    nacked: Vec<String>,
    pull_errors: VecDeque<MessagingError>,
    expired_leases: usize,
    pull_sizes: Vec<usize>,
}

impl BrokerState {
    fn requeue(&mut self, mut message: StoredMessage) {
        message.attempt += 1;
        self.pending.push_back(message);
    }

    /// Move every lease past its deadline back to the queue
    fn reclaim_expired(&mut self, now: Instant) -> bool {
        let expired: Vec<String> = self
            .outstanding
            .iter()
            .filter(|(_, lease)| lease.expires.is_some_and(|at| at <= now))
            .map(|(ack_id, _)| ack_id.clone())
            .collect();

        for ack_id in &expired {
            if let Some(lease) = self.outstanding.remove(ack_id) {
                tracing::debug!(message_id = %lease.message.message_id, "Lease expired");
                self.expired_leases += 1;
                self.requeue(lease.message);
            }
        }
        !expired.is_empty()
    }
}

struct Inner {
    state: Mutex<BrokerState>,
    notify: Notify,
    fail_publish: AtomicBool,
    pull_wait: Duration,
    batch_size: usize,
    ack_deadline: Option<Duration>,
}

/// Cloneable handle; clones share the same queue
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_pull_wait(Duration::from_millis(50))
    }

    /// `pull_wait` bounds how long an empty pull blocks before returning
    pub fn with_pull_wait(pull_wait: Duration) -> Self {
        Self::build(pull_wait, None)
    }

    /// Leases expire `ack_deadline` after delivery unless extended
    pub fn with_ack_deadline(pull_wait: Duration, ack_deadline: Duration) -> Self {
        Self::build(pull_wait, Some(ack_deadline))
    }

    fn build(pull_wait: Duration, ack_deadline: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                fail_publish: AtomicBool::new(false),
                pull_wait,
                batch_size: 10,
                ack_deadline,
            }),
        }
    }

    /// Make subsequent publishes fail until reset
    pub fn set_fail_publish(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Queue an error for the next pull
    pub async fn inject_pull_error(&self, error: MessagingError) {
        self.inner.state.lock().await.pull_errors.push_back(error);
        self.inner.notify.notify_one();
    }

    /// Enqueue a raw payload as if it had been published; returns its id
    pub async fn deliver(&self, data: impl Into<Bytes>) -> String {
        let message_id = Uuid::new_v4().to_string();
        let message = StoredMessage {
            message_id: message_id.clone(),
            data: data.into(),
            attempt: 1,
        };
        self.inner.state.lock().await.pending.push_back(message);
        self.inner.notify.notify_one();
        message_id
    }

    /// Every `(topic, payload)` accepted by [`Publisher::publish`]
    pub async fn published(&self) -> Vec<(String, Bytes)> {
        self.inner.state.lock().await.published.clone()
    }

    pub async fn acked(&self) -> Vec<String> {
        self.inner.state.lock().await.acked.clone()
    }

    pub async fn nacked(&self) -> Vec<String> {
        self.inner.state.lock().await.nacked.clone()
    }

    /// Leases that ran out before being settled or extended
    pub async fn expired_leases(&self) -> usize {
        self.inner.state.lock().await.expired_leases
    }

    /// Number of deliveries handed out by each non-empty pull
    pub async fn pull_sizes(&self) -> Vec<usize> {
        self.inner.state.lock().await.pull_sizes.clone()
    }

    /// Messages waiting for delivery plus delivered but unsettled ones
    pub async fn unsettled(&self) -> usize {
        let state = self.inner.state.lock().await;
        state.pending.len() + state.outstanding.len()
    }

    async fn take_batch(&self, max_messages: usize) -> Result<Vec<Delivery>> {
        let mut state = self.inner.state.lock().await;
        state.reclaim_expired(Instant::now());
        if let Some(error) = state.pull_errors.pop_front() {
            return Err(error);
        }

        let acker: Arc<dyn Acker> = Arc::new(self.clone());
        let limit = max_messages.min(self.inner.batch_size);
        let expires = self.inner.ack_deadline.map(|deadline| Instant::now() + deadline);
        let mut batch = Vec::new();

        while batch.len() < limit {
            let Some(message) = state.pending.pop_front() else {
                break;
            };
            let ack_id = Uuid::new_v4().to_string();
            batch.push(
                Delivery::new(message.message_id.clone(), message.data.clone(), ack_id.clone(), acker.clone())
                    .with_publish_time(Some(Utc::now()))
                    .with_delivery_attempt(Some(message.attempt)),
            );
            state.outstanding.insert(ack_id, Lease { message, expires });
        }

        if !batch.is_empty() {
            state.pull_sizes.push(batch.len());
        }
        Ok(batch)
    }

    /// Remove a live lease, reclaiming expired ones first
    async fn settle(&self, ack_id: &str) -> Result<(tokio::sync::MutexGuard<'_, BrokerState>, StoredMessage)> {
        let mut state = self.inner.state.lock().await;
        if state.reclaim_expired(Instant::now()) {
            self.inner.notify.notify_one();
        }
        let lease = state
            .outstanding
            .remove(ack_id)
            .ok_or_else(|| MessagingError::InvalidResponse(format!("unknown or expired ack id {ack_id}")))?;
        Ok((state, lease.message))
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<String> {
        if self.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(MessagingError::PublishFailed("broker unavailable".into()));
        }

        let data = Bytes::from(data);
        self.inner
            .state
            .lock()
            .await
            .published
            .push((topic.to_string(), data.clone()));

        let message_id = self.deliver(data).await;
        tracing::debug!(topic, message_id, "Memory publish");
        Ok(message_id)
    }

    async fn health(&self, _topic: &str) -> bool {
        !self.inner.fail_publish.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Subscription for MemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn pull(&self, max_messages: usize) -> Result<Vec<Delivery>> {
        let batch = self.take_batch(max_messages).await?;
        if !batch.is_empty() {
            return Ok(batch);
        }

        // Notify keeps a permit when nobody waits, so a publish racing this
        // call is not lost.
        let _ = tokio::time::timeout(self.inner.pull_wait, self.inner.notify.notified()).await;
        self.take_batch(max_messages).await
    }

    async fn modify_ack_deadline(&self, ack_ids: &[String], deadline: Duration) -> Result<()> {
        if deadline.is_zero() {
            for ack_id in ack_ids {
                self.nack(ack_id).await?;
            }
            return Ok(());
        }

        let mut state = self.inner.state.lock().await;
        let now = Instant::now();
        if state.reclaim_expired(now) {
            self.inner.notify.notify_one();
        }
        for ack_id in ack_ids {
            if let Some(lease) = state.outstanding.get_mut(ack_id) {
                if lease.expires.is_some() {
                    lease.expires = Some(now + deadline);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryBroker {
    async fn ack(&self, ack_id: &str) -> Result<()> {
        let (mut state, message) = self.settle(ack_id).await?;
        state.acked.push(message.message_id);
        Ok(())
    }

    async fn nack(&self, ack_id: &str) -> Result<()> {
        let (mut state, message) = self.settle(ack_id).await?;
        state.nacked.push(message.message_id.clone());
        state.requeue(message);
        drop(state);

        self.inner.notify.notify_one();
        Ok(())
    }
}
