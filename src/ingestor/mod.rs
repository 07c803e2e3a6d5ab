//! Ingestor worker
//!
//! Pulls deliveries from a subscription, fans them out to a worker pool
//! and settles each one with exactly one ack or nack.
//!
//! ## Key Components
//!
//! - [`MessageHandler`] - payload to filesystem side effect
//! - [`WorkerPool`] / [`Dispatcher`] - one bounded channel feeding workers
//! - [`LeaseKeeper`] - ack deadline extension for held deliveries
//! - [`Ingestor`] - the pull loop with cooperative shutdown

mod handler;
mod lease;
mod paths;
mod pool;
mod service;

pub use handler::{Disposition, MessageHandler, Outcome};
pub use lease::{Lease, LeaseKeeper};
pub use paths::{PathError, destination_path, ensure_parent};
pub use pool::{Dispatcher, Job, WorkerPool};
pub use service::run;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tracing::{debug, error, info, warn};

use crate::messaging::{Delivery, MessagingError, Subscription};
use crate::observability::Metrics;

#[derive(Debug, Error)]
pub enum IngestorError {
    #[error("Subscription stream failed: {0}")]
    Stream(#[from] MessagingError),
}

/// Pool and pacing settings
#[derive(Debug, Clone, bon::Builder)]
pub struct IngestorOptions {
    /// Also the maximum number of deliveries held at once
    #[builder(default = 4)]
    pub workers: usize,
    /// Deadline requested for held deliveries, renewed at a third of it
    #[builder(default = Duration::from_secs(60))]
    pub ack_deadline: Duration,
    /// Stop extending a delivery after this long and let the broker resend it
    #[builder(default = Duration::from_secs(3600))]
    pub max_lease: Duration,
    /// Pause after a retryable pull error
    #[builder(default = Duration::from_secs(1))]
    pub retry_delay: Duration,
    /// Pause after an empty pull
    #[builder(default = Duration::from_millis(250))]
    pub idle_delay: Duration,
}

impl Default for IngestorOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

pub struct Ingestor {
    handler: Arc<MessageHandler>,
    metrics: Arc<Metrics>,
    options: IngestorOptions,
}

impl Ingestor {
    pub fn new(handler: Arc<MessageHandler>, metrics: Arc<Metrics>, options: IngestorOptions) -> Self {
        Self {
            handler,
            metrics,
            options,
        }
    }

    /// Pull and process until `shutdown` flips to `true` (or its sender is
    /// dropped) or the stream fails fatally.
    ///
    /// No more deliveries are held than there are workers: a permit is taken
    /// for each one before pulling and returned once it is settled. Held
    /// deliveries get their ack deadline extended until then.
    ///
    /// On exit pulling stops first. Deliveries already running finish and are
    /// settled; ones still queued are nacked. A fatal stream error is
    /// returned after that drain.
    pub async fn run(
        &self,
        subscription: Arc<dyn Subscription>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), IngestorError> {
        let (dispatcher, pool) = WorkerPool::spawn(
            self.options.workers,
            self.handler.clone(),
            self.metrics.clone(),
            shutdown.clone(),
        );
        let permits = Arc::new(Semaphore::new(self.options.workers));
        let keeper = Arc::new(LeaseKeeper::new(
            subscription.clone(),
            self.options.ack_deadline,
            self.options.max_lease,
        ));
        let extender = keeper.clone().spawn();

        info!(
            subscription = subscription.name(),
            download_root = %self.handler.download_root().display(),
            workers = self.options.workers,
            "Listening for messages"
        );

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            let mut permit = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    continue;
                }
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };
            let free = permits.available_permits();
            if free > 0 {
                if let Ok(more) = permits.clone().try_acquire_many_owned(free as u32) {
                    permit.merge(more);
                }
            }

            let pulled = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    continue;
                }
                pulled = subscription.pull(permit.num_permits()) => pulled,
            };

            match pulled {
                Ok(batch) if batch.is_empty() => {
                    drop(permit);
                    if pause(&mut shutdown, self.options.idle_delay).await {
                        break Ok(());
                    }
                }
                Ok(batch) => {
                    debug!(count = batch.len(), capacity = permit.num_permits(), "Pulled messages");
                    self.dispatch_batch(&dispatcher, &keeper, batch, permit).await;
                }
                Err(e) if e.is_fatal() => {
                    error!(subscription = subscription.name(), error = %e, "An error occurred during subscription");
                    break Err(IngestorError::Stream(e));
                }
                Err(e) => {
                    drop(permit);
                    warn!(subscription = subscription.name(), error = %e, "Pull failed, retrying");
                    if pause(&mut shutdown, self.options.retry_delay).await {
                        break Ok(());
                    }
                }
            }
        };

        info!("Pull cancelled, waiting for in-flight messages");
        drop(dispatcher);
        pool.join().await;
        extender.abort();
        info!(metrics = ?self.metrics.snapshot(), "Ingestor stopped");

        result
    }

    /// Lease every delivery and hand it to the pool with one permit each.
    /// Unused permits go back when `permit` is dropped.
    async fn dispatch_batch(
        &self,
        dispatcher: &Dispatcher,
        keeper: &LeaseKeeper,
        batch: Vec<Delivery>,
        mut permit: OwnedSemaphorePermit,
    ) {
        let ack_ids = batch.iter().map(|d| d.ack_id().to_string()).collect();
        let leases = keeper.hold(ack_ids).await;

        for (delivery, lease) in batch.into_iter().zip(leases) {
            match permit.split(1) {
                Some(slot) => {
                    dispatcher
                        .dispatch(Job {
                            delivery,
                            lease,
                            permit: slot,
                        })
                        .await;
                }
                None => {
                    // The broker sent more than was asked for
                    drop(lease);
                    warn!(message_id = %delivery.message_id, "No free worker, returning message");
                    if let Err(e) = delivery.nack().await {
                        warn!(error = %e, "Failed to nack message");
                    }
                }
            }
        }
    }
}

/// Sleep unless shutdown arrives first. Returns `true` on shutdown.
async fn pause(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::MemoryBroker;
    use crate::storage::ObjectStoreFetcher;
    use tempfile::TempDir;

    fn ingestor(root: &TempDir) -> Ingestor {
        let handler = MessageHandler::new(Arc::new(ObjectStoreFetcher::in_memory()), root.path());
        let options = IngestorOptions::builder()
            .workers(2)
            .idle_delay(Duration::from_millis(5))
            .retry_delay(Duration::from_millis(5))
            .build();
        Ingestor::new(Arc::new(handler), Arc::new(Metrics::new()), options)
    }

    #[test]
    fn test_options_defaults() {
        let options = IngestorOptions::default();
        assert_eq!(options.workers, 4);
        assert_eq!(options.ack_deadline, Duration::from_secs(60));
        assert_eq!(options.max_lease, Duration::from_secs(3600));
        assert_eq!(options.retry_delay, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_stops_on_shutdown_signal() {
        let root = TempDir::new().unwrap();
        let broker = MemoryBroker::with_pull_wait(Duration::from_millis(5));
        let (tx, rx) = watch::channel(false);

        let ingestor = ingestor(&root);
        let run = tokio::spawn(async move { ingestor.run(Arc::new(broker), rx).await });

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_fatal_stream_error_ends_run() {
        let root = TempDir::new().unwrap();
        let broker = MemoryBroker::with_pull_wait(Duration::from_millis(5));
        broker
            .inject_pull_error(MessagingError::Rejected {
                status: 403,
                body: "permission denied".into(),
            })
            .await;
        let (_tx, rx) = watch::channel(false);

        let result = ingestor(&root).run(Arc::new(broker), rx).await;

        assert!(matches!(
            result,
            Err(IngestorError::Stream(MessagingError::Rejected { status: 403, .. }))
        ));
    }

    #[tokio::test]
    async fn test_retryable_error_keeps_pulling() {
        let root = TempDir::new().unwrap();
        let broker = MemoryBroker::with_pull_wait(Duration::from_millis(5));
        broker.inject_pull_error(MessagingError::Timeout).await;
        let id = broker.deliver(&b"garbage"[..]).await;
        let (tx, rx) = watch::channel(false);

        let ingestor = ingestor(&root);
        let subscription = Arc::new(broker.clone());
        let run = tokio::spawn(async move { ingestor.run(subscription, rx).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.acked().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        assert!(run.await.unwrap().is_ok());
        assert_eq!(broker.acked().await, vec![id]);
    }

    #[tokio::test]
    async fn test_pulls_no_more_than_free_workers() {
        let root = TempDir::new().unwrap();
        let broker = MemoryBroker::with_pull_wait(Duration::from_millis(5));
        for _ in 0..9 {
            broker.deliver(&b"garbage"[..]).await;
        }
        let (tx, rx) = watch::channel(false);

        let ingestor = ingestor(&root);
        let subscription = Arc::new(broker.clone());
        let run = tokio::spawn(async move { ingestor.run(subscription, rx).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.acked().await.len() < 9 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        assert!(run.await.unwrap().is_ok());
        let sizes = broker.pull_sizes().await;
        assert!(sizes.iter().all(|size| *size <= 2), "pull sizes {sizes:?}");
        assert_eq!(sizes.iter().sum::<usize>(), 9);
    }
}
