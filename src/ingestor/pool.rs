use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::handler::{Disposition, MessageHandler, Outcome};
use super::lease::Lease;
use crate::messaging::Delivery;
use crate::observability::Metrics;

/// A pulled delivery with everything that must be released once it is settled
#[derive(Debug)]
pub struct Job {
    pub delivery: Delivery,
    pub lease: Lease,
    pub permit: OwnedSemaphorePermit,
}

/// Dispatcher hands pulled deliveries to the worker pool
///
/// Architecture:
/// 1. The pull loop takes one semaphore permit per delivery before pulling
/// 2. `dispatcher.dispatch(job)` queues it on one channel shared by all workers
/// 3. The first idle worker runs the handler and settles the delivery
/// 4. Settling drops the lease and the permit, making room for the next pull
///
/// Dropping the dispatcher closes the channel; workers drain what is already
/// queued and exit.
pub struct Dispatcher {
    tx: mpsc::Sender<Job>,
}

/// Join handles of the spawned workers
pub struct WorkerPool {
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `num_workers` workers behind one bounded channel
    ///
    /// Jobs still queued once `shutdown` is set are nacked instead of run.
    pub fn spawn(
        num_workers: usize,
        handler: Arc<MessageHandler>,
        metrics: Arc<Metrics>,
        shutdown: watch::Receiver<bool>,
    ) -> (Dispatcher, WorkerPool) {
        assert!(num_workers > 0, "worker pool needs at least one worker");
        info!(num_workers, "Starting worker pool");

        let (tx, rx) = mpsc::channel(num_workers);
        let rx = Arc::new(Mutex::new(rx));

        let joins = (0..num_workers)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    rx.clone(),
                    handler.clone(),
                    metrics.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        (Dispatcher { tx }, WorkerPool { joins })
    }

    /// Wait for every worker to finish its queued deliveries
    pub async fn join(self) {
        for join in self.joins {
            if let Err(e) = join.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
    }
}

impl Dispatcher {
    /// Queue a job for the next idle worker
    pub async fn dispatch(&self, job: Job) {
        if let Err(mpsc::error::SendError(job)) = self.tx.send(job).await {
            // Every worker is gone; give the message back to the broker
            warn!(message_id = %job.delivery.message_id, "Worker pool closed, returning message");
            release(job).await;
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    handler: Arc<MessageHandler>,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = rx.lock().await.recv().await;
        let Some(job) = job else { break };

        if *shutdown.borrow() {
            debug!(worker_id, message_id = %job.delivery.message_id, "Shutting down, returning queued message");
            metrics.message_nacked();
            release(job).await;
            continue;
        }

        settle(worker_id, job, &handler, &metrics).await;
    }
    debug!(worker_id, "Worker stopped");
}

/// Nack a job that will not be processed
pub(crate) async fn release(job: Job) {
    let Job {
        delivery, lease, permit,
    } = job;
    drop(lease);
    let message_id = delivery.message_id.clone();
    if let Err(e) = delivery.nack().await {
        warn!(message_id, error = %e, "Failed to nack message");
    }
    drop(permit);
}

/// Run the handler and apply exactly one ack/nack
pub(crate) async fn settle(
    worker_id: usize,
    job: Job,
    handler: &MessageHandler,
    metrics: &Metrics,
) {
    let Job {
        delivery, lease, permit,
    } = job;
    let message_id = delivery.message_id.clone();

    if let Some(attempt) = delivery.delivery_attempt.filter(|attempt| *attempt > 1) {
        debug!(worker_id, message_id, attempt, published = ?delivery.publish_time, "Redelivered message");
    }

    let outcome = handler.handle(&message_id, &delivery.data).await;

    if let Outcome::Downloaded { bytes, .. } = &outcome {
        metrics.bytes_downloaded(*bytes);
    }

    drop(lease);
    match outcome.disposition() {
        Disposition::Ack => {
            metrics.message_acked();
            if let Err(e) = delivery.ack().await {
                // The broker redelivers after the ack deadline; processing is idempotent
                warn!(worker_id, message_id, error = %e, "Failed to ack message");
            }
        }
        Disposition::Nack => {
            metrics.message_nacked();
            if let Err(e) = delivery.nack().await {
                warn!(worker_id, message_id, error = %e, "Failed to nack message");
            }
        }
    }
    drop(permit);
}
