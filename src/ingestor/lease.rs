//! Ack deadline extension
//!
//! Every pulled delivery is held by a [`Lease`] until its worker settles it.
//! A background task pushes the broker deadline of all held ack ids forward
//! at a third of the deadline, so slow downloads are never redelivered while
//! they are still running.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::messaging::Subscription;

type HeldMap = Arc<Mutex<HashMap<String, Instant>>>;

fn lock(held: &HeldMap) -> MutexGuard<'_, HashMap<String, Instant>> {
    held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps held deliveries from expiring at the broker
pub struct LeaseKeeper {
    subscription: Arc<dyn Subscription>,
    deadline: Duration,
    max_lease: Duration,
    held: HeldMap,
}

/// Registration of one held ack id; dropping it stops the extensions
#[derive(Debug)]
pub struct Lease {
    ack_id: String,
    held: HeldMap,
}

impl Drop for Lease {
    fn drop(&mut self) {
        lock(&self.held).remove(&self.ack_id);
    }
}

impl LeaseKeeper {
    pub fn new(subscription: Arc<dyn Subscription>, deadline: Duration, max_lease: Duration) -> Self {
        Self {
            subscription,
            deadline,
            max_lease,
            held: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of ack ids currently held
    pub fn held(&self) -> usize {
        lock(&self.held).len()
    }

    /// Start holding `ack_ids` and set their deadline right away, since the
    /// subscription's own deadline may be shorter than ours.
    ///
    /// Leases come back in the order of `ack_ids`.
    pub async fn hold(&self, ack_ids: Vec<String>) -> Vec<Lease> {
        let now = Instant::now();
        {
            let mut held = lock(&self.held);
            for ack_id in &ack_ids {
                held.insert(ack_id.clone(), now);
            }
        }

        if let Err(e) = self.subscription.modify_ack_deadline(&ack_ids, self.deadline).await {
            warn!(count = ack_ids.len(), error = %e, "Failed to set initial ack deadline");
        }

        ack_ids
            .into_iter()
            .map(|ack_id| Lease {
                ack_id,
                held: self.held.clone(),
            })
            .collect()
    }

    /// Extend every held ack id once. Ids held longer than `max_lease` are
    /// released to the broker.
    pub async fn extend(&self) {
        let now = Instant::now();
        let ack_ids: Vec<String> = {
            let mut held = lock(&self.held);
            held.retain(|ack_id, since| {
                let keep = now.duration_since(*since) < self.max_lease;
                if !keep {
                    warn!(ack_id, "Maximum lease time reached, releasing message");
                }
                keep
            });
            held.keys().cloned().collect()
        };

        if ack_ids.is_empty() {
            return;
        }

        debug!(count = ack_ids.len(), "Extending ack deadlines");
        if let Err(e) = self.subscription.modify_ack_deadline(&ack_ids, self.deadline).await {
            warn!(count = ack_ids.len(), error = %e, "Failed to extend ack deadlines");
        }
    }

    /// Run [`LeaseKeeper::extend`] until the handle is aborted
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let period = (self.deadline / 3).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.extend().await;
            }
        })
    }
}
