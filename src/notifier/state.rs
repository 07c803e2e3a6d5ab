use std::sync::Arc;

use crate::messaging::Publisher;
use crate::observability::Metrics;

#[derive(Clone)]
pub struct NotifierState {
    pub publisher: Arc<dyn Publisher>,
    /// Topic id, resolved against the project by the publisher
    pub topic: String,
    pub metrics: Arc<Metrics>,
    pub max_payload_bytes: usize,
}

impl NotifierState {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        topic: impl Into<String>,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            metrics: Arc::new(Metrics::new()),
            max_payload_bytes,
        }
    }
}
