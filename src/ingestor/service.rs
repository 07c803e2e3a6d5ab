use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::{Ingestor, IngestorOptions, MessageHandler};
use crate::config::Config;
use crate::messaging::{RestConfig, RestPubSub};
use crate::observability::Metrics;
use crate::shutdown;
use crate::storage::ObjectStoreFetcher;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Build the process-wide clients from `config` and run until shutdown
pub async fn run(config: Config) -> Result<(), AnyError> {
    config.validate_ingestor()?;

    let pubsub = &config.pubsub;
    // Both are present once validation passed
    let project_id = pubsub.project_id.clone().unwrap_or_default();
    let subscription_id = pubsub.subscription_id.clone().unwrap_or_default();

    let rest = RestPubSub::new(
        RestConfig::builder()
            .project_id(project_id)
            .endpoint(pubsub.endpoint.clone())
            .connect_timeout(pubsub.connect_timeout())
            .request_timeout(pubsub.request_timeout())
            .max_messages(pubsub.max_messages)
            .build(),
        pubsub.token_source()?,
    )?;
    let subscription = Arc::new(rest.subscription(&subscription_id));

    info!(
        provider = ?config.storage.provider,
        download_root = %config.ingestor.download_root.display(),
        "Initializing storage"
    );
    let fetcher = Arc::new(ObjectStoreFetcher::from_config(&config.storage));
    let handler = Arc::new(MessageHandler::new(fetcher, config.ingestor.download_root.clone()));

    let options = IngestorOptions::builder()
        .workers(config.ingestor.workers)
        .ack_deadline(config.ingestor.ack_deadline())
        .max_lease(config.ingestor.max_lease())
        .retry_delay(Duration::from_millis(config.ingestor.retry_delay_ms))
        .idle_delay(Duration::from_millis(config.ingestor.idle_delay_ms))
        .build();

    let ingestor = Ingestor::new(handler, Arc::new(Metrics::new()), options);
    ingestor.run(subscription, shutdown::watch_shutdown()).await?;

    Ok(())
}
