use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, routing::get, routing::post};
use tokio::net::TcpListener;
use tower_http::decompression::RequestDecompressionLayer;
use tracing::info;

use super::{
    services::{health, publish_event},
    state::NotifierState,
};
use crate::config::Config;
use crate::messaging::{RestConfig, RestPubSub};
use crate::shutdown::shutdown_signal;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// HTTP routes for the notifier
pub fn router(state: NotifierState) -> Router {
    Router::new()
        .route("/", post(publish_event))
        .route("/health", get(health))
        .with_state(state)
        // Handles Content-Encoding transparently
        .layer(RequestDecompressionLayer::new())
}

/// Serve the notifier until Ctrl+C or SIGTERM
///
/// `address` overrides `notifier.bind_addr` from the configuration.
pub async fn run(config: Config, address: Option<SocketAddr>) -> Result<(), AnyError> {
    config.validate_notifier()?;

    let pubsub = &config.pubsub;
    // Both are present once validation passed
    let project_id = pubsub.project_id.clone().unwrap_or_default();
    let topic_id = pubsub.topic_id.clone().unwrap_or_default();

    let publisher = RestPubSub::new(
        RestConfig::builder()
            .project_id(project_id)
            .endpoint(pubsub.endpoint.clone())
            .connect_timeout(pubsub.connect_timeout())
            .request_timeout(pubsub.request_timeout())
            .max_messages(pubsub.max_messages)
            .build(),
        pubsub.token_source()?,
    )?;
    info!(topic = %publisher.topic_path(&topic_id), "Publishing storage events");

    let state = NotifierState::new(
        Arc::new(publisher),
        topic_id,
        config.notifier.max_payload_bytes,
    );
    let app = router(state);

    let address = address.unwrap_or(config.notifier.bind_addr);
    let listener = TcpListener::bind(address).await?;
    info!(%address, "Notifier listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
