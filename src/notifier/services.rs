use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use http_body_util::BodyExt;
use serde::Serialize;
use tracing::{error, info, warn};

use super::{error::NotifyError, message::build_message, state::NotifierState, utils};
use crate::observability::MetricsSnapshot;

/// Storage trigger endpoint (POST /)
///
/// Accepts one "object finalized" CloudEvent, in binary or structured
/// content mode, and publishes a normalized [`EventMessage`] to the
/// configured topic.
///
/// ## Responses:
/// - 200 `OK` once the broker confirmed the message
/// - 400 `Missing data` when a required attribute is absent or empty
/// - 400 for an unparsable body, content type or size
/// - 500 `Error publishing message` when the broker call fails
///
/// [`EventMessage`]: crate::event::EventMessage
pub async fn publish_event(
    State(state): State<NotifierState>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Result<impl IntoResponse, NotifyError> {
    let result = prepare(&state, &headers, body).await;
    let payload = match result {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "Rejected storage event");
            state.metrics.event_rejected();
            return Err(err);
        }
    };

    match state.publisher.publish(&state.topic, payload).await {
        Ok(message_id) => {
            state.metrics.event_published();
            info!(topic = %state.topic, message_id, "Published storage event");
            Ok((StatusCode::OK, "OK"))
        }
        Err(err) => {
            error!(topic = %state.topic, error = %err, "Error publishing message");
            state.metrics.publish_failed();
            Err(NotifyError::PublishFailed(err.to_string()))
        }
    }
}

/// Decode, validate and encode the event; no side effects
async fn prepare(
    state: &NotifierState,
    headers: &HeaderMap,
    body: axum::body::Body,
) -> Result<Vec<u8>, NotifyError> {
    let body_bytes = read_body(body, state.max_payload_bytes).await?;
    let mode = utils::parse_content_mode(headers)?;
    let (event_id, data) = utils::decode_event(mode, headers, &body_bytes)?;
    let message = build_message(event_id.as_deref(), &data)?;

    info!(
        event_id = %message.event_id,
        bucket = %message.bucket,
        object = %message.object,
        "Received storage event"
    );

    message
        .to_json_bytes()
        .map_err(|err| NotifyError::Internal(err.to_string()))
}

/// Reads request body and validates size
///
/// Decompression is handled by `RequestDecompressionLayer`; a body that
/// cannot be read or decoded is the sender's fault.
async fn read_body(body: axum::body::Body, max_size: usize) -> Result<Vec<u8>, NotifyError> {
    let data = body
        .collect()
        .await
        .map_err(|err| NotifyError::InvalidPayload(format!("unreadable body: {err}")))?
        .to_bytes()
        .to_vec();

    utils::validate_body_size(&data, max_size)?;

    Ok(data)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub metrics: MetricsSnapshot,
}

/// Health check endpoint (GET /health)
///
/// Returns 503 when the broker is unreachable.
pub async fn health(State(state): State<NotifierState>) -> impl IntoResponse {
    let healthy = state.publisher.health(&state.topic).await;
    let (status_code, status) = if healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    let response = HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        metrics: state.metrics.snapshot(),
    };

    (status_code, Json(response))
}
