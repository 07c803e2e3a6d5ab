//! Request parsing helpers
//!
//! Pure, stateless functions kept out of the handler so they can be unit
//! tested without a router.

use axum::http::HeaderMap;
use serde::Deserialize;

use super::error::NotifyError;
use crate::event::StorageObjectData;

/// Event id header in CloudEvents binary content mode
pub const CE_ID_HEADER: &str = "ce-id";

const CLOUDEVENTS_JSON: &str = "application/cloudevents+json";

/// How the CloudEvent is laid out on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentMode {
    /// Attributes in `ce-*` headers, body is the event data
    Binary,
    /// Attributes and data in one JSON document
    Structured,
}

/// Structured-mode envelope; only the attributes used here
#[derive(Debug, Deserialize)]
struct StructuredEvent {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    data: Option<StorageObjectData>,
}

/// Parses the Content-Type header
///
/// Accepts:
/// - `application/json` (binary mode, optionally with charset)
/// - `application/cloudevents+json` (structured mode)
///
/// Rejects anything else, including a missing header.
pub fn parse_content_mode(headers: &HeaderMap) -> Result<ContentMode, NotifyError> {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| NotifyError::InvalidPayload("missing Content-Type header".into()))?;

    let media_type: mime::Mime = content_type.parse().map_err(|_| {
        NotifyError::InvalidPayload(format!("invalid Content-Type: {}", content_type))
    })?;

    if media_type.type_() == mime::APPLICATION
        && media_type.subtype() == mime::JSON
        && media_type.suffix().is_none()
    {
        return Ok(ContentMode::Binary);
    }

    if media_type.essence_str() == CLOUDEVENTS_JSON {
        return Ok(ContentMode::Structured);
    }

    Err(unsupported(&media_type))
}

fn unsupported(media_type: &mime::Mime) -> NotifyError {
    NotifyError::InvalidPayload(format!(
        "Content-Type must be application/json or application/cloudevents+json, got: {}",
        media_type.essence_str()
    ))
}

/// Extract the event id and storage object data from a request
pub fn decode_event(
    mode: ContentMode,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(Option<String>, StorageObjectData), NotifyError> {
    match mode {
        ContentMode::Binary => {
            let event_id = headers
                .get(CE_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let data: StorageObjectData = serde_json::from_slice(body)?;
            Ok((event_id, data))
        }
        ContentMode::Structured => {
            let event: StructuredEvent = serde_json::from_slice(body)?;
            Ok((event.id, event.data.unwrap_or_default()))
        }
    }
}

/// Validates that body size does not exceed the maximum allowed size
pub fn validate_body_size(data: &[u8], max_size: usize) -> Result<(), NotifyError> {
    if data.len() > max_size {
        return Err(NotifyError::PayloadTooLarge(data.len()));
    }
    Ok(())
}
