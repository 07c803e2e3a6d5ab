use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

use crate::event::InvalidSize;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("missing essential event data: {0}")]
    MissingData(&'static str),
    #[error("invalid event data: {0}")]
    InvalidSize(#[from] InvalidSize),
    #[error("payload invalid: {0}")]
    InvalidPayload(String),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl NotifyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            NotifyError::MissingData(_)
            | NotifyError::InvalidSize(_)
            | NotifyError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            NotifyError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            NotifyError::PublishFailed(_) | NotifyError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Plain-text body returned to the event delivery system
    pub fn body(&self) -> String {
        match self {
            NotifyError::MissingData(_) => "Missing data".to_string(),
            NotifyError::PublishFailed(_) => "Error publishing message".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for NotifyError {
    fn into_response(self) -> axum::response::Response {
        (self.status_code(), self.body()).into_response()
    }
}

impl From<serde_json::Error> for NotifyError {
    fn from(value: serde_json::Error) -> Self {
        NotifyError::InvalidPayload(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            NotifyError::MissingData("bucket").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            NotifyError::InvalidSize(InvalidSize("x".into())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            NotifyError::PublishFailed("unavailable".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_bodies() {
        assert_eq!(NotifyError::MissingData("name").body(), "Missing data");
        assert_eq!(
            NotifyError::PublishFailed("quota".into()).body(),
            "Error publishing message"
        );
    }
}
