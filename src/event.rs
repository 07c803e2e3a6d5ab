//! Wire types shared by the notifier and the ingestor.
//!
//! The notifier receives a [`StorageObjectData`] (the payload of an object
//! storage "finalized" notification) and publishes an [`EventMessage`].
//! The ingestor decodes the same JSON but only relies on `bucket` and
//! `object`, see [`ObjectRef`].
//!
//! Published example:
//!
//! ```json
//! {
//!   "event_id": "e1",
//!   "bucket": "b1",
//!   "object": "u1/doc.pdf",
//!   "generation": "3",
//!   "size": 2048,
//!   "contentType": "application/pdf",
//!   "timeCreated": "2024-01-01T00:00:00Z"
//! }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque object version token. Storage services send it either as a
/// string or as a number; it is republished exactly as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Generation {
    Text(String),
    Number(i64),
}

impl Generation {
    /// An empty string carries no version information.
    pub fn is_blank(&self) -> bool {
        matches!(self, Generation::Text(text) if text.trim().is_empty())
    }
}

/// Raw `size` field of a storage notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SizeField {
    Text(String),
    Number(u64),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("size '{0}' is not a non-negative integer")]
pub struct InvalidSize(pub String);

impl SizeField {
    /// Coerce to a byte count. Empty text means "unknown" and yields `None`.
    pub fn coerce(&self) -> Result<Option<u64>, InvalidSize> {
        match self {
            SizeField::Number(n) => Ok(Some(*n)),
            SizeField::Text(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return Ok(None);
                }
                trimmed
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| InvalidSize(text.clone()))
            }
        }
    }
}

/// Storage object metadata carried by an upload notification.
///
/// Every field is optional so that a malformed trigger is reported by
/// validation instead of failing deserialization. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageObjectData {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub generation: Option<Generation>,
    #[serde(default)]
    pub size: Option<SizeField>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub time_created: Option<String>,
}

/// Message published to the topic. Field names and order are part of the
/// wire contract with independently deployed consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessage {
    pub event_id: String,
    pub bucket: String,
    pub object: String,
    pub generation: Generation,
    pub size: Option<u64>,
    #[serde(rename = "contentType")]
    pub content_type: Option<String>,
    #[serde(rename = "timeCreated")]
    pub time_created: String,
}

impl EventMessage {
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// The part of an [`EventMessage`] the ingestor depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ObjectRef {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub object: Option<String>,
}

impl ObjectRef {
    /// Returns `(bucket, object)` when both are present and non-empty.
    pub fn required(&self) -> Option<(&str, &str)> {
        let bucket = self.bucket.as_deref().filter(|b| !b.is_empty())?;
        let object = self.object.as_deref().filter(|o| !o.is_empty())?;
        Some((bucket, object))
    }
}
