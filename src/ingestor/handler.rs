//! Per-message processing
//!
//! ```text
//! Received ──decode error / missing bucket|object──────────────▶ Ack
//!    │
//!    └─▶ Downloading ──ok / not found / invalid key────────────▶ Ack
//!                     └─any other failure───────────────────────▶ Nack
//! ```
//!
//! Permanent failures are acked so the broker stops redelivering a message
//! that can never succeed. Everything else is nacked and left to the
//! broker's redelivery backoff.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use super::paths::{destination_path, ensure_parent};
use crate::event::ObjectRef;
use crate::storage::{FetchError, ObjectFetcher};

/// Settlement decision for one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack,
}

/// What happened to one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Downloaded { path: PathBuf, bytes: u64 },
    /// Payload is not a JSON object with string fields
    Malformed(String),
    MissingFields,
    /// Key cannot be mapped to a local path or a storage location
    InvalidKey { object: String, reason: String },
    NotFound { bucket: String, object: String },
    Transient(String),
}

impl Outcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            Outcome::Transient(_) => Disposition::Nack,
            Outcome::Downloaded { .. }
            | Outcome::Malformed(_)
            | Outcome::MissingFields
            | Outcome::InvalidKey { .. }
            | Outcome::NotFound { .. } => Disposition::Ack,
        }
    }
}

impl From<FetchError> for Outcome {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::NotFound { bucket, object } => Outcome::NotFound { bucket, object },
            FetchError::InvalidKey { key, reason } => Outcome::InvalidKey {
                object: key,
                reason,
            },
            FetchError::Transient(cause) => Outcome::Transient(cause),
        }
    }
}

/// Turns a payload into a file under `download_root`
pub struct MessageHandler {
    fetcher: Arc<dyn ObjectFetcher>,
    download_root: PathBuf,
}

impl MessageHandler {
    pub fn new(fetcher: Arc<dyn ObjectFetcher>, download_root: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            download_root: download_root.into(),
        }
    }

    pub fn download_root(&self) -> &Path {
        &self.download_root
    }

    /// Process one payload and log the result. Never panics on bad input.
    pub async fn handle(&self, message_id: &str, data: &[u8]) -> Outcome {
        info!(
            message_id,
            data = %String::from_utf8_lossy(data),
            "Received message"
        );

        let outcome = self.process(data).await;
        log_outcome(message_id, &outcome);
        outcome
    }

    async fn process(&self, data: &[u8]) -> Outcome {
        let object_ref: ObjectRef = match serde_json::from_slice(data) {
            Ok(object_ref) => object_ref,
            Err(e) => return Outcome::Malformed(e.to_string()),
        };

        let Some((bucket, object)) = object_ref.required() else {
            return Outcome::MissingFields;
        };

        let dest = match destination_path(&self.download_root, object) {
            Ok(dest) => dest,
            Err(e) => {
                return Outcome::InvalidKey {
                    object: object.to_string(),
                    reason: e.to_string(),
                };
            }
        };

        info!(bucket, object, "Attempting to download object");

        if let Err(e) = ensure_parent(&dest).await {
            return Outcome::Transient(format!(
                "could not create directory for {}: {e}",
                dest.display()
            ));
        }

        match self.fetcher.fetch(bucket, object, &dest).await {
            Ok(bytes) => Outcome::Downloaded { path: dest, bytes },
            Err(e) => e.into(),
        }
    }
}

fn log_outcome(message_id: &str, outcome: &Outcome) {
    match outcome {
        Outcome::Downloaded { path, bytes } => {
            info!(message_id, path = %path.display(), bytes, "Successfully processed message, acknowledging");
        }
        Outcome::Malformed(reason) => {
            error!(message_id, error = %reason, "Could not decode message data, acknowledging");
        }
        Outcome::MissingFields => {
            error!(message_id, "Message is missing 'bucket' or 'object' fields, acknowledging");
        }
        Outcome::InvalidKey { object, reason } => {
            error!(message_id, object, error = %reason, "Object key cannot be stored locally, acknowledging");
        }
        Outcome::NotFound { bucket, object } => {
            error!(
                message_id,
                bucket, object, "Object not found, acknowledging to prevent redelivery loop"
            );
        }
        Outcome::Transient(cause) => {
            error!(message_id, error = %cause, "Processing failed, requesting redelivery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records calls and answers with a fixed result
    struct StubFetcher {
        calls: Mutex<Vec<(String, String, PathBuf)>>,
        respond: fn() -> Result<u64, FetchError>,
    }

    impl StubFetcher {
        fn new(respond: fn() -> Result<u64, FetchError>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                respond,
            })
        }

        fn calls(&self) -> Vec<(String, String, PathBuf)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ObjectFetcher for StubFetcher {
        async fn fetch(&self, bucket: &str, object: &str, dest: &Path) -> Result<u64, FetchError> {
            self.calls
                .lock()
                .unwrap()
                .push((bucket.to_string(), object.to_string(), dest.to_path_buf()));
            (self.respond)()
        }
    }

    #[test]
    fn test_disposition_table() {
        let cases = [
            (
                Outcome::Downloaded {
                    path: PathBuf::from("/x"),
                    bytes: 1,
                },
                Disposition::Ack,
            ),
            (Outcome::Malformed("eof".into()), Disposition::Ack),
            (Outcome::MissingFields, Disposition::Ack),
            (
                Outcome::InvalidKey {
                    object: "..".into(),
                    reason: "unsafe".into(),
                },
                Disposition::Ack,
            ),
            (
                Outcome::NotFound {
                    bucket: "b".into(),
                    object: "o".into(),
                },
                Disposition::Ack,
            ),
            (Outcome::Transient("503".into()), Disposition::Nack),
        ];

        for (outcome, expected) in cases {
            assert_eq!(outcome.disposition(), expected, "{outcome:?}");
        }
    }

    #[tokio::test]
    async fn test_malformed_payload_is_acked_without_write() {
        let root = TempDir::new().unwrap();
        let fetcher = StubFetcher::new(|| Ok(0));
        let handler = MessageHandler::new(fetcher.clone(), root.path());

        let outcome = handler.handle("m1", b"{not json").await;

        assert!(matches!(outcome, Outcome::Malformed(_)));
        assert_eq!(outcome.disposition(), Disposition::Ack);
        assert!(fetcher.calls().is_empty());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_non_object_json_is_malformed() {
        let root = TempDir::new().unwrap();
        let handler = MessageHandler::new(StubFetcher::new(|| Ok(0)), root.path());

        assert!(matches!(handler.handle("m1", b"[1,2]").await, Outcome::Malformed(_)));
        assert!(matches!(
            handler.handle("m2", br#"{"bucket":1,"object":"a"}"#).await,
            Outcome::Malformed(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_object_field_skips_fetch() {
        let root = TempDir::new().unwrap();
        let fetcher = StubFetcher::new(|| Ok(0));
        let handler = MessageHandler::new(fetcher.clone(), root.path());

        let outcome = handler.handle("m1", br#"{"bucket":"b1"}"#).await;

        assert_eq!(outcome, Outcome::MissingFields);
        assert_eq!(outcome.disposition(), Disposition::Ack);
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_not_found_is_acked() {
        let root = TempDir::new().unwrap();
        let fetcher = StubFetcher::new(|| {
            Err(FetchError::NotFound {
                bucket: "b1".into(),
                object: "missing.txt".into(),
            })
        });
        let handler = MessageHandler::new(fetcher.clone(), root.path());

        let outcome = handler
            .handle("m1", br#"{"bucket":"b1","object":"missing.txt"}"#)
            .await;

        assert_eq!(
            outcome,
            Outcome::NotFound {
                bucket: "b1".into(),
                object: "missing.txt".into()
            }
        );
        assert_eq!(outcome.disposition(), Disposition::Ack);
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_nacked() {
        let root = TempDir::new().unwrap();
        let fetcher = StubFetcher::new(|| Err(FetchError::Transient("connection reset".into())));
        let handler = MessageHandler::new(fetcher, root.path());

        let outcome = handler
            .handle("m1", br#"{"bucket":"b1","object":"a.txt"}"#)
            .await;

        assert_eq!(outcome, Outcome::Transient("connection reset".into()));
        assert_eq!(outcome.disposition(), Disposition::Nack);
    }

    #[tokio::test]
    async fn test_download_path_and_parent_directory() {
        let root = TempDir::new().unwrap();
        let fetcher = StubFetcher::new(|| Ok(42));
        let handler = MessageHandler::new(fetcher.clone(), root.path());

        let outcome = handler
            .handle(
                "m1",
                br#"{"event_id":"e1","bucket":"b1","object":"alice@example.com/report.pdf"}"#,
            )
            .await;

        let expected = root.path().join("alice@example.com").join("report.pdf");
        assert_eq!(
            outcome,
            Outcome::Downloaded {
                path: expected.clone(),
                bytes: 42
            }
        );
        assert!(root.path().join("alice@example.com").is_dir());
        assert_eq!(
            fetcher.calls(),
            vec![(
                String::from("b1"),
                String::from("alice@example.com/report.pdf"),
                expected
            )]
        );
    }

    #[tokio::test]
    async fn test_traversal_key_is_acked_without_fetch() {
        let root = TempDir::new().unwrap();
        let fetcher = StubFetcher::new(|| Ok(0));
        let handler = MessageHandler::new(fetcher.clone(), root.path());

        let outcome = handler
            .handle("m1", br#"{"bucket":"b1","object":"../outside.txt"}"#)
            .await;

        assert!(matches!(outcome, Outcome::InvalidKey { .. }));
        assert_eq!(outcome.disposition(), Disposition::Ack);
        assert!(fetcher.calls().is_empty());
    }
}
