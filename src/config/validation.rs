use super::models::{Config, IngestorConfig, PubSubConfig};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required identifier '{field}' (set {env} or pubsub.{field})")]
    MissingIdentifier {
        field: &'static str,
        env: &'static str,
    },

    #[error("Invalid Pub/Sub endpoint '{endpoint}', expected an http:// or https:// URL")]
    InvalidEndpoint { endpoint: String },

    #[error("{field} must be positive")]
    NotPositive { field: &'static str },

    #[error("{field} must be between {min} and {max}")]
    OutOfRange {
        field: &'static str,
        min: u64,
        max: u64,
    },
}

/// Settings the notifier cannot start without
pub fn validate_notifier(config: &Config) -> Result<(), ValidationError> {
    require(&config.pubsub.project_id, "project_id", "GCLOUD_PROJECT")?;
    require(&config.pubsub.topic_id, "topic_id", "TOPIC_ID")?;
    validate_pubsub(&config.pubsub)?;
    if config.notifier.max_payload_bytes == 0 {
        return Err(ValidationError::NotPositive {
            field: "notifier.max_payload_bytes",
        });
    }
    Ok(())
}

/// Settings the ingestor cannot start without
pub fn validate_ingestor(config: &Config) -> Result<(), ValidationError> {
    require(&config.pubsub.project_id, "project_id", "GCLOUD_PROJECT")?;
    require(&config.pubsub.subscription_id, "subscription_id", "SUBSCRIPTION_ID")?;
    validate_pubsub(&config.pubsub)?;
    validate_pool(&config.ingestor)?;
    Ok(())
}

fn require(
    value: &Option<String>,
    field: &'static str,
    env: &'static str,
) -> Result<(), ValidationError> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(()),
        _ => Err(ValidationError::MissingIdentifier { field, env }),
    }
}

fn validate_pubsub(pubsub: &PubSubConfig) -> Result<(), ValidationError> {
    if !(pubsub.endpoint.starts_with("http://") || pubsub.endpoint.starts_with("https://")) {
        return Err(ValidationError::InvalidEndpoint {
            endpoint: pubsub.endpoint.clone(),
        });
    }
    if pubsub.max_messages == 0 {
        return Err(ValidationError::NotPositive {
            field: "pubsub.max_messages",
        });
    }
    Ok(())
}

fn validate_pool(ingestor: &IngestorConfig) -> Result<(), ValidationError> {
    if ingestor.workers == 0 {
        return Err(ValidationError::NotPositive {
            field: "ingestor.workers",
        });
    }
    // The broker accepts ack deadlines from 10 to 600 seconds
    if !(10..=600).contains(&ingestor.ack_deadline_secs) {
        return Err(ValidationError::OutOfRange {
            field: "ingestor.ack_deadline_secs",
            min: 10,
            max: 600,
        });
    }
    if ingestor.max_lease_secs < ingestor.ack_deadline_secs {
        return Err(ValidationError::OutOfRange {
            field: "ingestor.max_lease_secs",
            min: ingestor.ack_deadline_secs,
            max: u64::MAX,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingestor_config() -> Config {
        let mut config = Config::default();
        config.pubsub.project_id = Some("proj".into());
        config.pubsub.subscription_id = Some("worker".into());
        config
    }

    #[test]
    fn test_ingestor_requires_identifiers() {
        assert!(validate_ingestor(&ingestor_config()).is_ok());

        let mut config = ingestor_config();
        config.pubsub.subscription_id = None;
        assert_eq!(
            validate_ingestor(&config),
            Err(ValidationError::MissingIdentifier {
                field: "subscription_id",
                env: "SUBSCRIPTION_ID"
            })
        );

        let mut config = ingestor_config();
        config.pubsub.project_id = Some("  ".into());
        assert!(matches!(
            validate_ingestor(&config),
            Err(ValidationError::MissingIdentifier { field: "project_id", .. })
        ));
    }

    #[test]
    fn test_notifier_requires_topic() {
        let mut config = Config::default();
        config.pubsub.project_id = Some("proj".into());
        assert!(matches!(
            validate_notifier(&config),
            Err(ValidationError::MissingIdentifier { field: "topic_id", .. })
        ));

        config.pubsub.topic_id = Some("uploads".into());
        assert!(validate_notifier(&config).is_ok());
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        let mut config = ingestor_config();
        config.pubsub.endpoint = "pubsub.googleapis.com".into();
        assert!(matches!(
            validate_ingestor(&config),
            Err(ValidationError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn test_rejects_empty_pool() {
        let mut config = ingestor_config();
        config.ingestor.workers = 0;
        assert_eq!(
            validate_ingestor(&config),
            Err(ValidationError::NotPositive {
                field: "ingestor.workers"
            })
        );
    }

    #[test]
    fn test_rejects_ack_deadline_outside_broker_range() {
        let mut config = ingestor_config();
        config.ingestor.ack_deadline_secs = 5;
        assert!(matches!(
            validate_ingestor(&config),
            Err(ValidationError::OutOfRange {
                field: "ingestor.ack_deadline_secs",
                ..
            })
        ));

        config.ingestor.ack_deadline_secs = 600;
        config.ingestor.max_lease_secs = 60;
        assert!(matches!(
            validate_ingestor(&config),
            Err(ValidationError::OutOfRange {
                field: "ingestor.max_lease_secs",
                ..
            })
        ));
    }
}
